use std::sync::Arc;
use std::time::Duration;

use dunning_channel::{
    ConnectOutcome, ConnectionLifecycleManager, DisconnectReason, InMemoryCredentialStore,
    SessionRegistry, SocketEvent,
};
use dunning_core::BroadcastEventBus;
use dunning_reminders::{MessageRenderer, ReminderDispatcher};
use dunning_test_support::fixtures::{client, connection, date, eventually, template, within};
use dunning_test_support::{FakeConnector, InMemoryGateway};

#[tokio::test(start_paused = true)]
async fn reminders_flow_through_a_session_opened_by_the_manager() {
    let connector = Arc::new(FakeConnector::new());
    let gateway = Arc::new(InMemoryGateway::new());
    let registry = Arc::new(SessionRegistry::new());
    gateway.insert_connection(connection("s1", "u1", false));

    let mut maria = client("c1", "u1", Some(date(2024, 5, 10)));
    maria.template = Some(template("Olá, {nome}! Vencimento {vencimento}."));
    gateway.insert_client(maria);

    let manager = Arc::new(ConnectionLifecycleManager::new(
        connector.clone(),
        Arc::new(InMemoryCredentialStore::new()),
        gateway.clone(),
        Arc::clone(&registry),
        Arc::new(BroadcastEventBus::default()),
    ));
    let dispatcher = ReminderDispatcher::new(
        gateway.clone(),
        Arc::clone(&registry),
        MessageRenderer::new("R$", "{nome}"),
    );

    // Not connected yet: the tenant is filtered out entirely.
    let idle = dispatcher.run_for(date(2024, 5, 10)).await.unwrap();
    assert_eq!(idle.examined, 0);

    let waiter = manager.start("s1").await.unwrap();
    let session = within(Duration::from_secs(5), connector.next_open())
        .await
        .flatten()
        .unwrap();
    session.emit(SocketEvent::Open { phone: None }).await;
    assert!(matches!(
        waiter.wait().await.unwrap(),
        ConnectOutcome::Ready { .. }
    ));

    let report = dispatcher.run_for(date(2024, 5, 12)).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(session.socket.sent()[0].text, "Olá, Maria! Vencimento 10/05/2024.");
    assert_eq!(
        gateway.client("c1").unwrap().last_reminder_due_at,
        Some(date(2024, 5, 10))
    );

    // A transient drop leaves the record connected but the registry empty.
    session
        .emit(SocketEvent::Closed {
            reason: DisconnectReason::ConnectionLost,
        })
        .await;
    eventually("session unregistered", || !registry.contains("s1")).await;

    let mut bruno = client("c2", "u1", Some(date(2024, 5, 12)));
    bruno.name = "Bruno".to_string();
    gateway.insert_client(bruno);

    let offline = dispatcher.run_for(date(2024, 5, 12)).await.unwrap();
    assert_eq!(offline.offline, 2);
    assert_eq!(offline.sent, 0);
    assert_eq!(session.socket.sent().len(), 1);
}
