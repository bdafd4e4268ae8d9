use std::time::Duration;

use dunning_channel::{
    BridgeConnector, ChatConnector, ChatSocket, Credentials, Destination, DisconnectReason,
    SocketEvent, SocketEvents,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn connector(server: &MockServer) -> BridgeConnector {
    Mock::given(method("POST"))
        .and(path("/sessions/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(server)
        .await;

    BridgeConnector::new(&server.uri())
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
}

async fn recv(events: &mut SocketEvents) -> SocketEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for bridge event")
        .expect("event stream ended")
}

#[tokio::test]
async fn test_open_streams_events_in_sequence() {
    let server = MockServer::start().await;
    let connector = connector(&server).await;

    Mock::given(method("GET"))
        .and(path("/sessions/s1/events"))
        .and(query_param("after", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                { "seq": 1, "type": "qr", "code": "2@abc" },
                { "seq": 2, "type": "open", "phone": "5511988887777" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/s1/events"))
        .and(query_param("after", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [{ "seq": 3, "type": "close", "status_code": 401 }]
        })))
        .mount(&server)
        .await;

    let (_socket, mut events) = connector.open("s1", Credentials::fresh()).await.unwrap();

    assert_eq!(
        recv(&mut events).await,
        SocketEvent::Pairing {
            payload: "2@abc".into()
        }
    );
    assert_eq!(
        recv(&mut events).await,
        SocketEvent::Open {
            phone: Some("5511988887777".into())
        }
    );
    assert_eq!(
        recv(&mut events).await,
        SocketEvent::Closed {
            reason: DisconnectReason::LoggedOut
        }
    );
    assert!(events.recv().await.is_none(), "stream ends after close");
}

#[tokio::test]
async fn test_unknown_event_types_are_skipped() {
    let server = MockServer::start().await;
    let connector = connector(&server).await;

    Mock::given(method("GET"))
        .and(path("/sessions/s1/events"))
        .and(query_param("after", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                { "seq": 1, "type": "qr", "code": "2@abc" },
                { "seq": 2, "type": "receipt", "id": "3EB0C431" },
                { "seq": 3, "type": "open" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/s1/events"))
        .and(query_param("after", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "events": [] })))
        .mount(&server)
        .await;

    let (_socket, mut events) = connector.open("s1", Credentials::fresh()).await.unwrap();

    assert_eq!(
        recv(&mut events).await,
        SocketEvent::Pairing {
            payload: "2@abc".into()
        }
    );
    assert_eq!(recv(&mut events).await, SocketEvent::Open { phone: None });
    assert!(
        tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err(),
        "no close after an unknown event"
    );
}

#[tokio::test]
async fn test_poll_failure_surfaces_as_connection_lost() {
    let server = MockServer::start().await;
    let connector = connector(&server).await;

    Mock::given(method("GET"))
        .and(path("/sessions/s1/events"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (_socket, mut events) = connector.open("s1", Credentials::fresh()).await.unwrap();
    assert_eq!(
        recv(&mut events).await,
        SocketEvent::Closed {
            reason: DisconnectReason::ConnectionLost
        }
    );
}

#[tokio::test]
async fn test_open_rejected_by_bridge() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let connector = BridgeConnector::new(&server.uri()).unwrap();
    let err = connector
        .open("s1", Credentials::fresh())
        .await
        .err()
        .expect("open must fail");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_send_and_contact_lookup() {
    let server = MockServer::start().await;
    let connector = connector(&server).await;

    Mock::given(method("GET"))
        .and(path("/sessions/s1/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "events": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/messages"))
        .and(body_json(json!({ "to": "5511999990000", "text": "Olá" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/s1/contacts/5511999990000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "exists": true })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/s1/contacts/5500000000000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "exists": false })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/sessions/s1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (socket, _events) = connector.open("s1", Credentials::fresh()).await.unwrap();
    let known = Destination::from_phone("+55 11 99999-0000").unwrap();
    let unknown = Destination::from_phone("5500000000000").unwrap();

    assert!(socket.is_on_network(&known).await.unwrap());
    assert!(!socket.is_on_network(&unknown).await.unwrap());
    socket.send_text(&known, "Olá").await.unwrap();

    socket.close().await.unwrap();
    socket.close().await.unwrap();
    assert!(socket.send_text(&known, "late").await.is_err());
}
