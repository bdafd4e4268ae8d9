pub mod dispatcher;
pub mod error;
pub mod render;
pub mod schedule;

pub use dispatcher::{DispatchReport, ReminderDispatcher};
pub use error::ReminderError;
pub use render::MessageRenderer;
pub use schedule::{run_daily, DailySchedule};
