pub mod config;
pub mod notify;

pub use config::LabConfig;
pub use notify::{LogSink, Notification, NotificationQueue, NotificationSink, OutboxSink};
