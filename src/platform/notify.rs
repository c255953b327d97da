use tracing::error;

use crate::platform::NotificationSink;

// Forward alarms to the log, at the highest severity
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn critical(&self, message: &str) {
        error!(critical = true, "{message}");
    }
}
