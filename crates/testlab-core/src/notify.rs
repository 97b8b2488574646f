//! Out-of-band alerting.
//!
//! Components enqueue [`Notification`]s without blocking on delivery; the
//! dispatcher drains the queue once per tick into every configured
//! [`NotificationSink`].

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// One alert destined for a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    /// Unix timestamp (seconds) when the alert was raised.
    pub raised_at: u64,
}

impl Notification {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            raised_at: unix_now(),
        }
    }
}

/// Shared, fire-and-forget alert queue. Cloning shares the same queue.
#[derive(Debug, Clone, Default)]
pub struct NotificationQueue {
    pending: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, subject: impl Into<String>, body: impl Into<String>) {
        let notification = Notification::new(subject, body);
        warn!(subject = %notification.subject, "notification queued");
        self.lock().push(notification);
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the queue into every sink. Sink failures are logged and the
    /// remaining sinks still see the batch.
    pub fn flush(&self, sinks: &[Box<dyn NotificationSink>]) -> usize {
        let batch = self.drain();
        if batch.is_empty() {
            return 0;
        }
        for sink in sinks {
            if let Err(e) = sink.deliver(&batch) {
                error!(sink = sink.name(), error = %e, "failed to deliver notifications");
            }
        }
        batch.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        // A poisoned queue still holds valid notifications.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Destination for drained notifications.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, batch: &[Notification]) -> anyhow::Result<()>;
}

/// Writes every notification to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, batch: &[Notification]) -> anyhow::Result<()> {
        for n in batch {
            warn!(subject = %n.subject, body = %n.body, raised_at = n.raised_at, "alert");
        }
        Ok(())
    }
}

/// Appends notifications as JSON lines for an external mailer to pick up.
#[derive(Debug)]
pub struct OutboxSink {
    path: PathBuf,
}

impl OutboxSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NotificationSink for OutboxSink {
    fn name(&self) -> &str {
        "outbox"
    }

    fn deliver(&self, batch: &[Notification]) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for n in batch {
            let mut line = serde_json::to_vec(n)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.flush()?;
        Ok(())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
