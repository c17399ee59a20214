//! Progress and status notifications
//!
//! Every layer reports through an [`EventSink`]. Calls happen synchronously
//! on the task doing the work, in the order things happened. Use
//! [`ChannelSink`] to consume events from another task.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Severity of an informational message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What the library was doing when it emitted a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Idle,
    Connecting,
    SecurityAccess,
    Erasing,
    Writing,
    Reading,
    Verifying,
    Resetting,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Activity::Idle => "idle",
            Activity::Connecting => "connecting",
            Activity::SecurityAccess => "security access",
            Activity::Erasing => "erasing",
            Activity::Writing => "writing",
            Activity::Reading => "reading",
            Activity::Verifying => "verifying",
            Activity::Resetting => "resetting",
        };
        f.write_str(s)
    }
}

/// Write progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteProgress {
    pub percentage: u8,
    pub bytes_total: usize,
    pub bytes_done: usize,
}

impl WriteProgress {
    pub fn new(bytes_done: usize, bytes_total: usize) -> Self {
        Self {
            percentage: percentage(bytes_done, bytes_total),
            bytes_total,
            bytes_done,
        }
    }
}

/// Percentage of `done` in `total`, 100 for an empty total
pub fn percentage(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u64 * 100) / total as u64) as u8
}

/// Receiver of progress and status notifications
pub trait EventSink: Send + Sync {
    fn on_write_progress(&self, progress: WriteProgress);

    fn on_read_progress(&self, percentage: u8);

    fn on_info(&self, message: &str, severity: Severity, activity: Activity);
}

/// Owned form of a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlashEvent {
    WriteProgress(WriteProgress),
    ReadProgress {
        percentage: u8,
    },
    Info {
        message: String,
        severity: Severity,
        activity: Activity,
    },
}

/// Forwards every notification into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FlashEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlashEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: FlashEvent) {
        // The receiver going away only means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_write_progress(&self, progress: WriteProgress) {
        self.send(FlashEvent::WriteProgress(progress));
    }

    fn on_read_progress(&self, percentage: u8) {
        self.send(FlashEvent::ReadProgress { percentage });
    }

    fn on_info(&self, message: &str, severity: Severity, activity: Activity) {
        self.send(FlashEvent::Info {
            message: message.to_string(),
            severity,
            activity,
        });
    }
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_write_progress(&self, _progress: WriteProgress) {}

    fn on_read_progress(&self, _percentage: u8) {}

    fn on_info(&self, _message: &str, _severity: Severity, _activity: Activity) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 256), 0);
        assert_eq!(percentage(128, 256), 50);
        assert_eq!(percentage(256, 256), 100);
        assert_eq!(percentage(300, 256), 100);
        assert_eq!(percentage(0, 0), 100);
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();

        sink.on_info("connecting", Severity::Info, Activity::Connecting);
        sink.on_write_progress(WriteProgress::new(64, 128));
        sink.on_read_progress(10);
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                FlashEvent::Info {
                    message: "connecting".to_string(),
                    severity: Severity::Info,
                    activity: Activity::Connecting,
                },
                FlashEvent::WriteProgress(WriteProgress {
                    percentage: 50,
                    bytes_total: 128,
                    bytes_done: 64,
                }),
                FlashEvent::ReadProgress { percentage: 10 },
            ]
        );
    }
}
