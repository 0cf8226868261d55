//! Notification sink for human-readable VM events.
//!
//! The supervisor and registry push status changes, process output lines and
//! error notices into an [`EventSink`]. Whoever owns the receiving end (the
//! CLI console printer) drains and displays them. The channel is unbounded so
//! the core never blocks on a slow or absent consumer; if the receiver has
//! been dropped, events are discarded silently.

use chrono::{DateTime, Local};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Event type
// ---------------------------------------------------------------------------

/// One timestamped console line.
#[derive(Debug, Clone)]
pub struct ConsoleEvent {
    /// Local time at which the event was emitted.
    pub timestamp: DateTime<Local>,
    /// Human-readable message, already tagged with the VM name where relevant.
    pub message: String,
}

impl ConsoleEvent {
    /// Render the event as a `[HH:MM:SS] message` console line.
    pub fn format_line(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

// ---------------------------------------------------------------------------
// Sink handle
// ---------------------------------------------------------------------------

/// Clone-able producer handle for console events.
///
/// `emit` is fire-and-forget: it never blocks and never returns an error, so
/// background tasks can notify without caring whether anyone is listening.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ConsoleEvent>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConsoleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Create a sink whose events go nowhere. Useful in tests that exercise
    /// the supervisor without a console.
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    /// Push a message into the sink, stamping it with the current time.
    pub fn emit(&self, message: impl Into<String>) {
        let event = ConsoleEvent {
            timestamp: Local::now(),
            message: message.into(),
        };
        // A closed channel just means the console is gone; drop the event.
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit("first");
        sink.emit("second");

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert_eq!(rx.recv().await.unwrap().message, "second");
    }

    #[test]
    fn emit_with_dropped_receiver_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit("nobody is listening");
    }

    #[test]
    fn format_line_contains_timestamp_brackets_and_message() {
        let event = ConsoleEvent {
            timestamp: Local::now(),
            message: "Started VM: alpine".to_string(),
        };
        let line = event.format_line();
        assert!(line.starts_with('['));
        assert!(line.ends_with("Started VM: alpine"));
    }
}
