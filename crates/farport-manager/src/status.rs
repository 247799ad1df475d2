//! Status feed
//!
//! Session state changes go out on a bounded channel. Delivery is
//! best-effort: a saturated feed drops the event after a short deadline,
//! and command replies stay the authoritative outcome signal.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::model::StatusEvent;

/// How long a status push waits before the event is dropped
pub const STATUS_PUSH_DEADLINE: Duration = Duration::from_secs(1);

/// Sending side of the status feed.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: mpsc::Sender<StatusEvent>,
}

impl StatusPublisher {
    /// Create a feed of the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Push an event, dropping it if the feed stays full past the deadline.
    pub async fn publish(&self, event: StatusEvent) {
        match self.tx.send_timeout(event, STATUS_PUSH_DEADLINE).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(event)) => {
                warn!(
                    "Failed to send status for '{}': channel full",
                    event.instance_name
                );
            }
            Err(SendTimeoutError::Closed(event)) => {
                debug!(
                    "Status feed closed; dropping event for '{}'",
                    event.instance_name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_delivers_event() {
        let (publisher, mut rx) = StatusPublisher::channel(4);
        publisher.publish(StatusEvent::connected(1, "db", 5432)).await;
        assert_eq!(rx.recv().await.unwrap(), StatusEvent::connected(1, "db", 5432));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_feed_drops_after_deadline() {
        let (publisher, mut rx) = StatusPublisher::channel(1);
        publisher.publish(StatusEvent::connected(1, "db", 1111)).await;
        // Feed is full; this one waits out the deadline and is dropped.
        publisher.publish(StatusEvent::connected(2, "web", 2222)).await;

        assert_eq!(rx.recv().await.unwrap().instance_id, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_feed_does_not_panic() {
        let (publisher, rx) = StatusPublisher::channel(1);
        drop(rx);
        publisher.publish(StatusEvent::disconnected(1, "db")).await;
    }
}
