//! Typed per-testrun event channel.
//!
//! Each testrun owns one [`EventBus`]. The distributor publishes lifecycle
//! events as they happen; any number of observers (progress bars, log
//! forwarders) subscribe for the duration of that one orchestration. There
//! is deliberately no process-wide dispatcher: a bus is created with its
//! testrun and dropped with it, so listeners can never outlive the run they
//! observe.

use tokio::sync::broadcast;

use crate::environment::Environment;

/// Default buffer size for a testrun's event channel.
const DEFAULT_CAPACITY: usize = 256;

/// Lifecycle events observable during one testrun.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestrunEvent {
    /// A task was published to its worker queue.
    TaskDispatched {
        /// Id of the dispatched task.
        task_id: String,
    },
    /// A worker claimed a task.
    TaskStarted {
        /// Id of the claimed task.
        task_id: String,
    },
    /// A worker finished a task.
    TaskFinished {
        /// Id of the finished task.
        task_id: String,
    },
    /// A results document arrived for a (package, environment) pair.
    DocumentReceived {
        /// Package the document covers.
        package: String,
        /// Environment the package ran in.
        environment: Environment,
    },
    /// The testrun reached its terminal status.
    Ended,
}

/// Publish/subscribe channel scoped to one testrun.
///
/// Publishing never blocks and never fails: with no live subscribers the
/// event is simply dropped, and a subscriber that falls behind the buffer
/// misses the oldest events (`broadcast` semantics).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TestrunEvent>,
}

impl EventBus {
    /// Creates a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: TestrunEvent) {
        // An Err here only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TestrunEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(TestrunEvent::TaskStarted {
            task_id: "t1".into(),
        });

        let expected = TestrunEvent::TaskStarted {
            task_id: "t1".into(),
        };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(TestrunEvent::Ended);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_starts_at_subscribe_time() {
        let bus = EventBus::new();
        bus.publish(TestrunEvent::TaskDispatched {
            task_id: "missed".into(),
        });

        let mut rx = bus.subscribe();
        bus.publish(TestrunEvent::Ended);
        assert_eq!(rx.recv().await.unwrap(), TestrunEvent::Ended);
    }
}
