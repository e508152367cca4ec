//! Lifecycle event sink.
//!
//! The pinger reports traversal progress through a narrow one-way interface so
//! that observability stays out of the punching hot path. Publishing is
//! fire-and-forget: implementations must not block the caller.

use serde_json::Value;

pub const TOPIC_TRAVERSAL_STARTED: &str = "traversal.started";
pub const TOPIC_TRAVERSAL_SUCCEEDED: &str = "traversal.succeeded";
pub const TOPIC_TRAVERSAL_FAILED: &str = "traversal.failed";

pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);
}

/// Discards every event.
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _topic: &str, _payload: Value) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::EventPublisher;

    /// Records published events for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) events: Mutex<Vec<(String, Value)>>,
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, topic: &str, payload: Value) {
            self.events.lock().push((topic.to_string(), payload));
        }
    }

    impl RecordingPublisher {
        pub(crate) fn topics(&self) -> Vec<String> {
            self.events.lock().iter().map(|(t, _)| t.clone()).collect()
        }
    }
}
