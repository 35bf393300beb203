//! In-process publish/subscribe event bus (spec §2.3, §6 event topics).
//!
//! Fan-out is best-effort: slow subscribers drop the oldest buffered event
//! rather than block publishers (spec §5 "Shared-resource policy"). Delivery
//! is per-topic FIFO for a single subscriber; cross-topic ordering is
//! undefined, matching spec §5's ordering guarantees.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One published event. `topic` follows the dotted taxonomy in spec §6
/// (`workflow.started`, `agent.heartbeat`, `metric.sample`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dotted topic name.
    pub topic: String,
    /// Execution, agent, or system subject this event concerns.
    pub subject: String,
    /// Opaque JSON payload, shape defined per-topic at the design level.
    pub payload: serde_json::Value,
    /// Milliseconds since epoch, from the injected [`crate::clock::Clock`].
    pub emitted_at_ms: u64,
}

/// A filter over topics, applied at subscribe time.
#[derive(Debug, Clone, Default)]
pub enum TopicFilter {
    /// Deliver every event.
    #[default]
    All,
    /// Deliver only events whose topic starts with this prefix
    /// (e.g. `"workflow."`).
    Prefix(String),
    /// Deliver only events matching one of these exact topics.
    Exact(Vec<String>),
}

impl TopicFilter {
    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicFilter::Exact(topics) => topics.iter().any(|t| t == topic),
        }
    }
}

/// In-process event bus. Cheap to clone; clones share the same broadcast
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity. Once a
    /// subscriber's buffer is full, the oldest unread event is dropped for
    /// that subscriber (spec §5: "slow subscribers drop oldest").
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers it was
    /// delivered to; publishing never blocks and never fails on a full
    /// queue (the bus drops from the lagging reader, not the writer).
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events matching `filter`. The returned stream yields
    /// `None` entries silently skipped; callers only see matching events.
    #[must_use]
    pub fn subscribe(&self, filter: TopicFilter) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }
}

/// A live subscription. Call [`EventSubscription::recv`] in a loop.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
    filter: TopicFilter,
}

/// Outcome of waiting for the next event on a subscription.
#[derive(Debug)]
pub enum RecvOutcome {
    /// The next matching event.
    Event(Event),
    /// The subscriber fell behind and this many events were dropped.
    Lagged(u64),
    /// The bus has no more publishers and will never yield again.
    Closed,
}

impl EventSubscription {
    /// Wait for the next event matching this subscription's filter. Events
    /// that do not match the filter are silently skipped; lag is reported
    /// once per gap rather than silently absorbed.
    pub async fn recv(&mut self) -> RecvOutcome {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event.topic) => return RecvOutcome::Event(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return RecvOutcome::Lagged(n),
                Err(broadcast::error::RecvError::Closed) => return RecvOutcome::Closed,
            }
        }
    }
}

/// Well-known topic names (spec §6).
pub mod topics {
    /// A new execution was created and its root step enqueued.
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    /// An execution reached a terminal phase.
    pub const WORKFLOW_FINISHED: &str = "workflow.finished";
    /// An execution was paused.
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    /// A paused execution resumed.
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    /// An execution was cancelled.
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
    /// An execution was reconstructed from a checkpoint after a crash.
    pub const WORKFLOW_RECOVERED: &str = "workflow.recovered";
    /// New dispatch was parked because `maxConcurrentSteps` was reached.
    pub const WORKFLOW_THROTTLED: &str = "workflow.throttled";
    /// A step entered the run queue.
    pub const STEP_SCHEDULED: &str = "workflow.step.scheduled";
    /// A step began running.
    pub const STEP_STARTED: &str = "workflow.step.started";
    /// A step reached a terminal status, carrying its outcome.
    pub const STEP_FINISHED: &str = "workflow.step.finished";
    /// A step is being retried after a failed attempt.
    pub const STEP_RETRY: &str = "workflow.step.retry";
    /// A new agent registered with the pool.
    pub const AGENT_REGISTERED: &str = "agent.registered";
    /// An agent heartbeat was recorded.
    pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";
    /// An agent's status changed (e.g. available → degraded).
    pub const AGENT_STATUS_CHANGED: &str = "agent.status.changed";
    /// An agent was retired.
    pub const AGENT_RETIRED: &str = "agent.retired";
    /// A periodic system+workflow metric sample.
    pub const METRIC_SAMPLE: &str = "metric.sample";
    /// An alert rule newly fired.
    pub const ALERT_FIRED: &str = "alert.fired";
    /// A previously active alert cleared.
    pub const ALERT_CLEARED: &str = "alert.cleared";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: &str) -> Event {
        Event {
            topic: topic.to_string(),
            subject: "wf-1".to_string(),
            payload: serde_json::Value::Null,
            emitted_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_topics_only() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(TopicFilter::Prefix("workflow.".to_string()));

        bus.publish(event("agent.registered"));
        bus.publish(event(topics::WORKFLOW_STARTED));

        match sub.recv().await {
            RecvOutcome::Event(e) => assert_eq!(e.topic, topics::WORKFLOW_STARTED),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_it_dropped_events() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(TopicFilter::All);

        for i in 0..10 {
            bus.publish(event(&format!("metric.sample.{i}")));
        }

        match sub.recv().await {
            RecvOutcome::Lagged(_) | RecvOutcome::Event(_) => {}
            RecvOutcome::Closed => panic!("bus should not be closed"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(event("metric.sample")), 0);
    }
}
