use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lifecycle events published by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A task was claimed by an agent.
    TaskAssigned,
    /// An assigned task began running.
    TaskStarted,
    /// A task finished successfully.
    TaskCompleted,
    /// A failed task went back to PENDING with one more retry consumed.
    TaskRetryScheduled,
    /// A task exhausted its retries (or failed permanently). Requires escalation.
    TaskDead,
    /// An in-flight task was returned to PENDING because its owner disappeared.
    TaskRequeued,
    /// A running task exceeded its execution timeout.
    TaskTimedOut,
    /// A task was cancelled by request.
    TaskCancelled,
    /// A new agent joined the fleet.
    AgentRegistered,
    /// An agent missed its heartbeat deadline.
    AgentStale,
    /// An agent is late on heartbeats but not yet stale.
    AgentDegraded,
    /// A stale or degraded agent resumed heartbeating.
    AgentRecovered,
    /// An agent was deregistered.
    AgentTerminated,
    /// An agent let one or more heartbeat TTLs pass. Carries the escalation level.
    HeartbeatMissed,
    /// Heartbeat sequence numbers skipped ahead; some beats never arrived.
    HeartbeatSequenceGap,
}

impl EventKind {
    /// Wire name of the event (`TASK_ASSIGNED`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskAssigned => "TASK_ASSIGNED",
            EventKind::TaskStarted => "TASK_STARTED",
            EventKind::TaskCompleted => "TASK_COMPLETED",
            EventKind::TaskRetryScheduled => "TASK_RETRY_SCHEDULED",
            EventKind::TaskDead => "TASK_DEAD",
            EventKind::TaskRequeued => "TASK_REQUEUED",
            EventKind::TaskTimedOut => "TASK_TIMED_OUT",
            EventKind::TaskCancelled => "TASK_CANCELLED",
            EventKind::AgentRegistered => "AGENT_REGISTERED",
            EventKind::AgentStale => "AGENT_STALE",
            EventKind::AgentDegraded => "AGENT_DEGRADED",
            EventKind::AgentRecovered => "AGENT_RECOVERED",
            EventKind::AgentTerminated => "AGENT_TERMINATED",
            EventKind::HeartbeatMissed => "HEARTBEAT_MISSED",
            EventKind::HeartbeatSequenceGap => "HEARTBEAT_SEQUENCE_GAP",
        }
    }

    /// The kind of entity the event is about (`task` or `agent`).
    pub fn entity_type(&self) -> &'static str {
        match self {
            EventKind::TaskAssigned
            | EventKind::TaskStarted
            | EventKind::TaskCompleted
            | EventKind::TaskRetryScheduled
            | EventKind::TaskDead
            | EventKind::TaskRequeued
            | EventKind::TaskTimedOut
            | EventKind::TaskCancelled => "task",
            EventKind::AgentRegistered
            | EventKind::AgentStale
            | EventKind::AgentDegraded
            | EventKind::AgentRecovered
            | EventKind::AgentTerminated
            | EventKind::HeartbeatMissed
            | EventKind::HeartbeatSequenceGap => "agent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event as delivered to the external bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Wire name, e.g. `TASK_ASSIGNED`.
    pub event_type: String,
    /// `task` or `agent`.
    pub entity_type: String,
    /// Id of the task or agent.
    pub entity_id: String,
    /// Event-specific fields.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event with an empty payload.
    pub fn new(kind: EventKind, entity_id: impl ToString) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            entity_type: kind.entity_type().to_string(),
            entity_id: entity_id.to_string(),
            payload: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds a payload field.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// True if this event has the given kind.
    pub fn is(&self, kind: EventKind) -> bool {
        self.event_type == kind.as_str()
    }
}

/// Receives published events. Delivery is best-effort: sinks swallow their own failures.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handle one event.
    async fn on_event(&self, event: &Event);
}

/// Fan-out publisher that dispatches each event to every registered sink.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    /// Creates a bus with no sinks. Events published to it are dropped.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Adds a sink to the bus.
    pub fn add(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Builder-style [`EventBus::add`].
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.add(sink);
        self
    }

    /// Publishes an event to all sinks, in registration order.
    pub async fn publish(&self, event: Event) {
        for sink in &self.sinks {
            sink.on_event(&event).await;
        }
    }

    /// Number of registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

/// Writes every event to the tracing log.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn on_event(&self, event: &Event) {
        info!(
            event_type = %event.event_type,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            payload = %serde_json::Value::Object(event.payload.clone()),
            "event"
        );
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Creates the sink and the receiving half of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn on_event(&self, event: &Event) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Append-only JSON-lines event log, written by a background task.
pub struct JsonlSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl JsonlSink {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn new(path: PathBuf) -> Self {
        Self::spawn(path).0
    }

    /// Like [`JsonlSink::new`], also returning the writer's handle. The
    /// writer exits once every clone of the sink has been dropped, so
    /// awaiting the handle after that guarantees the log is flushed.
    pub fn spawn(path: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let handle = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;

            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "event log unavailable");
                    return;
                }
            };

            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    let line = format!("{line}\n");
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        warn!(error = %e, "failed to append event");
                        continue;
                    }
                    let _ = file.flush().await;
                }
            }
        });

        (Self { tx }, handle)
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn on_event(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_schema_fields() {
        let event = Event::new(EventKind::TaskDead, "task-1").with("retry_count", 3);
        assert_eq!(event.event_type, "TASK_DEAD");
        assert_eq!(event.entity_type, "task");
        assert_eq!(event.entity_id, "task-1");
        assert_eq!(event.payload["retry_count"], 3);
        assert!(event.is(EventKind::TaskDead));
    }

    #[test]
    fn test_event_kind_serializes_as_wire_name() {
        let json = serde_json::to_string(&EventKind::AgentRecovered).unwrap();
        assert_eq!(json, "\"AGENT_RECOVERED\"");
        assert_eq!(EventKind::AgentRecovered.entity_type(), "agent");
    }

    #[tokio::test]
    async fn test_bus_fans_out_to_all_sinks() {
        let (first, mut rx1) = ChannelSink::new();
        let (second, mut rx2) = ChannelSink::new();
        let bus = EventBus::new()
            .with_sink(Arc::new(first))
            .with_sink(Arc::new(second))
            .with_sink(Arc::new(LogSink));
        assert_eq!(bus.sink_count(), 3);

        bus.publish(Event::new(EventKind::AgentStale, "agent-7")).await;

        assert_eq!(rx1.recv().await.unwrap().entity_id, "agent-7");
        assert_eq!(rx2.recv().await.unwrap().event_type, "AGENT_STALE");
    }

    #[tokio::test]
    async fn test_publish_without_sinks_is_noop() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventKind::TaskCompleted, "t")).await;
        assert_eq!(bus.sink_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_fail_publish() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let bus = EventBus::new().with_sink(Arc::new(sink));
        bus.publish(Event::new(EventKind::TaskAssigned, "t")).await;
    }
}
