//! Process-local event hub: per-task ring buffer with subscriber fan-out,
//! replay, and slow-consumer eviction (§4.6).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Bound on the per-task ring buffer; oldest events are dropped on overflow.
const RING_CAPACITY: usize = 1000;
/// Bound on each subscriber's outbound channel; a full channel evicts the
/// subscriber rather than blocking the publisher.
const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Thinking,
    ToolCall,
    ToolResult,
    Error,
}

/// A single progress record (§3.3). Not persisted on the task object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub type_: EventType,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// The terminal outcome carried in a hub's `task_complete` message, mirrored
/// into the WebSocket frame of the same name (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "status")]
    pub phase: String,
    #[serde(rename = "prURL", skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a subscriber's channel carries: either a replayed/live event, or the
/// one-shot terminal outcome sent when the hub marks the task done.
#[derive(Debug, Clone)]
pub enum HubMessage {
    Event(Event),
    Complete(TaskOutcome),
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<HubMessage>,
}

struct TaskEntry {
    ring: VecDeque<Event>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    done: bool,
}

impl TaskEntry {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            done: false,
        }
    }
}

#[derive(Default)]
pub struct EventHub {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

/// A live subscription: a replay slice plus, unless the task was already
/// done at subscribe time, a channel for subsequent messages.
pub struct Subscription {
    pub replay: Vec<Event>,
    pub id: u64,
    pub receiver: Option<mpsc::Receiver<HubMessage>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends events to the task's ring and fans them out to subscribers.
    /// A no-op if the task is already marked done.
    pub fn publish(&self, task_id: &str, events: Vec<Event>) {
        let mut tasks = self.tasks.lock().unwrap();
        let entry = tasks.entry(task_id.to_string()).or_insert_with(TaskEntry::new);
        if entry.done {
            return;
        }

        for event in events {
            if entry.ring.len() == RING_CAPACITY {
                entry.ring.pop_front();
            }
            entry.ring.push_back(event.clone());

            entry.subscribers.retain(|sub| {
                match sub.sender.try_send(HubMessage::Event(event.clone())) {
                    Ok(()) => true,
                    Err(_) => {
                        debug!(task_id, subscriber_id = sub.id, "evicting slow subscriber");
                        false
                    }
                }
            });
        }
    }

    /// Subscribes to a task's event stream, replaying everything with
    /// `sequence > after`. Returns `receiver: None` if the task is already
    /// done -- the caller should treat this as "nothing more to deliver".
    pub fn subscribe(&self, task_id: &str, after: u64) -> Subscription {
        let mut tasks = self.tasks.lock().unwrap();
        let entry = tasks.entry(task_id.to_string()).or_insert_with(TaskEntry::new);

        let replay: Vec<Event> = entry
            .ring
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect();

        if entry.done {
            return Subscription {
                replay,
                id: 0,
                receiver: None,
            };
        }

        let id = entry.next_subscriber_id;
        entry.next_subscriber_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        entry.subscribers.push(Subscriber { id, sender: tx });

        Subscription {
            replay,
            id,
            receiver: Some(rx),
        }
    }

    /// Idempotent: removing a subscriber that's already gone (evicted, or
    /// never existed) is a no-op.
    pub fn unsubscribe(&self, task_id: &str, subscriber_id: u64) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Marks the task done and sends every subscriber a terminal `Complete`
    /// message. Subsequent `publish` calls for this task are no-ops.
    pub fn complete(&self, task_id: &str, outcome: TaskOutcome) {
        let mut tasks = self.tasks.lock().unwrap();
        let entry = tasks.entry(task_id.to_string()).or_insert_with(TaskEntry::new);
        entry.done = true;
        for sub in entry.subscribers.drain(..) {
            let _ = sub.sender.try_send(HubMessage::Complete(outcome.clone()));
        }
    }

    /// Distinguishes "the hub completed this task" from "this subscriber
    /// was evicted for slowness" -- the WS handler uses this to decide
    /// whether a `task_complete` frame is appropriate.
    pub fn is_stream_done(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .is_some_and(|e| e.done)
    }

    /// Completes (if not already) and removes the task's entry entirely.
    pub fn cleanup(&self, task_id: &str) {
        {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(entry) = tasks.get_mut(task_id) {
                if !entry.done {
                    entry.done = true;
                    entry.subscribers.clear();
                }
            }
        }
        self.tasks.lock().unwrap().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> Event {
        Event {
            sequence: seq,
            timestamp: Utc::now(),
            type_: EventType::Thinking,
            summary: format!("step {seq}"),
            tool: None,
            input: None,
            output: None,
        }
    }

    #[test]
    fn ring_buffer_keeps_last_k_events() {
        let hub = EventHub::new();
        for i in 1..=(RING_CAPACITY as u64 + 50) {
            hub.publish("task-a", vec![event(i)]);
        }
        let sub = hub.subscribe("task-a", 0);
        assert_eq!(sub.replay.len(), RING_CAPACITY);
        assert_eq!(sub.replay.first().unwrap().sequence, 51);
    }

    #[test]
    fn replay_honors_after_cursor() {
        let hub = EventHub::new();
        hub.publish("task-a", vec![event(1), event(2), event(3)]);
        let sub = hub.subscribe("task-a", 1);
        let sequences: Vec<u64> = sub.replay.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[tokio::test]
    async fn live_events_are_delivered_to_subscriber() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("task-a", 0);
        hub.publish("task-a", vec![event(1)]);

        let msg = sub.receiver.as_mut().unwrap().recv().await.unwrap();
        match msg {
            HubMessage::Event(e) => assert_eq!(e.sequence, 1),
            HubMessage::Complete(_) => panic!("expected an event"),
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_blocking_publish() {
        let hub = EventHub::new();
        let sub = hub.subscribe("task-a", 0);

        for i in 1..=(SUBSCRIBER_CAPACITY as u64 + 1) {
            hub.publish("task-a", vec![event(i)]);
        }

        // The channel should now be closed server-side (subscriber evicted).
        drop(sub);
        assert!(hub.tasks.lock().unwrap().get("task-a").unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn complete_sends_terminal_message_and_marks_done() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("task-a", 0);

        hub.complete(
            "task-a",
            TaskOutcome {
                task_id: "task-a".to_string(),
                phase: "Succeeded".to_string(),
                pr_url: Some("https://github.com/acme/widget/pull/7".to_string()),
                error: None,
            },
        );

        assert!(hub.is_stream_done("task-a"));
        let msg = sub.receiver.as_mut().unwrap().recv().await.unwrap();
        assert!(matches!(msg, HubMessage::Complete(_)));
    }

    #[test]
    fn publish_after_complete_is_a_no_op() {
        let hub = EventHub::new();
        hub.complete(
            "task-a",
            TaskOutcome {
                task_id: "task-a".to_string(),
                phase: "Succeeded".to_string(),
                pr_url: None,
                error: None,
            },
        );
        hub.publish("task-a", vec![event(1)]);
        let sub = hub.subscribe("task-a", 0);
        assert!(sub.replay.is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub = EventHub::new();
        let sub = hub.subscribe("task-a", 0);
        hub.unsubscribe("task-a", sub.id);
        hub.unsubscribe("task-a", sub.id);
    }

    #[test]
    fn cleanup_removes_entry() {
        let hub = EventHub::new();
        hub.publish("task-a", vec![event(1)]);
        hub.cleanup("task-a");
        assert!(!hub.tasks.lock().unwrap().contains_key("task-a"));
    }
}
