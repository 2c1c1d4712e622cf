//! Realtime broadcast fan-out for chat/workflow observers.
//!
//! Subscribers attach to one of four scopes (conversation, user, workflow,
//! or the unfiltered firehose); each scope is its own `DashMap` of
//! `tokio::mpsc` senders, following the same one-channel-per-consumer shape
//! as `bus::EventBus`'s subscriptions, just addressed by string key instead
//! of a `Filter`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::domain_types::ExecutionId;

/// One message pushed to a realtime subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastMessage {
    /// Event type discriminator, e.g. `"chat_message"` or `"workflow_update"`.
    pub event_type: String,
    /// Arbitrary structured payload.
    pub payload: serde_json::Value,
    /// Send-time in milliseconds since the broadcaster started, for latency sampling.
    pub sequence: u64,
}

struct Subscriber {
    sender: mpsc::Sender<BroadcastMessage>,
}

/// Fan-out hub for conversation-, user-, workflow-, and firehose-scoped
/// realtime subscribers, plus a bounded latency sample ring.
pub struct RealtimeBroadcaster {
    conversation_subs: DashMap<String, Vec<Subscriber>>,
    user_subs: DashMap<String, Vec<Subscriber>>,
    workflow_subs: DashMap<String, Vec<Subscriber>>,
    firehose_subs: Mutex<Vec<Subscriber>>,
    sequence: AtomicU64,
    latency_samples: Mutex<VecDeque<Duration>>,
    ring_capacity: usize,
}

impl RealtimeBroadcaster {
    /// Creates an empty broadcaster with the given latency-ring capacity.
    #[must_use]
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            conversation_subs: DashMap::new(),
            user_subs: DashMap::new(),
            workflow_subs: DashMap::new(),
            firehose_subs: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            latency_samples: Mutex::new(VecDeque::new()),
            ring_capacity,
        }
    }

    /// Subscribes to all messages published for `conversation_id`.
    pub fn subscribe_conversation(&self, conversation_id: &str, capacity: usize) -> mpsc::Receiver<BroadcastMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        self.conversation_subs
            .entry(conversation_id.to_string())
            .or_default()
            .push(Subscriber { sender: tx });
        rx
    }

    /// Subscribes to all messages published for `user_id`, across their conversations.
    pub fn subscribe_user(&self, user_id: &str, capacity: usize) -> mpsc::Receiver<BroadcastMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        self.user_subs.entry(user_id.to_string()).or_default().push(Subscriber { sender: tx });
        rx
    }

    /// Subscribes to all progress updates for one pipeline execution.
    pub fn subscribe_workflow(&self, execution_id: ExecutionId, capacity: usize) -> mpsc::Receiver<BroadcastMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        self.workflow_subs
            .entry(execution_id.to_string())
            .or_default()
            .push(Subscriber { sender: tx });
        rx
    }

    /// Subscribes to every message broadcast through this hub, regardless of scope.
    pub async fn subscribe_firehose(&self, capacity: usize) -> mpsc::Receiver<BroadcastMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        self.firehose_subs.lock().await.push(Subscriber { sender: tx });
        rx
    }

    async fn publish(&self, scope_map: &DashMap<String, Vec<Subscriber>>, scope_key: &str, message: BroadcastMessage) {
        if let Some(subscribers) = scope_map.get(scope_key) {
            for subscriber in subscribers.iter() {
                let _ = subscriber.sender.try_send(message.clone());
            }
        }
        let firehose = self.firehose_subs.lock().await;
        for subscriber in firehose.iter() {
            let _ = subscriber.sender.try_send(message.clone());
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Broadcasts one chat message to conversation and user scopes.
    pub async fn broadcast_chat_message(&self, conversation_id: &str, user_id: Option<&str>, content: serde_json::Value) {
        let message = BroadcastMessage {
            event_type: "chat_message".to_string(),
            payload: content,
            sequence: self.next_sequence(),
        };
        self.publish(&self.conversation_subs, conversation_id, message.clone()).await;
        if let Some(user_id) = user_id {
            self.publish(&self.user_subs, user_id, message).await;
        }
    }

    /// Broadcasts a workflow progress update to that execution's scope.
    ///
    /// `status` is one of `"running" | "completed" | "failed"`. `error` is
    /// set only when `status == "failed"`.
    #[allow(clippy::too_many_arguments)]
    pub async fn broadcast_workflow_update(
        &self,
        execution_id: ExecutionId,
        event_type: &str,
        status: &str,
        progress: f64,
        participating_agents: Vec<String>,
        current_stage: Option<String>,
        error: Option<String>,
    ) {
        let payload = serde_json::json!({
            "execution_id": execution_id.to_string(),
            "status": status,
            "progress": progress,
            "participating_agents": participating_agents,
            "current_stage": current_stage,
            "error": error,
        });
        let message = BroadcastMessage {
            event_type: event_type.to_string(),
            payload,
            sequence: self.next_sequence(),
        };
        self.publish(&self.workflow_subs, &execution_id.to_string(), message).await;
    }

    /// Emits a `typing` indicator to a conversation's subscribers.
    pub async fn send_typing(&self, conversation_id: &str, is_typing: bool, agent_type: Option<&str>) {
        let message = BroadcastMessage {
            event_type: "typing".to_string(),
            payload: serde_json::json!({
                "conversation_id": conversation_id,
                "is_typing": is_typing,
                "agent_type": agent_type,
            }),
            sequence: self.next_sequence(),
        };
        self.publish(&self.conversation_subs, conversation_id, message).await;
    }

    /// Sends an arbitrary event to one conversation's subscribers.
    pub async fn send_to_conversation(&self, conversation_id: &str, event_type: &str, payload: serde_json::Value) {
        let message = BroadcastMessage {
            event_type: event_type.to_string(),
            payload,
            sequence: self.next_sequence(),
        };
        self.publish(&self.conversation_subs, conversation_id, message).await;
    }

    /// Broadcasts a multi-agent coordination progress update to a
    /// coordination session's subscribers (addressed the same way as a
    /// pipeline execution id).
    #[allow(clippy::too_many_arguments)]
    pub async fn broadcast_agent_coordination(
        &self,
        coordination_id: &str,
        agents: Vec<String>,
        task: &str,
        progress: f64,
        phase: &str,
        agent_statuses: HashMap<String, String>,
    ) {
        let payload = serde_json::json!({
            "coordination_id": coordination_id,
            "agents": agents,
            "task": task,
            "progress": progress,
            "phase": phase,
            "agent_statuses": agent_statuses,
        });
        let message = BroadcastMessage {
            event_type: "agent_coordination".to_string(),
            payload,
            sequence: self.next_sequence(),
        };
        self.publish(&self.workflow_subs, coordination_id, message).await;
    }

    /// Broadcasts `payload` to every subscriber in every scope, returning
    /// the number of recipients it was delivered to.
    pub async fn broadcast(&self, event_type: &str, payload: serde_json::Value) -> usize {
        let message = BroadcastMessage {
            event_type: event_type.to_string(),
            payload,
            sequence: self.next_sequence(),
        };
        let mut count = 0;
        for scope in [&self.conversation_subs, &self.user_subs, &self.workflow_subs] {
            for entry in scope.iter() {
                for subscriber in entry.value() {
                    if subscriber.sender.try_send(message.clone()).is_ok() {
                        count += 1;
                    }
                }
            }
        }
        let firehose = self.firehose_subs.lock().await;
        for subscriber in firehose.iter() {
            if subscriber.sender.try_send(message.clone()).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Records a round-trip latency sample, dropping the oldest once the
    /// ring reaches its configured capacity.
    pub async fn record_latency(&self, sample: Duration) {
        let mut samples = self.latency_samples.lock().await;
        if samples.len() >= self.ring_capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Snapshot latency percentile stats (p50/p95/p99) over the current ring.
    pub async fn latency_stats(&self) -> HashMap<String, f64> {
        let samples = self.latency_samples.lock().await;
        if samples.is_empty() {
            return HashMap::new();
        }
        let mut sorted: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let percentile = |p: f64| -> f64 {
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        HashMap::from([
            ("p50".to_string(), percentile(0.50)),
            ("p95".to_string(), percentile(0.95)),
            ("p99".to_string(), percentile(0.99)),
        ])
    }

    /// Number of firehose subscribers currently attached.
    pub async fn firehose_subscriber_count(&self) -> usize {
        self.firehose_subs.lock().await.len()
    }
}

/// Measures and records one latency sample around `f`.
pub async fn timed<T, F, Fut>(broadcaster: &RealtimeBroadcaster, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let started = Instant::now();
    let result = f().await;
    broadcaster.record_latency(started.elapsed()).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conversation_subscriber_receives_only_its_conversation() {
        let broadcaster = RealtimeBroadcaster::new(64);
        let mut rx_a = broadcaster.subscribe_conversation("conv-a", 8);
        let mut rx_b = broadcaster.subscribe_conversation("conv-b", 8);

        broadcaster.broadcast_chat_message("conv-a", None, serde_json::json!({"text": "hi"})).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn firehose_subscriber_sees_every_scope() {
        let broadcaster = RealtimeBroadcaster::new(64);
        let mut firehose = broadcaster.subscribe_firehose(16).await;
        broadcaster.broadcast_chat_message("conv-x", Some("user-1"), serde_json::json!({})).await;
        broadcaster
            .broadcast_workflow_update(ExecutionId::generate(), "workflow_update", "running", 0.5, vec![], None, None)
            .await;

        assert!(firehose.try_recv().is_ok());
        assert!(firehose.try_recv().is_ok());
    }

    #[tokio::test]
    async fn latency_ring_drops_oldest_past_capacity() {
        let broadcaster = RealtimeBroadcaster::new(2);
        broadcaster.record_latency(Duration::from_millis(10)).await;
        broadcaster.record_latency(Duration::from_millis(20)).await;
        broadcaster.record_latency(Duration::from_millis(30)).await;

        let stats = broadcaster.latency_stats().await;
        assert!(stats["p99"] <= 30.0);
        let samples = broadcaster.latency_samples.lock().await;
        assert_eq!(samples.len(), 2);
    }

    #[tokio::test]
    async fn typing_event_reaches_only_its_conversation() {
        let broadcaster = RealtimeBroadcaster::new(64);
        let mut rx_a = broadcaster.subscribe_conversation("conv-a", 8);
        let mut rx_b = broadcaster.subscribe_conversation("conv-b", 8);

        broadcaster.send_typing("conv-a", true, Some("market")).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_counts_every_delivered_recipient() {
        let broadcaster = RealtimeBroadcaster::new(64);
        let _rx_conv = broadcaster.subscribe_conversation("conv-a", 8);
        let _rx_user = broadcaster.subscribe_user("user-1", 8);
        let _rx_fire = broadcaster.subscribe_firehose(8).await;

        let delivered = broadcaster.broadcast("system_alert", serde_json::json!({"msg": "restart"})).await;
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn workflow_progress_is_scoped_to_its_execution_id() {
        let broadcaster = RealtimeBroadcaster::new(64);
        let target = ExecutionId::generate();
        let other = ExecutionId::generate();
        let mut rx = broadcaster.subscribe_workflow(target, 8);

        broadcaster
            .broadcast_workflow_update(other, "workflow_update", "running", 0.1, vec![], None, None)
            .await;
        assert!(rx.try_recv().is_err());

        broadcaster
            .broadcast_workflow_update(target, "workflow_update", "running", 0.2, vec![], None, None)
            .await;
        assert!(rx.try_recv().is_ok());
    }
}
