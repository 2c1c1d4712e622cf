//! Communication manager: binds the agent registry and event bus into a
//! request/response-capable messaging surface for agents and pipelines.
//!
//! Splits "who" from "how": the registry answers who should handle a
//! message, the event bus answers how it gets there, and this module is
//! the thin layer translating a `Message` into bus traffic and back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::instrument;

use crate::bus::{Event, EventBus, EventKind, Filter};
use crate::domain_types::{AgentCategory, AgentId, CorrelationId, Priority};
use crate::message::{Message, MessageBody};
use crate::registry::AgentRegistry;

/// Errors raised by communication manager operations.
#[derive(Debug, Error)]
pub enum CommunicationError {
    /// No registered, available agent matched the dispatch target.
    #[error("no eligible agent for dispatch")]
    NoEligibleAgent,
    /// The bus rejected the publish (shut down or blocked past timeout).
    #[error("bus publish failed: {0}")]
    Bus(#[from] crate::bus::BusError),
    /// A request awaiting a correlated response timed out.
    #[error("timed out waiting for response")]
    ResponseTimeout,
}

/// Coordinates message dispatch between agents, categories, and pipeline stages.
pub struct CommunicationManager {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    pending_responses: DashMap<CorrelationId, oneshot::Sender<serde_json::Value>>,
    response_timeout: Duration,
}

impl CommunicationManager {
    /// Creates a manager bound to `registry` for target resolution and
    /// `bus` for transport.
    #[must_use]
    pub fn new(registry: Arc<AgentRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            bus,
            pending_responses: DashMap::new(),
            response_timeout: Duration::from_secs(30),
        }
    }

    /// Overrides the default response wait timeout, builder-style.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Installs the bus subscription that resolves pending `Response`
    /// futures created by `send_and_await`. Call once at startup.
    pub fn install_response_listener(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.bus.subscribe(
            Filter::Name("message_dispatched".to_string()),
            Arc::new(move |event: Event| {
                let manager = Arc::clone(&manager);
                Box::pin(async move {
                    manager.handle_dispatched(event);
                }) as futures::future::BoxFuture<'static, ()>
            }),
        );
    }

    fn handle_dispatched(&self, event: Event) {
        let Some(kind) = event.payload.get("body_kind").and_then(|v| v.as_str()) else { return };
        if kind != "Response" {
            return;
        }
        let Some(correlation_id) = event.correlation_id else { return };
        if let Some((_, sender)) = self.pending_responses.remove(&correlation_id) {
            let _ = sender.send(event.payload);
        }
    }

    /// Publishes `message` onto the bus addressed to its receiver (or as a
    /// broadcast if `receiver` is `None`).
    ///
    /// # Errors
    ///
    /// Returns `CommunicationError::Bus` if the underlying publish fails.
    #[instrument(skip(self, message))]
    pub async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        let event = message_to_event(&message);
        self.bus.publish(event).await?;
        Ok(())
    }

    /// Sends `message` and awaits a correlated Response, up to the
    /// configured response timeout.
    ///
    /// # Errors
    ///
    /// Returns `CommunicationError::ResponseTimeout` if no response arrives
    /// in time, or `CommunicationError::Bus` if publish fails outright.
    pub async fn send_and_await(&self, message: Message) -> Result<serde_json::Value, CommunicationError> {
        let correlation_id = message.correlation_id.unwrap_or_else(CorrelationId::generate);
        let (tx, rx) = oneshot::channel();
        self.pending_responses.insert(correlation_id, tx);

        let mut message = message;
        message.correlation_id = Some(correlation_id);
        self.send(message).await?;

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                self.pending_responses.remove(&correlation_id);
                Err(CommunicationError::ResponseTimeout)
            }
        }
    }

    /// Broadcasts `message` to every registered agent in `category`,
    /// stamping a distinct receiver-targeted event per agent so per-agent
    /// subscription filters still apply.
    ///
    /// # Errors
    ///
    /// Returns `CommunicationError::Bus` on the first publish failure.
    pub async fn broadcast_to_category(&self, category: AgentCategory, message: Message) -> Result<(), CommunicationError> {
        for agent in self.registry.find_by_type(category) {
            let mut targeted = message.clone();
            targeted.receiver = Some(agent.id);
            self.send(targeted).await?;
        }
        Ok(())
    }

    /// Dispatches `command` with `parameters` to the least-loaded available
    /// agent in `category`, and waits for its Response. Used by the
    /// pipeline controller to execute one stage.
    ///
    /// # Errors
    ///
    /// Returns `CommunicationError::NoEligibleAgent` if no agent in the
    /// category is currently available.
    #[instrument(skip(self, parameters))]
    pub async fn dispatch_to_category(
        &self,
        category: AgentCategory,
        command: &str,
        parameters: serde_json::Value,
    ) -> Result<serde_json::Value, CommunicationError> {
        let Some(agent_id) = self.registry.select_least_loaded_in_category(category) else {
            return Err(CommunicationError::NoEligibleAgent);
        };

        let params: HashMap<String, serde_json::Value> = parameters
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let coordinator = AgentId::generate();
        let message = Message::command(coordinator, command, params, None)
            .to(agent_id)
            .with_priority(Priority::High);

        self.send_and_await(message).await
    }

    /// Coordinates a multi-agent workflow step: sends `message` to every
    /// agent in `participants` and collects their Responses, short-circuiting
    /// on the first timeout.
    ///
    /// # Errors
    ///
    /// Returns `CommunicationError::ResponseTimeout` if any participant
    /// fails to answer in time.
    pub async fn coordinate_workflow(
        &self,
        participants: &[AgentId],
        body: MessageBody,
        coordinator: AgentId,
    ) -> Result<Vec<serde_json::Value>, CommunicationError> {
        let mut responses = Vec::with_capacity(participants.len());
        for &participant in participants {
            let message = Message::with_body(coordinator, body.clone()).to(participant);
            responses.push(self.send_and_await(message).await?);
        }
        Ok(responses)
    }
}

fn message_to_event(message: &Message) -> Event {
    let (kind, body_kind) = match &message.body {
        MessageBody::Update { .. } => (EventKind::Notification, "Update"),
        MessageBody::Alert { .. } => (EventKind::Notification, "Alert"),
        MessageBody::Query { .. } => (EventKind::Query, "Query"),
        MessageBody::Command { .. } => (EventKind::Command, "Command"),
        MessageBody::Response { .. } => (EventKind::Response, "Response"),
    };

    let mut payload = serde_json::to_value(&message.body).unwrap_or(serde_json::Value::Null);
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert("body_kind".to_string(), serde_json::Value::String(body_kind.to_string()));
        map.insert("message_id".to_string(), serde_json::Value::String(message.id.to_string()));
        map.insert("sender".to_string(), serde_json::Value::String(message.sender.to_string()));
    }

    let mut event = Event::notification("message_dispatched", message.sender.to_string(), payload)
        .with_priority(message.priority);
    event.kind = kind;
    if let Some(receiver) = message.receiver {
        event = event.with_target(receiver.to_string());
    }
    if let Some(correlation_id) = message.correlation_id {
        event = event.with_correlation(correlation_id);
    }
    event
}
