//! Typed inter-agent message envelopes.
//!
//! Mirrors the event bus's event/kind split one layer up: a `Message` is
//! what agents exchange through the Communication Manager, while an
//! `Event` (see `bus`) is what carries it across the process-wide pub/sub
//! fabric. `Message::into_event`/`Message::priority_as_bus_priority` bridge
//! the two.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::SystemTime;

use crate::domain_types::{AgentId, CorrelationId, MessageId, Priority};

/// The five message kinds the protocol supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MessageBody {
    /// A fact being announced; no reply expected.
    Update {
        /// Free-form structured content.
        content: Value,
    },
    /// A condition requiring attention.
    Alert {
        /// Severity label (e.g. "warning", "critical").
        severity: String,
        /// Machine-readable alert category.
        alert_type: String,
        /// Free-form structured content.
        content: Value,
    },
    /// A request for information, with no side effects expected.
    Query {
        /// The question being asked.
        query: String,
        /// Structured context supporting the query.
        context: HashMap<String, Value>,
    },
    /// A directive the receiver should act on.
    Command {
        /// Command name.
        command: String,
        /// Command parameters.
        parameters: HashMap<String, Value>,
        /// Optional deadline by which the command must complete.
        deadline: Option<SystemTime>,
    },
    /// A reply to a prior Query/Command.
    Response {
        /// Id of the message this responds to.
        request_id: MessageId,
        /// Outcome status, e.g. "ok" or "error".
        status: String,
        /// Structured result payload.
        result: HashMap<String, Value>,
        /// Non-empty only when `status != "ok"`.
        errors: Vec<String>,
        /// Wall-clock time the handler took to produce this response.
        execution_time_ms: Option<u64>,
    },
}

impl MessageBody {
    /// The bus priority this body kind maps to by default, absent an
    /// explicit override on the envelope.
    #[must_use]
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Alert { severity, .. } if severity == "critical" => Priority::Critical,
            Self::Alert { .. } | Self::Command { .. } => Priority::High,
            Self::Query { .. } | Self::Response { .. } => Priority::Normal,
            Self::Update { .. } => Priority::Low,
        }
    }
}

/// A fully addressed message envelope exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique id of this message.
    pub id: MessageId,
    /// Sender agent id.
    pub sender: AgentId,
    /// Receiver agent id; `None` marks a broadcast-by-category message.
    pub receiver: Option<AgentId>,
    /// Creation timestamp.
    pub timestamp: SystemTime,
    /// Effective delivery priority.
    pub priority: Priority,
    /// Groups this message with others in the same exchange or workflow.
    pub correlation_id: Option<CorrelationId>,
    /// Arbitrary sender-supplied metadata.
    pub metadata: HashMap<String, Value>,
    /// Whether the receiver must act (vs. purely informational).
    pub action_required: bool,
    /// The kind-specific payload.
    pub body: MessageBody,
}

impl Message {
    fn new(sender: AgentId, body: MessageBody) -> Self {
        let priority = body.default_priority();
        Self {
            id: MessageId::generate(),
            sender,
            receiver: None,
            timestamp: SystemTime::now(),
            priority,
            correlation_id: None,
            metadata: HashMap::new(),
            action_required: false,
            body,
        }
    }

    /// Builds a message wrapping an arbitrary pre-constructed body, used by
    /// callers (e.g. workflow coordination) that already hold a `MessageBody`
    /// of unknown variant.
    #[must_use]
    pub fn with_body(sender: AgentId, body: MessageBody) -> Self {
        Self::new(sender, body)
    }

    /// Builds an Update message.
    #[must_use]
    pub fn update(sender: AgentId, content: Value) -> Self {
        Self::new(sender, MessageBody::Update { content })
    }

    /// Builds an Alert message.
    #[must_use]
    pub fn alert(sender: AgentId, severity: impl Into<String>, alert_type: impl Into<String>, content: Value) -> Self {
        let mut message = Self::new(
            sender,
            MessageBody::Alert {
                severity: severity.into(),
                alert_type: alert_type.into(),
                content,
            },
        );
        message.action_required = true;
        message
    }

    /// Builds a Query message, assigning a fresh correlation id.
    #[must_use]
    pub fn query(sender: AgentId, query: impl Into<String>, context: HashMap<String, Value>) -> Self {
        let mut message = Self::new(sender, MessageBody::Query { query: query.into(), context });
        message.correlation_id = Some(CorrelationId::generate());
        message.action_required = true;
        message
    }

    /// Builds a Command message, assigning a fresh correlation id.
    #[must_use]
    pub fn command(
        sender: AgentId,
        command: impl Into<String>,
        parameters: HashMap<String, Value>,
        deadline: Option<SystemTime>,
    ) -> Self {
        let mut message = Self::new(
            sender,
            MessageBody::Command {
                command: command.into(),
                parameters,
                deadline,
            },
        );
        message.correlation_id = Some(CorrelationId::generate());
        message.action_required = true;
        message
    }

    /// Builds a Response to `request`, carrying its correlation id forward.
    #[must_use]
    pub fn response_to(
        request: &Message,
        sender: AgentId,
        status: impl Into<String>,
        result: HashMap<String, Value>,
        errors: Vec<String>,
        execution_time_ms: Option<u64>,
    ) -> Self {
        let mut message = Self::new(
            sender,
            MessageBody::Response {
                request_id: request.id,
                status: status.into(),
                result,
                errors,
                execution_time_ms,
            },
        );
        message.correlation_id = request.correlation_id;
        message.receiver = Some(request.sender);
        message
    }

    /// Sets the receiver, builder-style.
    #[must_use]
    pub fn to(mut self, receiver: AgentId) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Overrides the default priority, builder-style.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether this message is a successful Response.
    #[must_use]
    pub fn is_ok_response(&self) -> bool {
        matches!(&self.body, MessageBody::Response { status, .. } if status == "ok")
    }

    /// Converts to the loose legacy map representation used by older
    /// agent integrations: `{kind, sender, receiver, ...body fields}`.
    #[must_use]
    pub fn to_legacy_map(&self) -> HashMap<String, Value> {
        let mut map: HashMap<String, Value> = HashMap::new();
        map.insert("id".into(), Value::String(self.id.to_string()));
        map.insert("sender".into(), Value::String(self.sender.to_string()));
        if let Some(receiver) = self.receiver {
            map.insert("receiver".into(), Value::String(receiver.to_string()));
        }
        if let Ok(body_value) = serde_json::to_value(&self.body) {
            if let Value::Object(fields) = body_value {
                map.extend(fields);
            }
        }
        map
    }
}
