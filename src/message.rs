//! # Message Model
//!
//! The envelope every agent exchanges over the bus: a [`MessageHeader`] with
//! routing and lifecycle fields plus a [`MessageBody`] whose shape is fixed by
//! the header's [`MessageType`].
//!
//! ## Wire format
//!
//! Messages serialize to one JSON document, which is also the on-disk record
//! format used by the persistence layer:
//!
//! ```json
//! {
//!   "header": {
//!     "message_id": "msg_3f2a...",
//!     "correlation_id": null,
//!     "timestamp": "2024-05-01T10:00:00Z",
//!     "source": "coordinator",
//!     "target": "renderer",
//!     "message_type": "command",
//!     "priority": "high",
//!     "ttl": null,
//!     "session_id": "session_9c1e...",
//!     "trace_id": "trace_77ab...",
//!     "content_format": "json",
//!     "status": "pending"
//!   },
//!   "body": { "type": "command", "content": { "action": "render", "parameters": {} } },
//!   "metadata": {}
//! }
//! ```
//!
//! ## Example
//!
//! ```rust
//! use agent_bus::message::{Message, Priority};
//! use serde_json::json;
//!
//! let cmd = Message::command("coordinator", "renderer", "render", json!({"scene": 3}))
//!     .with_priority(Priority::High);
//! let reply = cmd.create_response(true, "done", json!({"frames": 240}));
//! assert_eq!(reply.header.correlation_id.as_deref(), Some(cmd.id()));
//! assert_eq!(reply.header.target, "coordinator");
//! ```

use crate::constants::{
    BROADCAST_TARGET, COST_CRITICAL, COST_HIGH, COST_LOW, COST_NORMAL, SYSTEM_TARGET, TOPIC_PREFIX,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// Type Aliases
// ============================================================================

/// Unique identifier for an agent on the bus.
pub type AgentId = String;

/// Unique identifier for messages.
pub type MessageId = String;

/// Mint a fresh message id.
pub fn new_message_id() -> MessageId {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Build a topic target address from a bare topic name.
pub fn topic_target(topic: &str) -> String {
    if topic.starts_with(TOPIC_PREFIX) {
        topic.to_string()
    } else {
        format!("{}{}", TOPIC_PREFIX, topic)
    }
}

fn short_hex_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..12])
}

// ============================================================================
// Core Enums
// ============================================================================

/// Kind of message; decides the body shape and routing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Response,
    Event,
    Data,
    Error,
    Query,
    Subscribe,
    Unsubscribe,
    Heartbeat,
    StateUpdate,
}

impl MessageType {
    /// All message kinds.
    pub const ALL: [MessageType; 10] = [
        MessageType::Command,
        MessageType::Response,
        MessageType::Event,
        MessageType::Data,
        MessageType::Error,
        MessageType::Query,
        MessageType::Subscribe,
        MessageType::Unsubscribe,
        MessageType::Heartbeat,
        MessageType::StateUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Data => "data",
            MessageType::Error => "error",
            MessageType::Query => "query",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Heartbeat => "heartbeat",
            MessageType::StateUpdate => "state_update",
        }
    }

    /// Parse from the wire name.
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Whether this kind answers another message.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Token cost charged against the destination's bucket for a command.
    pub fn cost(&self) -> f64 {
        match self {
            Priority::Low => COST_LOW,
            Priority::Normal => COST_NORMAL,
            Priority::High => COST_HIGH,
            Priority::Critical => COST_CRITICAL,
        }
    }

    /// High and critical messages are always persisted.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Encoding hint for the body content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    #[default]
    Json,
    Text,
    Binary,
    Action,
}

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
    Timeout,
}

impl MessageStatus {
    /// Whether no further processing will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Completed
                | MessageStatus::Failed
                | MessageStatus::Canceled
                | MessageStatus::Timeout
        )
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Temporary,
    Permanent,
}

/// Health status reported in heartbeat messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    /// Agent is functioning normally.
    Healthy,
    /// Agent is experiencing some issues but still operational.
    Degraded,
    /// Agent is not functioning properly.
    Unhealthy,
}

impl Default for HeartbeatStatus {
    fn default() -> Self {
        HeartbeatStatus::Healthy
    }
}

// ============================================================================
// Error Codes
// ============================================================================

/// Codes carried in the body of ERROR messages.
pub mod codes {
    use super::ErrorCategory;

    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const CIRCUIT_HALF_OPEN: &str = "CIRCUIT_HALF_OPEN";
    pub const COMMAND_TIMEOUT: &str = "COMMAND_TIMEOUT";
    pub const HANDLER_NOT_FOUND: &str = "HANDLER_NOT_FOUND";
    pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
    pub const MAX_RETRIES_EXCEEDED: &str = "MAX_RETRIES_EXCEEDED";

    /// Classify an error code. Unrecognised codes are permanent.
    pub fn category_of(code: &str) -> ErrorCategory {
        match code {
            RATE_LIMITED | CIRCUIT_OPEN | CIRCUIT_HALF_OPEN | COMMAND_TIMEOUT => {
                ErrorCategory::Temporary
            }
            _ => ErrorCategory::Permanent,
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// Routing and lifecycle metadata of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: MessageId,
    #[serde(default)]
    pub correlation_id: Option<MessageId>,
    pub timestamp: DateTime<Utc>,
    pub source: AgentId,
    /// Agent id, `"broadcast"`, or `"topic:<name>"`.
    pub target: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: Priority,
    /// Seconds after `timestamp` at which the message expires.
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub content_format: ContentFormat,
    #[serde(default)]
    pub status: MessageStatus,
}

// ============================================================================
// Bodies
// ============================================================================

/// Request for an agent to perform an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBody {
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Successful or unsuccessful answer to a command or query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_details: Option<Value>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

/// Notification that something happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub event_type: String,
    #[serde(rename = "source")]
    pub event_source: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sequence_number: Option<u64>,
}

/// Failure report, addressed back to the sender of the failed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub error_message: String,
    #[serde(default)]
    pub details: Option<Value>,
    pub retry_possible: bool,
    pub category: ErrorCategory,
    /// Responder's suggested delay before retrying.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Responder's suggested retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub suggested_action: Option<String>,
}

impl ErrorBody {
    /// Create an error body; category and retry flag follow from the code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let error_code = code.into();
        let category = codes::category_of(&error_code);
        Self {
            error_message: message.into(),
            details: None,
            retry_possible: category == ErrorCategory::Temporary,
            category,
            retry_delay_ms: None,
            max_retries: None,
            suggested_action: None,
            error_code,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    /// Whether a caller should retry.
    pub fn is_retryable(&self) -> bool {
        self.retry_possible && self.category == ErrorCategory::Temporary
    }
}

/// Request for data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryBody {
    pub query_type: String,
    #[serde(default)]
    pub filters: Value,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Subscribe or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionBody {
    pub topic: String,
    #[serde(default)]
    pub filters: Value,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

/// Change of an entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateBody {
    pub entity_id: String,
    pub entity_type: String,
    #[serde(default)]
    pub previous_state: Option<Value>,
    pub current_state: Value,
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

/// Liveness and load beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub agent_id: AgentId,
    #[serde(default)]
    pub status: HeartbeatStatus,
    /// Self-reported load in `[0, 1]`.
    pub load: f64,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Body of a message, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum MessageBody {
    Command(CommandBody),
    Response(ResponseBody),
    Event(EventBody),
    Error(ErrorBody),
    Query(QueryBody),
    Subscription(SubscriptionBody),
    StateUpdate(StateUpdateBody),
    Heartbeat(HeartbeatBody),
    /// Raw untyped payload.
    Data(Value),
}

impl MessageBody {
    /// Whether this body may travel under the given header kind.
    ///
    /// Raw data is accepted under any kind.
    pub fn fits(&self, kind: MessageType) -> bool {
        match self {
            MessageBody::Data(_) => true,
            MessageBody::Command(_) => kind == MessageType::Command,
            MessageBody::Response(_) => kind == MessageType::Response,
            MessageBody::Event(_) => kind == MessageType::Event,
            MessageBody::Error(_) => kind == MessageType::Error,
            MessageBody::Query(_) => kind == MessageType::Query,
            MessageBody::Subscription(_) => {
                matches!(kind, MessageType::Subscribe | MessageType::Unsubscribe)
            }
            MessageBody::StateUpdate(_) => kind == MessageType::StateUpdate,
            MessageBody::Heartbeat(_) => kind == MessageType::Heartbeat,
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// A structured envelope exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    /// Create a message with default header fields.
    pub fn new(
        source: impl Into<AgentId>,
        target: impl Into<String>,
        message_type: MessageType,
        body: MessageBody,
    ) -> Self {
        Message {
            header: MessageHeader {
                message_id: new_message_id(),
                correlation_id: None,
                timestamp: Utc::now(),
                source: source.into(),
                target: target.into(),
                message_type,
                priority: Priority::Normal,
                ttl: None,
                session_id: None,
                trace_id: None,
                content_format: ContentFormat::Json,
                status: MessageStatus::Pending,
            },
            body,
            metadata: HashMap::new(),
        }
    }

    /// Create a command. Session and trace ids are minted.
    pub fn command(
        source: impl Into<AgentId>,
        target: impl Into<String>,
        action: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let mut msg = Self::new(
            source,
            target,
            MessageType::Command,
            MessageBody::Command(CommandBody {
                action: action.into(),
                parameters,
                timeout_seconds: None,
                idempotency_key: None,
            }),
        );
        msg.header.content_format = ContentFormat::Action;
        msg.header.session_id = Some(short_hex_id("session"));
        msg.header.trace_id = Some(short_hex_id("trace"));
        msg
    }

    /// Create an event.
    pub fn event(
        source: impl Into<AgentId>,
        target: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        let source = source.into();
        let body = MessageBody::Event(EventBody {
            event_type: event_type.into(),
            event_source: source.clone(),
            data,
            sequence_number: None,
        });
        Self::new(source, target, MessageType::Event, body)
    }

    /// Create a query.
    pub fn query(
        source: impl Into<AgentId>,
        target: impl Into<String>,
        query_type: impl Into<String>,
        filters: Value,
    ) -> Self {
        let body = MessageBody::Query(QueryBody {
            query_type: query_type.into(),
            filters,
            fields: Vec::new(),
            limit: None,
            offset: None,
        });
        Self::new(source, target, MessageType::Query, body)
    }

    /// Create a heartbeat addressed to the bus itself.
    pub fn heartbeat(
        agent_id: impl Into<AgentId>,
        status: HeartbeatStatus,
        load: f64,
        uptime_seconds: u64,
        version: impl Into<String>,
    ) -> Self {
        let agent_id = agent_id.into();
        let body = MessageBody::Heartbeat(HeartbeatBody {
            agent_id: agent_id.clone(),
            status,
            load: load.clamp(0.0, 1.0),
            uptime_seconds,
            version: version.into(),
        });
        Self::new(agent_id, SYSTEM_TARGET, MessageType::Heartbeat, body).with_priority(Priority::Low)
    }

    /// Create a state update.
    pub fn state_update(
        source: impl Into<AgentId>,
        target: impl Into<String>,
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        previous_state: Option<Value>,
        current_state: Value,
    ) -> Self {
        let body = MessageBody::StateUpdate(StateUpdateBody {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            previous_state,
            current_state,
            changed_fields: Vec::new(),
        });
        Self::new(source, target, MessageType::StateUpdate, body)
    }

    /// Create a raw data message.
    pub fn data(source: impl Into<AgentId>, target: impl Into<String>, value: Value) -> Self {
        Self::new(source, target, MessageType::Data, MessageBody::Data(value))
    }

    /// Create an error message from a prepared body.
    pub fn error(source: impl Into<AgentId>, target: impl Into<String>, body: ErrorBody) -> Self {
        Self::new(source, target, MessageType::Error, MessageBody::Error(body))
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.header.ttl = Some(ttl_seconds);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.header.session_id = Some(session_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.header.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<MessageId>) -> Self {
        self.header.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Attach an idempotency key. Only command bodies carry one.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        if let MessageBody::Command(cmd) = &mut self.body {
            cmd.idempotency_key = Some(key.into());
        }
        self
    }

    /// Set the remote execution timeout of a command.
    pub fn with_command_timeout(mut self, timeout_seconds: u64) -> Self {
        if let MessageBody::Command(cmd) = &mut self.body {
            cmd.timeout_seconds = Some(timeout_seconds);
        }
        self
    }

    // ------------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------------

    fn reply(&self, message_type: MessageType, body: MessageBody) -> Message {
        let mut reply = Message::new(
            self.header.target.clone(),
            self.header.source.clone(),
            message_type,
            body,
        );
        reply.header.correlation_id = Some(self.header.message_id.clone());
        reply.header.priority = self.header.priority;
        reply.header.session_id = self.header.session_id.clone();
        reply.header.trace_id = self.header.trace_id.clone();
        reply
    }

    /// Build a response to this message.
    pub fn create_response(&self, success: bool, message: impl Into<String>, data: Value) -> Message {
        self.reply(
            MessageType::Response,
            MessageBody::Response(ResponseBody {
                success,
                message: Some(message.into()),
                data,
                error_code: None,
                error_details: None,
                execution_time_ms: None,
            }),
        )
    }

    /// Build an error reply to this message.
    pub fn create_error_response(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Message {
        let mut body = ErrorBody::new(code, message);
        body.details = details;
        self.reply(MessageType::Error, MessageBody::Error(body))
    }

    /// Build an error reply from a prepared body.
    pub fn create_error_reply(&self, body: ErrorBody) -> Message {
        self.reply(MessageType::Error, MessageBody::Error(body))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.header.message_id
    }

    pub fn kind(&self) -> MessageType {
        self.header.message_type
    }

    pub fn as_command(&self) -> Option<&CommandBody> {
        match &self.body {
            MessageBody::Command(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseBody> {
        match &self.body {
            MessageBody::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventBody> {
        match &self.body {
            MessageBody::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorBody> {
        match &self.body {
            MessageBody::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_heartbeat(&self) -> Option<&HeartbeatBody> {
        match &self.body {
            MessageBody::Heartbeat(h) => Some(h),
            _ => None,
        }
    }

    /// Idempotency key, if the body carries one.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.as_command().and_then(|c| c.idempotency_key.as_deref())
    }

    pub fn is_broadcast(&self) -> bool {
        self.header.target == BROADCAST_TARGET
    }

    /// Topic name when the target is a topic reference.
    pub fn topic(&self) -> Option<&str> {
        self.header.target.strip_prefix(TOPIC_PREFIX)
    }

    /// Whether the message's ttl has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.header.ttl {
            Some(ttl) => {
                let age = now.signed_duration_since(self.header.timestamp);
                age.num_milliseconds() > (ttl as i64).saturating_mul(1000)
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check the envelope once at the bus boundary.
    pub fn validate(&self) -> Result<()> {
        if self.header.source.is_empty() {
            return Err(Error::invalid_message("source must not be empty"));
        }
        if self.header.target.is_empty() {
            return Err(Error::invalid_message("target must not be empty"));
        }
        if !self.body.fits(self.header.message_type) {
            return Err(Error::invalid_message(format!(
                "body does not match message type '{}'",
                self.header.message_type
            )));
        }
        if self.header.message_type.is_reply() && self.header.correlation_id.is_none() {
            return Err(Error::invalid_message(format!(
                "{} messages require a correlation id",
                self.header.message_type
            )));
        }
        if let MessageBody::Heartbeat(hb) = &self.body {
            if !(0.0..=1.0).contains(&hb.load) {
                return Err(Error::invalid_message("heartbeat load must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ------------------------------------------------------------------------
    // Ids and enums
    // ------------------------------------------------------------------------

    #[test]
    fn test_message_ids_unique() {
        let ids: std::collections::HashSet<_> = (0..500).map(|_| new_message_id()).collect();
        assert_eq!(ids.len(), 500);
        assert!(ids.iter().all(|id| id.starts_with("msg_") && id.len() == 36));
    }

    #[test]
    fn test_message_type_round_trip_names() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::from_str("telegram"), None);
    }

    #[test]
    fn test_priority_cost_and_order() {
        assert_eq!(Priority::Low.cost(), 2.0);
        assert_eq!(Priority::Critical.cost(), 0.1);
        assert!(Priority::Critical > Priority::Low);
        assert!(Priority::High.is_urgent());
        assert!(!Priority::Normal.is_urgent());
        assert_eq!(Priority::from_str("HIGH"), Some(Priority::High));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(codes::category_of(codes::RATE_LIMITED), ErrorCategory::Temporary);
        assert_eq!(codes::category_of(codes::COMMAND_TIMEOUT), ErrorCategory::Temporary);
        assert_eq!(codes::category_of(codes::PROCESSING_ERROR), ErrorCategory::Permanent);
        assert_eq!(codes::category_of("SOMETHING_ELSE"), ErrorCategory::Permanent);

        let body = ErrorBody::new(codes::CIRCUIT_OPEN, "open");
        assert!(body.is_retryable());
        let body = ErrorBody::new(codes::UNKNOWN_COMMAND, "nope");
        assert!(!body.is_retryable());
    }

    // ------------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------------

    #[test]
    fn test_command_factory() {
        let msg = Message::command("a", "b", "render", json!({"x": 1}))
            .with_idempotency_key("key-1")
            .with_command_timeout(10);
        assert_eq!(msg.kind(), MessageType::Command);
        assert_eq!(msg.idempotency_key(), Some("key-1"));
        assert_eq!(msg.as_command().unwrap().timeout_seconds, Some(10));
        assert!(msg.header.session_id.as_deref().unwrap().starts_with("session_"));
        assert!(msg.header.trace_id.as_deref().unwrap().starts_with("trace_"));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_create_response_swaps_addresses() {
        let cmd = Message::command("a", "b", "render", json!({})).with_priority(Priority::High);
        let resp = cmd.create_response(true, "ok", json!({"done": true}));
        assert_eq!(resp.header.source, "b");
        assert_eq!(resp.header.target, "a");
        assert_eq!(resp.header.correlation_id.as_deref(), Some(cmd.id()));
        assert_eq!(resp.header.session_id, cmd.header.session_id);
        assert_eq!(resp.header.priority, Priority::High);
        assert!(resp.as_response().unwrap().success);
    }

    #[test]
    fn test_create_error_response() {
        let cmd = Message::command("a", "b", "render", json!({}));
        let err = cmd.create_error_response(codes::RATE_LIMITED, "slow down", None);
        let body = err.as_error().unwrap();
        assert_eq!(err.kind(), MessageType::Error);
        assert!(body.retry_possible);
        assert_eq!(body.category, ErrorCategory::Temporary);
        assert_eq!(err.header.target, "a");
    }

    #[test]
    fn test_heartbeat_factory() {
        let hb = Message::heartbeat("agent-1", HeartbeatStatus::Healthy, 1.7, 12, "1.0.0");
        assert_eq!(hb.header.target, SYSTEM_TARGET);
        assert_eq!(hb.header.priority, Priority::Low);
        assert_eq!(hb.as_heartbeat().unwrap().load, 1.0);
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(topic_target("render"), "topic:render");
        assert_eq!(topic_target("topic:render"), "topic:render");
        let ev = Message::event("a", topic_target("render"), "frame.done", json!({}));
        assert_eq!(ev.topic(), Some("render"));
        assert!(!ev.is_broadcast());
        let ev = Message::event("a", "broadcast", "hello", json!({}));
        assert!(ev.is_broadcast());
        assert_eq!(ev.topic(), None);
    }

    // ------------------------------------------------------------------------
    // Validation and expiry
    // ------------------------------------------------------------------------

    #[test]
    fn test_validate_rejects_mismatched_body() {
        let mut msg = Message::event("a", "b", "x", json!({}));
        msg.header.message_type = MessageType::Command;
        assert!(matches!(msg.validate(), Err(Error::InvalidMessage { .. })));
    }

    #[test]
    fn test_validate_requires_correlation_on_replies() {
        let body = ErrorBody::new(codes::PROCESSING_ERROR, "boom");
        let msg = Message::error("a", "b", body);
        assert!(msg.validate().is_err());
        assert!(msg.with_correlation("msg_x").validate().is_ok());
    }

    #[test]
    fn test_data_body_fits_any_kind() {
        let mut msg = Message::data("a", "b", json!([1, 2, 3]));
        assert!(msg.validate().is_ok());
        msg.header.message_type = MessageType::StateUpdate;
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_ttl_expiry() {
        let msg = Message::data("a", "b", json!(null)).with_ttl(5);
        let later = msg.header.timestamp + chrono::Duration::seconds(6);
        assert!(msg.is_expired_at(later));
        assert!(!msg.is_expired_at(msg.header.timestamp));
        assert!(!Message::data("a", "b", json!(null)).is_expired());
    }

    // ------------------------------------------------------------------------
    // Wire format
    // ------------------------------------------------------------------------

    #[test]
    fn test_wire_field_names() {
        let msg = Message::command("a", "b", "render", json!({"k": "v"}))
            .with_priority(Priority::Critical);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["header"]["message_type"], "command");
        assert_eq!(value["header"]["priority"], "critical");
        assert_eq!(value["header"]["status"], "pending");
        assert_eq!(value["header"]["content_format"], "action");
        assert_eq!(value["body"]["type"], "command");
        assert_eq!(value["body"]["content"]["action"], "render");
    }

    #[test]
    fn test_event_body_names_its_source() {
        let msg = Message::event("sensor", "topic:alerts", "overheat", json!({"c": 91}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["body"]["content"]["source"], "sensor");
        assert!(value["body"]["content"].get("event_source").is_none());

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.as_event().unwrap().event_source, "sensor");
    }

    #[test]
    fn test_deserialize_minimal_header() {
        let raw = json!({
            "header": {
                "message_id": "msg_1",
                "timestamp": "2024-05-01T10:00:00Z",
                "source": "a",
                "target": "topic:render",
                "message_type": "state_update"
            },
            "body": {
                "type": "state_update",
                "content": {"entity_id": "job-1", "entity_type": "job", "current_state": "done"}
            }
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.header.priority, Priority::Normal);
        assert_eq!(msg.header.status, MessageStatus::Pending);
        assert!(msg.metadata.is_empty());
        assert!(msg.validate().is_ok());
    }
}
