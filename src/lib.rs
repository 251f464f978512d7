//! # Agent Bus
//!
//! In-process message bus for cooperating agents.
//!
//! ## Overview
//!
//! Agents exchange structured [`Message`]s through a [`MessageBus`]: commands
//! addressed to one agent, events fanned out to topic subscribers, and the
//! responses and errors that answer them. Around that core sit the pieces a
//! long-running multi-agent process needs:
//!
//! - **Admission control**: per-destination token buckets whose rate follows
//!   the destination's reported load, and per-conversation circuit breakers
//! - **Durability**: important messages are persisted before delivery and
//!   replayed after a crash; commands are deduplicated by idempotency key
//! - **Workflows**: finite-state machines whose states run as supervised tasks
//! - **Command protocol**: retries with exponential backoff that honour the
//!   responder's hints, plus periodic heartbeats
//!
//! ## Architecture
//!
//! ```text
//!   BusAgent ---- send_command / send_event / heartbeat ----+
//!      ^                                                    |
//!      | handle(msg)                                        v
//! +----+-----------------------------------------------------------+
//! |                          MessageBus                            |
//! |  publish: validate -> RateLimiter -> idempotency -> breakers   |
//! |           -> persistence -> queue                              |
//! |  consumer loop: expiry, heartbeats, correlation, fan-out       |
//! |  monitors: liveness check, cleanup sweep                       |
//! +----------------------------------------------------------------+
//!      ^                                                    |
//!      | workflow events                                    v
//!   Workflow (FSM) <-- WorkflowManager          MessagePersistence
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agent_bus::{BusConfig, MessageBus, Message, Priority};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> agent_bus::Result<()> {
//!     let bus = MessageBus::open(BusConfig::default()).await?;
//!     bus.start().await?;
//!
//!     let cmd = Message::command("client", "renderer", "render", serde_json::json!({}))
//!         .with_priority(Priority::High);
//!     let id = bus.publish(cmd).await?;
//!     let reply = bus.wait_for_response(&id, Duration::from_secs(5), Some("renderer")).await?;
//!
//!     bus.stop().await;
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod agent;
pub mod bus;
pub mod constants;
pub mod error;
pub mod message;
pub mod persistence;
pub mod rate_limiter;
pub mod recovery;
pub mod settings;
pub mod supervisor;
pub mod tracing_setup;
pub mod workflow;

// Re-exports for convenient access
pub use agent::{AgentBehavior, AgentConfig, AgentStatus, BusAgent, CommandOptions};
pub use bus::{
    handler_fn, AgentInfo, BusConfig, BusMetrics, HistoryFilter, MessageBus, MessageHandler,
    SharedHandler,
};
pub use constants::*;
pub use error::{Error, Result};
pub use message::{
    codes, AgentId, ErrorBody, ErrorCategory, HeartbeatStatus, Message, MessageBody,
    MessageHeader, MessageId, MessageStatus, MessageType, Priority,
};
pub use persistence::{
    FileSystemPersistence, InMemoryPersistence, MessageFilter, MessagePersistence,
};
pub use rate_limiter::{BucketSnapshot, RateLimitConfig, RateLimiter, TokenBucket};
pub use recovery::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerTable, CircuitDecision,
    CircuitState, RetryConfig,
};
pub use settings::{Settings, SettingsBuilder, SettingsError, SettingsResult};
pub use supervisor::{ShutdownSignal, TaskSupervisor};
pub use tracing_setup::{log_format, setup_logging, should_use_json};
pub use workflow::{
    TransitionResult, Workflow, WorkflowData, WorkflowManager, WorkflowState, WorkflowStatus,
    WorkflowSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
