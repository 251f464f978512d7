//! Centralized constants for the agent bus.
//!
//! This module provides a single source of truth for default values,
//! reserved addresses and protocol names used throughout the crate.

// ============================================================================
// Reserved Addresses
// ============================================================================

/// Target that delivers to every direct subscriber.
pub const BROADCAST_TARGET: &str = "broadcast";

/// Prefix marking a target as a topic rather than an agent id.
pub const TOPIC_PREFIX: &str = "topic:";

/// Target used for messages addressed to the bus itself (heartbeats).
pub const SYSTEM_TARGET: &str = "system";

/// Source id the bus uses for messages it originates.
pub const BUS_SOURCE_ID: &str = "message_bus";

// ============================================================================
// Event Names
// ============================================================================

/// Broadcast when an agent misses heartbeats for too long.
pub const EVENT_AGENT_OFFLINE: &str = "agent.offline";

pub const EVENT_WORKFLOW_STARTED: &str = "workflow.started";
pub const EVENT_WORKFLOW_STATE_CHANGED: &str = "workflow.state_changed";
pub const EVENT_WORKFLOW_STOPPED: &str = "workflow.stopped";
pub const EVENT_WORKFLOW_CHECKPOINT_RESTORED: &str = "workflow.checkpoint_restored";
pub const EVENT_WORKFLOW_ERROR: &str = "workflow.error";

/// Topic carrying workflow lifecycle events.
pub const WORKFLOW_TOPIC: &str = "topic:workflow";

/// Topic carrying workflow error events.
pub const WORKFLOW_ERROR_TOPIC: &str = "topic:workflow.error";

/// Name of the terminal error state bundled with every workflow.
pub const WORKFLOW_ERROR_STATE: &str = "error";

// ============================================================================
// Rate Limiting
// ============================================================================

/// Default bucket refill rate in tokens per second.
pub const DEFAULT_BUCKET_RATE: f64 = 50.0;

/// Default bucket capacity in tokens.
pub const DEFAULT_BUCKET_CAPACITY: f64 = 100.0;

/// Token cost of a LOW priority command.
pub const COST_LOW: f64 = 2.0;

/// Token cost of a NORMAL priority command.
pub const COST_NORMAL: f64 = 1.0;

/// Token cost of a HIGH priority command.
pub const COST_HIGH: f64 = 0.5;

/// Token cost of a CRITICAL priority command.
pub const COST_CRITICAL: f64 = 0.1;

/// Fraction of the command cost waived at full destination load.
pub const LOAD_COST_DISCOUNT: f64 = 0.9;

/// Lower bound of the rate multiplier applied from a heartbeat's load.
pub const MIN_LOAD_RATE_FACTOR: f64 = 0.1;

/// How long a command may wait for tokens before being rejected.
pub const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 5_000;

/// Minimum sleep between token acquisition attempts.
pub const MIN_TOKEN_WAIT_MS: u64 = 10;

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Consecutive failures before a circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Seconds an open circuit waits before probing.
pub const DEFAULT_RESET_TIMEOUT_SECS: u64 = 30;

/// Successes needed in half-open state to close the circuit.
pub const DEFAULT_HALF_OPEN_SUCCESSES: u32 = 3;

/// Share of traffic admitted while half-open.
pub const DEFAULT_HALF_OPEN_ADMIT_RATIO: f64 = 0.8;

// ============================================================================
// Bus Timers & Retention
// ============================================================================

/// Interval between heartbeat monitor scans.
pub const DEFAULT_HEARTBEAT_CHECK_SECS: u64 = 30;

/// Silence after which an agent is flagged offline.
pub const DEFAULT_OFFLINE_AFTER_SECS: u64 = 90;

/// Interval between cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Maximum number of messages kept in history.
pub const DEFAULT_HISTORY_SIZE: usize = 1_000;

/// Age after which history entries without their own ttl are dropped.
pub const DEFAULT_HISTORY_TTL_SECS: u64 = 3_600;

/// Age after which idempotency keys are forgotten.
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 3_600;

/// Time allowed for background tasks to drain on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// ============================================================================
// Agent Protocol
// ============================================================================

/// Interval between heartbeats published by an agent.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Load reported by agents that do not override it.
pub const DEFAULT_AGENT_LOAD: f64 = 0.5;

/// Default time a command may take on the remote side.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Default time `send_command` waits for each reply.
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_RETRY_JITTER: f64 = 0.1;

/// Retries of a failing workflow state before escalation.
pub const DEFAULT_STATE_MAX_RETRIES: u32 = 3;

// ============================================================================
// Persistence
// ============================================================================

pub const PENDING_DIR: &str = "pending";
pub const PROCESSED_DIR: &str = "processed";

/// Default store location relative to the working directory.
pub const DEFAULT_PERSISTENCE_DIR: &str = "./data/messages";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_costs_ordered() {
        assert!(COST_LOW > COST_NORMAL);
        assert!(COST_NORMAL > COST_HIGH);
        assert!(COST_HIGH > COST_CRITICAL);
        assert!(COST_CRITICAL > 0.0);
    }

    #[test]
    fn test_ratios_in_range() {
        assert!((0.0..=1.0).contains(&DEFAULT_HALF_OPEN_ADMIT_RATIO));
        assert!((0.0..=1.0).contains(&DEFAULT_RETRY_JITTER));
        assert!((0.0..=1.0).contains(&LOAD_COST_DISCOUNT));
        assert!((0.0..=1.0).contains(&DEFAULT_AGENT_LOAD));
    }

    #[test]
    fn test_offline_window_spans_several_checks() {
        assert!(DEFAULT_OFFLINE_AFTER_SECS > DEFAULT_HEARTBEAT_CHECK_SECS);
        assert!(DEFAULT_OFFLINE_AFTER_SECS > DEFAULT_HEARTBEAT_INTERVAL_SECS);
    }

    #[test]
    fn test_topic_constants_use_prefix() {
        assert!(WORKFLOW_TOPIC.starts_with(TOPIC_PREFIX));
        assert!(WORKFLOW_ERROR_TOPIC.starts_with(TOPIC_PREFIX));
    }
}
