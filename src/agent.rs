//! # Agent Command Protocol
//!
//! A [`BusAgent`] is a participant on the bus: it receives messages addressed
//! to its id, dispatches them by kind to an [`AgentBehavior`], publishes a
//! periodic heartbeat, and sends commands with retry and backoff.
//!
//! ## Command retries
//!
//! `send_command` attaches one idempotency key per call and reuses it across
//! attempts. A TEMPORARY error reply or a response timeout triggers a retry;
//! the responder may override the delay and budget through `retry_delay_ms`
//! and `max_retries` in its error body. When attempts run out the caller gets
//! a synthesized `COMMAND_TIMEOUT` or `MAX_RETRIES_EXCEEDED` error message,
//! so a command always resolves.
//!
//! ## Example
//!
//! ```rust,ignore
//! struct Echo;
//!
//! #[async_trait]
//! impl AgentBehavior for Echo {
//!     async fn handle_command(&self, message: Message) -> Result<Option<Message>> {
//!         Ok(Some(message.create_response(true, "echo", json!({}))))
//!     }
//! }
//!
//! let agent = BusAgent::new("echo", "Echo", Echo, bus.clone(), AgentConfig::default());
//! agent.start().await?;
//! ```

use crate::bus::{AgentInfo, MessageBus, MessageHandler, SharedHandler};
use crate::constants::{
    BROADCAST_TARGET, DEFAULT_AGENT_LOAD, DEFAULT_COMMAND_TIMEOUT_SECS,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_RESPONSE_TIMEOUT_SECS,
};
use crate::error::{Error, Result};
use crate::message::{
    codes, AgentId, HeartbeatStatus, Message, MessageId, MessageType, Priority,
};
use crate::recovery::RetryConfig;
use crate::settings::Settings;
use crate::supervisor::cancelled;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_interval: Duration,
    /// Remote execution timeout attached to outgoing commands.
    pub command_timeout_secs: u64,
    /// How long `send_command` waits for each reply.
    pub response_timeout: Duration,
    pub retry: RetryConfig,
    pub version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
            retry: RetryConfig::default(),
            version: crate::VERSION.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let agents = &settings.agents;
        Self {
            heartbeat_interval: Duration::from_secs(agents.heartbeat_interval_secs),
            command_timeout_secs: agents.command_timeout_secs,
            response_timeout: Duration::from_secs(agents.response_timeout_secs),
            retry: RetryConfig::from_settings(settings),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Per-call options for [`BusAgent::send_command`].
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub priority: Priority,
    pub timeout_seconds: Option<u64>,
    pub wait_for_response: bool,
    pub response_timeout: Duration,
    pub retry: RetryConfig,
    pub session_id: Option<String>,
}

impl CommandOptions {
    /// Options taken from the agent's configuration.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            priority: Priority::Normal,
            timeout_seconds: Some(config.command_timeout_secs),
            wait_for_response: true,
            response_timeout: config.response_timeout,
            retry: config.retry.clone(),
            session_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Publish and return immediately.
    pub fn fire_and_forget(mut self) -> Self {
        self.wait_for_response = false;
        self
    }
}

// ============================================================================
// Behaviour
// ============================================================================

/// Domain logic of an agent, one handler per message kind.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    async fn handle_command(&self, message: Message) -> Result<Option<Message>>;

    async fn handle_event(&self, message: Message) -> Result<Option<Message>> {
        if let Some(event) = message.as_event() {
            debug!(message_id = %message.id(), event_type = %event.event_type, "Event received");
        }
        Ok(None)
    }

    async fn handle_query(&self, message: Message) -> Result<Option<Message>> {
        Ok(Some(message.create_error_response(
            codes::NOT_IMPLEMENTED,
            format!("'{}' does not answer queries", message.header.target),
            None,
        )))
    }

    async fn handle_response(&self, message: Message) -> Result<Option<Message>> {
        debug!(message_id = %message.id(), "Response received");
        Ok(None)
    }

    async fn handle_error(&self, message: Message) -> Result<Option<Message>> {
        if let Some(err) = message.as_error() {
            warn!(
                message_id = %message.id(),
                code = %err.error_code,
                error = %err.error_message,
                "Error message received"
            );
        }
        Ok(None)
    }

    async fn handle_data(&self, _message: Message) -> Result<Option<Message>> {
        Ok(None)
    }

    async fn handle_state_update(&self, _message: Message) -> Result<Option<Message>> {
        Ok(None)
    }

    /// Load reported in heartbeats, in `[0, 1]`.
    async fn load(&self) -> f64 {
        DEFAULT_AGENT_LOAD
    }

    async fn health(&self) -> HeartbeatStatus {
        HeartbeatStatus::Healthy
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Counters reported by [`BusAgent::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub name: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub messages_processed: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct RunInfo {
    started: Option<(Instant, DateTime<Utc>)>,
    last_error: Option<String>,
}

struct AgentInner {
    agent_id: AgentId,
    name: String,
    behavior: Arc<dyn AgentBehavior>,
    bus: MessageBus,
    config: AgentConfig,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    messages_processed: AtomicU64,
    errors: AtomicU64,
    run: Mutex<RunInfo>,
}

/// Handle to an agent. Clones share the agent.
#[derive(Clone)]
pub struct BusAgent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for BusAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusAgent")
            .field("agent_id", &self.inner.agent_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl BusAgent {
    pub fn new(
        agent_id: impl Into<AgentId>,
        name: impl Into<String>,
        behavior: impl AgentBehavior + 'static,
        bus: MessageBus,
        config: AgentConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(AgentInner {
                agent_id: agent_id.into(),
                name: name.into(),
                behavior: Arc::new(behavior),
                bus,
                config,
                running: AtomicBool::new(false),
                stop_tx,
                messages_processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                run: Mutex::new(RunInfo::default()),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn run_info(&self) -> std::sync::MutexGuard<'_, RunInfo> {
        self.inner.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::AgentNotRunning {
                agent_id: self.inner.agent_id.clone(),
            })
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Subscribe the agent to messages addressed to its id.
    pub async fn initialize(&self) -> Result<()> {
        let handler: SharedHandler = Arc::new(self.clone());
        if self
            .inner
            .bus
            .subscribe_direct(&self.inner.agent_id, handler)
            .await
        {
            debug!(agent_id = %self.inner.agent_id, "Agent subscribed");
        }
        Ok(())
    }

    /// Subscribe, run the behaviour's start hook and launch the heartbeat publisher.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.initialize().await?;
        self.run_info().started = Some((Instant::now(), Utc::now()));
        self.inner.stop_tx.send_replace(false);

        if let Err(e) = self.inner.behavior.on_start().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let agent = self.clone();
        self.inner.bus.spawn_supervised(
            format!("heartbeat-{}", self.inner.agent_id),
            async move { agent.heartbeat_loop().await },
        );
        info!(agent_id = %self.inner.agent_id, name = %self.inner.name, "Agent started");
        Ok(())
    }

    /// Stop the heartbeat, unsubscribe and run the behaviour's stop hook.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop_tx.send_replace(true);
        self.inner
            .bus
            .unsubscribe_direct(&self.inner.agent_id, &self.inner.agent_id)
            .await;
        self.inner.behavior.on_stop().await?;
        info!(agent_id = %self.inner.agent_id, "Agent stopped");
        Ok(())
    }

    async fn heartbeat_loop(&self) {
        let mut bus_signal = self.inner.bus.shutdown_signal();
        let mut stop_signal = self.inner.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(agent_id = %self.inner.agent_id, "Heartbeat publisher running");

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut bus_signal) => break,
                _ = cancelled(&mut stop_signal) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(agent_id = %self.inner.agent_id, error = %e, "Heartbeat publish failed");
                    }
                }
            }
        }
        debug!(agent_id = %self.inner.agent_id, "Heartbeat publisher exited");
    }

    /// Publish one heartbeat now.
    pub async fn send_heartbeat(&self) -> Result<MessageId> {
        let behavior = &self.inner.behavior;
        let load = behavior.load().await.clamp(0.0, 1.0);
        let heartbeat = Message::heartbeat(
            self.inner.agent_id.clone(),
            behavior.health().await,
            load,
            self.uptime_seconds(),
            self.inner.config.version.clone(),
        );
        self.inner.bus.publish(heartbeat).await
    }

    fn uptime_seconds(&self) -> u64 {
        self.run_info()
            .started
            .map(|(at, _)| at.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn status(&self) -> AgentStatus {
        let run = self.run_info();
        AgentStatus {
            agent_id: self.inner.agent_id.clone(),
            name: self.inner.name.clone(),
            running: self.is_running(),
            started_at: run.started.map(|(_, at)| at),
            uptime_seconds: run
                .started
                .map(|(at, _)| at.elapsed().as_secs())
                .unwrap_or(0),
            messages_processed: self.inner.messages_processed.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            last_error: run.last_error.clone(),
        }
    }

    /// Another agent's registry entry, as learned from its heartbeats.
    pub async fn agent_status(&self, agent_id: &str) -> Option<AgentInfo> {
        self.inner.bus.get_agent_status(agent_id).await
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send a command and, unless `fire_and_forget`, wait for its outcome.
    ///
    /// Returns the Response or Error reply, a synthesized error after retries
    /// run out, or `None` when not waiting.
    pub async fn send_command(
        &self,
        target: &str,
        action: &str,
        parameters: Value,
        options: CommandOptions,
    ) -> Result<Option<Message>> {
        self.ensure_running()?;
        let bus = &self.inner.bus;
        let idempotency_key = format!(
            "{}:{}",
            self.inner.agent_id,
            uuid::Uuid::new_v4().simple()
        );
        let mut max_retries = options.retry.max_retries;
        let mut attempt: u32 = 0;

        loop {
            let mut command = Message::command(
                self.inner.agent_id.clone(),
                target,
                action,
                parameters.clone(),
            )
            .with_priority(options.priority)
            .with_idempotency_key(idempotency_key.clone());
            if let Some(seconds) = options.timeout_seconds {
                command = command.with_command_timeout(seconds);
            }
            if let Some(session) = &options.session_id {
                command = command.with_session(session.clone());
            }

            let message_id = bus.publish(command.clone()).await?;
            command.header.message_id = message_id.clone();
            debug!(agent_id = %self.inner.agent_id, target, action, message_id = %message_id, attempt, "Command sent");

            if !options.wait_for_response {
                return Ok(None);
            }

            let reply = bus
                .wait_for_response(&message_id, options.response_timeout, Some(target))
                .await?;

            let hinted_delay = match &reply {
                Some(r) => match r.as_error() {
                    None => return Ok(reply),
                    Some(err) if !err.is_retryable() => return Ok(reply),
                    Some(err) => {
                        if let Some(budget) = err.max_retries {
                            max_retries = budget;
                        }
                        debug!(target, action, code = %err.error_code, attempt, "Retryable error reply");
                        err.retry_delay_ms.map(Duration::from_millis)
                    }
                },
                None => {
                    warn!(agent_id = %self.inner.agent_id, target, action, attempt, "No response before timeout");
                    None
                }
            };

            if attempt >= max_retries {
                return Ok(Some(self.exhausted(&command, reply, attempt + 1, &options)));
            }
            let delay = hinted_delay.unwrap_or_else(|| options.retry.delay_for_attempt(attempt));
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// Error reply handed back once every attempt has been spent.
    fn exhausted(
        &self,
        command: &Message,
        last_reply: Option<Message>,
        attempts: u32,
        options: &CommandOptions,
    ) -> Message {
        let target = &command.header.target;
        let action = command
            .as_command()
            .map(|c| c.action.clone())
            .unwrap_or_default();

        let (code, err) = match &last_reply {
            None => (
                codes::COMMAND_TIMEOUT,
                Error::CommandTimeout {
                    target: target.clone(),
                    action: action.clone(),
                    timeout_ms: options.response_timeout.as_millis() as u64,
                },
            ),
            Some(_) => (
                codes::MAX_RETRIES_EXCEEDED,
                Error::MaxRetriesExceeded {
                    action: action.clone(),
                    attempts,
                },
            ),
        };
        warn!(agent_id = %self.inner.agent_id, target = %target, action = %action, attempts, code, "Command gave up");

        let last_code = last_reply
            .as_ref()
            .and_then(|r| r.as_error())
            .map(|e| e.error_code.clone());
        command.create_error_response(
            code,
            err.to_string(),
            Some(json!({ "attempts": attempts, "last_error_code": last_code })),
        )
    }

    /// Publish an event to `target`.
    pub async fn send_event(&self, target: &str, event_type: &str, data: Value) -> Result<MessageId> {
        self.ensure_running()?;
        let event = Message::event(self.inner.agent_id.clone(), target, event_type, data);
        let id = self.inner.bus.publish(event).await?;
        debug!(agent_id = %self.inner.agent_id, target, event_type, message_id = %id, "Event sent");
        Ok(id)
    }

    /// Publish an event to every directly subscribed agent.
    pub async fn broadcast_event(&self, event_type: &str, data: Value) -> Result<MessageId> {
        self.send_event(BROADCAST_TARGET, event_type, data).await
    }

    fn record_error(&self, error: &Error) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        self.run_info().last_error = Some(error.to_string());
    }
}

#[async_trait]
impl MessageHandler for BusAgent {
    fn handler_id(&self) -> &str {
        &self.inner.agent_id
    }

    async fn handle(&self, message: Message) -> Result<Option<Message>> {
        let behavior = &self.inner.behavior;
        let outcome = match message.kind() {
            MessageType::Command => behavior.handle_command(message).await,
            MessageType::Event => behavior.handle_event(message).await,
            MessageType::Query => behavior.handle_query(message).await,
            MessageType::Response => behavior.handle_response(message).await,
            MessageType::Error => behavior.handle_error(message).await,
            MessageType::Data => behavior.handle_data(message).await,
            MessageType::StateUpdate => behavior.handle_state_update(message).await,
            MessageType::Heartbeat | MessageType::Subscribe | MessageType::Unsubscribe => {
                Ok(None)
            }
        };

        match &outcome {
            Ok(_) => {
                self.inner.messages_processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_error(e),
        }
        outcome
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::message::ErrorBody;
    use std::sync::atomic::AtomicU32;

    struct Echo;

    #[async_trait]
    impl AgentBehavior for Echo {
        async fn handle_command(&self, message: Message) -> Result<Option<Message>> {
            let action = message.as_command().map(|c| c.action.clone()).unwrap_or_default();
            match action.as_str() {
                "echo" => Ok(Some(message.create_response(true, "echo", json!({"ok": true})))),
                other => Err(Error::unknown_action(other)),
            }
        }
    }

    /// Answers with RATE_LIMITED until `succeed_after` calls have been made.
    struct Busy {
        calls: Arc<AtomicU32>,
        succeed_after: u32,
    }

    #[async_trait]
    impl AgentBehavior for Busy {
        async fn handle_command(&self, message: Message) -> Result<Option<Message>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.succeed_after {
                return Ok(Some(message.create_response(true, "done", json!({}))));
            }
            Ok(Some(message.create_error_reply(
                ErrorBody::new(codes::RATE_LIMITED, "busy").with_retry_delay_ms(10),
            )))
        }
    }

    struct Silent;

    #[async_trait]
    impl AgentBehavior for Silent {
        async fn handle_command(&self, _message: Message) -> Result<Option<Message>> {
            Ok(None)
        }
    }

    async fn running_bus() -> MessageBus {
        let bus = MessageBus::new(BusConfig::minimal());
        bus.start().await.unwrap();
        bus
    }

    fn fast_config() -> AgentConfig {
        AgentConfig {
            heartbeat_interval: Duration::from_millis(50),
            response_timeout: Duration::from_millis(300),
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 10,
                max_delay_ms: 50,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    async fn agent(id: &str, behavior: impl AgentBehavior + 'static, bus: &MessageBus) -> BusAgent {
        let agent = BusAgent::new(id, id, behavior, bus.clone(), fast_config());
        agent.start().await.unwrap();
        agent
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_requires_running_agent() {
        let bus = running_bus().await;
        let idle = BusAgent::new("idle", "Idle", Silent, bus.clone(), fast_config());
        let err = idle
            .send_event("anyone", "ping", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotRunning { .. }));
    }

    #[tokio::test]
    async fn test_heartbeats_register_agent() {
        let bus = running_bus().await;
        let echo = agent("echo", Echo, &bus).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let info = echo.agent_status("echo").await.expect("heartbeat seen");
        assert!((info.load - DEFAULT_AGENT_LOAD).abs() < 1e-9);
        assert!(!info.offline);

        echo.stop().await.unwrap();
        assert!(!echo.status().running);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_command_gets_response() {
        let bus = running_bus().await;
        let _echo = agent("echo", Echo, &bus).await;
        let client = agent("client", Silent, &bus).await;

        let options = CommandOptions::from_config(client.config());
        let reply = client
            .send_command("echo", "echo", json!({}), options)
            .await
            .unwrap()
            .expect("reply");
        assert!(reply.as_response().unwrap().success);
    }

    #[tokio::test]
    async fn test_unknown_action_is_permanent() {
        let bus = running_bus().await;
        let echo = agent("echo", Echo, &bus).await;
        let client = agent("client", Silent, &bus).await;

        let options = CommandOptions::from_config(client.config());
        let reply = client
            .send_command("echo", "dance", json!({}), options)
            .await
            .unwrap()
            .expect("reply");
        assert_eq!(reply.as_error().unwrap().error_code, codes::UNKNOWN_COMMAND);
        assert_eq!(echo.status().errors, 1);
    }

    #[tokio::test]
    async fn test_temporary_errors_are_retried() {
        let bus = running_bus().await;
        let calls = Arc::new(AtomicU32::new(0));
        let _busy = agent(
            "busy",
            Busy {
                calls: calls.clone(),
                succeed_after: 2,
            },
            &bus,
        )
        .await;
        let client = agent("client", Silent, &bus).await;

        let options = CommandOptions::from_config(client.config());
        let reply = client
            .send_command("busy", "work", json!({}), options)
            .await
            .unwrap()
            .expect("reply");
        assert!(reply.as_response().unwrap().success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_synthesizes_error() {
        let bus = running_bus().await;
        let calls = Arc::new(AtomicU32::new(0));
        let _busy = agent(
            "busy",
            Busy {
                calls: calls.clone(),
                succeed_after: 100,
            },
            &bus,
        )
        .await;
        let client = agent("client", Silent, &bus).await;

        let options = CommandOptions::from_config(client.config());
        let reply = client
            .send_command("busy", "work", json!({}), options)
            .await
            .unwrap()
            .expect("reply");
        let err = reply.as_error().unwrap();
        assert_eq!(err.error_code, codes::MAX_RETRIES_EXCEEDED);
        assert_eq!(err.details.as_ref().unwrap()["last_error_code"], codes::RATE_LIMITED);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_silent_target_times_out() {
        let bus = running_bus().await;
        let _mute = agent("mute", Silent, &bus).await;
        let client = agent("client", Silent, &bus).await;

        let options = CommandOptions::from_config(client.config())
            .with_response_timeout(Duration::from_millis(50))
            .with_retry(RetryConfig {
                max_retries: 1,
                base_delay_ms: 5,
                max_delay_ms: 5,
                jitter: 0.0,
            });
        let reply = client
            .send_command("mute", "anything", json!({}), options)
            .await
            .unwrap()
            .expect("synthesized reply");
        assert_eq!(reply.as_error().unwrap().error_code, codes::COMMAND_TIMEOUT);
    }

    #[tokio::test]
    async fn test_default_query_handler_not_implemented() {
        let bus = running_bus().await;
        let _echo = agent("echo", Echo, &bus).await;

        let query = Message::query("client", "echo", "stats", json!({}));
        let id = bus.publish(query).await.unwrap();
        let reply = bus
            .wait_for_response(&id, Duration::from_secs(2), Some("echo"))
            .await
            .unwrap()
            .expect("reply");
        assert_eq!(reply.as_error().unwrap().error_code, codes::NOT_IMPLEMENTED);
    }
}
