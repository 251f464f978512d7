//! # Message Bus
//!
//! In-process broker connecting agents through addressed and topical pub/sub,
//! with request/response correlation and per-destination admission control.
//!
//! ## Features
//!
//! - **Direct / Topic / Type subscriptions**: handlers keyed by agent id, topic or message kind
//! - **Correlation**: `wait_for_response` resolves when a reply naming the request arrives
//! - **Admission control**: token buckets per destination, circuit breakers per conversation
//! - **Idempotency**: commands carrying a known idempotency key are dropped
//! - **Durability**: important messages are persisted and replayed after a crash
//! - **Heartbeat monitoring**: silent agents are flagged offline and announced
//!
//! ## Publish pipeline
//!
//! ```text
//! publish(msg)
//!   |- validate, assign id
//!   |- [command] wait for tokens on target bucket ---- timeout --> RATE_LIMITED reply
//!   |- [command] idempotency key seen? -----------------------> return original id
//!   |- circuit (source, target) open / half-open shed -------> CIRCUIT_* reply
//!   |- persist (high/critical, command, state_update)
//!   '- enqueue --> single consumer loop --> concurrent fan-out to subscribers
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_bus::bus::{handler_fn, BusConfig, MessageBus};
//! use agent_bus::message::Message;
//!
//! let bus = MessageBus::new(BusConfig::default());
//! bus.subscribe_direct("echo", handler_fn("echo", |msg: Message| async move {
//!     Ok(Some(msg.create_response(true, "echoed", serde_json::json!({}))))
//! })).await;
//! bus.start().await?;
//!
//! let id = bus.publish(Message::command("client", "echo", "ping", serde_json::json!({}))).await?;
//! let reply = bus.wait_for_response(&id, Duration::from_secs(5), Some("echo")).await?;
//! ```

use crate::constants::*;
use crate::error::{Error, Result};
use crate::message::{
    codes, new_message_id, AgentId, ErrorBody, HeartbeatStatus, Message, MessageBody, MessageId,
    MessageStatus, MessageType, Priority,
};
use crate::persistence::{FileSystemPersistence, MessagePersistence};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::recovery::{CircuitBreakerConfig, CircuitBreakerTable, CircuitDecision};
use crate::settings::Settings;
use crate::supervisor::{cancelled, ShutdownSignal, TaskSupervisor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

// ============================================================================
// Handler Contract
// ============================================================================

/// Something that can receive messages from the bus.
///
/// Handlers run inside the bus's consumer loop; the next message is not
/// dequeued until every handler for the current one has returned. A handler
/// that needs to await another command's reply must do so from its own task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable identity used for set semantics in the registries.
    fn handler_id(&self) -> &str;

    /// Handle one delivery. A returned message is published on the handler's behalf.
    async fn handle(&self, message: Message) -> Result<Option<Message>>;
}

/// Shared handler reference stored in the registries.
pub type SharedHandler = Arc<dyn MessageHandler>;

struct FnHandler<F> {
    id: String,
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    fn handler_id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, message: Message) -> Result<Option<Message>> {
        (self.f)(message).await
    }
}

/// Adapt an async closure into a [`SharedHandler`].
pub fn handler_fn<F, Fut>(id: impl Into<String>, f: F) -> SharedHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    Arc::new(FnHandler { id: id.into(), f })
}

// ============================================================================
// Bus Configuration
// ============================================================================

/// Configuration for the message bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Store location; `None` disables persistence.
    pub persistence_dir: Option<PathBuf>,
    /// Maximum number of messages kept in history.
    pub history_size: usize,
    pub history_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub heartbeat_check_interval: Duration,
    /// Silence after which an agent is flagged offline.
    pub offline_after: Duration,
    pub cleanup_interval: Duration,
    /// How long a command may wait for rate-limit tokens.
    pub admission_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            persistence_dir: None,
            history_size: DEFAULT_HISTORY_SIZE,
            history_ttl: Duration::from_secs(DEFAULT_HISTORY_TTL_SECS),
            idempotency_ttl: Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS),
            heartbeat_check_interval: Duration::from_secs(DEFAULT_HEARTBEAT_CHECK_SECS),
            offline_after: Duration::from_secs(DEFAULT_OFFLINE_AFTER_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            admission_timeout: Duration::from_millis(DEFAULT_ADMISSION_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl BusConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let bus = &settings.bus;
        BusConfig {
            rate_limit: settings.rate_limit_config(),
            circuit_breaker: settings.circuit_breaker_config(),
            persistence_dir: settings.persistence_dir(),
            history_size: bus.history_size,
            history_ttl: Duration::from_secs(bus.history_ttl_secs),
            idempotency_ttl: Duration::from_secs(bus.idempotency_ttl_secs),
            heartbeat_check_interval: Duration::from_secs(bus.heartbeat_check_secs),
            offline_after: Duration::from_secs(bus.offline_after_secs),
            cleanup_interval: Duration::from_secs(bus.cleanup_interval_secs),
            admission_timeout: Duration::from_millis(bus.admission_timeout_ms),
            shutdown_grace: Duration::from_millis(bus.shutdown_grace_ms),
        }
    }

    /// Create a minimal configuration for testing: short timers, small history.
    pub fn minimal() -> Self {
        BusConfig {
            history_size: 100,
            history_ttl: Duration::from_secs(60),
            idempotency_ttl: Duration::from_secs(60),
            heartbeat_check_interval: Duration::from_millis(50),
            offline_after: Duration::from_millis(300),
            cleanup_interval: Duration::from_millis(100),
            admission_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    pub fn with_persistence_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistence_dir = Some(dir.into());
        self
    }
}

// ============================================================================
// Agent Registry
// ============================================================================

/// Liveness and load of an agent, learned from its heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub status: HeartbeatStatus,
    pub load: f64,
    pub uptime_seconds: u64,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub offline: bool,
}

impl AgentInfo {
    /// Whether the last heartbeat is older than `window`.
    pub fn is_silent_for(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_heartbeat);
        elapsed.num_milliseconds() > window.as_millis() as i64
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

struct Registry<K> {
    entries: HashMap<K, Vec<SharedHandler>>,
}

impl<K> Default for Registry<K> {
    fn default() -> Self {
        Registry {
            entries: HashMap::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq> Registry<K> {
    fn add(&mut self, key: K, handler: SharedHandler) -> bool {
        let handlers = self.entries.entry(key).or_default();
        if handlers
            .iter()
            .any(|h| h.handler_id() == handler.handler_id())
        {
            return false;
        }
        handlers.push(handler);
        true
    }

    fn remove(&mut self, key: &K, handler_id: &str) -> bool {
        let Some(handlers) = self.entries.get_mut(key) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| h.handler_id() != handler_id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.entries.remove(key);
        }
        removed
    }

    fn get(&self, key: &K) -> &[SharedHandler] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn all(&self) -> impl Iterator<Item = &SharedHandler> {
        self.entries.values().flatten()
    }

    fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

#[derive(Default)]
struct Subscriptions {
    direct: Registry<String>,
    topic: Registry<String>,
    by_type: Registry<MessageType>,
}

fn topic_key(topic: &str) -> String {
    topic.strip_prefix(TOPIC_PREFIX).unwrap_or(topic).to_string()
}

// ============================================================================
// History & Metrics
// ============================================================================

/// Predicates for [`MessageBus::get_message_history`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
    /// Agent appearing as source or target.
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub message_type: Option<MessageType>,
}

impl HistoryFilter {
    fn matches(&self, m: &Message) -> bool {
        let h = &m.header;
        self.agent_id
            .as_deref()
            .map_or(true, |a| h.source == a || h.target == a)
            && self
                .session_id
                .as_deref()
                .map_or(true, |s| h.session_id.as_deref() == Some(s))
            && self.message_type.map_or(true, |t| h.message_type == t)
    }
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    deduplicated: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
    expired: AtomicU64,
    subscriber_failures: AtomicU64,
    persistence_failures: AtomicU64,
    loop_errors: AtomicU64,
    recovered: AtomicU64,
    queued: AtomicU64,
    processing_micros: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of bus activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub running: bool,
    pub published: u64,
    pub processed: u64,
    pub failed: u64,
    pub deduplicated: u64,
    pub rate_limited: u64,
    pub circuit_rejected: u64,
    pub expired: u64,
    pub subscriber_failures: u64,
    pub persistence_failures: u64,
    pub loop_errors: u64,
    pub recovered: u64,
    pub queue_size: u64,
    pub total_processing_ms: f64,
    pub average_processing_ms: f64,
    pub active_waiters: usize,
    pub subscriptions: usize,
    pub known_agents: usize,
}

struct SeenEntry {
    source: AgentId,
    target: String,
    idempotency_key: Option<String>,
    recorded_at: Instant,
}

struct Waiter {
    expected_source: Option<String>,
    tx: oneshot::Sender<Message>,
}

impl Waiter {
    fn accepts(&self, reply: &Message) -> bool {
        accepts_source(self.expected_source.as_deref(), reply)
    }
}

fn accepts_source(expected: Option<&str>, reply: &Message) -> bool {
    match expected {
        None => true,
        Some(source) => reply.header.source == source || reply.header.source == BUS_SOURCE_ID,
    }
}

fn should_persist(message: &Message) -> bool {
    message.header.priority >= Priority::High
        || matches!(
            message.kind(),
            MessageType::Command | MessageType::StateUpdate
        )
}

// ============================================================================
// Message Bus
// ============================================================================

struct BusInner {
    config: BusConfig,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
    running: AtomicBool,
    subscriptions: RwLock<Subscriptions>,
    waiters: Mutex<HashMap<MessageId, Waiter>>,
    history: Mutex<VecDeque<Message>>,
    seen: Mutex<HashMap<MessageId, SeenEntry>>,
    idempotency: Mutex<HashMap<String, (MessageId, Instant)>>,
    agents: RwLock<HashMap<AgentId, AgentInfo>>,
    rate_limiter: RateLimiter,
    breakers: CircuitBreakerTable,
    persistence: Option<Arc<dyn MessagePersistence>>,
    counters: Counters,
    supervisor: TaskSupervisor,
}

/// Handle to a message bus. Clones share the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("running", &self.is_running())
            .field("persistent", &self.inner.persistence.is_some())
            .finish()
    }
}

impl MessageBus {
    /// Create a bus without persistence. `config.persistence_dir` is ignored; use [`MessageBus::open`].
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a bus backed by the given store.
    pub fn with_persistence(config: BusConfig, store: Arc<dyn MessagePersistence>) -> Self {
        Self::build(config, Some(store))
    }

    /// Create a bus, opening a file store when `config.persistence_dir` is set.
    pub async fn open(config: BusConfig) -> Result<Self> {
        match config.persistence_dir.clone() {
            Some(dir) => {
                let store = FileSystemPersistence::open(&dir).await?;
                Ok(Self::with_persistence(config, Arc::new(store)))
            }
            None => Ok(Self::new(config)),
        }
    }

    fn build(config: BusConfig, persistence: Option<Arc<dyn MessagePersistence>>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = BusInner {
            rate_limiter: RateLimiter::with_config(config.rate_limit.clone()),
            breakers: CircuitBreakerTable::new(config.circuit_breaker),
            config,
            sender,
            receiver: Mutex::new(receiver),
            running: AtomicBool::new(false),
            subscriptions: RwLock::new(Subscriptions::default()),
            waiters: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            persistence,
            counters: Counters::default(),
            supervisor: TaskSupervisor::new(),
        };
        MessageBus {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerTable {
        &self.inner.breakers
    }

    pub fn persistence(&self) -> Option<Arc<dyn MessagePersistence>> {
        self.inner.persistence.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run `future` under the bus's supervisor so `stop()` drains or cancels it.
    pub fn spawn_supervised<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.supervisor.spawn(name, future);
    }

    /// Shutdown flag shared by every supervised task.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.supervisor.signal()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Replay pending records, then spawn the consumer loop, heartbeat monitor
    /// and cleanup sweep. Starting a running bus is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Message bus already running");
            return Ok(());
        }

        let recovered = self.recover_pending().await;

        let bus = self.clone();
        let signal = self.shutdown_signal();
        self.spawn_supervised("bus-consumer", async move { bus.consumer_loop(signal).await });

        let bus = self.clone();
        let signal = self.shutdown_signal();
        let period = self.inner.config.heartbeat_check_interval;
        self.spawn_supervised("bus-heartbeat-monitor", async move {
            bus.periodic(period, signal, |bus| async move {
                bus.check_agent_liveness().await;
            })
            .await
        });

        let bus = self.clone();
        let signal = self.shutdown_signal();
        let period = self.inner.config.cleanup_interval;
        self.spawn_supervised("bus-cleanup", async move {
            bus.periodic(period, signal, |bus| async move {
                bus.cleanup().await;
            })
            .await
        });

        info!(recovered, "Message bus started");
        Ok(())
    }

    /// Stop background work and drop every outstanding response waiter.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let aborted = self
            .inner
            .supervisor
            .shutdown(self.inner.config.shutdown_grace)
            .await;
        let dropped = {
            let mut waiters = self.inner.waiters.lock().await;
            let n = waiters.len();
            waiters.clear();
            n
        };
        info!(aborted, dropped_waiters = dropped, "Message bus stopped");
    }

    async fn recover_pending(&self) -> u64 {
        let Some(store) = &self.inner.persistence else {
            return 0;
        };
        let pending = match store.load_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to load pending messages");
                bump(&self.inner.counters.persistence_failures);
                return 0;
            }
        };

        let mut recovered = 0;
        for message in pending {
            if let Some(key) = message.idempotency_key() {
                self.inner
                    .idempotency
                    .lock()
                    .await
                    .insert(key.to_string(), (message.id().to_string(), Instant::now()));
            }
            debug!(message_id = %message.id(), "Re-enqueueing pending message");
            if self.enqueue(message).await.is_ok() {
                recovered += 1;
            }
        }
        self.inner
            .counters
            .recovered
            .fetch_add(recovered, Ordering::Relaxed);
        recovered
    }

    async fn periodic<F, Fut>(&self, period: Duration, mut signal: ShutdownSignal, tick: F)
    where
        F: Fn(MessageBus) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut signal) => break,
                _ = ticker.tick() => tick(self.clone()).await,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Deliver messages addressed to `agent_id` (and broadcasts) to `handler`.
    pub async fn subscribe_direct(&self, agent_id: &str, handler: SharedHandler) -> bool {
        let added = self
            .inner
            .subscriptions
            .write()
            .await
            .direct
            .add(agent_id.to_string(), handler);
        debug!(agent_id, added, "Direct subscription");
        added
    }

    pub async fn unsubscribe_direct(&self, agent_id: &str, handler_id: &str) -> bool {
        self.inner
            .subscriptions
            .write()
            .await
            .direct
            .remove(&agent_id.to_string(), handler_id)
    }

    /// Deliver messages targeted at `topic` (with or without the `topic:` prefix).
    pub async fn subscribe_topic(&self, topic: &str, handler: SharedHandler) -> bool {
        let added = self
            .inner
            .subscriptions
            .write()
            .await
            .topic
            .add(topic_key(topic), handler);
        debug!(topic, added, "Topic subscription");
        added
    }

    pub async fn unsubscribe_topic(&self, topic: &str, handler_id: &str) -> bool {
        self.inner
            .subscriptions
            .write()
            .await
            .topic
            .remove(&topic_key(topic), handler_id)
    }

    /// Deliver every message of `kind`, whatever its target.
    pub async fn subscribe_type(&self, kind: MessageType, handler: SharedHandler) -> bool {
        self.inner
            .subscriptions
            .write()
            .await
            .by_type
            .add(kind, handler)
    }

    pub async fn unsubscribe_type(&self, kind: MessageType, handler_id: &str) -> bool {
        self.inner
            .subscriptions
            .write()
            .await
            .by_type
            .remove(&kind, handler_id)
    }

    async fn subscribers_for(&self, message: &Message) -> Vec<SharedHandler> {
        let subs = self.inner.subscriptions.read().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |h: &SharedHandler| {
            if seen.insert(h.handler_id().to_string()) {
                out.push(h.clone());
            }
        };

        if message.is_broadcast() {
            subs.direct.all().for_each(&mut push);
        } else if let Some(topic) = message.topic() {
            subs.topic.get(&topic.to_string()).iter().for_each(&mut push);
        } else {
            subs.direct
                .get(&message.header.target)
                .iter()
                .for_each(&mut push);
        }
        subs.by_type.get(&message.kind()).iter().for_each(&mut push);
        out
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Admit and enqueue a message. Returns its id, or the original id for a
    /// deduplicated command. Admission rejections are delivered to the sender
    /// as ERROR replies and still return `Ok`.
    pub async fn publish(&self, message: Message) -> Result<MessageId> {
        let mut message = message;
        if message.header.message_id.is_empty() {
            message.header.message_id = new_message_id();
        }
        message.validate()?;

        if message.kind().is_reply() {
            let correlation = message.header.correlation_id.as_deref().unwrap_or_default();
            if !self.inner.seen.lock().await.contains_key(correlation) {
                return Err(Error::unknown_correlation(correlation));
            }
        }

        let id = message.id().to_string();

        if message.kind() == MessageType::Command && !self.admit_rate(&message).await {
            warn!(message_id = %id, target = %message.header.target, "Command rate limited");
            bump(&self.inner.counters.rate_limited);
            let body = ErrorBody::new(
                codes::RATE_LIMITED,
                format!("rate limit exceeded for '{}'", message.header.target),
            )
            .with_retry_delay_ms(self.inner.config.admission_timeout.as_millis() as u64);
            self.reject(&message, body).await?;
            return Ok(id);
        }

        let idempotency_key = message.idempotency_key().map(str::to_string);
        if let Some(key) = &idempotency_key {
            let mut keys = self.inner.idempotency.lock().await;
            if let Some((original, _)) = keys.get(key) {
                debug!(message_id = %id, original = %original, "Duplicate command dropped");
                bump(&self.inner.counters.deduplicated);
                return Ok(original.clone());
            }
            keys.insert(key.clone(), (id.clone(), Instant::now()));
        }

        if !message.kind().is_reply() {
            if let Some(body) = self.admit_circuit(&message).await {
                if let Some(key) = &idempotency_key {
                    let mut keys = self.inner.idempotency.lock().await;
                    if keys.get(key).map(|(owner, _)| owner == &id).unwrap_or(false) {
                        keys.remove(key);
                    }
                }
                bump(&self.inner.counters.circuit_rejected);
                self.reject(&message, body).await?;
                return Ok(id);
            }
        }

        if should_persist(&message) {
            if let Some(store) = &self.inner.persistence {
                if let Err(e) = store.save(&message).await {
                    error!(message_id = %id, error = %e, "Persistence failed, delivering anyway");
                    bump(&self.inner.counters.persistence_failures);
                }
            }
        }

        bump(&self.inner.counters.published);
        self.enqueue(message).await?;
        Ok(id)
    }

    /// Token admission for a command. Cost shrinks as the target's load grows.
    async fn admit_rate(&self, message: &Message) -> bool {
        let limiter = &self.inner.rate_limiter;
        if !limiter.config().enabled {
            return true;
        }
        let target = &message.header.target;
        let load = self
            .inner
            .agents
            .read()
            .await
            .get(target)
            .map(|a| a.load.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let cost = message.header.priority.cost() * (1.0 - LOAD_COST_DISCOUNT * load);
        let cost = cost.min(limiter.capacity_of(target).await);
        limiter
            .wait_for_tokens(target, cost, self.inner.config.admission_timeout)
            .await
    }

    /// Circuit admission. Returns the rejection body when the message must not pass.
    async fn admit_circuit(&self, message: &Message) -> Option<ErrorBody> {
        let (source, target) = (&message.header.source, &message.header.target);
        match self.inner.breakers.check(source, target).await {
            CircuitDecision::Allow => None,
            CircuitDecision::RejectOpen { .. } => {
                warn!(source = %source, target = %target, "Circuit open, message rejected");
                let reset = self.inner.breakers.config().reset_timeout;
                Some(
                    ErrorBody::new(
                        codes::CIRCUIT_OPEN,
                        format!("circuit from '{}' to '{}' is open", source, target),
                    )
                    .with_retry_delay_ms(reset.as_millis() as u64),
                )
            }
            CircuitDecision::RejectHalfOpen => {
                debug!(source = %source, target = %target, "Half-open circuit shed message");
                Some(ErrorBody::new(
                    codes::CIRCUIT_HALF_OPEN,
                    format!("circuit from '{}' to '{}' is recovering", source, target),
                ))
            }
        }
    }

    /// Record the rejected message and queue an ERROR reply from the bus to its sender.
    async fn reject(&self, message: &Message, body: ErrorBody) -> Result<()> {
        self.remember(message, MessageStatus::Failed).await;
        let mut reply = message.create_error_reply(body);
        reply.header.source = BUS_SOURCE_ID.to_string();
        self.enqueue(reply).await
    }

    async fn remember(&self, message: &Message, status: MessageStatus) {
        self.inner.seen.lock().await.insert(
            message.id().to_string(),
            SeenEntry {
                source: message.header.source.clone(),
                target: message.header.target.clone(),
                idempotency_key: message.idempotency_key().map(str::to_string),
                recorded_at: Instant::now(),
            },
        );

        let mut entry = message.clone();
        entry.header.status = status;
        let mut history = self.inner.history.lock().await;
        history.push_back(entry);
        while history.len() > self.inner.config.history_size {
            history.pop_front();
        }
    }

    async fn enqueue(&self, message: Message) -> Result<()> {
        self.remember(&message, MessageStatus::Pending).await;
        self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.inner.sender.send(message).map_err(|e| {
            self.inner.counters.queued.fetch_sub(1, Ordering::Relaxed);
            Error::ChannelClosed(format!("queue closed for {}", e.0.id()))
        })
    }

    async fn set_status(&self, message_id: &str, status: MessageStatus) {
        let mut history = self.inner.history.lock().await;
        if let Some(entry) = history
            .iter_mut()
            .rev()
            .find(|m| m.header.message_id == message_id)
        {
            entry.header.status = status;
        }
    }

    // ------------------------------------------------------------------------
    // Correlation
    // ------------------------------------------------------------------------

    /// Wait for a response or error correlated with `message_id`.
    ///
    /// Replies already delivered are found in history. Replies from a source
    /// other than `expected_source` are ignored, except those the bus itself
    /// generated. Returns `None` on timeout or when the bus stops.
    pub async fn wait_for_response(
        &self,
        message_id: &str,
        timeout: Duration,
        expected_source: Option<&str>,
    ) -> Result<Option<Message>> {
        let rx = {
            let mut waiters = self.inner.waiters.lock().await;
            if waiters.contains_key(message_id) {
                return Err(Error::duplicate_waiter(message_id));
            }

            let earlier = {
                let history = self.inner.history.lock().await;
                history
                    .iter()
                    .find(|m| {
                        m.kind().is_reply()
                            && m.header.correlation_id.as_deref() == Some(message_id)
                            && accepts_source(expected_source, m)
                    })
                    .cloned()
            };
            if let Some(reply) = earlier {
                return Ok(Some(reply));
            }

            let (tx, rx) = oneshot::channel();
            waiters.insert(
                message_id.to_string(),
                Waiter {
                    expected_source: expected_source.map(str::to_string),
                    tx,
                },
            );
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                self.inner.waiters.lock().await.remove(message_id);
                debug!(message_id, "Response wait timed out");
                Ok(None)
            }
        }
    }

    async fn resolve_waiter(&self, reply: &Message) {
        let Some(correlation) = reply.header.correlation_id.as_deref() else {
            return;
        };
        let mut waiters = self.inner.waiters.lock().await;
        let matches = waiters
            .get(correlation)
            .map(|w| w.accepts(reply))
            .unwrap_or(false);
        if matches {
            if let Some(waiter) = waiters.remove(correlation) {
                let _ = waiter.tx.send(reply.clone());
            }
        }
    }

    /// Forget the idempotency key of a command that failed, so a retry is delivered.
    async fn release_idempotency_key(&self, reply: &Message) {
        let Some(correlation) = reply.header.correlation_id.as_deref() else {
            return;
        };
        let key = match self.inner.seen.lock().await.get(correlation) {
            Some(entry) => entry.idempotency_key.clone(),
            None => None,
        };
        if let Some(key) = key {
            let mut keys = self.inner.idempotency.lock().await;
            if keys.get(&key).map(|(owner, _)| owner == correlation).unwrap_or(false) {
                keys.remove(&key);
                debug!(message_id = correlation, "Idempotency key released after failure");
            }
        }
    }

    /// Update the breaker of the conversation a reply answers.
    async fn record_outcome(&self, reply: &Message) {
        if reply.header.source == BUS_SOURCE_ID {
            return;
        }
        let Some(correlation) = reply.header.correlation_id.as_deref() else {
            return;
        };
        let (source, target) = match self.inner.seen.lock().await.get(correlation) {
            Some(entry) => (entry.source.clone(), entry.target.clone()),
            None => (reply.header.target.clone(), reply.header.source.clone()),
        };

        match &reply.body {
            MessageBody::Error(_) => self.inner.breakers.record_failure(&source, &target).await,
            MessageBody::Response(r) if r.success => {
                self.inner.breakers.record_success(&source, &target).await
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Consumer Loop
    // ------------------------------------------------------------------------

    async fn consumer_loop(&self, mut signal: ShutdownSignal) {
        let mut rx = self.inner.receiver.lock().await;
        debug!("Consumer loop running");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut signal) => break,
                next = rx.recv() => next,
            };
            let Some(message) = next else { break };
            self.inner.counters.queued.fetch_sub(1, Ordering::Relaxed);

            let message_id = message.id().to_string();
            if let Err(e) = self.process(message).await {
                bump(&self.inner.counters.loop_errors);
                error!(message_id = %message_id, error = %e, "Error processing message");
            }
        }
        debug!("Consumer loop exited");
    }

    async fn process(&self, message: Message) -> Result<()> {
        let started = Instant::now();
        let id = message.id().to_string();
        let kind = message.kind();

        if message.is_expired() {
            debug!(message_id = %id, "Message expired before delivery");
            bump(&self.inner.counters.expired);
            self.set_status(&id, MessageStatus::Timeout).await;
            self.finish_persisted(&message).await;
            return Ok(());
        }
        self.set_status(&id, MessageStatus::Processing).await;

        match kind {
            MessageType::Heartbeat => self.observe_heartbeat(&message).await,
            MessageType::Response | MessageType::Error => {
                self.record_outcome(&message).await;
                if kind == MessageType::Error {
                    self.release_idempotency_key(&message).await;
                }
                self.resolve_waiter(&message).await;
            }
            _ => {}
        }

        let subscribers = self.subscribers_for(&message).await;
        let status = if subscribers.is_empty() {
            self.no_subscribers(&message).await?
        } else {
            self.fan_out(&message, subscribers).await
        };

        self.set_status(&id, status).await;
        if status == MessageStatus::Failed {
            bump(&self.inner.counters.failed);
        }
        self.finish_persisted(&message).await;

        bump(&self.inner.counters.processed);
        self.inner
            .counters
            .processing_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        debug!(message_id = %id, kind = %kind, ?status, "Message processed");
        Ok(())
    }

    async fn no_subscribers(&self, message: &Message) -> Result<MessageStatus> {
        match message.kind() {
            MessageType::Heartbeat | MessageType::Response | MessageType::Error => {
                Ok(MessageStatus::Completed)
            }
            MessageType::Command => {
                warn!(message_id = %message.id(), target = %message.header.target, "No handler for command");
                let mut reply = message.create_error_response(
                    codes::HANDLER_NOT_FOUND,
                    format!("no handler registered for '{}'", message.header.target),
                    None,
                );
                reply.header.source = BUS_SOURCE_ID.to_string();
                self.enqueue(reply).await?;
                Ok(MessageStatus::Failed)
            }
            _ => {
                debug!(message_id = %message.id(), target = %message.header.target, "No subscribers");
                Ok(MessageStatus::Failed)
            }
        }
    }

    async fn fan_out(&self, message: &Message, subscribers: Vec<SharedHandler>) -> MessageStatus {
        let deliveries = subscribers.into_iter().map(|handler| {
            let delivered = message.clone();
            async move {
                let handler_id = handler.handler_id().to_string();
                let outcome = tokio::spawn(async move { handler.handle(delivered).await }).await;
                (handler_id, outcome)
            }
        });

        let mut failures = 0;
        for (handler_id, outcome) in join_all(deliveries).await {
            let failure = match outcome {
                Ok(Ok(Some(reply))) => {
                    self.publish_on_behalf(message, reply).await;
                    None
                }
                Ok(Ok(None)) => None,
                Ok(Err(e)) => Some((e.wire_code(), e.to_string())),
                Err(join) => Some((
                    codes::PROCESSING_ERROR,
                    if join.is_panic() {
                        "handler panicked".to_string()
                    } else {
                        "handler was cancelled".to_string()
                    },
                )),
            };

            if let Some((code, reason)) = failure {
                failures += 1;
                bump(&self.inner.counters.subscriber_failures);
                warn!(
                    message_id = %message.id(),
                    subscriber = %handler_id,
                    code,
                    error = %reason,
                    "Subscriber failed"
                );
                self.report_failure(message, &handler_id, code, reason).await;
            }
        }

        if failures == 0 {
            MessageStatus::Completed
        } else {
            MessageStatus::Failed
        }
    }

    async fn publish_on_behalf(&self, original: &Message, mut reply: Message) {
        if reply.header.correlation_id.is_none() {
            reply.header.correlation_id = Some(original.id().to_string());
        }
        if let Err(e) = self.publish(reply).await {
            warn!(message_id = %original.id(), error = %e, "Failed to publish handler reply");
        }
    }

    /// Send an ERROR naming the failed subscriber back to the sender.
    async fn report_failure(&self, message: &Message, handler_id: &str, code: &str, reason: String) {
        if message.kind().is_reply()
            || message.kind() == MessageType::Heartbeat
            || message.header.source == BUS_SOURCE_ID
        {
            return;
        }
        let mut reply = message.create_error_response(
            code,
            reason,
            Some(json!({ "subscriber": handler_id })),
        );
        reply.header.source = handler_id.to_string();
        if let Err(e) = self.publish(reply).await {
            warn!(message_id = %message.id(), error = %e, "Failed to publish error reply");
        }
    }

    async fn finish_persisted(&self, message: &Message) {
        if !should_persist(message) {
            return;
        }
        if let Some(store) = &self.inner.persistence {
            if let Err(e) = store.mark_as_processed(message.id()).await {
                error!(message_id = %message.id(), error = %e, "Failed to mark message processed");
                bump(&self.inner.counters.persistence_failures);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Heartbeats & Liveness
    // ------------------------------------------------------------------------

    async fn observe_heartbeat(&self, message: &Message) {
        let Some(hb) = message.as_heartbeat() else {
            return;
        };
        let load = hb.load.clamp(0.0, 1.0);
        let came_back = {
            let mut agents = self.inner.agents.write().await;
            let previous = agents.insert(
                hb.agent_id.clone(),
                AgentInfo {
                    agent_id: hb.agent_id.clone(),
                    status: hb.status,
                    load,
                    uptime_seconds: hb.uptime_seconds,
                    version: hb.version.clone(),
                    last_heartbeat: Utc::now(),
                    offline: false,
                },
            );
            previous.map(|p| p.offline).unwrap_or(false)
        };
        if came_back {
            info!(agent_id = %hb.agent_id, "Agent back online");
        }

        let default_rate = self.inner.rate_limiter.config().default_rate;
        let rate = default_rate * (1.0 - load).max(MIN_LOAD_RATE_FACTOR);
        self.inner
            .rate_limiter
            .update_rate(&hb.agent_id, rate, None)
            .await;
        debug!(agent_id = %hb.agent_id, load, rate, "Heartbeat observed");
    }

    /// Flag agents silent for longer than the offline window and broadcast
    /// `agent.offline` for each. Returns the newly offline agent ids.
    pub async fn check_agent_liveness(&self) -> Vec<AgentId> {
        let now = Utc::now();
        let window = self.inner.config.offline_after;
        let newly_offline: Vec<AgentInfo> = {
            let mut agents = self.inner.agents.write().await;
            agents
                .values_mut()
                .filter(|a| !a.offline && a.is_silent_for(window, now))
                .map(|a| {
                    a.offline = true;
                    a.clone()
                })
                .collect()
        };

        for agent in &newly_offline {
            warn!(agent_id = %agent.agent_id, "Agent missed heartbeats, flagged offline");
            let event = Message::event(
                BUS_SOURCE_ID,
                BROADCAST_TARGET,
                EVENT_AGENT_OFFLINE,
                json!({
                    "agent_id": agent.agent_id,
                    "last_heartbeat": agent.last_heartbeat,
                }),
            );
            if let Err(e) = self.publish(event).await {
                warn!(agent_id = %agent.agent_id, error = %e, "Failed to announce offline agent");
            }
        }
        newly_offline.into_iter().map(|a| a.agent_id).collect()
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Option<AgentInfo> {
        self.inner.agents.read().await.get(agent_id).cloned()
    }

    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<_> = self.inner.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    // ------------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------------

    /// Trim history, the seen-message map and idempotency keys past their TTLs.
    /// Returns the number of entries dropped.
    pub async fn cleanup(&self) -> usize {
        let history_ttl = self.inner.config.history_ttl;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(history_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut dropped = 0;

        {
            let mut history = self.inner.history.lock().await;
            let before = history.len();
            history.retain(|m| m.header.timestamp >= cutoff);
            dropped += before - history.len();
        }
        {
            let mut seen = self.inner.seen.lock().await;
            let before = seen.len();
            seen.retain(|_, e| e.recorded_at.elapsed() <= history_ttl);
            dropped += before - seen.len();
        }
        {
            let ttl = self.inner.config.idempotency_ttl;
            let mut keys = self.inner.idempotency.lock().await;
            let before = keys.len();
            keys.retain(|_, (_, at)| at.elapsed() <= ttl);
            dropped += before - keys.len();
        }
        {
            let mut waiters = self.inner.waiters.lock().await;
            waiters.retain(|_, w| !w.tx.is_closed());
        }

        if dropped > 0 {
            debug!(dropped, "Cleanup sweep");
        }
        dropped
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Messages in history matching `filter`, oldest first.
    pub async fn get_message_history(&self, filter: &HistoryFilter) -> Vec<Message> {
        let history = self.inner.history.lock().await;
        let matched: Vec<Message> = history
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        match filter.limit {
            Some(limit) if matched.len() > limit => matched[matched.len() - limit..].to_vec(),
            _ => matched,
        }
    }

    /// Most recent history entry for `message_id`.
    pub async fn get_message(&self, message_id: &str) -> Option<Message> {
        let history = self.inner.history.lock().await;
        history
            .iter()
            .rev()
            .find(|m| m.header.message_id == message_id)
            .cloned()
    }

    pub async fn get_metrics(&self) -> BusMetrics {
        let c = &self.inner.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let total_ms = c.processing_micros.load(Ordering::Relaxed) as f64 / 1000.0;
        let subscriptions = {
            let subs = self.inner.subscriptions.read().await;
            subs.direct.len() + subs.topic.len() + subs.by_type.len()
        };
        let active_waiters = self.inner.waiters.lock().await.len();
        let known_agents = self.inner.agents.read().await.len();
        BusMetrics {
            running: self.is_running(),
            published: c.published.load(Ordering::Relaxed),
            processed,
            failed: c.failed.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            circuit_rejected: c.circuit_rejected.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            subscriber_failures: c.subscriber_failures.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            loop_errors: c.loop_errors.load(Ordering::Relaxed),
            recovered: c.recovered.load(Ordering::Relaxed),
            queue_size: c.queued.load(Ordering::Relaxed),
            total_processing_ms: total_ms,
            average_processing_ms: if processed > 0 {
                total_ms / processed as f64
            } else {
                0.0
            },
            active_waiters,
            subscriptions,
            known_agents,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeartbeatStatus;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(id: &str, counter: Arc<AtomicUsize>) -> SharedHandler {
        handler_fn(id.to_string(), move |_msg: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
    }

    fn echo_handler(id: &str) -> SharedHandler {
        handler_fn(id.to_string(), |msg: Message| async move {
            Ok(Some(msg.create_response(true, "ok", json!({"echo": true}))))
        })
    }

    async fn started_bus() -> MessageBus {
        let bus = MessageBus::new(BusConfig::minimal());
        bus.start().await.unwrap();
        bus
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // ------------------------------------------------------------------------
    // Configuration Tests
    // ------------------------------------------------------------------------

    #[test]
    fn test_bus_config_default() {
        let config = BusConfig::default();
        assert_eq!(config.history_size, 1000);
        assert_eq!(config.heartbeat_check_interval, Duration::from_secs(30));
        assert_eq!(config.offline_after, Duration::from_secs(90));
        assert!(config.persistence_dir.is_none());
    }

    #[test]
    fn test_bus_config_from_settings() {
        let settings = Settings::builder()
            .history_size(42)
            .persistence_dir("/tmp/bus")
            .build();
        let config = BusConfig::from_settings(&settings);
        assert_eq!(config.history_size, 42);
        assert_eq!(config.persistence_dir, Some(PathBuf::from("/tmp/bus")));
    }

    #[test]
    fn test_should_persist() {
        let cmd = Message::command("a", "b", "go", json!({}));
        let low_event = Message::event("a", "b", "x", json!({})).with_priority(Priority::Low);
        let high_event = Message::event("a", "b", "x", json!({})).with_priority(Priority::High);
        assert!(should_persist(&cmd));
        assert!(!should_persist(&low_event));
        assert!(should_persist(&high_event));
    }

    // ------------------------------------------------------------------------
    // Subscription Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_subscribe_is_set_semantics() {
        let bus = started_bus().await;
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler("a", count.clone());

        assert!(bus.subscribe_direct("a", handler.clone()).await);
        assert!(!bus.subscribe_direct("a", handler.clone()).await);
        assert!(bus.subscribe_type(MessageType::Event, handler).await);

        bus.publish(Message::event("src", "a", "ping", json!({})))
            .await
            .unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe_direct("a", "a").await);
        assert!(!bus.unsubscribe_direct("a", "a").await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_topic_and_broadcast_routing() {
        let bus = started_bus().await;
        let topic_hits = Arc::new(AtomicUsize::new(0));
        let direct_hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe_topic("progress", counting_handler("watcher", topic_hits.clone()))
            .await;
        bus.subscribe_direct("a", counting_handler("a", direct_hits.clone()))
            .await;
        bus.subscribe_direct("b", counting_handler("b", direct_hits.clone()))
            .await;

        bus.publish(Message::event("src", "topic:progress", "step", json!({})))
            .await
            .unwrap();
        bus.publish(Message::event("src", BROADCAST_TARGET, "hello", json!({})))
            .await
            .unwrap();
        settle().await;

        assert_eq!(topic_hits.load(Ordering::SeqCst), 1);
        assert_eq!(direct_hits.load(Ordering::SeqCst), 2);
        bus.stop().await;
    }

    // ------------------------------------------------------------------------
    // Publish & Correlation Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_publish_assigns_unique_ids() {
        let bus = MessageBus::new(BusConfig::minimal());
        let mut ids = HashSet::new();
        for _ in 0..50 {
            let mut msg = Message::event("a", "b", "e", json!({}));
            msg.header.message_id.clear();
            let id = bus.publish(msg).await.unwrap();
            assert!(!id.is_empty());
            assert!(ids.insert(id));
        }
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_message() {
        let bus = MessageBus::new(BusConfig::minimal());
        let msg = Message::event("", "b", "e", json!({}));
        assert!(matches!(
            bus.publish(msg).await,
            Err(Error::InvalidMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_reply_with_unknown_correlation_rejected() {
        let bus = MessageBus::new(BusConfig::minimal());
        let original = Message::command("a", "b", "go", json!({}));
        let reply = original.create_response(true, "done", json!({}));
        assert!(matches!(
            bus.publish(reply).await,
            Err(Error::UnknownCorrelation { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let bus = started_bus().await;
        bus.subscribe_direct("echo", echo_handler("echo")).await;

        let cmd = Message::command("client", "echo", "ping", json!({}))
            .with_priority(Priority::Critical);
        let id = bus.publish(cmd).await.unwrap();
        let reply = bus
            .wait_for_response(&id, Duration::from_secs(5), Some("echo"))
            .await
            .unwrap()
            .expect("reply");

        assert_eq!(reply.header.correlation_id.as_deref(), Some(id.as_str()));
        assert!(reply.as_response().unwrap().success);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_wait_finds_reply_already_delivered() {
        let bus = started_bus().await;
        bus.subscribe_direct("echo", echo_handler("echo")).await;

        let id = bus
            .publish(Message::command("client", "echo", "ping", json!({})))
            .await
            .unwrap();
        settle().await;

        let reply = bus
            .wait_for_response(&id, Duration::from_millis(10), None)
            .await
            .unwrap();
        assert!(reply.is_some());
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_waiter_rejected() {
        let bus = started_bus().await;
        let id = "msg_waiting".to_string();

        let waiting = {
            let bus = bus.clone();
            let id = id.clone();
            tokio::spawn(async move {
                bus.wait_for_response(&id, Duration::from_millis(300), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = bus
            .wait_for_response(&id, Duration::from_millis(10), None)
            .await;
        assert!(matches!(second, Err(Error::DuplicateWaiter { .. })));
        assert_eq!(waiting.await.unwrap().unwrap(), None);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_wait_times_out_and_discards_waiter() {
        let bus = started_bus().await;
        let reply = bus
            .wait_for_response("msg_nobody", Duration::from_millis(30), None)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(bus.get_metrics().await.active_waiters, 0);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drops_waiters() {
        let bus = started_bus().await;
        let waiting = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for_response("msg_pending", Duration::from_secs(30), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.stop().await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("waiter released")
            .unwrap()
            .unwrap();
        assert!(outcome.is_none());
    }

    // ------------------------------------------------------------------------
    // Failure Handling Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_handler_error_becomes_processing_error() {
        let bus = started_bus().await;
        bus.subscribe_direct(
            "worker",
            handler_fn("worker", |_msg: Message| async move {
                Err(Error::handler_failed("worker", "boom"))
            }),
        )
        .await;

        let id = bus
            .publish(Message::command("client", "worker", "explode", json!({})))
            .await
            .unwrap();
        let reply = bus
            .wait_for_response(&id, Duration::from_secs(2), Some("worker"))
            .await
            .unwrap()
            .expect("error reply");

        let err = reply.as_error().unwrap();
        assert_eq!(err.error_code, codes::PROCESSING_ERROR);
        assert_eq!(err.details.as_ref().unwrap()["subscriber"], "worker");
        assert_eq!(
            bus.get_message(&id).await.unwrap().header.status,
            MessageStatus::Failed
        );
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let bus = started_bus().await;
        let healthy = Arc::new(AtomicUsize::new(0));
        bus.subscribe_topic(
            "jobs",
            handler_fn("crashy", |_msg: Message| async move {
                if true {
                    panic!("subscriber bug");
                }
                Ok(None)
            }),
        )
        .await;
        bus.subscribe_topic("jobs", counting_handler("steady", healthy.clone()))
            .await;

        bus.publish(Message::event("src", "topic:jobs", "job", json!({})))
            .await
            .unwrap();
        bus.publish(Message::event("src", "topic:jobs", "job", json!({})))
            .await
            .unwrap();
        settle().await;

        assert_eq!(healthy.load(Ordering::SeqCst), 2);
        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.subscriber_failures, 2);
        assert!(bus.is_running());
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_command_without_handler_gets_handler_not_found() {
        let bus = started_bus().await;
        let id = bus
            .publish(Message::command("client", "ghost", "haunt", json!({})))
            .await
            .unwrap();
        let reply = bus
            .wait_for_response(&id, Duration::from_secs(2), Some("ghost"))
            .await
            .unwrap()
            .expect("bus reply");
        assert_eq!(reply.header.source, BUS_SOURCE_ID);
        assert_eq!(reply.as_error().unwrap().error_code, codes::HANDLER_NOT_FOUND);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_expired_message_not_delivered() {
        let bus = started_bus().await;
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe_direct("a", counting_handler("a", count.clone()))
            .await;

        let mut msg = Message::event("src", "a", "late", json!({})).with_ttl(1);
        msg.header.timestamp = Utc::now() - chrono::Duration::seconds(5);
        let id = bus.publish(msg).await.unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            bus.get_message(&id).await.unwrap().header.status,
            MessageStatus::Timeout
        );
        bus.stop().await;
    }

    // ------------------------------------------------------------------------
    // Heartbeat Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_heartbeat_updates_registry_and_rate() {
        let bus = started_bus().await;
        bus.publish(Message::heartbeat("worker", HeartbeatStatus::Degraded, 0.75, 10, "1.0"))
            .await
            .unwrap();
        settle().await;

        let info = bus.get_agent_status("worker").await.expect("registered");
        assert_eq!(info.status, HeartbeatStatus::Degraded);
        assert!((info.load - 0.75).abs() < 1e-9);

        let bucket = bus.rate_limiter().get_bucket("worker").await.unwrap();
        assert!((bucket.rate - DEFAULT_BUCKET_RATE * 0.25).abs() < 1e-9);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_silent_agent_flagged_offline() {
        let bus = started_bus().await;
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        bus.subscribe_type(
            MessageType::Event,
            handler_fn("observer", move |msg: Message| {
                let seen = seen.clone();
                async move {
                    if msg.as_event().map(|e| e.event_type.as_str()) == Some(EVENT_AGENT_OFFLINE) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(None)
                }
            }),
        )
        .await;

        bus.publish(Message::heartbeat("sleepy", HeartbeatStatus::Healthy, 0.1, 1, "1.0"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(bus.get_agent_status("sleepy").await.unwrap().offline);
        assert_eq!(events.load(Ordering::SeqCst), 1);
        bus.stop().await;
    }

    // ------------------------------------------------------------------------
    // Lifecycle Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_restart_after_stop() {
        let bus = started_bus().await;
        bus.stop().await;
        assert!(!bus.is_running());

        bus.start().await.unwrap();
        bus.subscribe_direct("echo", echo_handler("echo")).await;
        let id = bus
            .publish(Message::command("client", "echo", "ping", json!({})))
            .await
            .unwrap();
        let reply = bus
            .wait_for_response(&id, Duration::from_secs(2), None)
            .await
            .unwrap();
        assert!(reply.is_some());
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_history_filter_and_limit() {
        let bus = MessageBus::new(BusConfig::minimal());
        for i in 0..5 {
            bus.publish(Message::event("a", "b", format!("e{}", i), json!({})))
                .await
                .unwrap();
        }
        bus.publish(Message::event("c", "d", "other", json!({})))
            .await
            .unwrap();

        let filter = HistoryFilter {
            agent_id: Some("a".into()),
            limit: Some(2),
            ..Default::default()
        };
        let history = bus.get_message_history(&filter).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].as_event().unwrap().event_type, "e4");
    }

    #[tokio::test]
    async fn test_cleanup_expires_idempotency_keys() {
        let config = BusConfig {
            idempotency_ttl: Duration::from_millis(10),
            ..BusConfig::minimal()
        };
        let bus = MessageBus::new(config);
        let first = bus
            .publish(Message::command("a", "b", "go", json!({})).with_idempotency_key("k"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(bus.cleanup().await >= 1);

        let second = bus
            .publish(Message::command("a", "b", "go", json!({})).with_idempotency_key("k"))
            .await
            .unwrap();
        assert_ne!(first, second);
    }
}
