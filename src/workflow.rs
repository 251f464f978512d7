//! # Workflow Engine
//!
//! Finite-state workflows driven over the message bus.
//!
//! A [`Workflow`] owns a set of named [`WorkflowState`]s, a serializable
//! [`WorkflowData`] blob and a transition lock. Entering a state schedules its
//! `process` step as a supervised background task; the step's
//! [`TransitionResult`] decides where the workflow goes next.
//!
//! ```text
//!   start(initial) --> [initial] --process--> next --> [next] --> ... --> stop
//!                          |                                 ^
//!                          '--failure--> handle_error -------'
//!                                            |
//!                                            '--retries exhausted--> [error]
//! ```
//!
//! Lifecycle and transition events are published on `topic:workflow`.
//!
//! ## Example
//!
//! ```rust,ignore
//! let manager = WorkflowManager::new(bus.clone());
//! let wf = manager.create_workflow("render", "coordinator").await;
//! wf.add_state("fetch", FetchState).add_state("render", RenderState);
//! wf.start("fetch", None).await?;
//! wf.wait_for_completion(Duration::from_secs(10)).await;
//! ```

use crate::bus::MessageBus;
use crate::constants::{
    DEFAULT_STATE_MAX_RETRIES, EVENT_WORKFLOW_CHECKPOINT_RESTORED, EVENT_WORKFLOW_ERROR,
    EVENT_WORKFLOW_STARTED, EVENT_WORKFLOW_STATE_CHANGED, EVENT_WORKFLOW_STOPPED,
    WORKFLOW_ERROR_STATE, WORKFLOW_ERROR_TOPIC, WORKFLOW_TOPIC,
};
use crate::error::{Error, Result};
use crate::message::{AgentId, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

// ============================================================================
// State Contract
// ============================================================================

/// Outcome of processing a state or handling its error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionResult {
    pub success: bool,
    pub next_state: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TransitionResult {
    /// Success; wait for an external transition.
    pub fn stay() -> Self {
        Self {
            success: true,
            next_state: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Success; move to `next`.
    pub fn to(next: impl Into<String>) -> Self {
        Self {
            next_state: Some(next.into()),
            ..Self::stay()
        }
    }

    /// Failure, handed to the state's error handler.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::stay()
        }
    }

    /// Failure that still names a destination.
    pub fn escalate(next: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            next_state: Some(next.into()),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// One state of a workflow.
///
/// Only `process` is required. The default error handler retries the same
/// state up to [`WorkflowState::max_retries`] times, then escalates to the
/// bundled `error` state.
#[async_trait]
pub trait WorkflowState: Send + Sync {
    fn max_retries(&self) -> u32 {
        DEFAULT_STATE_MAX_RETRIES
    }

    async fn on_enter(&self, _data: &mut WorkflowData) -> Result<()> {
        Ok(())
    }

    /// Do the state's work. Runs without the transition lock held, on a copy
    /// of the data that is committed only if no other transition intervened.
    async fn process(&self, data: &mut WorkflowData) -> Result<TransitionResult>;

    async fn on_exit(&self, _data: &mut WorkflowData) -> Result<()> {
        Ok(())
    }

    async fn handle_error(
        &self,
        state: &str,
        error: &str,
        data: &mut WorkflowData,
    ) -> TransitionResult {
        let attempts = data.retry_counts.entry(state.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts <= self.max_retries() {
            warn!(
                state,
                error,
                attempt = *attempts,
                max = self.max_retries(),
                "State failed, retrying"
            );
            TransitionResult::to(state)
        } else {
            error!(state, error, "State failed, retries exhausted");
            TransitionResult::escalate(WORKFLOW_ERROR_STATE, error)
        }
    }

    /// Transition guard.
    async fn can_transition_to(&self, _next: &str, _data: &WorkflowData) -> bool {
        true
    }
}

/// Terminal state entered when a state exhausts its retries. Announces the
/// failure on `topic:workflow.error` and waits for outside intervention.
pub struct ErrorState {
    bus: MessageBus,
    workflow_id: String,
    agent_id: AgentId,
}

#[async_trait]
impl WorkflowState for ErrorState {
    async fn on_enter(&self, data: &mut WorkflowData) -> Result<()> {
        let cause = data
            .context
            .get(TRANSITION_ERROR_KEY)
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        error!(workflow_id = %self.workflow_id, error = %cause, "Workflow entered error state");

        let event = Message::event(
            self.agent_id.clone(),
            WORKFLOW_ERROR_TOPIC,
            EVENT_WORKFLOW_ERROR,
            json!({
                "workflow_id": self.workflow_id,
                "error": cause,
                "timestamp": Utc::now(),
            }),
        );
        self.bus.publish(event).await?;
        Ok(())
    }

    async fn process(&self, _data: &mut WorkflowData) -> Result<TransitionResult> {
        Ok(TransitionResult::stay())
    }
}

/// Context key holding the error that sent the workflow to the error state.
pub const TRANSITION_ERROR_KEY: &str = "transition_error";

// ============================================================================
// Workflow Data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Initialized,
    Running,
    Completed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Initialized => "initialized",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// One entry of the transition log. `from_state` is `None` at start,
/// `to_state` is `None` at stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub state: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub exception: bool,
}

/// Everything a workflow knows about its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowData {
    pub workflow_id: String,
    pub name: String,
    pub agent_id: AgentId,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
    pub history: Vec<HistoryEntry>,
    pub checkpoints: HashMap<String, Checkpoint>,
    pub errors: Vec<WorkflowFailure>,
    /// Free-form data shared between states.
    pub context: Map<String, Value>,
    pub retry_counts: HashMap<String, u32>,
}

impl WorkflowData {
    fn new(workflow_id: &str, name: &str, agent_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            name: name.to_string(),
            agent_id: agent_id.to_string(),
            start_time: None,
            end_time: None,
            status: WorkflowStatus::Initialized,
            history: Vec::new(),
            checkpoints: HashMap::new(),
            errors: Vec::new(),
            context: Map::new(),
            retry_counts: HashMap::new(),
        }
    }

    fn record_transition(&mut self, from: Option<&str>, to: Option<&str>, reason: &str) {
        self.history.push(HistoryEntry {
            from_state: from.map(str::to_string),
            to_state: to.map(str::to_string),
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
    }

    fn record_failure(&mut self, state: Option<&str>, error: &str, exception: bool) {
        self.errors.push(WorkflowFailure {
            state: state.map(str::to_string),
            error: error.to_string(),
            timestamp: Utc::now(),
            exception,
        });
    }
}

/// Listing row returned by [`WorkflowManager::list_workflows`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub name: String,
    pub agent_id: AgentId,
    pub current_state: Option<String>,
    pub status: WorkflowStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Workflow
// ============================================================================

type SharedState = Arc<dyn WorkflowState>;

#[derive(Debug, Clone, PartialEq)]
struct Progress {
    state: Option<String>,
    status: WorkflowStatus,
}

struct Core {
    current_state: Option<String>,
    data: WorkflowData,
    /// Bumped on every transition and stop; stale processing results are dropped.
    epoch: u64,
}

struct WorkflowInner {
    id: String,
    name: String,
    agent_id: AgentId,
    bus: MessageBus,
    states: RwLock<HashMap<String, SharedState>>,
    core: Mutex<Core>,
    progress: watch::Sender<Progress>,
}

/// Handle to one workflow instance. Clones share the instance.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("agent_id", &self.inner.agent_id)
            .finish()
    }
}

impl Workflow {
    /// Create a workflow with the bundled `error` state registered.
    pub fn new(
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        agent_id: impl Into<AgentId>,
        bus: MessageBus,
    ) -> Self {
        let id = workflow_id.into();
        let name = name.into();
        let agent_id = agent_id.into();
        let (progress, _) = watch::channel(Progress {
            state: None,
            status: WorkflowStatus::Initialized,
        });

        let error_state: SharedState = Arc::new(ErrorState {
            bus: bus.clone(),
            workflow_id: id.clone(),
            agent_id: agent_id.clone(),
        });
        let mut states = HashMap::new();
        states.insert(WORKFLOW_ERROR_STATE.to_string(), error_state);

        let inner = WorkflowInner {
            core: Mutex::new(Core {
                current_state: None,
                data: WorkflowData::new(&id, &name, &agent_id),
                epoch: 0,
            }),
            id,
            name,
            agent_id,
            bus,
            states: RwLock::new(states),
            progress,
        };
        Workflow {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Register (or replace) a state. Chainable.
    pub fn add_state(&self, name: impl Into<String>, state: impl WorkflowState + 'static) -> &Self {
        let name = name.into();
        debug!(workflow_id = %self.inner.id, state = %name, "State registered");
        self.inner
            .states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(state));
        self
    }

    fn state(&self, name: &str) -> Option<SharedState> {
        self.inner
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.state(name).is_some()
    }

    pub async fn current_state(&self) -> Option<String> {
        self.inner.core.lock().await.current_state.clone()
    }

    pub async fn status(&self) -> WorkflowStatus {
        self.inner.core.lock().await.data.status
    }

    /// Snapshot of the workflow's data blob.
    pub async fn data(&self) -> WorkflowData {
        self.inner.core.lock().await.data.clone()
    }

    pub async fn summary(&self) -> WorkflowSummary {
        let core = self.inner.core.lock().await;
        WorkflowSummary {
            workflow_id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            agent_id: self.inner.agent_id.clone(),
            current_state: core.current_state.clone(),
            status: core.data.status,
            start_time: core.data.start_time,
            end_time: core.data.end_time,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Enter `initial_state` and schedule its processing.
    ///
    /// Returns `Ok(false)` if the workflow was already started.
    pub async fn start(
        &self,
        initial_state: &str,
        initial_context: Option<Map<String, Value>>,
    ) -> Result<bool> {
        let mut core = self.inner.core.lock().await;
        if core.data.status != WorkflowStatus::Initialized {
            warn!(workflow_id = %self.inner.id, "Workflow already started");
            return Ok(false);
        }
        let state = self
            .state(initial_state)
            .ok_or_else(|| Error::unknown_state(initial_state))?;

        if let Some(context) = initial_context {
            core.data.context.extend(context);
        }
        core.data.start_time = Some(Utc::now());
        core.data.status = WorkflowStatus::Running;
        core.current_state = Some(initial_state.to_string());
        core.epoch += 1;
        core.data
            .record_transition(None, Some(initial_state), "workflow_started");

        if let Err(e) = state.on_enter(&mut core.data).await {
            warn!(workflow_id = %self.inner.id, state = initial_state, error = %e, "on_enter failed");
            core.data.record_failure(Some(initial_state), &e.to_string(), false);
        }

        self.publish_event(
            EVENT_WORKFLOW_STARTED,
            json!({
                "workflow_id": self.inner.id,
                "name": self.inner.name,
                "initial_state": initial_state,
            }),
        )
        .await;
        info!(workflow_id = %self.inner.id, state = initial_state, "Workflow started");

        self.notify(&core);
        self.schedule(core.epoch);
        Ok(true)
    }

    /// Move to `next` and schedule its processing. Returns before the new
    /// state's processing completes.
    pub async fn transition(&self, next: &str, reason: &str) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        self.apply_transition(&mut core, next, reason).await
    }

    async fn apply_transition(&self, core: &mut Core, next: &str, reason: &str) -> Result<()> {
        let current = core
            .current_state
            .clone()
            .ok_or_else(|| Error::WorkflowNotRunning {
                workflow_id: self.inner.id.clone(),
            })?;
        let next_state = self.state(next).ok_or_else(|| Error::unknown_state(next))?;
        let current_state = self
            .state(&current)
            .ok_or_else(|| Error::unknown_state(current.as_str()))?;

        if !current_state.can_transition_to(next, &core.data).await {
            warn!(workflow_id = %self.inner.id, from = %current, to = next, "Transition rejected by guard");
            return Err(Error::TransitionRejected {
                from: current,
                to: next.to_string(),
            });
        }

        current_state.on_exit(&mut core.data).await?;

        core.current_state = Some(next.to_string());
        core.epoch += 1;
        core.data
            .record_transition(Some(&current), Some(next), reason);

        if let Err(e) = next_state.on_enter(&mut core.data).await {
            warn!(workflow_id = %self.inner.id, state = next, error = %e, "on_enter failed");
            core.data.record_failure(Some(next), &e.to_string(), false);
        }

        self.publish_event(
            EVENT_WORKFLOW_STATE_CHANGED,
            json!({
                "workflow_id": self.inner.id,
                "from_state": current,
                "to_state": next,
                "reason": reason,
            }),
        )
        .await;
        debug!(workflow_id = %self.inner.id, from = %current, to = next, reason, "Transition");

        self.notify(core);
        self.schedule(core.epoch);
        Ok(())
    }

    /// Leave the current state and mark the workflow completed.
    pub async fn stop(&self, reason: &str) {
        let mut core = self.inner.core.lock().await;
        self.apply_stop(&mut core, reason).await;
    }

    async fn apply_stop(&self, core: &mut Core, reason: &str) {
        let Some(current) = core.current_state.clone() else {
            return;
        };
        if core.data.status == WorkflowStatus::Completed {
            return;
        }

        if let Some(state) = self.state(&current) {
            if let Err(e) = state.on_exit(&mut core.data).await {
                warn!(workflow_id = %self.inner.id, state = %current, error = %e, "on_exit failed");
            }
        }

        core.data.status = WorkflowStatus::Completed;
        core.data.end_time = Some(Utc::now());
        core.data.record_transition(Some(&current), None, reason);
        core.current_state = None;
        core.epoch += 1;

        self.publish_event(
            EVENT_WORKFLOW_STOPPED,
            json!({ "workflow_id": self.inner.id, "reason": reason }),
        )
        .await;
        info!(workflow_id = %self.inner.id, reason, "Workflow stopped");
        self.notify(core);
    }

    // ------------------------------------------------------------------------
    // State Processing
    // ------------------------------------------------------------------------

    fn schedule(&self, epoch: u64) {
        let workflow = self.clone();
        self.inner.bus.spawn_supervised(
            format!("workflow-{}", self.inner.id),
            async move { workflow.run_state(epoch).await },
        );
    }

    async fn run_state(&self, epoch: u64) {
        let (name, mut data) = {
            let core = self.inner.core.lock().await;
            if core.epoch != epoch || core.data.status != WorkflowStatus::Running {
                return;
            }
            match &core.current_state {
                Some(name) => (name.clone(), core.data.clone()),
                None => return,
            }
        };
        let Some(state) = self.state(&name) else {
            return;
        };

        let outcome = state.process(&mut data).await;

        let mut core = self.inner.core.lock().await;
        if core.epoch != epoch {
            debug!(workflow_id = %self.inner.id, state = %name, "Discarding stale processing result");
            return;
        }
        // Checkpoints created while the state ran live only in the shared copy.
        let checkpoints = std::mem::take(&mut core.data.checkpoints);
        core.data = data;
        core.data.checkpoints = checkpoints;

        match outcome {
            Err(e) => {
                let message = e.to_string();
                error!(workflow_id = %self.inner.id, state = %name, error = %message, "State processing raised");
                core.data.record_failure(Some(&name), &message, true);
                self.apply_stop(&mut core, &format!("exception: {}", message))
                    .await;
            }
            Ok(result) if result.success => {
                core.data.retry_counts.remove(&name);
                match result.next_state {
                    Some(next) if next != name => {
                        if let Err(e) = self
                            .apply_transition(&mut core, &next, "state_processing_complete")
                            .await
                        {
                            self.fail_and_stop(&mut core, &name, &e.to_string()).await;
                        }
                    }
                    _ => {
                        debug!(workflow_id = %self.inner.id, state = %name, "Waiting for external transition")
                    }
                }
            }
            Ok(result) => {
                let message = result.error.unwrap_or_else(|| "unknown error".to_string());
                error!(workflow_id = %self.inner.id, state = %name, error = %message, "State processing failed");
                let recovery = state.handle_error(&name, &message, &mut core.data).await;

                match recovery.next_state {
                    Some(next) => {
                        if !recovery.success {
                            core.data.record_failure(Some(&name), &message, false);
                            core.data
                                .context
                                .insert(TRANSITION_ERROR_KEY.to_string(), json!(message));
                        }
                        let reason = format!("error_recovery: {}", message);
                        if let Err(e) = self.apply_transition(&mut core, &next, &reason).await {
                            self.fail_and_stop(&mut core, &name, &e.to_string()).await;
                        }
                    }
                    None => self.fail_and_stop(&mut core, &name, &message).await,
                }
            }
        }
    }

    async fn fail_and_stop(&self, core: &mut Core, state: &str, message: &str) {
        core.data.record_failure(Some(state), message, false);
        self.apply_stop(core, &format!("error: {}", message)).await;
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Record the current state under `checkpoint_id`, replacing any previous one.
    pub async fn create_checkpoint(&self, checkpoint_id: &str, extra: Option<Value>) {
        let mut core = self.inner.core.lock().await;
        let checkpoint = Checkpoint {
            state: core.current_state.clone(),
            timestamp: Utc::now(),
            extra: extra.unwrap_or(Value::Null),
        };
        info!(
            workflow_id = %self.inner.id,
            checkpoint_id,
            state = ?checkpoint.state,
            "Checkpoint created"
        );
        core.data
            .checkpoints
            .insert(checkpoint_id.to_string(), checkpoint);
    }

    /// Transition back to the state recorded by `checkpoint_id`.
    ///
    /// Only the position is restored; the data blob keeps its current contents.
    pub async fn restore_from_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        let checkpoint = core
            .data
            .checkpoints
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| Error::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })?;
        let target = checkpoint.state.ok_or_else(|| Error::WorkflowNotRunning {
            workflow_id: self.inner.id.clone(),
        })?;
        if !self.has_state(&target) {
            return Err(Error::unknown_state(target));
        }

        let reason = format!("restore_from_checkpoint:{}", checkpoint_id);
        self.apply_transition(&mut core, &target, &reason).await?;

        self.publish_event(
            EVENT_WORKFLOW_CHECKPOINT_RESTORED,
            json!({
                "workflow_id": self.inner.id,
                "checkpoint_id": checkpoint_id,
                "state": target,
            }),
        )
        .await;
        info!(workflow_id = %self.inner.id, checkpoint_id, state = %target, "Restored from checkpoint");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    fn notify(&self, core: &Core) {
        self.inner.progress.send_replace(Progress {
            state: core.current_state.clone(),
            status: core.data.status,
        });
    }

    /// Wait until the workflow sits in `state`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: &str, timeout: Duration) -> bool {
        let mut rx = self.inner.progress.subscribe();
        tokio::time::timeout(
            timeout,
            rx.wait_for(|p| p.state.as_deref() == Some(state)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }

    /// Wait until the workflow has stopped. Returns `false` on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.progress.subscribe();
        tokio::time::timeout(
            timeout,
            rx.wait_for(|p| p.status == WorkflowStatus::Completed),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }

    async fn publish_event(&self, event_type: &str, mut data: Value) {
        if let Value::Object(map) = &mut data {
            map.insert("timestamp".to_string(), json!(Utc::now()));
        }
        let event = Message::event(self.inner.agent_id.clone(), WORKFLOW_TOPIC, event_type, data);
        if let Err(e) = self.inner.bus.publish(event).await {
            warn!(workflow_id = %self.inner.id, event_type, error = %e, "Failed to publish workflow event");
        }
    }
}

// ============================================================================
// Workflow Manager
// ============================================================================

/// Registry of workflow instances sharing one bus.
pub struct WorkflowManager {
    bus: MessageBus,
    workflows: tokio::sync::RwLock<HashMap<String, Workflow>>,
}

impl WorkflowManager {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            workflows: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a workflow with a fresh `wf_xxxxxxxx` id.
    pub async fn create_workflow(&self, name: &str, agent_id: &str) -> Workflow {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let workflow_id = format!("wf_{}", &simple[..8]);
        let workflow = Workflow::new(workflow_id.clone(), name, agent_id, self.bus.clone());
        self.workflows
            .write()
            .await
            .insert(workflow_id.clone(), workflow.clone());
        info!(workflow_id = %workflow_id, name, agent_id, "Workflow created");
        workflow
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    /// Summaries of all workflows, optionally only those owned by `agent_id`.
    pub async fn list_workflows(&self, agent_id: Option<&str>) -> Vec<WorkflowSummary> {
        let workflows: Vec<Workflow> = self
            .workflows
            .read()
            .await
            .values()
            .filter(|w| agent_id.map_or(true, |a| w.agent_id() == a))
            .cloned()
            .collect();

        let mut summaries = Vec::with_capacity(workflows.len());
        for workflow in workflows {
            summaries.push(workflow.summary().await);
        }
        summaries.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        summaries
    }

    pub async fn remove_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.write().await.remove(workflow_id)
    }
}

// ============================================================================
// Tests
// ============================================================================
