//! Session runtime.
//!
//! A [`Session`] owns everything one running statechart needs: its active
//! configuration, both event queues, recorded history, invocations and the
//! evaluator. It is single-threaded; callers that share sessions wrap them
//! in a lock (see [`crate::engine::StatechartEngine`]).

use crate::configuration::ActiveConfiguration;
use crate::definition::{Chart, StateId};
use crate::error::{CoreError, EvalError};
use crate::evaluator::{EvalContext, Evaluator, SystemVariables};
use crate::event::{Event, EventKind, SCXML_PROCESSOR};
use crate::expr::JsonEvaluator;
use crate::history::HistoryTable;
use crate::invoke::{InvocationManager, InvocationStatus, Invoker, STATECHART_INVOKE_TYPE};
use crate::queue::EventQueues;
use crate::scheduler::{DelayedSendScheduler, ExternalTransport, ScheduledSend};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Default bound on microsteps per run.
pub const DEFAULT_MAX_MICROSTEPS: usize = 100_000;

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Overrides the chart name exposed as `_name`.
    pub name: Option<String>,
    /// Upper bound on microsteps in a single `start`, `step` or
    /// `run_to_quiescence` call.
    pub max_microsteps_per_run: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_microsteps_per_run: DEFAULT_MAX_MICROSTEPS,
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Built but not started.
    Created,
    Running,
    /// A top-level final state was reached.
    Finished,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Finished => "finished",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// Builds a [`Session`].
pub struct SessionBuilder {
    chart: Arc<Chart>,
    session_id: Option<String>,
    config: SessionConfig,
    evaluator: Option<Box<dyn Evaluator>>,
    scheduler: Option<Arc<dyn DelayedSendScheduler>>,
    transport: Option<Arc<dyn ExternalTransport>>,
    invokers: HashMap<String, Arc<dyn Invoker>>,
    parent: Option<String>,
    parent_path: Vec<String>,
    initial_values: Map<String, Value>,
}

impl SessionBuilder {
    pub fn new(chart: Arc<Chart>) -> Self {
        Self {
            chart,
            session_id: None,
            config: SessionConfig::default(),
            evaluator: None,
            scheduler: None,
            transport: None,
            invokers: HashMap::new(),
            parent: None,
            parent_path: Vec::new(),
            initial_values: Map::new(),
        }
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `evaluator` instead of a fresh [`JsonEvaluator`].
    pub fn evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn DelayedSendScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ExternalTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers an invoker for an invoke type.
    pub fn invoker(mut self, invoke_type: impl Into<String>, invoker: Arc<dyn Invoker>) -> Self {
        self.invokers.insert(invoke_type.into(), invoker);
        self
    }

    /// Marks the session as invoked by `parent`, whose own path is
    /// `parent_path`.
    pub fn parent(mut self, parent: impl Into<String>, parent_path: Vec<String>) -> Self {
        self.parent = Some(parent.into());
        self.parent_path = parent_path;
        self
    }

    /// Values that replace the initial value of same-named top-level data.
    pub fn initial_values(mut self, values: Map<String, Value>) -> Self {
        self.initial_values = values;
        self
    }

    pub fn build(self) -> Session {
        let session_id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = self
            .config
            .name
            .clone()
            .unwrap_or_else(|| self.chart.name().to_string());

        let mut ioprocessors = std::collections::BTreeMap::new();
        let location = json!({ "location": format!("#_scxml_{}", session_id) });
        ioprocessors.insert(STATECHART_INVOKE_TYPE.to_string(), location.clone());
        ioprocessors.insert(SCXML_PROCESSOR.to_string(), location);

        let mut session_path = self.parent_path;
        session_path.push(session_id.clone());

        Session {
            system: SystemVariables {
                session_id: session_id.clone(),
                name,
                parent: self.parent,
                ioprocessors,
                event: None,
            },
            id: session_id,
            chart: self.chart,
            config: self.config,
            status: SessionStatus::Created,
            configuration: ActiveConfiguration::new(),
            history: HistoryTable::new(),
            queues: EventQueues::new(),
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Box::new(JsonEvaluator::new())),
            invocations: InvocationManager::new(),
            invokers: self.invokers,
            scheduler: self.scheduler,
            transport: self.transport,
            session_path,
            initial_values: self.initial_values,
            outbox: Vec::new(),
            pending_sends: HashSet::new(),
            done_raised: HashSet::new(),
            initialized: HashSet::new(),
            final_reached: false,
            done_data: None,
            microsteps: 0,
        }
    }
}

/// One running statechart instance.
pub struct Session {
    pub(crate) id: String,
    pub(crate) chart: Arc<Chart>,
    pub(crate) config: SessionConfig,
    pub(crate) status: SessionStatus,
    pub(crate) configuration: ActiveConfiguration,
    pub(crate) history: HistoryTable,
    pub(crate) queues: EventQueues,
    pub(crate) evaluator: Box<dyn Evaluator>,
    pub(crate) system: SystemVariables,
    pub(crate) invocations: InvocationManager,
    pub(crate) invokers: HashMap<String, Arc<dyn Invoker>>,
    pub(crate) scheduler: Option<Arc<dyn DelayedSendScheduler>>,
    pub(crate) transport: Option<Arc<dyn ExternalTransport>>,
    /// Session ids from the root session down to this one.
    pub(crate) session_path: Vec<String>,
    pub(crate) initial_values: Map<String, Value>,
    /// Events sent to `#_parent`.
    pub(crate) outbox: Vec<Event>,
    /// Delayed sends scheduled and not yet fired or cancelled.
    pub(crate) pending_sends: HashSet<String>,
    /// Parallel states whose done event was raised in their current
    /// activation.
    pub(crate) done_raised: HashSet<StateId>,
    /// States whose late-bound data has been initialised.
    pub(crate) initialized: HashSet<StateId>,
    pub(crate) final_reached: bool,
    pub(crate) done_data: Option<Value>,
    pub(crate) microsteps: usize,
}

/// Serializable view of a session, for callers and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub chart: String,
    pub status: SessionStatus,
    pub configuration: Vec<String>,
    pub variables: Value,
    pub invocations: Vec<String>,
    pub done_data: Option<Value>,
}

impl Session {
    pub fn builder(chart: Arc<Chart>) -> SessionBuilder {
        SessionBuilder::new(chart)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chart(&self) -> &Arc<Chart> {
        &self.chart
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn session_path(&self) -> &[String] {
        &self.session_path
    }

    /// Queues an external event. Events for a finished or cancelled
    /// session are rejected.
    pub fn raise_external(&mut self, event: Event) -> Result<(), CoreError> {
        match self.status {
            SessionStatus::Created | SessionStatus::Running => {
                self.queues.external.push(event);
                Ok(())
            }
            _ => Err(CoreError::SessionNotRunning {
                session_id: self.id.clone(),
            }),
        }
    }

    pub fn active_configuration(&self) -> &ActiveConfiguration {
        &self.configuration
    }

    /// Ids of the active states in document order.
    pub fn active_state_ids(&self) -> Vec<String> {
        self.configuration.ids(&self.chart)
    }

    /// True once a top-level final state has been reached.
    pub fn is_in_final_state(&self) -> bool {
        self.status == SessionStatus::Finished
    }

    pub fn is_state_active(&self, id: &str) -> bool {
        self.chart
            .lookup(id)
            .map(|s| self.configuration.contains(s))
            .unwrap_or(false)
    }

    /// Evaluates an expression against the session's variables.
    pub fn evaluate(&mut self, expr: &str) -> Result<Value, EvalError> {
        self.eval_value(expr)
    }

    /// Delivers an event to an invoked child. Events for invocations that
    /// are not active are discarded; returns whether it was delivered.
    pub fn send_to_child(&mut self, invoke_id: &str, event: Event) -> bool {
        let delivered = self.invocations.route(invoke_id, event);
        if !delivered {
            tracing::warn!(
                session_id = %self.id,
                invoke_id = %invoke_id,
                "discarding event for inactive invocation"
            );
        }
        delivered
    }

    /// Queues an event sent by the invoked child `invoke_id` on the external
    /// queue, tagged with its invoke id. Events from invocations that were
    /// cancelled, never started or are unknown never reach the queue;
    /// returns whether it was queued.
    pub fn route_child_event(&mut self, invoke_id: &str, mut event: Event) -> bool {
        if !self.invocations.accepts_from(invoke_id) {
            tracing::debug!(
                session_id = %self.id,
                invoke_id = %invoke_id,
                event = %event.name,
                "discarding event from inactive invocation"
            );
            return false;
        }
        event.kind = EventKind::External;
        event.invoke_id = Some(invoke_id.to_string());
        event.origin = Some(format!("#_{}", invoke_id));
        event.origin_type = Some(SCXML_PROCESSOR.to_string());
        self.queues.external.push(event);
        true
    }

    pub fn invocation_status(&self, invoke_id: &str) -> Option<InvocationStatus> {
        self.invocations.status(invoke_id)
    }

    /// Number of children this session has started.
    pub fn invocations_started(&self) -> usize {
        self.invocations.started()
    }

    /// Events sent to `#_parent` since the last call.
    pub fn take_outbox(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.outbox)
    }

    /// Done data of the top-level final state, once finished.
    pub fn done_data(&self) -> Option<&Value> {
        self.done_data.as_ref()
    }

    /// Number of events waiting on the (internal, external) queues.
    pub fn queued(&self) -> (usize, usize) {
        (self.queues.internal.len(), self.queues.external.len())
    }

    /// Stops the session without running exit handlers. Active children are
    /// cancelled and pending delayed sends dropped.
    pub fn cancel(&mut self) {
        if matches!(self.status, SessionStatus::Finished | SessionStatus::Cancelled) {
            return;
        }
        self.invocations.cancel_all();
        self.cancel_pending_sends();
        self.queues.internal.clear();
        self.queues.external.clear();
        self.status = SessionStatus::Cancelled;
        tracing::info!(session_id = %self.id, "session cancelled");
    }

    /// Handles a fired delayed send addressed to this session or one of its
    /// descendants. Returns true if it was addressed to this subtree.
    pub fn deliver_scheduled(&mut self, send: ScheduledSend) -> bool {
        if send.session_path == self.session_path {
            if !self.pending_sends.remove(&send.send_id) {
                tracing::debug!(session_id = %self.id, send_id = %send.send_id, "ignoring cancelled send");
                return true;
            }
            if matches!(self.status, SessionStatus::Running) {
                if let Err(err) = self.dispatch(send.target, send.event) {
                    self.queues.internal.push(err.into_event());
                }
            }
            return true;
        }
        if send.session_path.starts_with(&self.session_path) {
            return self.invocations.deliver_scheduled(&send);
        }
        false
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            chart: self.chart.name().to_string(),
            status: self.status,
            configuration: self.active_state_ids(),
            variables: self.evaluator.variables(),
            invocations: self.invocations.active_ids(),
            done_data: self.done_data.clone(),
        }
    }

    pub(crate) fn cancel_pending_sends(&mut self) {
        if let Some(scheduler) = &self.scheduler {
            for send_id in &self.pending_sends {
                scheduler.cancel(&self.id, send_id);
            }
        }
        self.pending_sends.clear();
    }

    // =====================================================================
    // Evaluator access
    // =====================================================================

    pub(crate) fn eval_value(&mut self, expr: &str) -> Result<Value, EvalError> {
        let ctx = EvalContext {
            system: &self.system,
            chart: &self.chart,
            configuration: &self.configuration,
        };
        self.evaluator.evaluate_expr(expr, &ctx)
    }

    pub(crate) fn eval_guard(&mut self, expr: &str) -> Result<bool, EvalError> {
        let ctx = EvalContext {
            system: &self.system,
            chart: &self.chart,
            configuration: &self.configuration,
        };
        self.evaluator.evaluate_guard(expr, &ctx)
    }

    pub(crate) fn assign_value(&mut self, location: &str, value: Value) -> Result<(), EvalError> {
        let ctx = EvalContext {
            system: &self.system,
            chart: &self.chart,
            configuration: &self.configuration,
        };
        self.evaluator.assign(location, value, &ctx)
    }

    pub(crate) fn run_script(&mut self, source: &str) -> Result<(), EvalError> {
        let ctx = EvalContext {
            system: &self.system,
            chart: &self.chart,
            configuration: &self.configuration,
        };
        self.evaluator.execute_script(source, &ctx)
    }
}
