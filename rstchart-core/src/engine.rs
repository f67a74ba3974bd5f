//! Statechart engine - registry of charts and running sessions.

use crate::child::StatechartInvoker;
use crate::definition::Chart;
use crate::error::{CoreError, DispatchError};
use crate::evaluator::EvaluatorFactory;
use crate::event::Event;
use crate::expr::JsonEvaluator;
use crate::invoke::STATECHART_INVOKE_TYPE;
use crate::scheduler::{DelayedSendScheduler, ExternalTransport, ScheduledSend};
use crate::session::{Session, SessionConfig, SessionSnapshot};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Rounds of cross-session hand-off `run_pending` performs before giving up.
const MAX_HANDOFF_ROUNDS: usize = 1_000;

type Inbox = Arc<Mutex<VecDeque<Event>>>;

/// Routes `#_scxml_<id>` sends to sessions owned by the engine.
struct EngineTransport {
    inboxes: Arc<DashMap<String, Inbox>>,
    fallback: Option<Arc<dyn ExternalTransport>>,
}

impl ExternalTransport for EngineTransport {
    fn send(&self, target: &str, send_type: &str, event: &Event) -> Result<(), DispatchError> {
        if let Some(session_id) = target.strip_prefix("#_scxml_") {
            if let Some(inbox) = self.inboxes.get(session_id) {
                inbox.lock().push_back(event.clone());
                return Ok(());
            }
        }
        match &self.fallback {
            Some(transport) => transport.send(target, send_type, event),
            None => Err(DispatchError::Unreachable {
                target: target.to_string(),
            }),
        }
    }
}

/// The statechart engine.
pub struct StatechartEngine {
    /// Chart definitions indexed by name.
    charts: Arc<DashMap<String, Arc<Chart>>>,

    /// Sessions indexed by ID.
    sessions: DashMap<String, Arc<Mutex<Session>>>,

    /// Events waiting to be handed to each session.
    inboxes: Arc<DashMap<String, Inbox>>,

    evaluator_factory: EvaluatorFactory,
    scheduler: Option<Arc<dyn DelayedSendScheduler>>,
    transport: Option<Arc<dyn ExternalTransport>>,
    config: SessionConfig,
}

impl Default for StatechartEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatechartEngine {
    pub fn new() -> Self {
        Self {
            charts: Arc::new(DashMap::new()),
            sessions: DashMap::new(),
            inboxes: Arc::new(DashMap::new()),
            evaluator_factory: JsonEvaluator::factory(),
            scheduler: None,
            transport: None,
            config: SessionConfig::default(),
        }
    }

    pub fn with_evaluator_factory(mut self, factory: EvaluatorFactory) -> Self {
        self.evaluator_factory = factory;
        self
    }

    /// Scheduler handed to every session for delayed sends.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn DelayedSendScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Transport for targets that are not sessions of this engine.
    pub fn with_transport(mut self, transport: Arc<dyn ExternalTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    // =========================================================================
    // Chart Management
    // =========================================================================

    /// Registers a chart from its JSON description.
    ///
    /// Returns the checksum and whether the chart was newly created.
    /// Registering identical content again is a no-op.
    pub fn put_chart(&self, definition_json: &Value) -> Result<(String, bool), CoreError> {
        let chart = Chart::from_json(definition_json)?;
        self.register_chart(chart)
    }

    /// Registers an already compiled chart under its name.
    pub fn register_chart(&self, chart: Chart) -> Result<(String, bool), CoreError> {
        let name = chart.name().to_string();

        if let Some(existing) = self.charts.get(&name) {
            if existing.checksum() == chart.checksum() {
                return Ok((existing.checksum().to_string(), false));
            }
            return Err(CoreError::ChartExists { chart: name });
        }

        let checksum = chart.checksum().to_string();
        tracing::info!(chart = %name, checksum = %checksum, "chart registered");
        self.charts.insert(name, Arc::new(chart));
        Ok((checksum, true))
    }

    pub fn get_chart(&self, name: &str) -> Result<Arc<Chart>, CoreError> {
        self.charts
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| CoreError::ChartNotFound {
                chart: name.to_string(),
            })
    }

    /// Names of all registered charts, sorted.
    pub fn list_charts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.charts.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // =========================================================================
    // Session Management
    // =========================================================================

    /// Creates and starts a session of a registered chart.
    ///
    /// `initial_values` replace the initial values of same-named top-level
    /// data. Returns the session id.
    pub fn create_session(
        &self,
        chart: &str,
        session_id: Option<&str>,
        initial_values: Map<String, Value>,
    ) -> Result<String, CoreError> {
        let chart = self.get_chart(chart)?;
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if self.sessions.contains_key(&session_id) {
            return Err(CoreError::SessionExists { session_id });
        }

        let transport: Arc<dyn ExternalTransport> = Arc::new(EngineTransport {
            inboxes: Arc::clone(&self.inboxes),
            fallback: self.transport.clone(),
        });
        let invoker = StatechartInvoker::new(Arc::clone(&self.charts))
            .with_evaluator_factory(Arc::clone(&self.evaluator_factory))
            .with_scheduler(self.scheduler.clone())
            .with_transport(Some(Arc::clone(&transport)))
            .with_config(self.config.clone());

        let mut builder = Session::builder(chart)
            .session_id(session_id.clone())
            .config(self.config.clone())
            .evaluator((self.evaluator_factory)())
            .transport(transport)
            .invoker(STATECHART_INVOKE_TYPE, Arc::new(invoker))
            .initial_values(initial_values);
        if let Some(scheduler) = &self.scheduler {
            builder = builder.scheduler(Arc::clone(scheduler));
        }

        let mut session = builder.build();
        self.inboxes
            .insert(session_id.clone(), Arc::new(Mutex::new(VecDeque::new())));
        if let Err(err) = session.start() {
            self.inboxes.remove(&session_id);
            return Err(err);
        }

        self.sessions
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));
        Ok(session_id)
    }

    fn session(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, CoreError> {
        self.sessions
            .get(session_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Queues an external event for a session. It is processed by the next
    /// [`run`](Self::run).
    pub fn raise_external(&self, session_id: &str, event: Event) -> Result<(), CoreError> {
        let inbox = self
            .inboxes
            .get(session_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        inbox.lock().push_back(event);
        Ok(())
    }

    /// Hands queued events to a session and runs it to quiescence.
    pub fn run(&self, session_id: &str) -> Result<SessionSnapshot, CoreError> {
        let session = self.session(session_id)?;
        let mut session = session.lock();
        loop {
            let drained: Vec<Event> = match self.inboxes.get(session_id) {
                Some(inbox) => inbox.lock().drain(..).collect(),
                None => Vec::new(),
            };
            if drained.is_empty() {
                session.run_to_quiescence()?;
                break;
            }
            for event in drained {
                if session.raise_external(event).is_err() {
                    tracing::warn!(session_id = %session_id, "discarding event for stopped session");
                }
            }
            session.run_to_quiescence()?;
        }
        Ok(session.snapshot())
    }

    /// Runs every session with queued events until no inbox has work left.
    /// Returns the ids of the sessions that ran.
    pub fn run_pending(&self) -> Result<Vec<String>, CoreError> {
        let mut ran = Vec::new();
        for _ in 0..MAX_HANDOFF_ROUNDS {
            let ready: Vec<String> = self
                .inboxes
                .iter()
                .filter(|e| !e.value().lock().is_empty())
                .map(|e| e.key().clone())
                .collect();
            if ready.is_empty() {
                return Ok(ran);
            }
            for session_id in ready {
                self.run(&session_id)?;
                if !ran.contains(&session_id) {
                    ran.push(session_id);
                }
            }
        }
        tracing::warn!(rounds = MAX_HANDOFF_ROUNDS, "cross-session hand-off did not settle");
        Ok(ran)
    }

    /// Delivers a fired delayed send to the session tree it came from and
    /// runs that tree. Returns false if the session is gone.
    pub fn deliver_scheduled(&self, send: ScheduledSend) -> Result<bool, CoreError> {
        let Some(root) = send.session_path.first().cloned() else {
            return Ok(false);
        };
        let Ok(session) = self.session(&root) else {
            tracing::debug!(session_id = %root, send_id = %send.send_id, "dropping send for removed session");
            return Ok(false);
        };
        let delivered = session.lock().deliver_scheduled(send);
        if delivered {
            self.run(&root)?;
        }
        Ok(delivered)
    }

    /// Active state ids of a session, in document order.
    pub fn configuration(&self, session_id: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.session(session_id)?.lock().active_state_ids())
    }

    pub fn is_finished(&self, session_id: &str) -> Result<bool, CoreError> {
        Ok(self.session(session_id)?.lock().is_in_final_state())
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, CoreError> {
        Ok(self.session(session_id)?.lock().snapshot())
    }

    /// Runs `f` with exclusive access to a session.
    pub fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Result<R, CoreError> {
        let session = self.session(session_id)?;
        let mut guard = session.lock();
        Ok(f(&mut guard))
    }

    /// Cancels and forgets a session.
    pub fn remove_session(&self, session_id: &str) -> Result<(), CoreError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        self.inboxes.remove(session_id);
        session.lock().cancel();
        tracing::info!(session_id = %session_id, "session removed");
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
