//! Invocation lifecycle.
//!
//! Entering a state defers its invokes. They start once the macrostep has
//! settled, in the order their states were entered. Leaving the state
//! before that drops them without ever starting a child.

use crate::content::Block;
use crate::definition::{ChartDocument, StateId};
use crate::error::InvokeError;
use crate::event::{Event, SCXML_PROCESSOR};
use crate::scheduler::ScheduledSend;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;

/// Terminal statuses kept for lookups after an invocation is gone.
const RETIRED_CAPACITY: usize = 64;

/// Type name the built-in statechart invoker is registered under.
pub const STATECHART_INVOKE_TYPE: &str = "scxml";

/// Maps the accepted spellings of the statechart type onto
/// [`STATECHART_INVOKE_TYPE`].
pub fn normalize_invoke_type(invoke_type: Option<&str>) -> String {
    match invoke_type.map(str::trim) {
        None | Some("") | Some("scxml") | Some("http://www.w3.org/TR/scxml/") => {
            STATECHART_INVOKE_TYPE.to_string()
        }
        Some(t) if t == SCXML_PROCESSOR => STATECHART_INVOKE_TYPE.to_string(),
        Some(t) => t.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Active,
    Cancelled,
    Done,
}

/// Everything an invoker needs to start a child.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub invoke_id: String,
    pub invoke_type: String,
    pub src: Option<String>,
    pub content: Option<ChartDocument>,
    /// Evaluated params and namelist values.
    pub params: Map<String, Value>,
    pub parent_session_id: String,
    /// Session path of the parent, root first.
    pub parent_path: Vec<String>,
    pub autoforward: bool,
}

/// What a child produced since the last poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildOutput {
    /// Events addressed to the parent.
    pub events: Vec<Event>,
    /// The child reached a top-level final state.
    pub finished: bool,
    pub done_data: Option<Value>,
}

/// A running child session.
pub trait ChildSession: Send {
    /// Queues an event on the child's external queue.
    fn deliver(&mut self, event: Event);

    /// Runs the child until it is quiescent and collects its output.
    fn poll(&mut self) -> ChildOutput;

    /// Asks the child to stop.
    fn cancel(&mut self);

    /// Offers a fired delayed send to the child (or its descendants).
    /// Returns true if it was addressed to them.
    fn deliver_scheduled(&mut self, _send: &ScheduledSend) -> bool {
        false
    }
}

/// Starts children of one invoke type.
pub trait Invoker: Send + Sync {
    fn start(&self, request: InvokeRequest) -> Result<Box<dyn ChildSession>, InvokeError>;
}

/// A deferred invoke ready to be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvoke {
    pub invoke_id: String,
    pub state: StateId,
    /// Index into the state's invoke list.
    pub index: usize,
}

struct InvocationRecord {
    invoke_id: String,
    state: StateId,
    index: usize,
    status: InvocationStatus,
    autoforward: bool,
    finalize: Block,
    child: Option<Box<dyn ChildSession>>,
}

/// Pending and active invocations of one session.
#[derive(Default)]
pub struct InvocationManager {
    records: Vec<InvocationRecord>,
    retired: VecDeque<(String, InvocationStatus)>,
    started: usize,
}

impl InvocationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an invoke to start at the end of the macrostep.
    pub fn defer(&mut self, state: StateId, index: usize, invoke_id: String, autoforward: bool, finalize: Block) {
        tracing::debug!(invoke_id = %invoke_id, "invocation deferred");
        self.records.push(InvocationRecord {
            invoke_id,
            state,
            index,
            status: InvocationStatus::Pending,
            autoforward,
            finalize,
            child: None,
        });
    }

    /// Invokes that still wait to start, in deferral order.
    pub fn pending(&self) -> Vec<PendingInvoke> {
        self.records
            .iter()
            .filter(|r| r.status == InvocationStatus::Pending)
            .map(|r| PendingInvoke {
                invoke_id: r.invoke_id.clone(),
                state: r.state,
                index: r.index,
            })
            .collect()
    }

    /// Marks a pending invoke as started.
    pub fn activate(&mut self, invoke_id: &str, child: Box<dyn ChildSession>) {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.invoke_id == invoke_id && r.status == InvocationStatus::Pending)
        {
            record.status = InvocationStatus::Active;
            record.child = Some(child);
            self.started += 1;
            tracing::info!(invoke_id = %invoke_id, "invocation started");
        }
    }

    /// Drops a pending invoke that could not be started.
    pub fn fail(&mut self, invoke_id: &str) {
        if let Some(pos) = self
            .records
            .iter()
            .position(|r| r.invoke_id == invoke_id && r.status == InvocationStatus::Pending)
        {
            let record = self.records.remove(pos);
            self.retire(record.invoke_id, InvocationStatus::Cancelled);
        }
    }

    /// Cancels every invocation owned by `state`. Pending ones are dropped
    /// without starting. Returns the cancelled ids.
    pub fn cancel_state(&mut self, state: StateId) -> Vec<String> {
        let mut cancelled = Vec::new();
        let mut i = 0;
        while i < self.records.len() {
            if self.records[i].state != state {
                i += 1;
                continue;
            }
            let mut record = self.records.remove(i);
            if let Some(child) = record.child.as_mut() {
                child.cancel();
            }
            if record.status == InvocationStatus::Done {
                self.retire(record.invoke_id, InvocationStatus::Done);
                continue;
            }
            tracing::debug!(invoke_id = %record.invoke_id, "invocation cancelled");
            cancelled.push(record.invoke_id.clone());
            self.retire(record.invoke_id, InvocationStatus::Cancelled);
        }
        cancelled
    }

    /// Cancels everything.
    pub fn cancel_all(&mut self) {
        for mut record in std::mem::take(&mut self.records) {
            if let Some(child) = record.child.as_mut() {
                child.cancel();
            }
            let status = match record.status {
                InvocationStatus::Done => InvocationStatus::Done,
                _ => InvocationStatus::Cancelled,
            };
            self.retire(record.invoke_id, status);
        }
    }

    /// Delivers an event to an active child. Returns false, and drops the
    /// event, if the invocation is not active.
    pub fn route(&mut self, invoke_id: &str, event: Event) -> bool {
        match self.active_mut(invoke_id) {
            Some(child) => {
                child.deliver(event);
                true
            }
            None => false,
        }
    }

    /// Relays an external event to every active child with autoforward set.
    pub fn autoforward(&mut self, event: &Event) {
        for record in &mut self.records {
            if record.status != InvocationStatus::Active || !record.autoforward {
                continue;
            }
            if let Some(child) = record.child.as_mut() {
                child.deliver(event.clone());
            }
        }
    }

    /// The finalize content of a running or just finished invocation.
    pub fn finalize_block(&self, invoke_id: &str) -> Option<Block> {
        self.records
            .iter()
            .find(|r| {
                r.invoke_id == invoke_id
                    && matches!(r.status, InvocationStatus::Active | InvocationStatus::Done)
            })
            .map(|r| r.finalize.clone())
            .filter(|b| !b.is_empty())
    }

    /// Polls every active child. A finished child stays on record as done
    /// until its state exits, so finalize still applies to its last events.
    pub fn poll_children(&mut self) -> Vec<(String, ChildOutput)> {
        let mut outputs = Vec::new();
        for record in &mut self.records {
            if record.status != InvocationStatus::Active {
                continue;
            }
            let Some(child) = record.child.as_mut() else {
                continue;
            };
            let output = child.poll();
            if output.finished {
                tracing::info!(invoke_id = %record.invoke_id, "invocation done");
                record.status = InvocationStatus::Done;
                record.child = None;
            }
            if !output.events.is_empty() || output.finished {
                outputs.push((record.invoke_id.clone(), output));
            }
        }
        outputs
    }

    /// Offers a fired delayed send to the active children.
    pub fn deliver_scheduled(&mut self, send: &ScheduledSend) -> bool {
        self.records
            .iter_mut()
            .filter(|r| r.status == InvocationStatus::Active)
            .filter_map(|r| r.child.as_mut())
            .any(|child| child.deliver_scheduled(send))
    }

    /// True if events from `invoke_id` may still reach the parent: the
    /// child is running or has just finished.
    pub fn accepts_from(&self, invoke_id: &str) -> bool {
        matches!(
            self.status(invoke_id),
            Some(InvocationStatus::Active | InvocationStatus::Done)
        )
    }

    /// True if `invoke_id` was cancelled or never started. Events tagged
    /// with it are dropped.
    pub fn discards_from(&self, invoke_id: &str) -> bool {
        matches!(
            self.status(invoke_id),
            Some(InvocationStatus::Pending | InvocationStatus::Cancelled)
        )
    }

    pub fn status(&self, invoke_id: &str) -> Option<InvocationStatus> {
        if let Some(record) = self.records.iter().find(|r| r.invoke_id == invoke_id) {
            return Some(record.status);
        }
        self.retired
            .iter()
            .rev()
            .find(|(id, _)| id == invoke_id)
            .map(|(_, status)| *status)
    }

    /// Number of children ever started.
    pub fn started(&self) -> usize {
        self.started
    }

    /// Ids of the active invocations.
    pub fn active_ids(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.status == InvocationStatus::Active)
            .map(|r| r.invoke_id.clone())
            .collect()
    }

    fn active_mut(&mut self, invoke_id: &str) -> Option<&mut Box<dyn ChildSession>> {
        self.records
            .iter_mut()
            .find(|r| r.invoke_id == invoke_id && r.status == InvocationStatus::Active)
            .and_then(|r| r.child.as_mut())
    }

    fn retire(&mut self, invoke_id: String, status: InvocationStatus) {
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back((invoke_id, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct ChildState {
        delivered: Vec<String>,
        cancelled: bool,
        finish_on_poll: bool,
    }

    struct FakeChild(Arc<Mutex<ChildState>>);

    impl ChildSession for FakeChild {
        fn deliver(&mut self, event: Event) {
            self.0.lock().delivered.push(event.name);
        }

        fn poll(&mut self) -> ChildOutput {
            let child = self.0.lock();
            ChildOutput {
                events: vec![],
                finished: child.finish_on_poll,
                done_data: None,
            }
        }

        fn cancel(&mut self) {
            self.0.lock().cancelled = true;
        }
    }

    fn state(n: u32) -> StateId {
        let chart = crate::definition::Chart::from_json(&serde_json::json!({
            "states": [{"id": "a"}, {"id": "b"}, {"id": "c"}]
        }))
        .unwrap();
        let id = chart.state_ids().nth(n as usize).unwrap();
        id
    }

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_invoke_type(None), "scxml");
        assert_eq!(normalize_invoke_type(Some(SCXML_PROCESSOR)), "scxml");
        assert_eq!(normalize_invoke_type(Some("http://www.w3.org/TR/scxml/")), "scxml");
        assert_eq!(normalize_invoke_type(Some("custom")), "custom");
    }

    #[test]
    fn test_cancel_before_start_never_starts() {
        let mut mgr = InvocationManager::new();
        mgr.defer(state(1), 0, "i1".into(), false, vec![]);
        assert_eq!(mgr.status("i1"), Some(InvocationStatus::Pending));

        assert_eq!(mgr.cancel_state(state(1)), vec!["i1".to_string()]);
        assert!(mgr.pending().is_empty());
        assert_eq!(mgr.status("i1"), Some(InvocationStatus::Cancelled));
        assert_eq!(mgr.started(), 0);
    }

    #[test]
    fn test_route_only_to_active() {
        let child = Arc::new(Mutex::new(ChildState::default()));
        let mut mgr = InvocationManager::new();
        mgr.defer(state(1), 0, "i1".into(), true, vec![]);
        assert!(!mgr.route("i1", Event::external("early")));

        mgr.activate("i1", Box::new(FakeChild(Arc::clone(&child))));
        assert_eq!(mgr.started(), 1);
        assert!(mgr.route("i1", Event::external("hello")));
        mgr.autoforward(&Event::external("fwd"));
        assert_eq!(child.lock().delivered, vec!["hello", "fwd"]);

        mgr.cancel_state(state(1));
        assert!(child.lock().cancelled);
        assert!(!mgr.route("i1", Event::external("late")));
        assert!(!mgr.route("unknown", Event::external("late")));
        assert_eq!(child.lock().delivered.len(), 2);
    }

    #[test]
    fn test_finished_children_retire_as_done() {
        let child = Arc::new(Mutex::new(ChildState {
            finish_on_poll: true,
            ..Default::default()
        }));
        let mut mgr = InvocationManager::new();
        mgr.defer(state(2), 0, "i2".into(), false, vec![]);
        mgr.activate("i2", Box::new(FakeChild(child)));

        let outputs = mgr.poll_children();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].1.finished);
        assert_eq!(mgr.status("i2"), Some(InvocationStatus::Done));
        assert!(mgr.active_ids().is_empty());
        assert!(mgr.poll_children().is_empty());
        assert!(!mgr.route("i2", Event::external("late")));

        assert!(mgr.cancel_state(state(2)).is_empty());
        assert_eq!(mgr.status("i2"), Some(InvocationStatus::Done));
        assert!(mgr.accepts_from("i2"));
    }

    #[test]
    fn test_events_from_children_by_status() {
        let mut mgr = InvocationManager::new();
        mgr.defer(state(1), 0, "i1".into(), false, vec![]);
        assert!(!mgr.accepts_from("i1"));
        assert!(mgr.discards_from("i1"));

        mgr.activate("i1", Box::new(FakeChild(Arc::default())));
        assert!(mgr.accepts_from("i1"));
        assert!(!mgr.discards_from("i1"));

        mgr.cancel_state(state(1));
        assert!(!mgr.accepts_from("i1"));
        assert!(mgr.discards_from("i1"));

        assert!(!mgr.accepts_from("unknown"));
        assert!(!mgr.discards_from("unknown"));
    }

    #[test]
    fn test_failed_start_is_retired() {
        let mut mgr = InvocationManager::new();
        mgr.defer(state(1), 0, "i1".into(), false, vec![]);
        mgr.fail("i1");
        assert!(mgr.pending().is_empty());
        assert_eq!(mgr.status("i1"), Some(InvocationStatus::Cancelled));
    }
}
