//! Microsteps and macrosteps.

use crate::content::{DataDecl, DoneData};
use crate::definition::{Binding, StateId, StateKind, TransitionId};
use crate::error::CoreError;
use crate::event::Event;
use crate::exec::ActionError;
use crate::invoke::{normalize_invoke_type, InvokeRequest, PendingInvoke};
use crate::planner::{self, EntryPlan};
use crate::selector;
use crate::session::{Session, SessionStatus};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Session {
    /// Enters the initial configuration and runs the first macrostep.
    /// Calling it again is a no-op.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != SessionStatus::Created {
            return Ok(());
        }
        self.status = SessionStatus::Running;
        self.microsteps = 0;
        info!(session_id = %self.id, chart = %self.chart.name(), "session started");

        self.init_datamodel();
        if let Some(script) = self.chart.script().map(str::to_string) {
            if let Err(err) = self.run_script(&script) {
                self.queues.internal.push(ActionError::from(err).into_event());
            }
        }

        let chart = Arc::clone(&self.chart);
        let StateKind::Compound { initial } = chart.state(chart.root()).kind else {
            return Err(CoreError::InvalidDefinition {
                reason: "chart root has no initial transition".to_string(),
            });
        };
        self.microstep(&[initial])?;
        self.settle()
    }

    /// Runs one macrostep: settles, collects child output, then processes
    /// at most one external event. Returns false when there was nothing to
    /// process.
    pub fn step(&mut self) -> Result<bool, CoreError> {
        self.microsteps = 0;
        self.step_once()
    }

    /// Processes external events until the queue is empty or the session
    /// stops.
    pub fn run_to_quiescence(&mut self) -> Result<(), CoreError> {
        self.microsteps = 0;
        while self.step_once()? {}
        Ok(())
    }

    fn step_once(&mut self) -> Result<bool, CoreError> {
        match self.status {
            SessionStatus::Created => {
                self.start()?;
                return Ok(true);
            }
            SessionStatus::Running => {}
            _ => return Ok(false),
        }

        self.settle()?;
        if self.status != SessionStatus::Running {
            return Ok(false);
        }
        self.pump_children();

        let Some(event) = self.queues.external.pop() else {
            return Ok(false);
        };
        self.process_external(event)?;
        Ok(true)
    }

    fn process_external(&mut self, event: Event) -> Result<(), CoreError> {
        if let Some(invoke_id) = event.invoke_id.as_deref() {
            if self.invocations.discards_from(invoke_id) {
                debug!(
                    session_id = %self.id,
                    invoke_id = %invoke_id,
                    event = %event.name,
                    "discarding event from cancelled invocation"
                );
                return Ok(());
            }
        }
        debug!(session_id = %self.id, event = %event.name, "processing external event");
        self.system.event = Some(event.clone());

        if let Some(invoke_id) = event.invoke_id.as_deref() {
            if let Some(block) = self.invocations.finalize_block(invoke_id) {
                self.execute_block(&block);
            }
        }
        self.invocations.autoforward(&event);

        let enabled = self.select(Some(&event));
        if !enabled.is_empty() {
            self.microstep(&enabled)?;
        }
        self.settle()
    }

    /// Runs eventless transitions and internal events until both are
    /// exhausted, then starts deferred invokes. Repeats while starting
    /// invokes produced internal events.
    pub(crate) fn settle(&mut self) -> Result<(), CoreError> {
        loop {
            loop {
                if self.final_reached {
                    self.halt();
                    return Ok(());
                }
                if self.status != SessionStatus::Running {
                    return Ok(());
                }
                let enabled = self.select(None);
                if !enabled.is_empty() {
                    self.microstep(&enabled)?;
                    continue;
                }
                let Some(event) = self.queues.internal.pop() else {
                    break;
                };
                debug!(session_id = %self.id, event = %event.name, "processing internal event");
                self.system.event = Some(event.clone());
                let enabled = self.select(Some(&event));
                if !enabled.is_empty() {
                    self.microstep(&enabled)?;
                }
            }

            self.start_pending_invokes();
            if self.queues.internal.is_empty() {
                return Ok(());
            }
        }
    }

    fn select(&mut self, event: Option<&Event>) -> Vec<TransitionId> {
        let chart = Arc::clone(&self.chart);
        let mut errors = Vec::new();
        let configuration = self.configuration.clone();
        let history = std::mem::take(&mut self.history);
        let enabled = selector::select_transitions(&chart, &configuration, &history, event, |tid| {
            let Some(cond) = chart.transition(tid).cond.as_deref() else {
                return true;
            };
            match self.eval_guard(cond) {
                Ok(result) => result,
                Err(err) => {
                    errors.push(ActionError::from(err).into_event());
                    false
                }
            }
        });
        self.history = history;
        for error in errors {
            self.queues.internal.push(error);
        }
        enabled
    }

    /// Exit, transition content, entry.
    pub(crate) fn microstep(&mut self, transitions: &[TransitionId]) -> Result<(), CoreError> {
        let chart = Arc::clone(&self.chart);
        self.microsteps += 1;
        if self.microsteps > self.config.max_microsteps_per_run {
            warn!(session_id = %self.id, limit = self.config.max_microsteps_per_run, "microstep limit exceeded");
            return Err(CoreError::MicrostepLimit {
                session_id: self.id.clone(),
                limit: self.config.max_microsteps_per_run,
            });
        }

        let exit = planner::exit_set(&chart, &self.configuration, &self.history, transitions);
        self.exit_states(&exit);

        for &tid in transitions {
            let t = chart.transition(tid);
            debug!(
                session_id = %self.id,
                source = %chart.state(t.source).id,
                targets = ?t.targets.iter().map(|s| chart.state(*s).id.as_str()).collect::<Vec<_>>(),
                "taking transition"
            );
            self.execute_block(&t.actions);
        }

        let plan = planner::entry_set(&chart, &self.history, transitions);
        self.enter_states(&plan);
        Ok(())
    }

    fn exit_states(&mut self, exit: &[StateId]) {
        let chart = Arc::clone(&self.chart);
        for &s in exit {
            self.history.record_on_exit(&chart, s, &self.configuration);
        }
        for &s in exit {
            let state = chart.state(s);
            debug!(session_id = %self.id, state = %state.id, "exiting state");
            for block in &state.on_exit {
                self.execute_block(block);
            }
            self.invocations.cancel_state(s);
            self.configuration.remove(s);
            self.done_raised.remove(&s);
        }
    }

    fn enter_states(&mut self, plan: &EntryPlan) {
        let chart = Arc::clone(&self.chart);
        for &s in &plan.states {
            let state = chart.state(s);
            debug!(session_id = %self.id, state = %state.id, "entering state");
            self.configuration.insert(s);

            for (index, spec) in state.invokes.iter().enumerate() {
                let invoke_id = spec
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}.{}", state.id, uuid::Uuid::new_v4()));
                self.invocations
                    .defer(s, index, invoke_id, spec.autoforward, spec.finalize.clone());
            }

            if chart.binding() == Binding::Late && self.initialized.insert(s) {
                self.bind_data(&state.data);
            }

            for block in &state.on_entry {
                self.execute_block(block);
            }

            if plan.default_entry.contains(&s) {
                if let StateKind::Compound { initial } = state.kind {
                    self.execute_block(&chart.transition(initial).actions);
                }
            }
            if let Some(&tid) = plan.default_history.get(&s) {
                self.execute_block(&chart.transition(tid).actions);
            }

            if let StateKind::Final { done_data } = &state.kind {
                self.entered_final(s, done_data.as_ref());
            }
        }
    }

    fn entered_final(&mut self, state: StateId, done_data: Option<&DoneData>) {
        let chart = Arc::clone(&self.chart);
        let Some(parent) = chart.state(state).parent else {
            return;
        };
        let data = self.eval_done_data(done_data);

        if parent == chart.root() {
            self.final_reached = true;
            self.done_data = Some(data);
            return;
        }

        let parent_state = chart.state(parent);
        self.queues
            .internal
            .push(Event::platform(format!("done.state.{}", parent_state.id), data));

        if let Some(grandparent) = parent_state.parent {
            if chart.state(grandparent).is_parallel()
                && chart
                    .state(grandparent)
                    .children
                    .iter()
                    .all(|&region| self.is_in_final(region))
                && self.done_raised.insert(grandparent)
            {
                self.queues.internal.push(Event::platform(
                    format!("done.state.{}", chart.state(grandparent).id),
                    Value::Null,
                ));
            }
        }
    }

    /// Compound: an active final child. Parallel: every region final.
    fn is_in_final(&self, state: StateId) -> bool {
        let s = self.chart.state(state);
        if s.is_compound() {
            s.children
                .iter()
                .any(|&c| self.chart.state(c).is_final() && self.configuration.contains(c))
        } else if s.is_parallel() {
            s.children.iter().all(|&c| self.is_in_final(c))
        } else {
            false
        }
    }

    /// Leaves the state machine after a top-level final state: exit content
    /// runs for the remaining states but the configuration is kept.
    fn halt(&mut self) {
        let chart = Arc::clone(&self.chart);
        self.final_reached = false;
        let remaining: Vec<StateId> = self.configuration.iter().rev().collect();
        for s in remaining {
            for block in &chart.state(s).on_exit {
                self.execute_block(block);
            }
            self.invocations.cancel_state(s);
        }
        self.cancel_pending_sends();
        self.status = SessionStatus::Finished;
        info!(session_id = %self.id, "session finished");
    }

    // =====================================================================
    // Data
    // =====================================================================

    fn init_datamodel(&mut self) {
        let chart = Arc::clone(&self.chart);
        let root = chart.root();
        self.initialized.insert(root);
        self.bind_data(&chart.state(root).data);

        for s in chart.state_ids().skip(1) {
            let decls = &chart.state(s).data;
            if decls.is_empty() {
                continue;
            }
            match chart.binding() {
                Binding::Early => {
                    self.initialized.insert(s);
                    self.bind_data(decls);
                }
                Binding::Late => {
                    for decl in decls {
                        self.evaluator.declare(&decl.id, Value::Null);
                    }
                }
            }
        }
    }

    fn bind_data(&mut self, decls: &[DataDecl]) {
        for decl in decls {
            let value = if let Some(v) = self.initial_values.get(&decl.id) {
                Ok(v.clone())
            } else if let Some(expr) = decl.expr.as_deref() {
                self.eval_value(expr)
            } else {
                Ok(decl.value.clone().unwrap_or(Value::Null))
            };
            match value {
                Ok(v) => self.evaluator.declare(&decl.id, v),
                Err(err) => {
                    self.evaluator.declare(&decl.id, Value::Null);
                    self.queues.internal.push(ActionError::from(err).into_event());
                }
            }
        }
    }

    // =====================================================================
    // Invocations
    // =====================================================================

    fn start_pending_invokes(&mut self) {
        for pending in self.invocations.pending() {
            match self.build_invoke_request(&pending) {
                Ok(request) => {
                    let invoke_id = request.invoke_id.clone();
                    let Some(invoker) = self.invokers.get(&request.invoke_type).cloned() else {
                        self.invocations.fail(&invoke_id);
                        self.queues.internal.push(Event::error_execution(format!(
                            "unsupported invoke type: {}",
                            request.invoke_type
                        )));
                        continue;
                    };
                    match invoker.start(request) {
                        Ok(child) => self.invocations.activate(&invoke_id, child),
                        Err(err) => {
                            warn!(session_id = %self.id, invoke_id = %invoke_id, error = %err, "invocation failed to start");
                            self.invocations.fail(&invoke_id);
                            self.queues
                                .internal
                                .push(Event::error_execution(err.to_string()).with_invoke_id(invoke_id));
                        }
                    }
                }
                Err(err) => {
                    self.invocations.fail(&pending.invoke_id);
                    self.queues.internal.push(err.into_event());
                }
            }
        }
    }

    fn build_invoke_request(&mut self, pending: &PendingInvoke) -> Result<InvokeRequest, ActionError> {
        let chart = Arc::clone(&self.chart);
        let spec = &chart.state(pending.state).invokes[pending.index];

        if let Some(location) = spec.id_location.as_deref() {
            self.assign_value(location, Value::String(pending.invoke_id.clone()))?;
        }
        let invoke_type = match (&spec.invoke_type, &spec.type_expr) {
            (Some(t), _) => normalize_invoke_type(Some(t.as_str())),
            (None, Some(expr)) => normalize_invoke_type(Some(self.eval_string(expr)?.as_str())),
            (None, None) => normalize_invoke_type(None),
        };
        let src = match (&spec.src, &spec.src_expr) {
            (Some(src), _) => Some(src.clone()),
            (None, Some(expr)) => Some(self.eval_string(expr)?),
            (None, None) => None,
        };
        let params = self.eval_params(&spec.params, &spec.namelist)?;

        Ok(InvokeRequest {
            invoke_id: pending.invoke_id.clone(),
            invoke_type,
            src,
            content: spec.content.as_deref().cloned(),
            params,
            parent_session_id: self.id.clone(),
            parent_path: self.session_path.clone(),
            autoforward: spec.autoforward,
        })
    }

    /// Moves child output onto the external queue.
    fn pump_children(&mut self) {
        for (invoke_id, output) in self.invocations.poll_children() {
            for event in output.events {
                self.route_child_event(&invoke_id, event);
            }
            if output.finished {
                self.queues.external.push(
                    Event::external(format!("done.invoke.{}", invoke_id))
                        .with_data(output.done_data.unwrap_or(Value::Null))
                        .with_invoke_id(invoke_id),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::child::StatechartInvoker;
    use crate::definition::Chart;
    use crate::error::CoreError;
    use crate::event::Event;
    use crate::invoke::InvocationStatus;
    use crate::session::{Session, SessionConfig};
    use dashmap::DashMap;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn session(chart: Value) -> Session {
        let chart = Arc::new(Chart::from_json(&chart).unwrap());
        let charts = Arc::new(DashMap::new());
        let mut session = Session::builder(chart)
            .session_id("test")
            .invoker("scxml", Arc::new(StatechartInvoker::new(charts)))
            .build();
        session.start().unwrap();
        session
    }

    fn send(session: &mut Session, name: &str) {
        session.raise_external(Event::external(name)).unwrap();
        session.run_to_quiescence().unwrap();
    }

    fn mark(tag: &str) -> Value {
        json!({"assign": {"location": "trace", "expr": format!("trace + ['{}']", tag)}})
    }

    fn trace(session: &mut Session) -> Value {
        session.evaluate("trace").unwrap()
    }

    #[test]
    fn test_eventless_before_internal_events() {
        let s = session(json!({
            "states": [
                {"id": "a", "on_entry": [{"raise": {"event": "ev"}}],
                 "transitions": [{"target": "b"}, {"event": "ev", "target": "wrong"}]},
                {"id": "b", "transitions": [{"event": "ev", "target": "c"}]},
                {"id": "c"},
                {"id": "wrong"}
            ]
        }));
        assert_eq!(s.active_state_ids(), vec!["c"]);
    }

    #[test]
    fn test_internal_queue_drains_before_external() {
        let mut s = session(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "target": "a2", "actions": [{"raise": {"event": "int"}}]}
                ]},
                {"id": "a2", "transitions": [
                    {"event": "int", "target": "b"},
                    {"event": "ext", "target": "wrong"}
                ]},
                {"id": "b", "transitions": [{"event": "ext", "target": "done"}]},
                {"id": "done"},
                {"id": "wrong"}
            ]
        }));
        s.raise_external(Event::external("go")).unwrap();
        s.raise_external(Event::external("ext")).unwrap();
        s.run_to_quiescence().unwrap();
        assert_eq!(s.active_state_ids(), vec!["done"]);
    }

    #[test]
    fn test_step_processes_one_external_event() {
        let mut s = session(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "x", "target": "b"}]},
                {"id": "b", "transitions": [{"event": "x", "target": "c"}]},
                {"id": "c"}
            ]
        }));
        s.raise_external(Event::external("x")).unwrap();
        s.raise_external(Event::external("x")).unwrap();
        assert!(s.step().unwrap());
        assert_eq!(s.active_state_ids(), vec!["b"]);
        assert!(s.step().unwrap());
        assert!(!s.step().unwrap());
        assert_eq!(s.active_state_ids(), vec!["c"]);
    }

    #[test]
    fn test_entry_and_exit_order() {
        let mut s = session(json!({
            "datamodel": [{"id": "trace", "value": []}],
            "states": [
                {"id": "p", "type": "parallel",
                 "on_entry": [mark("enter p")], "on_exit": [mark("exit p")],
                 "states": [
                    {"id": "r1", "on_entry": [mark("enter r1")], "on_exit": [mark("exit r1")]},
                    {"id": "r2", "on_entry": [mark("enter r2")], "on_exit": [mark("exit r2")]}
                 ],
                 "transitions": [{"event": "go", "target": "q", "actions": [mark("transition")]}]},
                {"id": "q", "on_entry": [mark("enter q")]}
            ]
        }));
        assert_eq!(trace(&mut s), json!(["enter p", "enter r1", "enter r2"]));
        send(&mut s, "go");
        assert_eq!(
            trace(&mut s),
            json!([
                "enter p", "enter r1", "enter r2",
                "exit r2", "exit r1", "exit p", "transition", "enter q"
            ])
        );
    }

    #[test]
    fn test_internal_transition_does_not_exit_source() {
        let mut s = session(json!({
            "datamodel": [{"id": "trace", "value": []}],
            "states": [
                {"id": "s", "on_exit": [mark("exit s")], "states": [
                    {"id": "s1"}, {"id": "s2"}
                ], "transitions": [
                    {"event": "inner", "target": "s2", "type": "internal"},
                    {"event": "outer", "target": "s1"}
                ]}
            ]
        }));
        send(&mut s, "inner");
        assert_eq!(s.active_state_ids(), vec!["s", "s2"]);
        assert_eq!(trace(&mut s), json!([]));
        send(&mut s, "outer");
        assert_eq!(s.active_state_ids(), vec!["s", "s1"]);
        assert_eq!(trace(&mut s), json!(["exit s"]));
    }

    #[test]
    fn test_initial_pseudostate_content_runs_on_default_entry() {
        let mut s = session(json!({
            "datamodel": [{"id": "trace", "value": []}],
            "states": [
                {"id": "s", "on_entry": [mark("enter s")], "states": [
                    {"id": "i", "type": "initial", "transitions": [
                        {"target": "s2", "actions": [mark("initial")]}
                    ]},
                    {"id": "s1"},
                    {"id": "s2", "on_entry": [mark("enter s2")]}
                ]}
            ]
        }));
        assert_eq!(s.active_state_ids(), vec!["s", "s2"]);
        assert_eq!(trace(&mut s), json!(["enter s", "initial", "enter s2"]));
    }

    #[test]
    fn test_history_default_content_runs_once() {
        let mut s = session(json!({
            "initial": "o",
            "datamodel": [{"id": "trace", "value": []}],
            "states": [
                {"id": "s", "states": [
                    {"id": "h", "type": "history", "transitions": [
                        {"target": "s2", "actions": [mark("default")]}
                    ]},
                    {"id": "s1"},
                    {"id": "s2", "transitions": [{"event": "next", "target": "s3"}]},
                    {"id": "s3"}
                ], "transitions": [{"event": "out", "target": "o"}]},
                {"id": "o", "transitions": [{"event": "back", "target": "h"}]}
            ]
        }));
        send(&mut s, "back");
        assert_eq!(s.active_state_ids(), vec!["s", "s2"]);
        send(&mut s, "next");
        for _ in 0..2 {
            send(&mut s, "out");
            send(&mut s, "back");
            assert_eq!(s.active_state_ids(), vec!["s", "s3"]);
        }
        assert_eq!(trace(&mut s), json!(["default"]));
    }

    #[test]
    fn test_deep_history_round_trip() {
        let mut s = session(json!({
            "states": [
                {"id": "s", "states": [
                    {"id": "h", "type": "history", "history": "deep", "transitions": [{"target": "a"}]},
                    {"id": "a", "transitions": [{"event": "deeper", "target": "b22"}]},
                    {"id": "b", "states": [
                        {"id": "b1"},
                        {"id": "b2", "states": [{"id": "b21"}, {"id": "b22"}]}
                    ]}
                ], "transitions": [{"event": "out", "target": "o"}]},
                {"id": "o", "transitions": [{"event": "back", "target": "h"}]}
            ]
        }));
        send(&mut s, "deeper");
        let before = s.active_state_ids();
        assert_eq!(before, vec!["s", "b", "b2", "b22"]);
        send(&mut s, "out");
        assert_eq!(s.active_state_ids(), vec!["o"]);
        send(&mut s, "back");
        assert_eq!(s.active_state_ids(), before);
    }

    #[test]
    fn test_shallow_history_uses_default_entry_below() {
        let mut s = session(json!({
            "states": [
                {"id": "s", "states": [
                    {"id": "h", "type": "history", "transitions": [{"target": "a"}]},
                    {"id": "a", "transitions": [{"event": "deeper", "target": "b2"}]},
                    {"id": "b", "states": [{"id": "b1"}, {"id": "b2"}]}
                ], "transitions": [{"event": "out", "target": "o"}]},
                {"id": "o", "transitions": [{"event": "back", "target": "h"}]}
            ]
        }));
        send(&mut s, "deeper");
        send(&mut s, "out");
        send(&mut s, "back");
        assert_eq!(s.active_state_ids(), vec!["s", "b", "b1"]);
    }

    #[test]
    fn test_parallel_done_raised_once() {
        let mut s = session(json!({
            "datamodel": [{"id": "count", "value": 0}, {"id": "regions", "value": []}],
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "states": [
                        {"id": "r1a", "transitions": [{"event": "e1", "target": "r1f"}]},
                        {"id": "r1f", "type": "final"}
                    ]},
                    {"id": "r2", "states": [
                        {"id": "r2a", "transitions": [{"event": "e2", "target": "r2f"}]},
                        {"id": "r2f", "type": "final"}
                    ], "transitions": [{"event": "again", "target": "r2f", "type": "internal"}]}
                ], "transitions": [
                    {"event": "done.state.p", "actions": [
                        {"assign": {"location": "count", "expr": "count + 1"}}
                    ]},
                    {"event": "done.state.r1 done.state.r2", "actions": [
                        {"assign": {"location": "regions", "expr": "regions + [_event.name]"}}
                    ]}
                ]}
            ]
        }));
        send(&mut s, "e1");
        assert_eq!(s.evaluate("count").unwrap(), json!(0));
        send(&mut s, "e2");
        assert_eq!(s.evaluate("count").unwrap(), json!(1));
        send(&mut s, "again");
        assert!(s.is_state_active("r2f"));
        assert_eq!(s.evaluate("count").unwrap(), json!(1));
        assert_eq!(
            s.evaluate("regions").unwrap(),
            json!(["done.state.r1", "done.state.r2", "done.state.r2"])
        );
    }

    #[test]
    fn test_compound_done_data() {
        let mut s = session(json!({
            "datamodel": [{"id": "result", "value": null}],
            "states": [
                {"id": "job", "states": [
                    {"id": "working", "transitions": [{"event": "finish", "target": "complete"}]},
                    {"id": "complete", "type": "final", "done_data": {
                        "params": [{"name": "status", "expr": "'ok'"}]
                    }}
                ], "transitions": [{"event": "done.state.job", "target": "after", "actions": [
                    {"assign": {"location": "result", "expr": "_event.data.status"}}
                ]}]},
                {"id": "after"}
            ]
        }));
        send(&mut s, "finish");
        assert_eq!(s.active_state_ids(), vec!["after"]);
        assert_eq!(s.evaluate("result").unwrap(), json!("ok"));
    }

    #[test]
    fn test_top_level_final_keeps_configuration() {
        let mut s = session(json!({
            "datamodel": [{"id": "trace", "value": []}],
            "states": [
                {"id": "run", "on_exit": [mark("exit run")],
                 "transitions": [{"event": "stop", "target": "end"}]},
                {"id": "end", "type": "final", "on_exit": [mark("exit end")],
                 "done_data": {"content": {"expr": "{code: 0}"}}}
            ]
        }));
        assert!(!s.is_in_final_state());
        send(&mut s, "stop");
        assert!(s.is_in_final_state());
        assert_eq!(s.active_state_ids(), vec!["end"]);
        assert_eq!(s.done_data(), Some(&json!({"code": 0})));
        assert_eq!(trace(&mut s), json!(["exit run", "exit end"]));
        assert!(matches!(
            s.raise_external(Event::external("stop")),
            Err(CoreError::SessionNotRunning { .. })
        ));
        assert!(!s.step().unwrap());
    }

    #[test]
    fn test_descriptor_matching_in_session() {
        let mut s = session(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "foo.bar", "target": "b"}]},
                {"id": "b"}
            ]
        }));
        send(&mut s, "foo.barz");
        send(&mut s, "foobar");
        assert_eq!(s.active_state_ids(), vec!["a"]);
        send(&mut s, "foo.bar.baz");
        assert_eq!(s.active_state_ids(), vec!["b"]);
    }

    #[test]
    fn test_sibling_regions_earlier_wins() {
        let mut s = session(json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "transitions": [{"event": "go", "target": "x"}]},
                    {"id": "r2", "transitions": [{"event": "go", "target": "y"}]}
                ]},
                {"id": "x"},
                {"id": "y"}
            ]
        }));
        send(&mut s, "go");
        assert_eq!(s.active_state_ids(), vec!["x"]);
    }

    #[test]
    fn test_outer_transition_preempts_inner() {
        let mut s = session(json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "states": [
                        {"id": "a", "transitions": [{"event": "go", "target": "a2"}]},
                        {"id": "a2"}
                    ]},
                    {"id": "r2", "states": [{"id": "b"}]}
                ], "transitions": [{"event": "go", "target": "outer"}]},
                {"id": "outer"}
            ]
        }));
        send(&mut s, "go");
        assert_eq!(s.active_state_ids(), vec!["outer"]);

        // the inner transition is selected by the later region
        let mut s = session(json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "states": [{"id": "b"}]},
                    {"id": "r2", "states": [
                        {"id": "a", "transitions": [{"event": "go", "target": "a2"}]},
                        {"id": "a2"}
                    ]}
                ], "transitions": [{"event": "go", "target": "outer"}]},
                {"id": "outer"}
            ]
        }));
        send(&mut s, "go");
        assert_eq!(s.active_state_ids(), vec!["outer"]);
    }

    #[test]
    fn test_guard_error_raises_error_execution() {
        let mut s = session(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "cond": "missing > 1", "target": "wrong"},
                    {"event": "error.execution", "target": "b"}
                ]},
                {"id": "b"},
                {"id": "wrong"}
            ]
        }));
        send(&mut s, "go");
        assert_eq!(s.active_state_ids(), vec!["b"]);
    }

    #[test]
    fn test_microstep_limit() {
        let chart = Arc::new(
            Chart::from_json(&json!({
                "states": [
                    {"id": "a", "transitions": [{"target": "b"}]},
                    {"id": "b", "transitions": [{"target": "a"}]}
                ]
            }))
            .unwrap(),
        );
        let mut s = Session::builder(chart)
            .config(SessionConfig {
                max_microsteps_per_run: 50,
                ..Default::default()
            })
            .build();
        let err = s.start().unwrap_err();
        assert!(matches!(err, CoreError::MicrostepLimit { limit: 50, .. }));
    }

    #[test]
    fn test_late_binding() {
        let mut s = session(json!({
            "binding": "late",
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "datamodel": [{"id": "x", "value": 42}]}
            ]
        }));
        assert_eq!(s.evaluate("x").unwrap(), Value::Null);
        send(&mut s, "go");
        assert_eq!(s.evaluate("x").unwrap(), json!(42));
    }

    #[test]
    fn test_early_binding() {
        let mut s = session(json!({
            "states": [
                {"id": "a"},
                {"id": "b", "datamodel": [{"id": "x", "expr": "40 + 2"}]}
            ]
        }));
        assert_eq!(s.evaluate("x").unwrap(), json!(42));
    }

    // ---------------------------------------------------------------------
    // Invocations
    // ---------------------------------------------------------------------

    #[test]
    fn test_invoke_then_exit_never_starts() {
        let mut s = session(json!({
            "states": [
                {"id": "s", "invoke": [{"id": "child", "content": {"states": [{"id": "c"}]}}],
                 "transitions": [{"target": "t"}]},
                {"id": "t", "transitions": [{"event": "late", "target": "leaked"}]},
                {"id": "leaked"}
            ]
        }));
        assert_eq!(s.active_state_ids(), vec!["t"]);
        assert_eq!(s.invocations_started(), 0);
        assert_eq!(s.invocation_status("child"), Some(InvocationStatus::Cancelled));
        assert!(!s.send_to_child("child", Event::external("hello")));

        assert!(!s.route_child_event("child", Event::external("late")));
        assert_eq!(s.queued(), (0, 0));
        send_tagged(&mut s, "late", "child");
        assert_eq!(s.active_state_ids(), vec!["t"]);
    }

    fn send_tagged(session: &mut Session, name: &str, invoke_id: &str) {
        session
            .raise_external(Event::external(name).with_invoke_id(invoke_id))
            .unwrap();
        session.run_to_quiescence().unwrap();
    }

    #[test]
    fn test_events_from_cancelled_invocation_are_discarded() {
        let mut s = session(json!({
            "states": [
                {"id": "s", "invoke": [{"id": "child", "content": {"states": [{"id": "c"}]}}],
                 "transitions": [{"event": "leave", "target": "t"}]},
                {"id": "t", "transitions": [{"event": "late", "target": "leaked"}]},
                {"id": "leaked"}
            ]
        }));
        assert_eq!(s.invocation_status("child"), Some(InvocationStatus::Active));
        send(&mut s, "leave");
        assert_eq!(s.invocation_status("child"), Some(InvocationStatus::Cancelled));

        assert!(!s.route_child_event("child", Event::external("late")));
        send_tagged(&mut s, "late", "child");
        assert_eq!(s.active_state_ids(), vec!["t"]);

        // the same event without the tag is handled
        send(&mut s, "late");
        assert_eq!(s.active_state_ids(), vec!["leaked"]);
    }

    #[test]
    fn test_queued_child_events_dropped_after_exit() {
        let mut s = session(json!({
            "states": [
                {"id": "s", "invoke": [{"id": "child", "content": {"states": [
                    {"id": "c", "on_entry": [
                        {"send": {"event": "hello", "target": "#_parent"}},
                        {"send": {"event": "late", "target": "#_parent"}}
                    ]}
                ]}}],
                 "transitions": [{"event": "hello", "target": "t"}]},
                {"id": "t", "transitions": [{"event": "late", "target": "leaked"}]},
                {"id": "leaked"}
            ]
        }));
        s.run_to_quiescence().unwrap();
        assert_eq!(s.active_state_ids(), vec!["t"]);
        assert_eq!(s.queued(), (0, 0));
    }

    #[test]
    fn test_route_child_event_tags_origin() {
        let mut s = session(json!({
            "datamodel": [{"id": "origin", "value": null}],
            "states": [
                {"id": "s", "invoke": [{"id": "child", "content": {"states": [{"id": "c"}]}}],
                 "transitions": [{"event": "report", "target": "t", "actions": [
                    {"assign": {"location": "origin", "expr": "_event.origin"}}
                 ]}]},
                {"id": "t"}
            ]
        }));
        assert!(s.route_child_event("child", Event::internal("report")));
        assert!(!s.route_child_event("stranger", Event::external("report")));
        s.run_to_quiescence().unwrap();
        assert_eq!(s.active_state_ids(), vec!["t"]);
        assert_eq!(s.evaluate("origin").unwrap(), json!("#_child"));
    }

    #[test]
    fn test_child_events_reach_parent() {
        let mut s = session(json!({
            "states": [
                {"id": "s", "invoke": [{"id": "child", "content": {"states": [
                    {"id": "c", "on_entry": [{"send": {"event": "hello", "target": "#_parent"}}],
                     "transitions": [{"event": "ping", "target": "c2", "actions": [
                        {"send": {"event": "pong", "target": "#_parent"}}
                     ]}]},
                    {"id": "c2"}
                ]}}],
                 "transitions": [
                    {"event": "hello", "target": "greeted", "cond": "_event.invokeid == 'child'"}
                 ]},
                {"id": "greeted"}
            ]
        }));
        assert_eq!(s.invocations_started(), 1);
        assert_eq!(s.invocation_status("child"), Some(InvocationStatus::Active));
        s.run_to_quiescence().unwrap();
        // leaving the invoking state cancels the child
        assert_eq!(s.active_state_ids(), vec!["greeted"]);
        assert_eq!(s.invocation_status("child"), Some(InvocationStatus::Cancelled));
        assert!(!s.send_to_child("child", Event::external("ping")));
    }

    #[test]
    fn test_done_invoke_after_child_finishes() {
        let mut s = session(json!({
            "datamodel": [{"id": "trace", "value": []}],
            "states": [
                {"id": "s", "invoke": [{
                    "id": "worker",
                    "params": [{"name": "input", "expr": "21"}],
                    "finalize": [mark("finalize")],
                    "content": {
                        "datamodel": [{"id": "input", "value": 0}],
                        "states": [
                            {"id": "busy", "transitions": [{"target": "f"}]},
                            {"id": "f", "type": "final", "done_data": {"content": {"expr": "input * 2"}}}
                        ]
                    }
                }], "transitions": [
                    {"event": "done.invoke.worker", "target": "after", "actions": [
                        {"assign": {"location": "trace", "expr": "trace + [_event.data]"}}
                    ]}
                ]},
                {"id": "after"}
            ]
        }));
        s.run_to_quiescence().unwrap();
        assert_eq!(s.active_state_ids(), vec!["after"]);
        assert_eq!(trace(&mut s), json!(["finalize", 42]));
        assert_eq!(s.invocation_status("worker"), Some(InvocationStatus::Done));
    }

    #[test]
    fn test_autoforward() {
        let mut s = session(json!({
            "states": [
                {"id": "s", "invoke": [{"id": "child", "autoforward": true, "content": {"states": [
                    {"id": "c", "transitions": [{"event": "poke", "target": "c2", "actions": [
                        {"send": {"event": "poked", "target": "#_parent"}}
                    ]}]},
                    {"id": "c2"}
                ]}}],
                 "transitions": [{"event": "poked", "target": "done"}]},
                {"id": "done"}
            ]
        }));
        send(&mut s, "poke");
        assert_eq!(s.active_state_ids(), vec!["done"]);
    }

    #[test]
    fn test_unknown_invoke_type_raises_error() {
        let s = session(json!({
            "states": [
                {"id": "s", "invoke": [{"id": "x", "type": "http://example.com/unknown"}],
                 "transitions": [{"event": "error.execution", "target": "failed"}]},
                {"id": "failed"}
            ]
        }));
        assert_eq!(s.active_state_ids(), vec!["failed"]);
        assert_eq!(s.invocations_started(), 0);
    }

    #[test]
    fn test_invoke_missing_src_raises_error() {
        let s = session(json!({
            "states": [
                {"id": "s", "invoke": [{"id": "x", "src": "not-registered"}],
                 "transitions": [{"event": "error.execution", "target": "failed"}]},
                {"id": "failed"}
            ]
        }));
        assert_eq!(s.active_state_ids(), vec!["failed"]);
    }

    fn closure_chart() -> Value {
        json!({
            "states": [
                {"id": "main", "states": [
                    {"id": "h", "type": "history", "history": "deep", "transitions": [{"target": "idle"}]},
                    {"id": "idle", "transitions": [{"event": "a", "target": "work"}]},
                    {"id": "work", "type": "parallel", "states": [
                        {"id": "w1", "states": [
                            {"id": "w1a", "transitions": [{"event": "b", "target": "w1b"}]},
                            {"id": "w1b", "transitions": [{"event": "c", "target": "w1a"}]}
                        ]},
                        {"id": "w2", "states": [
                            {"id": "w2a", "transitions": [{"event": "c", "target": "w2b"}]},
                            {"id": "w2b", "type": "final"}
                        ]}
                    ], "transitions": [{"event": "d", "target": "idle"}]}
                ], "transitions": [{"event": "e", "target": "away"}]},
                {"id": "away", "transitions": [
                    {"event": "a", "target": "h"},
                    {"event": "b", "target": "main"}
                ]}
            ]
        })
    }

    proptest! {
        #[test]
        fn configuration_stays_legal(
            events in prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d", "e"]), 0..40)
        ) {
            let mut s = session(closure_chart());
            let chart = Arc::clone(s.chart());
            prop_assert!(s.active_configuration().is_legal(&chart));
            for name in events {
                s.raise_external(Event::external(name)).unwrap();
                s.step().unwrap();
                prop_assert!(s.active_configuration().is_legal(&chart));
            }
        }
    }
}
