//! In-process child sessions for the statechart invoke type.

use crate::definition::Chart;
use crate::error::InvokeError;
use crate::evaluator::EvaluatorFactory;
use crate::event::Event;
use crate::expr::JsonEvaluator;
use crate::invoke::{ChildOutput, ChildSession, InvokeRequest, Invoker, STATECHART_INVOKE_TYPE};
use crate::scheduler::{DelayedSendScheduler, ExternalTransport, ScheduledSend};
use crate::session::{Session, SessionConfig};
use dashmap::DashMap;
use std::sync::Arc;

/// Starts child statecharts from inline content or from a chart registry.
#[derive(Clone)]
pub struct StatechartInvoker {
    charts: Arc<DashMap<String, Arc<Chart>>>,
    evaluator_factory: EvaluatorFactory,
    scheduler: Option<Arc<dyn DelayedSendScheduler>>,
    transport: Option<Arc<dyn ExternalTransport>>,
    config: SessionConfig,
}

impl StatechartInvoker {
    pub fn new(charts: Arc<DashMap<String, Arc<Chart>>>) -> Self {
        Self {
            charts,
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

    pub fn with_scheduler(mut self, scheduler: Option<Arc<dyn DelayedSendScheduler>>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_transport(mut self, transport: Option<Arc<dyn ExternalTransport>>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    fn resolve_chart(&self, request: &InvokeRequest) -> Result<Arc<Chart>, InvokeError> {
        if let Some(doc) = &request.content {
            return Chart::from_document(doc.clone())
                .map(Arc::new)
                .map_err(|e| InvokeError::StartFailed { reason: e.to_string() });
        }
        let src = request.src.as_deref().ok_or(InvokeError::MissingSource)?;
        let name = src.strip_prefix("chart:").unwrap_or(src);
        self.charts
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| InvokeError::SourceNotFound { src: src.to_string() })
    }
}

impl Invoker for StatechartInvoker {
    fn start(&self, request: InvokeRequest) -> Result<Box<dyn ChildSession>, InvokeError> {
        let chart = self.resolve_chart(&request)?;

        let mut config = self.config.clone();
        config.name = None;
        let mut builder = Session::builder(chart)
            .session_id(uuid::Uuid::new_v4().to_string())
            .config(config)
            .evaluator((self.evaluator_factory)())
            .parent(request.parent_session_id.clone(), request.parent_path.clone())
            .initial_values(request.params.clone())
            .invoker(STATECHART_INVOKE_TYPE, Arc::new(self.clone()));
        if let Some(scheduler) = &self.scheduler {
            builder = builder.scheduler(Arc::clone(scheduler));
        }
        if let Some(transport) = &self.transport {
            builder = builder.transport(Arc::clone(transport));
        }

        let mut session = builder.build();
        tracing::info!(
            invoke_id = %request.invoke_id,
            child_session = %session.id(),
            chart = %session.chart().name(),
            "starting child session"
        );
        session
            .start()
            .map_err(|e| InvokeError::StartFailed { reason: e.to_string() })?;
        Ok(Box::new(LocalChild { session }))
    }
}

/// A child session run synchronously inside its parent.
pub struct LocalChild {
    session: Session,
}

impl LocalChild {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl ChildSession for LocalChild {
    fn deliver(&mut self, event: Event) {
        if let Err(err) = self.session.raise_external(event) {
            tracing::debug!(child_session = %self.session.id(), error = %err, "child rejected event");
        }
    }

    fn poll(&mut self) -> ChildOutput {
        if let Err(err) = self.session.run_to_quiescence() {
            tracing::warn!(child_session = %self.session.id(), error = %err, "child run failed");
        }
        ChildOutput {
            events: self.session.take_outbox(),
            finished: self.session.is_in_final_state(),
            done_data: self.session.done_data().cloned(),
        }
    }

    fn cancel(&mut self) {
        self.session.cancel();
    }

    fn deliver_scheduled(&mut self, send: &ScheduledSend) -> bool {
        self.session.deliver_scheduled(send.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use serde_json::json;
    use std::time::Duration;

    fn registry(charts: &[(&str, serde_json::Value)]) -> Arc<DashMap<String, Arc<Chart>>> {
        let map = DashMap::new();
        for (name, doc) in charts {
            map.insert(name.to_string(), Arc::new(Chart::from_json(doc).unwrap()));
        }
        Arc::new(map)
    }

    fn parent_chart(invoke: serde_json::Value) -> Arc<Chart> {
        Arc::new(
            Chart::from_json(&json!({
                "states": [
                    {"id": "waiting", "invoke": [invoke], "transitions": [
                        {"event": "tick", "target": "ticked"},
                        {"event": "done.invoke.*", "target": "finished"},
                        {"event": "error.execution", "target": "failed"}
                    ]},
                    {"id": "ticked"},
                    {"id": "finished"},
                    {"id": "failed"}
                ]
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_invoke_from_registry() {
        let charts = registry(&[(
            "worker",
            json!({"states": [{"id": "run", "transitions": [{"event": "go", "target": "end"}]},
                              {"id": "end", "type": "final"}]}),
        )]);
        let invoker = StatechartInvoker::new(Arc::clone(&charts));
        let mut parent = Session::builder(parent_chart(json!({"id": "w", "src": "chart:worker"})))
            .invoker(STATECHART_INVOKE_TYPE, Arc::new(invoker))
            .build();
        parent.start().unwrap();
        assert_eq!(parent.invocations_started(), 1);
        assert_eq!(parent.active_state_ids(), vec!["waiting"]);

        assert!(parent.send_to_child("w", Event::external("go")));
        parent.run_to_quiescence().unwrap();
        assert_eq!(parent.active_state_ids(), vec!["finished"]);
    }

    #[test]
    fn test_unknown_source_fails_start() {
        let invoker = StatechartInvoker::new(registry(&[]));
        let mut parent = Session::builder(parent_chart(json!({"id": "w", "src": "missing"})))
            .invoker(STATECHART_INVOKE_TYPE, Arc::new(invoker))
            .build();
        parent.start().unwrap();
        assert_eq!(parent.active_state_ids(), vec!["failed"]);
        assert_eq!(parent.invocations_started(), 0);
    }

    #[test]
    fn test_child_event_origin() {
        let charts = registry(&[(
            "echo",
            json!({"states": [{"id": "idle", "on_entry": [
                {"send": {"event": "tick", "target": "#_parent", "content": {"expr": "_ioprocessors.scxml.location"}}}
            ]}]}),
        )]);
        let mut parent = Session::builder(parent_chart(json!({"id": "e", "src": "echo"})))
            .invoker(STATECHART_INVOKE_TYPE, Arc::new(StatechartInvoker::new(charts)))
            .build();
        parent.start().unwrap();
        parent.run_to_quiescence().unwrap();
        assert_eq!(parent.active_state_ids(), vec!["ticked"]);
        let origin = parent.evaluate("_event.origin").unwrap();
        assert_eq!(origin, serde_json::json!("#_e"));
        let location = parent.evaluate("_event.data").unwrap();
        assert_ne!(location, parent.evaluate("_ioprocessors.scxml.location").unwrap());
    }

    #[test]
    fn test_child_delayed_send_routes_through_parent() {
        let scheduler = Arc::new(ManualScheduler::new());
        let charts = registry(&[(
            "timer",
            json!({"states": [{"id": "counting", "on_entry": [
                {"send": {"event": "tick", "target": "#_parent", "delay": "2s"}}
            ]}]}),
        )]);
        let invoker = StatechartInvoker::new(charts).with_scheduler(Some(scheduler.clone()));
        let mut parent = Session::builder(parent_chart(json!({"id": "t", "src": "timer"})))
            .invoker(STATECHART_INVOKE_TYPE, Arc::new(invoker))
            .scheduler(scheduler.clone())
            .build();
        parent.start().unwrap();
        assert_eq!(scheduler.pending(), 1);

        let fired = scheduler.advance(Duration::from_secs(2));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session_path.len(), 2);
        assert_eq!(fired[0].session_path[0], parent.id());
        for send in fired {
            assert!(parent.deliver_scheduled(send));
        }
        parent.run_to_quiescence().unwrap();
        assert_eq!(parent.active_state_ids(), vec!["ticked"]);
    }

    #[test]
    fn test_cancelling_parent_cancels_child_sends() {
        let scheduler = Arc::new(ManualScheduler::new());
        let charts = registry(&[(
            "timer",
            json!({"states": [{"id": "counting", "on_entry": [
                {"send": {"event": "tick", "target": "#_parent", "delay": "2s"}}
            ]}]}),
        )]);
        let invoker = StatechartInvoker::new(charts).with_scheduler(Some(scheduler.clone()));
        let mut parent = Session::builder(parent_chart(json!({"id": "t", "src": "timer"})))
            .invoker(STATECHART_INVOKE_TYPE, Arc::new(invoker))
            .scheduler(scheduler.clone())
            .build();
        parent.start().unwrap();
        parent.cancel();
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(parent.invocation_status("t"), Some(crate::invoke::InvocationStatus::Cancelled));
    }
}
