//! Session driver.
//!
//! Feeds external events and fired delayed sends into a
//! [`StatechartEngine`], runs the affected sessions to quiescence and
//! publishes what changed.

use crate::config::DriverConfig;
use crate::error::RuntimeError;
use rstchart_core::event::Event;
use rstchart_core::scheduler::ScheduledSend;
use rstchart_core::session::SessionStatus;
use rstchart_core::{CoreError, StatechartEngine};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};

/// State of a session after the driver ran it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub session_id: String,
    pub status: SessionStatus,
    /// Active state ids in document order.
    pub configuration: Vec<String>,
    pub done_data: Option<Value>,
}

/// Cloneable handle for talking to a running driver.
#[derive(Clone)]
pub struct DriverHandle {
    events: mpsc::Sender<(String, Event)>,
    updates: broadcast::Sender<SessionUpdate>,
    shutdown: Arc<Notify>,
}

impl DriverHandle {
    /// Queues an external event for a session.
    pub async fn send(&self, session_id: &str, event: Event) -> Result<(), RuntimeError> {
        self.events
            .send((session_id.to_string(), event))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Subscribes to session updates published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Signals the driver to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Owns the inbound channels and runs sessions as work arrives.
pub struct SessionDriver {
    engine: Arc<StatechartEngine>,
    events: mpsc::Receiver<(String, Event)>,
    fired: mpsc::UnboundedReceiver<ScheduledSend>,
    updates: broadcast::Sender<SessionUpdate>,
    shutdown: Arc<Notify>,
}

impl SessionDriver {
    /// Creates a driver. `fired` is the receiving end of the scheduler the
    /// engine was built with.
    pub fn new(
        engine: Arc<StatechartEngine>,
        fired: mpsc::UnboundedReceiver<ScheduledSend>,
        config: &DriverConfig,
    ) -> (Self, DriverHandle) {
        let (events_tx, events) = mpsc::channel(config.event_capacity);
        let (updates, _) = broadcast::channel(config.update_capacity);
        let shutdown = Arc::new(Notify::new());

        let handle = DriverHandle {
            events: events_tx,
            updates: updates.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let driver = Self {
            engine,
            events,
            fired,
            updates,
            shutdown,
        };
        (driver, handle)
    }

    /// Runs the driver loop until shutdown or until every input is closed.
    /// Events already queued are processed before a shutdown takes effect.
    pub async fn run(mut self) {
        tracing::info!(sessions = self.engine.session_count(), "session driver started");

        loop {
            tokio::select! {
                biased;
                Some((session_id, event)) = self.events.recv() => {
                    self.handle_event(&session_id, event);
                }
                Some(send) = self.fired.recv() => {
                    self.handle_fired(send);
                }
                _ = self.shutdown.notified() => break,
                else => break,
            }
        }

        tracing::info!("session driver stopped");
    }

    fn handle_event(&self, session_id: &str, event: Event) {
        tracing::debug!(session_id = %session_id, event = %event.name, "driver received event");
        if let Err(err) = self.engine.raise_external(session_id, event) {
            tracing::warn!(session_id = %session_id, error = %err, "dropping event");
            return;
        }
        self.run_pending();
    }

    fn handle_fired(&self, send: ScheduledSend) {
        let session_id = send.session_id().to_string();
        match self.engine.deliver_scheduled(send) {
            Ok(true) => {
                self.publish(&session_id);
                self.run_pending();
            }
            Ok(false) => {}
            Err(err) => self.report(&session_id, &err),
        }
    }

    /// Runs every session with queued events and publishes each one.
    fn run_pending(&self) {
        match self.engine.run_pending() {
            Ok(ran) => {
                for session_id in ran {
                    self.publish(&session_id);
                }
            }
            Err(err) => {
                let session_id = match &err {
                    CoreError::MicrostepLimit { session_id, .. } => session_id.clone(),
                    _ => String::new(),
                };
                self.report(&session_id, &err);
            }
        }
    }

    fn publish(&self, session_id: &str) {
        let Ok(snapshot) = self.engine.snapshot(session_id) else {
            return;
        };
        // No subscribers is fine.
        let _ = self.updates.send(SessionUpdate {
            session_id: snapshot.session_id,
            status: snapshot.status,
            configuration: snapshot.configuration,
            done_data: snapshot.done_data,
        });
    }

    fn report(&self, session_id: &str, err: &CoreError) {
        tracing::error!(session_id = %session_id, code = err.error_code(), error = %err, "session run failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use serde_json::json;
    use std::time::Duration;
    use tokio::runtime::Handle;
    use tokio::time::timeout;

    fn engine_with_timer() -> (Arc<StatechartEngine>, mpsc::UnboundedReceiver<ScheduledSend>) {
        let (scheduler, fired) = TokioScheduler::new(Handle::current());
        let engine = StatechartEngine::new().with_scheduler(Arc::new(scheduler));
        engine
            .put_chart(&json!({
                "name": "kettle",
                "states": [
                    {"id": "idle", "transitions": [{"event": "switch_on", "target": "heating"}]},
                    {"id": "heating",
                     "on_entry": [{"send": {"event": "boiled", "delay": "20ms", "id": "boil"}}],
                     "transitions": [
                        {"event": "boiled", "target": "done"},
                        {"event": "switch_off", "target": "idle", "actions": [{"cancel": {"send_id": "boil"}}]}
                     ]},
                    {"id": "done", "type": "final", "done_data": {"content": {"value": "ready"}}}
                ]
            }))
            .unwrap();
        (Arc::new(engine), fired)
    }

    async fn next_update(rx: &mut broadcast::Receiver<SessionUpdate>) -> SessionUpdate {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_event_then_delayed_send() {
        let (engine, fired) = engine_with_timer();
        let session_id = engine.create_session("kettle", Some("k1"), Default::default()).unwrap();
        let (driver, handle) = SessionDriver::new(Arc::clone(&engine), fired, &DriverConfig::default());
        let mut updates = handle.subscribe();
        let task = tokio::spawn(driver.run());

        handle.send(&session_id, Event::external("switch_on")).await.unwrap();
        let update = next_update(&mut updates).await;
        assert_eq!(update.session_id, "k1");
        assert_eq!(update.configuration, vec!["heating"]);
        assert_eq!(update.status, SessionStatus::Running);

        let update = next_update(&mut updates).await;
        assert_eq!(update.configuration, vec!["done"]);
        assert_eq!(update.status, SessionStatus::Finished);
        assert_eq!(update.done_data, Some(json!("ready")));

        handle.shutdown();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_timer_does_not_fire() {
        let (engine, fired) = engine_with_timer();
        let session_id = engine.create_session("kettle", None, Default::default()).unwrap();
        let (driver, handle) = SessionDriver::new(Arc::clone(&engine), fired, &DriverConfig::default());
        let mut updates = handle.subscribe();
        let task = tokio::spawn(driver.run());

        handle.send(&session_id, Event::external("switch_on")).await.unwrap();
        handle.send(&session_id, Event::external("switch_off")).await.unwrap();
        next_update(&mut updates).await;
        let update = next_update(&mut updates).await;
        assert_eq!(update.configuration, vec!["idle"]);

        assert!(timeout(Duration::from_millis(100), updates.recv()).await.is_err());
        assert_eq!(engine.configuration(&session_id).unwrap(), vec!["idle"]);

        handle.shutdown();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session_is_dropped() {
        let (engine, fired) = engine_with_timer();
        let (driver, handle) = SessionDriver::new(engine, fired, &DriverConfig::default());
        let mut updates = handle.subscribe();
        let task = tokio::spawn(driver.run());

        handle.send("ghost", Event::external("switch_on")).await.unwrap();
        assert!(timeout(Duration::from_millis(50), updates.recv()).await.is_err());

        handle.shutdown();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let (engine, fired) = engine_with_timer();
        let (driver, handle) = SessionDriver::new(engine, fired, &DriverConfig::default());
        handle.shutdown();
        driver.run().await;

        let err = handle.send("k1", Event::external("x")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ChannelClosed));
    }
}
