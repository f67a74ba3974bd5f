//! Tokio-backed delayed sends.

use dashmap::DashMap;
use rstchart_core::error::DispatchError;
use rstchart_core::scheduler::{DelayedSendScheduler, ScheduledSend};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type TimerKey = (String, String);

/// Runs each delayed send as a timer task. Fired sends come out of the
/// receiver returned by [`TokioScheduler::new`]; whoever owns it hands them
/// back to the engine.
pub struct TokioScheduler {
    handle: Handle,
    /// Live timers by (session id, send id), with the generation that
    /// armed them.
    timers: Arc<DashMap<TimerKey, (u64, oneshot::Sender<()>)>>,
    generation: AtomicU64,
    fired: mpsc::UnboundedSender<ScheduledSend>,
}

impl TokioScheduler {
    /// Creates a scheduler spawning its timers on `handle`.
    pub fn new(handle: Handle) -> (Self, mpsc::UnboundedReceiver<ScheduledSend>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            handle,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            fired,
        };
        (scheduler, rx)
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

impl DelayedSendScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, send: ScheduledSend) -> Result<(), DispatchError> {
        if self.fired.is_closed() {
            return Err(DispatchError::NoScheduler);
        }

        let key = (send.session_id().to_string(), send.send_id.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        // Re-using a send id replaces the earlier timer.
        self.timers.insert(key.clone(), (generation, cancel_tx));

        let timers = Arc::clone(&self.timers);
        let fired = self.fired.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if timers.remove_if(&key, |_, (g, _)| *g == generation).is_some() {
                        tracing::debug!(session_id = %key.0, send_id = %key.1, "delayed send fired");
                        let _ = fired.send(send);
                    }
                }
                _ = cancel_rx => {
                    tracing::debug!(session_id = %key.0, send_id = %key.1, "delayed send cancelled");
                }
            }
        });
        Ok(())
    }

    fn cancel(&self, session_id: &str, send_id: &str) -> bool {
        match self
            .timers
            .remove(&(session_id.to_string(), send_id.to_string()))
        {
            Some((_, (_, cancel))) => {
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }
}
