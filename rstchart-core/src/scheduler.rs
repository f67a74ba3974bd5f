//! Delayed sends and external transports.

use crate::error::DispatchError;
use crate::event::Event;
use parking_lot::Mutex;
use std::time::Duration;

/// Where a send delivers its event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// The sending session's external queue.
    External,
    /// The sending session's internal queue (`#_internal`).
    Internal,
    /// The invoking parent (`#_parent`).
    Parent,
    /// An invoked child (`#_<invokeid>`).
    Child(String),
    /// A session by id (`#_scxml_<sessionid>`).
    Session(String),
    /// Anything the session cannot resolve itself.
    Transport { target: String, send_type: String },
}

impl SendTarget {
    /// Classifies a `target` attribute. Returns `None` for malformed
    /// special targets (`#` or `#_` with nothing after it).
    pub fn parse(target: Option<&str>, send_type: &str) -> Option<SendTarget> {
        let Some(target) = target.map(str::trim).filter(|t| !t.is_empty()) else {
            return Some(SendTarget::External);
        };
        match target {
            "#_internal" => Some(SendTarget::Internal),
            "#_parent" => Some(SendTarget::Parent),
            "#" | "#_" | "#_scxml_" => None,
            _ => {
                if let Some(session) = target.strip_prefix("#_scxml_") {
                    Some(SendTarget::Session(session.to_string()))
                } else if let Some(invoke_id) = target.strip_prefix("#_") {
                    Some(SendTarget::Child(invoke_id.to_string()))
                } else if target.starts_with('#') {
                    None
                } else {
                    Some(SendTarget::Transport {
                        target: target.to_string(),
                        send_type: send_type.to_string(),
                    })
                }
            }
        }
    }
}

/// A send waiting for its delay to elapse.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledSend {
    /// Session ids from the root session down to the sender.
    pub session_path: Vec<String>,
    pub send_id: String,
    pub event: Event,
    pub target: SendTarget,
}

impl ScheduledSend {
    /// Id of the session that issued the send.
    pub fn session_id(&self) -> &str {
        self.session_path.last().map(String::as_str).unwrap_or_default()
    }
}

/// Holds delayed sends until they are due.
///
/// Fired sends are handed back to the owning session through
/// `Session::deliver_scheduled`; delivering a send that was cancelled is a
/// no-op there.
pub trait DelayedSendScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, send: ScheduledSend) -> Result<(), DispatchError>;

    /// Cancels a pending send. Returns false if it was not pending.
    fn cancel(&self, session_id: &str, send_id: &str) -> bool;
}

/// Delivery for targets a session cannot resolve itself.
pub trait ExternalTransport: Send + Sync {
    fn send(&self, target: &str, send_type: &str, event: &Event) -> Result<(), DispatchError>;
}

/// A scheduler driven by explicit calls to [`ManualScheduler::advance`].
#[derive(Debug, Default)]
pub struct ManualScheduler {
    inner: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    /// (due, sequence, send)
    pending: Vec<(Duration, u64, ScheduledSend)>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward and returns every send that became due, in
    /// due order.
    pub fn advance(&self, by: Duration) -> Vec<ScheduledSend> {
        let mut state = self.inner.lock();
        state.now += by;
        let now = state.now;
        let mut due: Vec<_> = Vec::new();
        state.pending.retain(|(at, seq, send)| {
            if *at <= now {
                due.push((*at, *seq, send.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, seq, _)| (*at, *seq));
        due.into_iter().map(|(_, _, send)| send).collect()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl DelayedSendScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, send: ScheduledSend) -> Result<(), DispatchError> {
        let mut state = self.inner.lock();
        let due = state.now + delay;
        state.seq += 1;
        let seq = state.seq;
        state.pending.push((due, seq, send));
        Ok(())
    }

    fn cancel(&self, session_id: &str, send_id: &str) -> bool {
        let mut state = self.inner.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|(_, _, s)| !(s.session_id() == session_id && s.send_id == send_id));
        state.pending.len() != before
    }
}
