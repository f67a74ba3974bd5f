//! Executable content.

use crate::content::{Action, ContentSpec, DoneData, Param, SendSpec};
use crate::error::{DispatchError, EvalError};
use crate::event::{Event, EventKind, SCXML_PROCESSOR};
use crate::invoke::{normalize_invoke_type, STATECHART_INVOKE_TYPE};
use crate::scheduler::{ScheduledSend, SendTarget};
use crate::session::Session;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A failure inside executable content. It aborts the rest of the block
/// and is reported as an error event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ActionError {
    Execution(String),
    Communication { reason: String, send_id: Option<String> },
}

impl ActionError {
    pub(crate) fn into_event(self) -> Event {
        match self {
            ActionError::Execution(reason) => Event::error_execution(reason),
            ActionError::Communication { reason, send_id } => Event::error_communication(reason, send_id),
        }
    }

    fn communication(err: DispatchError, send_id: &str) -> Self {
        ActionError::Communication {
            reason: err.to_string(),
            send_id: Some(send_id.to_string()),
        }
    }
}

impl From<EvalError> for ActionError {
    fn from(err: EvalError) -> Self {
        ActionError::Execution(err.to_string())
    }
}

impl Session {
    /// Runs a block. On the first error the rest of the block is skipped
    /// and the error is queued as an internal event.
    pub(crate) fn execute_block(&mut self, block: &[Action]) {
        if let Err(err) = self.run_actions(block) {
            debug!(session_id = %self.id, error = ?err, "executable content failed");
            self.queues.internal.push(err.into_event());
        }
    }

    fn run_actions(&mut self, actions: &[Action]) -> Result<(), ActionError> {
        for action in actions {
            self.run_action(action)?;
        }
        Ok(())
    }

    fn run_action(&mut self, action: &Action) -> Result<(), ActionError> {
        match action {
            Action::Raise { event } => {
                self.queues.internal.push(Event::internal(event.clone()));
            }

            Action::Send(spec) => self.send(spec)?,

            Action::Cancel {
                send_id,
                send_id_expr,
            } => {
                let send_id = match (send_id, send_id_expr) {
                    (Some(id), _) => id.clone(),
                    (None, Some(expr)) => self.eval_string(expr)?,
                    (None, None) => {
                        return Err(ActionError::Execution("cancel without send id".to_string()))
                    }
                };
                self.pending_sends.remove(&send_id);
                if let Some(scheduler) = &self.scheduler {
                    scheduler.cancel(&self.id, &send_id);
                }
                debug!(session_id = %self.id, send_id = %send_id, "send cancelled");
            }

            Action::Assign {
                location,
                expr,
                value,
            } => {
                let v = match (expr, value) {
                    (Some(expr), _) => self.eval_value(expr)?,
                    (None, Some(v)) => v.clone(),
                    (None, None) => Value::Null,
                };
                self.assign_value(location, v)?;
            }

            Action::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => self.eval_value(expr)?,
                    None => Value::Null,
                };
                info!(
                    session_id = %self.id,
                    label = label.as_deref().unwrap_or_default(),
                    value = %value,
                    "log"
                );
            }

            Action::Script { source } => self.run_script(source)?,

            Action::If {
                cond,
                then,
                else_if,
                otherwise,
            } => {
                if self.eval_guard(cond)? {
                    return self.run_actions(then);
                }
                for branch in else_if {
                    if self.eval_guard(&branch.cond)? {
                        return self.run_actions(&branch.then);
                    }
                }
                self.run_actions(otherwise)?;
            }

            Action::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let items = match self.eval_value(array)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(ActionError::Execution(format!(
                            "foreach over non-iterable value {}",
                            other
                        )))
                    }
                };
                for location in std::iter::once(item).chain(index.iter()) {
                    if !self.evaluator.has_location(location) {
                        if !is_simple_name(location) {
                            return Err(ActionError::Execution(format!(
                                "invalid foreach location '{}'",
                                location
                            )));
                        }
                        self.evaluator.declare(location, Value::Null);
                    }
                }
                for (i, value) in items.into_iter().enumerate() {
                    self.assign_value(item, value)?;
                    if let Some(index) = index {
                        self.assign_value(index, Value::from(i))?;
                    }
                    self.run_actions(actions)?;
                }
            }
        }
        Ok(())
    }

    fn send(&mut self, spec: &SendSpec) -> Result<(), ActionError> {
        let name = match (&spec.event, &spec.event_expr) {
            (Some(name), _) => name.clone(),
            (None, Some(expr)) => self.eval_string(expr)?,
            (None, None) => String::new(),
        };
        let target = match (&spec.target, &spec.target_expr) {
            (Some(t), _) => Some(t.clone()),
            (None, Some(expr)) => Some(self.eval_string(expr)?),
            (None, None) => None,
        };
        let send_type = match (&spec.send_type, &spec.type_expr) {
            (Some(t), _) => t.clone(),
            (None, Some(expr)) => self.eval_string(expr)?,
            (None, None) => STATECHART_INVOKE_TYPE.to_string(),
        };
        let send_id = spec
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Some(location) = spec.id_location.as_deref() {
            self.assign_value(location, Value::String(send_id.clone()))?;
        }
        let delay = match (&spec.delay, &spec.delay_expr) {
            (Some(text), _) => Some(parse_delay(text)?),
            (None, Some(expr)) => match self.eval_value(expr)? {
                Value::String(text) => Some(parse_delay(&text)?),
                Value::Number(ms) => Some(millis_to_delay(ms.as_f64())?),
                other => {
                    return Err(ActionError::Execution(format!("invalid delay {}", other)));
                }
            },
            (None, None) => None,
        };
        let data = self.eval_payload(spec.content.as_ref(), &spec.params, &spec.namelist)?;

        let event = Event {
            name,
            kind: EventKind::External,
            send_id: Some(send_id.clone()),
            origin: Some(format!("#_scxml_{}", self.id)),
            origin_type: Some(SCXML_PROCESSOR.to_string()),
            invoke_id: None,
            data,
        };

        let is_statechart_type = normalize_invoke_type(Some(send_type.as_str())) == STATECHART_INVOKE_TYPE;
        let target = if is_statechart_type {
            SendTarget::parse(target.as_deref(), &send_type).ok_or_else(|| {
                ActionError::Execution(format!("invalid send target '{}'", target.unwrap_or_default()))
            })?
        } else {
            if self.transport.is_none() {
                return Err(ActionError::Execution(format!(
                    "unsupported send type '{}'",
                    send_type
                )));
            }
            SendTarget::Transport {
                target: target.unwrap_or_default(),
                send_type,
            }
        };

        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                if target == SendTarget::Internal {
                    return Err(ActionError::Execution(
                        "delayed send to #_internal".to_string(),
                    ));
                }
                let Some(scheduler) = self.scheduler.clone() else {
                    return Err(ActionError::communication(DispatchError::NoScheduler, &send_id));
                };
                scheduler
                    .schedule(
                        delay,
                        ScheduledSend {
                            session_path: self.session_path.clone(),
                            send_id: send_id.clone(),
                            event,
                            target,
                        },
                    )
                    .map_err(|err| ActionError::communication(err, &send_id))?;
                self.pending_sends.insert(send_id.clone());
                debug!(session_id = %self.id, send_id = %send_id, delay_ms = delay.as_millis() as u64, "send scheduled");
                Ok(())
            }
            None => self.dispatch(target, event),
        }
    }

    /// Delivers a send now.
    pub(crate) fn dispatch(&mut self, target: SendTarget, mut event: Event) -> Result<(), ActionError> {
        let send_id = event.send_id.clone().unwrap_or_default();
        match target {
            SendTarget::External => self.queues.external.push(event),
            SendTarget::Internal => {
                event.kind = EventKind::Internal;
                self.queues.internal.push(event);
            }
            SendTarget::Parent => {
                if self.system.parent.is_none() {
                    return Err(ActionError::Communication {
                        reason: "session has no parent".to_string(),
                        send_id: Some(send_id),
                    });
                }
                self.outbox.push(event);
            }
            SendTarget::Session(id) if id == self.id => self.queues.external.push(event),
            SendTarget::Session(id) => {
                self.transport_send(&format!("#_scxml_{}", id), STATECHART_INVOKE_TYPE, &event)?
            }
            SendTarget::Child(invoke_id) => {
                if !self.invocations.route(&invoke_id, event) {
                    warn!(session_id = %self.id, invoke_id = %invoke_id, "send to inactive invocation");
                    return Err(ActionError::communication(
                        DispatchError::Unreachable {
                            target: format!("#_{}", invoke_id),
                        },
                        &send_id,
                    ));
                }
            }
            SendTarget::Transport { target, send_type } => {
                self.transport_send(&target, &send_type, &event)?
            }
        }
        Ok(())
    }

    fn transport_send(&self, target: &str, send_type: &str, event: &Event) -> Result<(), ActionError> {
        let send_id = event.send_id.clone().unwrap_or_default();
        let Some(transport) = &self.transport else {
            return Err(ActionError::communication(
                DispatchError::NoTransport {
                    target: target.to_string(),
                },
                &send_id,
            ));
        };
        transport.send(target, send_type, event).map_err(|err| {
            warn!(session_id = %self.id, target = %target, error = %err, "transport send failed");
            ActionError::communication(err, &send_id)
        })
    }

    pub(crate) fn eval_string(&mut self, expr: &str) -> Result<String, ActionError> {
        Ok(match self.eval_value(expr)? {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    /// Namelist values followed by params, as an object.
    pub(crate) fn eval_params(&mut self, params: &[Param], namelist: &[String]) -> Result<Map<String, Value>, ActionError> {
        let mut out = Map::new();
        for name in namelist {
            out.insert(name.clone(), self.eval_value(name)?);
        }
        for param in params {
            let expr = param
                .expr
                .as_deref()
                .or(param.location.as_deref())
                .ok_or_else(|| ActionError::Execution(format!("param '{}' has no value", param.name)))?;
            out.insert(param.name.clone(), self.eval_value(expr)?);
        }
        Ok(out)
    }

    fn eval_payload(
        &mut self,
        content: Option<&ContentSpec>,
        params: &[Param],
        namelist: &[String],
    ) -> Result<Value, ActionError> {
        if let Some(content) = content {
            return match (&content.expr, &content.value) {
                (Some(expr), _) => Ok(self.eval_value(expr)?),
                (None, Some(v)) => Ok(v.clone()),
                (None, None) => Ok(Value::Null),
            };
        }
        if params.is_empty() && namelist.is_empty() {
            return Ok(Value::Null);
        }
        Ok(Value::Object(self.eval_params(params, namelist)?))
    }

    /// Evaluates done data. Failures queue `error.execution` and yield null.
    pub(crate) fn eval_done_data(&mut self, done_data: Option<&DoneData>) -> Value {
        let Some(dd) = done_data else {
            return Value::Null;
        };
        match self.eval_payload(dd.content.as_ref(), &dd.params, &[]) {
            Ok(v) => v,
            Err(err) => {
                self.queues.internal.push(err.into_event());
                Value::Null
            }
        }
    }
}

/// A numeric delay in milliseconds. Fractions are rounded to the nearest
/// microsecond.
fn millis_to_delay(ms: Option<f64>) -> Result<Duration, ActionError> {
    match ms {
        Some(ms) if ms.is_finite() && ms >= 0.0 => Ok(Duration::from_micros((ms * 1_000.0).round() as u64)),
        _ => Err(ActionError::Execution(format!(
            "invalid delay {}",
            ms.map(|v| v.to_string()).unwrap_or_default()
        ))),
    }
}

fn parse_delay(text: &str) -> Result<Duration, ActionError> {
    crate::content::parse_delay(text).ok_or_else(|| ActionError::Execution(format!("invalid delay '{}'", text)))
}

fn is_simple_name(location: &str) -> bool {
    let mut chars = location.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}
