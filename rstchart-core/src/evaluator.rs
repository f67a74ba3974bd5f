//! The expression evaluator capability.
//!
//! The engine never interprets guards or expressions itself. Each session
//! owns one [`Evaluator`] that holds the chart's variables, and every call
//! receives an [`EvalContext`] carrying the system variables and a view of
//! the active configuration (for `In()`).

use crate::configuration::ActiveConfiguration;
use crate::definition::Chart;
use crate::error::EvalError;
use crate::event::Event;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-session system variables.
#[derive(Debug, Clone, Default)]
pub struct SystemVariables {
    pub session_id: String,
    pub name: String,
    /// Session id of the invoking parent, if any.
    pub parent: Option<String>,
    /// Event I/O processors: type name to location.
    pub ioprocessors: BTreeMap<String, Value>,
    /// The event being processed (`_event`).
    pub event: Option<Event>,
}

impl SystemVariables {
    /// `_event` as a value, or null before the first event.
    pub fn event_value(&self) -> Value {
        self.event.as_ref().map(Event::to_value).unwrap_or(Value::Null)
    }

    pub fn ioprocessors_value(&self) -> Value {
        Value::Object(self.ioprocessors.clone().into_iter().collect())
    }
}

/// Read-only view handed to every evaluator call.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub system: &'a SystemVariables,
    pub chart: &'a Chart,
    pub configuration: &'a ActiveConfiguration,
}

impl<'a> EvalContext<'a> {
    /// `In(id)`: true if the named state is active.
    pub fn in_state(&self, id: &str) -> bool {
        match self.chart.lookup(id) {
            Some(sid) => self.configuration.contains(sid),
            None => false,
        }
    }
}

/// Variable store plus expression language.
pub trait Evaluator: Send {
    /// Creates (or overwrites) a top-level variable.
    fn declare(&mut self, id: &str, value: Value);

    /// Evaluates a condition to a boolean.
    fn evaluate_guard(&mut self, expr: &str, ctx: &EvalContext<'_>) -> Result<bool, EvalError>;

    /// Evaluates an expression to a value.
    fn evaluate_expr(&mut self, expr: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError>;

    /// Stores `value` at `location`. Fails if the location was never declared.
    fn assign(&mut self, location: &str, value: Value, ctx: &EvalContext<'_>) -> Result<(), EvalError>;

    /// Runs a script body.
    fn execute_script(&mut self, source: &str, ctx: &EvalContext<'_>) -> Result<(), EvalError>;

    /// Returns true if `location` names a declared variable.
    fn has_location(&self, location: &str) -> bool;

    /// Snapshot of the declared variables, for inspection.
    fn variables(&self) -> Value {
        Value::Null
    }
}

/// Builds a fresh evaluator for each new session (including children).
pub type EvaluatorFactory = Arc<dyn Fn() -> Box<dyn Evaluator> + Send + Sync>;
