//! Executable content, data declarations and invoke descriptions.
//!
//! Actions use an externally tagged JSON form:
//!
//! ```json
//! [
//!   {"assign": {"location": "count", "expr": "count + 1"}},
//!   {"if": {"cond": "count > 3", "then": [{"raise": {"event": "full"}}]}},
//!   {"send": {"event": "tick", "delay": "1s", "id": "timer"}}
//! ]
//! ```

use crate::definition::ChartDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A block of executable content. An error in one item skips the rest of
/// the block.
pub type Block = Vec<Action>;

/// One item of executable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Enqueue an event on the internal queue.
    Raise { event: String },

    Send(SendSpec),

    /// Cancel a delayed send by id.
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        send_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        send_id_expr: Option<String>,
    },

    Assign {
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },

    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },

    Script { source: String },

    If {
        cond: String,
        #[serde(default)]
        then: Vec<Action>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_if: Vec<ElseIf>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<Action>,
    },

    Foreach {
        array: String,
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        #[serde(default)]
        actions: Vec<Action>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElseIf {
    pub cond: String,
    #[serde(default)]
    pub then: Vec<Action>,
}

/// A `send` action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_expr: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub send_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_location: Option<String>,
    /// Delay such as `"500ms"` or `"2s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_expr: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub namelist: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentSpec>,
}

/// A named value passed with a send, invoke or done data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Inline payload: either an expression or a literal value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Payload of the completion event raised when a final state is entered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DoneData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

/// A variable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDecl {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// An `invoke` attached to a state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_location: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub invoke_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_expr: Option<String>,
    /// Name of a registered chart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_expr: Option<String>,
    /// Inline child chart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Box<ChartDocument>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub namelist: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    pub autoforward: bool,
    /// Runs before transition selection for every event from this child.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<Action>,
}

/// Parses a delay like `"250ms"`, `"1.5s"`, `"2m"` or a bare number of
/// milliseconds.
pub fn parse_delay(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (number, scale) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1_000.0)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = text.strip_suffix('h') {
        (n, 3_600_000.0)
    } else {
        (text, 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_micros((value * scale * 1_000.0).round() as u64))
}
