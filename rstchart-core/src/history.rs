//! History recording and resolution.

use crate::configuration::ActiveConfiguration;
use crate::definition::{Chart, HistoryDepth, StateId, StateKind};
use std::collections::HashMap;

/// Recorded history per history pseudostate.
#[derive(Debug, Clone, Default)]
pub struct HistoryTable {
    records: HashMap<StateId, Vec<StateId>>,
}

impl HistoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every history pseudostate owned by `exiting` against the
    /// configuration as it was before any exit of the current microstep.
    pub fn record_on_exit(&mut self, chart: &Chart, exiting: StateId, configuration: &ActiveConfiguration) {
        for &h in &chart.state(exiting).history {
            let StateKind::History { depth, .. } = chart.state(h).kind else {
                continue;
            };
            let recorded: Vec<StateId> = match depth {
                HistoryDepth::Deep => configuration
                    .descendants_of(chart, exiting)
                    .filter(|&s| chart.state(s).is_atomic())
                    .collect(),
                HistoryDepth::Shallow => configuration
                    .iter()
                    .filter(|&s| chart.state(s).parent == Some(exiting))
                    .collect(),
            };
            tracing::debug!(history = %chart.state(h).id, states = recorded.len(), "recorded history");
            self.records.insert(h, recorded);
        }
    }

    /// Recorded target set for a history pseudostate, if it was ever recorded.
    pub fn resolve(&self, history: StateId) -> Option<&[StateId]> {
        self.records.get(&history).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
