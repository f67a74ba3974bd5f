//! The active configuration of a session.

use crate::definition::{Chart, StateId};
use std::collections::BTreeSet;

/// Set of active states, ordered by document order.
///
/// The chart root is implicitly active and never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveConfiguration {
    states: BTreeSet<StateId>,
}

impl ActiveConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, state: StateId) -> bool {
        self.states.contains(&state)
    }

    pub fn insert(&mut self, state: StateId) -> bool {
        self.states.insert(state)
    }

    pub fn remove(&mut self, state: StateId) -> bool {
        self.states.remove(&state)
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Active states in document order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = StateId> + '_ {
        self.states.iter().copied()
    }

    /// Active atomic states in document order.
    pub fn atomic_states<'a>(&'a self, chart: &'a Chart) -> impl Iterator<Item = StateId> + 'a {
        self.iter().filter(move |&s| chart.state(s).is_atomic())
    }

    /// Active proper descendants of `ancestor`, in document order.
    pub fn descendants_of<'a>(
        &'a self,
        chart: &'a Chart,
        ancestor: StateId,
    ) -> impl Iterator<Item = StateId> + 'a {
        self.iter().filter(move |&s| chart.is_descendant(s, ancestor))
    }

    /// Document ids of the active states, in document order.
    pub fn ids(&self, chart: &Chart) -> Vec<String> {
        self.iter().map(|s| chart.state(s).id.clone()).collect()
    }

    /// Checks the structural invariants of a legal configuration:
    /// ancestors of active states are active, a compound state has exactly
    /// one active child, and a parallel state has all or none of its
    /// regions active.
    pub fn is_legal(&self, chart: &Chart) -> bool {
        for s in self.iter() {
            let state = chart.state(s);
            if state.is_pseudo() {
                return false;
            }
            if let Some(parent) = state.parent {
                if parent != chart.root() && !self.contains(parent) {
                    return false;
                }
            }
        }

        let mut check = vec![chart.root()];
        check.extend(self.iter());
        for s in check {
            let state = chart.state(s);
            let active = state.children.iter().filter(|c| self.contains(**c)).count();
            if state.is_compound() && active != 1 {
                return false;
            }
            if state.is_parallel() && active != state.children.len() {
                return false;
            }
        }
        true
    }
}
