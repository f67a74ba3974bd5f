//! Transition selection and conflict resolution.

use crate::configuration::ActiveConfiguration;
use crate::definition::{Chart, TransitionId};
use crate::event::{matches_any, Event};
use crate::history::HistoryTable;
use crate::planner::exit_set;
use std::collections::BTreeSet;

/// Selects the optimal enabled transition set for `event`, or the eventless
/// transitions when `event` is `None`.
///
/// `guard` is asked for every candidate whose descriptor matches; it returns
/// whether the transition's condition holds.
pub fn select_transitions<G>(
    chart: &Chart,
    configuration: &ActiveConfiguration,
    history: &HistoryTable,
    event: Option<&Event>,
    mut guard: G,
) -> Vec<TransitionId>
where
    G: FnMut(TransitionId) -> bool,
{
    let mut enabled: Vec<TransitionId> = Vec::new();

    for atomic in configuration.atomic_states(chart) {
        let mut chain = vec![atomic];
        chain.extend(chart.proper_ancestors(atomic, Some(chart.root())));

        'chain: for state in chain {
            for &tid in &chart.state(state).transitions {
                let t = chart.transition(tid);
                let matches = match event {
                    None => t.is_eventless(),
                    Some(e) => !t.is_eventless() && matches_any(&t.events, &e.name),
                };
                if matches && guard(tid) {
                    if !enabled.contains(&tid) {
                        enabled.push(tid);
                    }
                    break 'chain;
                }
            }
        }
    }

    remove_conflicting(chart, configuration, history, enabled)
}

/// Drops transitions whose exit sets intersect an already kept one. A
/// transition from an ancestor source preempts one from its descendant;
/// otherwise the earlier selection wins.
pub fn remove_conflicting(
    chart: &Chart,
    configuration: &ActiveConfiguration,
    history: &HistoryTable,
    enabled: Vec<TransitionId>,
) -> Vec<TransitionId> {
    let mut filtered: Vec<(TransitionId, BTreeSet<_>)> = Vec::with_capacity(enabled.len());

    for t1 in enabled {
        let exit1: BTreeSet<_> = exit_set(chart, configuration, history, &[t1]).into_iter().collect();
        let source1 = chart.transition(t1).source;
        let mut preempted = false;
        let mut to_remove = Vec::new();

        for (t2, exit2) in &filtered {
            if exit1.is_disjoint(exit2) {
                continue;
            }
            if chart.is_descendant(chart.transition(*t2).source, source1) {
                to_remove.push(*t2);
            } else {
                preempted = true;
                break;
            }
        }

        if !preempted {
            filtered.retain(|(t, _)| !to_remove.contains(t));
            filtered.push((t1, exit1));
        }
    }

    filtered.into_iter().map(|(t, _)| t).collect()
}
