//! Exit and entry set computation.

use crate::configuration::ActiveConfiguration;
use crate::definition::{Chart, StateId, StateKind, TransitionId, TransitionType};
use crate::history::HistoryTable;
use std::collections::{BTreeMap, BTreeSet};

/// States to enter for one microstep, plus what default content to run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EntryPlan {
    /// Ascending id order is entry order.
    pub states: BTreeSet<StateId>,
    /// Compound states entered through their initial transition.
    pub default_entry: BTreeSet<StateId>,
    /// Parent state to history default transition whose content must run.
    pub default_history: BTreeMap<StateId, TransitionId>,
}

/// Targets of a transition with history pseudostates replaced by what they
/// stand for.
pub fn effective_targets(chart: &Chart, history: &HistoryTable, transition: TransitionId) -> Vec<StateId> {
    let mut out = Vec::new();
    for &target in &chart.transition(transition).targets {
        push_effective(chart, history, target, &mut out);
    }
    out
}

fn push_effective(chart: &Chart, history: &HistoryTable, target: StateId, out: &mut Vec<StateId>) {
    match chart.state(target).kind {
        StateKind::History { default, .. } => match history.resolve(target) {
            Some(recorded) => {
                for &s in recorded {
                    if !out.contains(&s) {
                        out.push(s);
                    }
                }
            }
            None => {
                for &t in &chart.transition(default).targets {
                    push_effective(chart, history, t, out);
                }
            }
        },
        _ => {
            if !out.contains(&target) {
                out.push(target);
            }
        }
    }
}

/// The state whose active descendants a transition exits, or `None` for
/// targetless transitions.
pub fn transition_domain(chart: &Chart, history: &HistoryTable, transition: TransitionId) -> Option<StateId> {
    let targets = effective_targets(chart, history, transition);
    if targets.is_empty() {
        return None;
    }
    let t = chart.transition(transition);
    let source = chart.state(t.source);
    if t.kind == TransitionType::Internal
        && (source.is_compound() || t.source == chart.root())
        && targets.iter().all(|&s| chart.is_descendant(s, t.source))
    {
        return Some(t.source);
    }
    let mut states = Vec::with_capacity(targets.len() + 1);
    states.push(t.source);
    states.extend(targets);
    Some(chart.lcca(&states))
}

/// Active states exited by the given transitions, in exit order
/// (descendants first, reverse document order).
pub fn exit_set(
    chart: &Chart,
    configuration: &ActiveConfiguration,
    history: &HistoryTable,
    transitions: &[TransitionId],
) -> Vec<StateId> {
    let mut exit = BTreeSet::new();
    for &t in transitions {
        if chart.transition(t).is_targetless() {
            continue;
        }
        if let Some(domain) = transition_domain(chart, history, t) {
            exit.extend(configuration.descendants_of(chart, domain));
        }
    }
    exit.into_iter().rev().collect()
}

/// Computes the entry plan for the given transitions.
pub fn entry_set(chart: &Chart, history: &HistoryTable, transitions: &[TransitionId]) -> EntryPlan {
    let mut planner = EntryPlanner {
        chart,
        history,
        plan: EntryPlan::default(),
    };
    for &t in transitions {
        for &target in &chart.transition(t).targets {
            planner.add_descendants(target);
        }
        let Some(domain) = transition_domain(chart, history, t) else {
            continue;
        };
        for s in effective_targets(chart, history, t) {
            planner.add_ancestors(s, domain);
        }
    }
    planner.plan
}

struct EntryPlanner<'a> {
    chart: &'a Chart,
    history: &'a HistoryTable,
    plan: EntryPlan,
}

impl<'a> EntryPlanner<'a> {
    fn add_descendants(&mut self, state: StateId) {
        let chart = self.chart;
        match chart.state(state).kind {
            StateKind::History { default, .. } => {
                let Some(parent) = chart.state(state).parent else {
                    return;
                };
                let targets: Vec<StateId> = match self.history.resolve(state) {
                    Some(recorded) => recorded.to_vec(),
                    None => {
                        self.plan.default_history.insert(parent, default);
                        chart.transition(default).targets.clone()
                    }
                };
                for &s in &targets {
                    self.add_descendants(s);
                }
                for &s in &targets {
                    self.add_ancestors(s, parent);
                }
            }
            StateKind::Compound { initial } => {
                self.plan.states.insert(state);
                self.plan.default_entry.insert(state);
                let targets = chart.transition(initial).targets.clone();
                for &s in &targets {
                    self.add_descendants(s);
                }
                for &s in &targets {
                    self.add_ancestors(s, state);
                }
            }
            StateKind::Parallel => {
                self.plan.states.insert(state);
                self.add_missing_regions(state);
            }
            StateKind::Initial => {}
            StateKind::Atomic | StateKind::Final { .. } => {
                self.plan.states.insert(state);
            }
        }
    }

    fn add_ancestors(&mut self, state: StateId, ancestor: StateId) {
        for anc in self.chart.proper_ancestors(state, Some(ancestor)) {
            if anc == self.chart.root() {
                continue;
            }
            self.plan.states.insert(anc);
            if self.chart.state(anc).is_parallel() {
                self.add_missing_regions(anc);
            }
        }
    }

    fn add_missing_regions(&mut self, parallel: StateId) {
        let regions = self.chart.state(parallel).children.clone();
        for region in regions {
            let covered = self
                .plan
                .states
                .iter()
                .any(|&s| s == region || self.chart.is_descendant(s, region));
            if !covered {
                self.add_descendants(region);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chart() -> Chart {
        Chart::from_json(&json!({
            "states": [
                {"id": "s", "initial": "s1", "states": [
                    {"id": "h", "type": "history", "history": "deep",
                     "transitions": [{"target": "s2"}]},
                    {"id": "s1", "transitions": [
                        {"event": "sib", "target": "s2"},
                        {"event": "self", "target": "s1"},
                        {"event": "stay"}
                    ]},
                    {"id": "s2", "states": [{"id": "s21"}, {"id": "s22"}]}
                ], "transitions": [
                    {"event": "inner", "target": "s2", "type": "internal"},
                    {"event": "outer", "target": "s2"},
                    {"event": "leave", "target": "p"}
                ]},
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "states": [{"id": "a"}, {"id": "b"}]},
                    {"id": "r2", "states": [{"id": "c"}]}
                ], "transitions": [{"event": "back", "target": "h"}]}
            ]
        }))
        .unwrap()
    }

    fn transition(chart: &Chart, state: &str, index: usize) -> TransitionId {
        chart.state(chart.lookup(state).unwrap()).transitions[index]
    }

    fn ids(chart: &Chart, states: impl IntoIterator<Item = StateId>) -> Vec<String> {
        states.into_iter().map(|s| chart.state(s).id.clone()).collect()
    }

    fn config(chart: &Chart, ids: &[&str]) -> ActiveConfiguration {
        let mut c = ActiveConfiguration::new();
        for id in ids {
            c.insert(chart.lookup(id).unwrap());
        }
        c
    }

    #[test]
    fn test_domains() {
        let chart = chart();
        let history = HistoryTable::new();
        let s = chart.lookup("s").unwrap();

        assert_eq!(transition_domain(&chart, &history, transition(&chart, "s1", 0)), Some(s));
        assert_eq!(transition_domain(&chart, &history, transition(&chart, "s1", 2)), None);
        // internal transition from a compound keeps the source
        assert_eq!(transition_domain(&chart, &history, transition(&chart, "s", 0)), Some(s));
        // external transition to a descendant exits the source
        assert_eq!(
            transition_domain(&chart, &history, transition(&chart, "s", 1)),
            Some(chart.root())
        );
    }

    #[test]
    fn test_self_transition_exits_and_reenters() {
        let chart = chart();
        let history = HistoryTable::new();
        let c = config(&chart, &["s", "s1"]);
        let t = transition(&chart, "s1", 1);
        assert_eq!(ids(&chart, exit_set(&chart, &c, &history, &[t])), vec!["s1"]);
        assert_eq!(ids(&chart, entry_set(&chart, &history, &[t]).states), vec!["s1"]);
    }

    #[test]
    fn test_exit_order_is_reverse_document_order() {
        let chart = chart();
        let history = HistoryTable::new();
        let c = config(&chart, &["p", "r1", "a", "r2", "c"]);
        let t = transition(&chart, "p", 0);
        assert_eq!(
            ids(&chart, exit_set(&chart, &c, &history, &[t])),
            vec!["c", "r2", "a", "r1", "p"]
        );
    }

    #[test]
    fn test_entering_parallel_adds_all_regions() {
        let chart = chart();
        let history = HistoryTable::new();
        let plan = entry_set(&chart, &history, &[transition(&chart, "s", 2)]);
        assert_eq!(ids(&chart, plan.states.clone()), vec!["p", "r1", "a", "r2", "c"]);
        assert!(plan.default_entry.contains(&chart.lookup("r1").unwrap()));
    }

    #[test]
    fn test_history_default_and_recorded() {
        let chart = chart();
        let back = transition(&chart, "p", 0);
        let s = chart.lookup("s").unwrap();

        let history = HistoryTable::new();
        let plan = entry_set(&chart, &history, &[back]);
        assert_eq!(ids(&chart, plan.states.clone()), vec!["s", "s2", "s21"]);
        assert!(plan.default_history.contains_key(&s));

        let mut history = HistoryTable::new();
        history.record_on_exit(&chart, s, &config(&chart, &["s", "s2", "s22"]));
        let plan = entry_set(&chart, &history, &[back]);
        assert_eq!(ids(&chart, plan.states.clone()), vec!["s", "s2", "s22"]);
        assert!(plan.default_history.is_empty());
        assert!(!plan.default_entry.contains(&chart.lookup("s2").unwrap()));
    }
}
