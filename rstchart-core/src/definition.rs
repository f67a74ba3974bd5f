//! Statechart graph types.
//!
//! Charts are described with a JSON (or YAML) DSL and compiled into an
//! arena of states indexed by [`StateId`]:
//!
//! ```json
//! {
//!   "name": "door",
//!   "initial": "closed",
//!   "states": [
//!     {"id": "closed", "transitions": [{"event": "open", "target": "opened"}]},
//!     {"id": "opened", "transitions": [{"event": "close", "target": "closed"}]}
//!   ]
//! }
//! ```
//!
//! State ids are assigned in document pre-order, so comparing two ids
//! compares their document order. Ancestors always sort before their
//! descendants.

use crate::content::{Action, Block, DataDecl, DoneData, InvokeSpec};
use crate::error::CoreError;
use crate::event::EventDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Index of a state in the chart arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(u32);

impl StateId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a transition in the chart arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionId(u32);

impl TransitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How much of a state's configuration a history pseudostate remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDepth {
    #[default]
    Shallow,
    Deep,
}

/// When data declarations are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// Every declaration is initialised when the session starts.
    #[default]
    Early,
    /// A state's declarations are initialised on its first entry.
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionType {
    #[default]
    External,
    /// Does not exit its compound source when all targets are inside it.
    Internal,
}

/// State kinds. Pseudostates (history, initial) are never active.
#[derive(Debug, Clone, PartialEq)]
pub enum StateKind {
    Atomic,
    /// `initial` is the default-entry transition.
    Compound { initial: TransitionId },
    Parallel,
    Final { done_data: Option<DoneData> },
    History {
        depth: HistoryDepth,
        default: TransitionId,
    },
    Initial,
}

/// A compiled state.
#[derive(Debug, Clone)]
pub struct State {
    pub id: String,
    pub kind: StateKind,
    pub parent: Option<StateId>,
    /// Child states in document order, pseudostates excluded.
    pub children: Vec<StateId>,
    /// History pseudostates owned by this state.
    pub history: Vec<StateId>,
    /// Selectable transitions in document order.
    pub transitions: Vec<TransitionId>,
    pub on_entry: Vec<Block>,
    pub on_exit: Vec<Block>,
    pub invokes: Vec<InvokeSpec>,
    pub data: Vec<DataDecl>,
}

impl State {
    /// Atomic and final states have no child states.
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final { .. })
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.kind, StateKind::Compound { .. })
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, StateKind::Parallel)
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, StateKind::Final { .. })
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History { .. })
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self.kind, StateKind::History { .. } | StateKind::Initial)
    }
}

/// A compiled transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub source: StateId,
    /// Empty for eventless transitions.
    pub events: Vec<EventDescriptor>,
    pub cond: Option<String>,
    pub targets: Vec<StateId>,
    pub kind: TransitionType,
    pub actions: Block,
}

impl Transition {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }
}

// =========================================================================
// Document form
// =========================================================================

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct StringOrSeqVisitor;

    impl<'de> Visitor<'de> for StringOrSeqVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut ids = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                ids.push(s);
            }
            Ok(ids)
        }
    }

    deserializer.deserialize_any(StringOrSeqVisitor)
}

/// Raw chart as stored/transmitted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "string_or_seq", skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,
    pub binding: Binding,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDecl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub states: Vec<StateDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Atomic,
    Compound,
    Parallel,
    Final,
    History,
    Initial,
}

/// Executable content blocks: one block as a list of actions, or several
/// as a list of lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Blocks {
    Many(Vec<Vec<Action>>),
    One(Vec<Action>),
}

impl Default for Blocks {
    fn default() -> Self {
        Blocks::Many(Vec::new())
    }
}

impl Blocks {
    fn is_empty(&self) -> bool {
        match self {
            Blocks::Many(b) => b.is_empty(),
            Blocks::One(b) => b.is_empty(),
        }
    }

    fn to_blocks(&self) -> Vec<Block> {
        match self {
            Blocks::Many(blocks) => blocks.clone(),
            Blocks::One(block) if block.is_empty() => Vec::new(),
            Blocks::One(block) => vec![block.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDocument {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateType>,
    #[serde(deserialize_with = "string_or_seq", skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryDepth>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDocument>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDocument>,
    #[serde(skip_serializing_if = "Blocks::is_empty")]
    pub on_entry: Blocks,
    #[serde(skip_serializing_if = "Blocks::is_empty")]
    pub on_exit: Blocks,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invoke: Vec<InvokeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_data: Option<DoneData>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDecl>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(deserialize_with = "string_or_seq", skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<String>,
    #[serde(rename = "type")]
    pub kind: TransitionType,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

// =========================================================================
// Compiled chart
// =========================================================================

/// Validated and indexed statechart graph.
#[derive(Debug, Clone)]
pub struct Chart {
    name: String,
    binding: Binding,
    script: Option<String>,
    states: Vec<State>,
    transitions: Vec<Transition>,
    index: HashMap<String, StateId>,
    /// Original document for storage and invocation.
    document: ChartDocument,
    /// Hash of the document for idempotent registration.
    checksum: String,
}

const ROOT: StateId = StateId(0);

impl Chart {
    /// Parses and validates a chart from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let doc: ChartDocument = serde_json::from_value(json.clone())?;
        Self::from_document(doc)
    }

    /// Parses and validates a chart from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, CoreError> {
        let doc: ChartDocument = serde_yaml::from_str(text)?;
        Self::from_document(doc)
    }

    /// Compiles a document into the arena form.
    pub fn from_document(document: ChartDocument) -> Result<Self, CoreError> {
        if document.states.is_empty() {
            return Err(CoreError::invalid("chart has no states"));
        }
        let name = document.name.clone().unwrap_or_else(|| "chart".to_string());

        let mut compiler = Compiler::default();
        compiler.allocate_root(&name, &document);
        compiler.compile_root(&document)?;

        let json_bytes = serde_json::to_vec(&document)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self {
            name,
            binding: document.binding,
            script: document.script.clone(),
            states: compiler.states,
            transitions: compiler.transitions,
            index: compiler.index,
            document,
            checksum,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    pub fn document(&self) -> &ChartDocument {
        &self.document
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// The implicit document root. It is never part of a configuration.
    pub fn root(&self) -> StateId {
        ROOT
    }

    pub fn state(&self, id: StateId) -> &State {
        &self.states[id.index()]
    }

    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.index()]
    }

    /// Looks up a state by its document id.
    pub fn lookup(&self, id: &str) -> Option<StateId> {
        self.index.get(id).copied()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// All states in document order, root first.
    pub fn state_ids(&self) -> impl Iterator<Item = StateId> + '_ {
        (0..self.states.len() as u32).map(StateId)
    }

    /// Returns true if `state` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, state: StateId, ancestor: StateId) -> bool {
        let mut current = self.state(state).parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.state(p).parent;
        }
        false
    }

    /// Proper ancestors of `state`, nearest first, stopping before `upto`
    /// (or including the root when `upto` is `None`).
    pub fn proper_ancestors(&self, state: StateId, upto: Option<StateId>) -> Vec<StateId> {
        let mut out = Vec::new();
        let mut current = self.state(state).parent;
        while let Some(p) = current {
            if Some(p) == upto {
                break;
            }
            out.push(p);
            current = self.state(p).parent;
        }
        out
    }

    /// Least common compound ancestor: the nearest proper ancestor of the
    /// first state that is compound (or the root) and contains all others.
    pub fn lcca(&self, states: &[StateId]) -> StateId {
        let Some((&head, tail)) = states.split_first() else {
            return ROOT;
        };
        for anc in self.proper_ancestors(head, None) {
            if (anc == ROOT || self.state(anc).is_compound())
                && tail.iter().all(|&s| self.is_descendant(s, anc))
            {
                return anc;
            }
        }
        ROOT
    }
}

#[derive(Default)]
struct Compiler {
    states: Vec<State>,
    transitions: Vec<Transition>,
    index: HashMap<String, StateId>,
    generated: usize,
}

impl Compiler {
    fn push_state(&mut self, id: String, parent: Option<StateId>) -> StateId {
        let sid = StateId(self.states.len() as u32);
        self.states.push(State {
            id,
            kind: StateKind::Atomic,
            parent,
            children: Vec::new(),
            history: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            invokes: Vec::new(),
            data: Vec::new(),
        });
        sid
    }

    fn allocate_root(&mut self, name: &str, document: &ChartDocument) {
        let root = self.push_state(name.to_string(), None);
        self.index.insert(name.to_string(), root);
        self.states[root.index()].data = document.datamodel.clone();
    }

    /// First pass: assign ids in pre-order so that targets can be resolved.
    fn allocate(&mut self, doc: &StateDocument, parent: StateId) -> Result<StateId, CoreError> {
        let id = if doc.id.is_empty() {
            self.generated += 1;
            format!("__generated_{}", self.generated)
        } else {
            doc.id.clone()
        };
        if self.index.contains_key(&id) {
            return Err(CoreError::invalid(format!("duplicate state id '{}'", id)));
        }
        let sid = self.push_state(id.clone(), Some(parent));
        self.index.insert(id, sid);
        for child in &doc.states {
            self.allocate(child, sid)?;
        }
        Ok(sid)
    }

    fn compile_root(&mut self, document: &ChartDocument) -> Result<(), CoreError> {
        let mut top = Vec::new();
        for doc in &document.states {
            top.push(self.allocate(doc, ROOT)?);
        }
        for (sid, doc) in top.iter().zip(&document.states) {
            self.compile_state(*sid, doc)?;
        }
        let initial = self.default_initial(ROOT, &document.initial, &top)?;

        let mut children = Vec::new();
        let mut history = Vec::new();
        for sid in top {
            match self.states[sid.index()].kind {
                StateKind::History { .. } => history.push(sid),
                StateKind::Initial => {}
                _ => children.push(sid),
            }
        }
        let root = &mut self.states[ROOT.index()];
        root.kind = StateKind::Compound { initial };
        root.children = children;
        root.history = history;
        Ok(())
    }

    fn resolve(&self, ids: &[String], context: &str) -> Result<Vec<StateId>, CoreError> {
        ids.iter()
            .map(|id| {
                self.index.get(id).copied().ok_or_else(|| {
                    CoreError::invalid(format!("{} references unknown state '{}'", context, id))
                })
            })
            .collect()
    }

    fn push_transition(&mut self, transition: Transition) -> TransitionId {
        let tid = TransitionId(self.transitions.len() as u32);
        self.transitions.push(transition);
        tid
    }

    fn compile_transition(
        &mut self,
        source: StateId,
        doc: &TransitionDocument,
    ) -> Result<TransitionId, CoreError> {
        let context = format!("transition from '{}'", self.states[source.index()].id);
        let targets = self.resolve(&doc.target, &context)?;
        Ok(self.push_transition(Transition {
            source,
            events: doc
                .event
                .as_deref()
                .map(EventDescriptor::parse_list)
                .unwrap_or_default(),
            cond: doc.cond.clone(),
            targets,
            kind: doc.kind,
            actions: doc.actions.clone(),
        }))
    }

    /// Second pass: kinds, transitions and content.
    fn compile_state(&mut self, sid: StateId, doc: &StateDocument) -> Result<(), CoreError> {
        let children = self.direct_children(sid);
        for (child, child_doc) in children.iter().zip(&doc.states) {
            self.compile_state(*child, child_doc)?;
        }

        let id = self.states[sid.index()].id.clone();
        let kind = match doc.kind {
            Some(StateType::Parallel) => {
                if doc.states.is_empty() {
                    return Err(CoreError::invalid(format!(
                        "parallel state '{}' has no regions",
                        id
                    )));
                }
                StateKind::Parallel
            }
            Some(StateType::Final) => {
                if !doc.states.is_empty() || !doc.transitions.is_empty() {
                    return Err(CoreError::invalid(format!(
                        "final state '{}' cannot have children or transitions",
                        id
                    )));
                }
                StateKind::Final {
                    done_data: doc.done_data.clone(),
                }
            }
            Some(StateType::History) => self.compile_history(sid, doc)?,
            Some(StateType::Initial) => self.compile_initial(sid, doc)?,
            Some(StateType::Atomic) if !doc.states.is_empty() => {
                return Err(CoreError::invalid(format!(
                    "atomic state '{}' cannot have children",
                    id
                )));
            }
            Some(StateType::Compound) if doc.states.is_empty() => {
                return Err(CoreError::invalid(format!(
                    "compound state '{}' has no children",
                    id
                )));
            }
            _ if doc.states.is_empty() => StateKind::Atomic,
            _ => {
                let initial = self.default_initial(sid, &doc.initial, &children)?;
                StateKind::Compound { initial }
            }
        };

        let pseudo = matches!(kind, StateKind::History { .. } | StateKind::Initial);
        if !pseudo {
            let mut transitions = Vec::new();
            for t in &doc.transitions {
                transitions.push(self.compile_transition(sid, t)?);
            }
            let state = &mut self.states[sid.index()];
            state.transitions = transitions;
        }

        let mut proper_children = Vec::new();
        let mut history = Vec::new();
        for child in children {
            match self.states[child.index()].kind {
                StateKind::History { .. } => history.push(child),
                StateKind::Initial => {}
                _ => proper_children.push(child),
            }
        }
        if matches!(kind, StateKind::Parallel) && proper_children.is_empty() {
            return Err(CoreError::invalid(format!(
                "parallel state '{}' has no regions",
                id
            )));
        }

        let state = &mut self.states[sid.index()];
        state.kind = kind;
        state.children = proper_children;
        state.history = history;
        state.on_entry = doc.on_entry.to_blocks();
        state.on_exit = doc.on_exit.to_blocks();
        state.invokes = doc.invoke.clone();
        state.data = doc.datamodel.clone();
        Ok(())
    }

    /// Direct children in document order. Pre-order allocation keeps them
    /// in ascending arena order.
    fn direct_children(&self, parent: StateId) -> Vec<StateId> {
        self.states
            .iter()
            .enumerate()
            .skip(parent.index() + 1)
            .filter(|(_, s)| s.parent == Some(parent))
            .map(|(i, _)| StateId(i as u32))
            .collect()
    }

    fn compile_history(&mut self, sid: StateId, doc: &StateDocument) -> Result<StateKind, CoreError> {
        let id = self.states[sid.index()].id.clone();
        let parent = self.states[sid.index()]
            .parent
            .ok_or_else(|| CoreError::invalid("history without parent"))?;
        if !doc.states.is_empty() {
            return Err(CoreError::invalid(format!(
                "history state '{}' cannot have children",
                id
            )));
        }
        let [default] = doc.transitions.as_slice() else {
            return Err(CoreError::invalid(format!(
                "history state '{}' needs exactly one default transition",
                id
            )));
        };
        if default.event.is_some() || default.cond.is_some() || default.target.is_empty() {
            return Err(CoreError::invalid(format!(
                "default transition of history '{}' must be an unconditional targeted transition",
                id
            )));
        }
        let tid = self.compile_transition(sid, default)?;
        for &target in &self.transitions[tid.index()].targets {
            if !self.is_descendant(target, parent) {
                return Err(CoreError::invalid(format!(
                    "history '{}' default target '{}' is outside its parent",
                    id,
                    self.states[target.index()].id
                )));
            }
        }
        Ok(StateKind::History {
            depth: doc.history.unwrap_or_default(),
            default: tid,
        })
    }

    fn compile_initial(&mut self, sid: StateId, doc: &StateDocument) -> Result<StateKind, CoreError> {
        let id = self.states[sid.index()].id.clone();
        let parent = self.states[sid.index()]
            .parent
            .ok_or_else(|| CoreError::invalid("initial pseudostate without parent"))?;
        let [transition] = doc.transitions.as_slice() else {
            return Err(CoreError::invalid(format!(
                "initial pseudostate '{}' needs exactly one transition",
                id
            )));
        };
        if transition.event.is_some() || transition.cond.is_some() || transition.target.is_empty() {
            return Err(CoreError::invalid(format!(
                "transition of initial pseudostate '{}' must be an unconditional targeted transition",
                id
            )));
        }
        let tid = self.compile_transition(sid, transition)?;
        for &target in &self.transitions[tid.index()].targets {
            if !self.is_descendant(target, parent) {
                return Err(CoreError::invalid(format!(
                    "initial target '{}' is outside '{}'",
                    self.states[target.index()].id,
                    self.states[parent.index()].id
                )));
            }
        }
        Ok(StateKind::Initial)
    }

    /// Resolves the default-entry transition of a compound state (or the
    /// root): `initial` attribute, initial pseudostate, or first child.
    fn default_initial(
        &mut self,
        sid: StateId,
        initial: &[String],
        children: &[StateId],
    ) -> Result<TransitionId, CoreError> {
        let id = self.states[sid.index()].id.clone();
        let pseudo: Vec<StateId> = children
            .iter()
            .copied()
            .filter(|c| matches!(self.states[c.index()].kind, StateKind::Initial))
            .collect();
        if pseudo.len() > 1 {
            return Err(CoreError::invalid(format!(
                "state '{}' has more than one initial pseudostate",
                id
            )));
        }

        if let Some(&pseudo) = pseudo.first() {
            if !initial.is_empty() {
                return Err(CoreError::invalid(format!(
                    "state '{}' has both an initial attribute and an initial pseudostate",
                    id
                )));
            }
            let tid = self
                .transitions
                .iter()
                .position(|t| t.source == pseudo)
                .map(|i| TransitionId(i as u32))
                .ok_or_else(|| CoreError::invalid("initial pseudostate without transition"))?;
            return Ok(tid);
        }

        let targets = if initial.is_empty() {
            let first = children
                .iter()
                .copied()
                .find(|c| !self.states[c.index()].is_pseudo())
                .ok_or_else(|| CoreError::invalid(format!("state '{}' has no child states", id)))?;
            vec![first]
        } else {
            let targets = self.resolve(initial, &format!("initial of '{}'", id))?;
            for &t in &targets {
                if !self.is_descendant(t, sid) {
                    return Err(CoreError::invalid(format!(
                        "initial target '{}' is outside '{}'",
                        self.states[t.index()].id,
                        id
                    )));
                }
            }
            targets
        };

        Ok(self.push_transition(Transition {
            source: sid,
            events: Vec::new(),
            cond: None,
            targets,
            kind: TransitionType::Internal,
            actions: Vec::new(),
        }))
    }

    fn is_descendant(&self, state: StateId, ancestor: StateId) -> bool {
        let mut current = self.states[state.index()].parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.states[p.index()].parent;
        }
        false
    }
}
