use std::collections::{HashMap, HashSet};

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::engine::types::{Flow, StateId};

/// Pure predicate over the run context deciding whether a transition is eligible.
pub type Guard<C> = fn(&C) -> bool;

/// Enter/exit hook. Receives the run context and the adapter set handed to the run.
pub type Hook<S, C, A> = for<'a> fn(&'a mut C, &'a A) -> BoxFuture<'a, anyhow::Result<Flow<S>>>;

/// Errors detected while building a specification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("specification '{spec}': state '{state}' declared twice")]
    DuplicateState { spec: String, state: &'static str },

    #[error("specification '{spec}': start state '{state}' is not declared")]
    UndeclaredStart { spec: String, state: &'static str },

    #[error("specification '{spec}': transition '{label}' leaves undeclared state '{state}'")]
    UndeclaredSource {
        spec: String,
        label: String,
        state: &'static str,
    },

    #[error("specification '{spec}': transition '{label}' targets undeclared state '{state}'")]
    UndeclaredTarget {
        spec: String,
        label: String,
        state: &'static str,
    },

    #[error("specification '{spec}': transition '{label}' leaves end state '{state}'")]
    TransitionFromEnd {
        spec: String,
        label: String,
        state: &'static str,
    },

    #[error("specification '{spec}': state '{state}' is both terminal and fail")]
    TerminalAndFail { spec: String, state: &'static str },
}

/// Hooks attached to one state.
pub struct StateDef<S, C, A: ?Sized> {
    pub enter: Option<Hook<S, C, A>>,
    pub exit: Option<Hook<S, C, A>>,
}

impl<S, C, A: ?Sized> Default for StateDef<S, C, A> {
    fn default() -> Self {
        Self {
            enter: None,
            exit: None,
        }
    }
}

impl<S, C, A: ?Sized> StateDef<S, C, A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_enter(mut self, hook: Hook<S, C, A>) -> Self {
        self.enter = Some(hook);
        self
    }

    pub fn on_exit(mut self, hook: Hook<S, C, A>) -> Self {
        self.exit = Some(hook);
        self
    }
}

/// Directed edge between two states.
pub struct Transition<S, C> {
    pub from: S,
    pub to: S,
    pub guard: Option<Guard<C>>,
    pub label: String,
}

/// Immutable description of a workflow.
pub struct Specification<S, C, A: ?Sized> {
    name: String,
    version: String,
    start: S,
    terminal: HashSet<S>,
    fail: HashSet<S>,
    states: HashMap<S, StateDef<S, C, A>>,
    transitions: Vec<Transition<S, C>>,
    success: Option<Guard<C>>,
}

impl<S: StateId, C, A: ?Sized> Specification<S, C, A> {
    pub fn builder(name: &str, version: &str, start: S) -> SpecBuilder<S, C, A> {
        SpecBuilder {
            name: name.to_string(),
            version: version.to_string(),
            start,
            terminal: HashSet::new(),
            fail: HashSet::new(),
            states: Vec::new(),
            transitions: Vec::new(),
            success: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn start(&self) -> S {
        self.start
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    pub fn is_fail(&self, state: S) -> bool {
        self.fail.contains(&state)
    }

    pub fn state(&self, state: S) -> Option<&StateDef<S, C, A>> {
        self.states.get(&state)
    }

    /// Outgoing transitions of `state`, in declaration order.
    pub fn outgoing(&self, state: S) -> impl Iterator<Item = &Transition<S, C>> {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    pub fn transitions(&self) -> &[Transition<S, C>] {
        &self.transitions
    }

    /// Whether a run that reached a terminal state with this context succeeded.
    pub fn succeeded(&self, ctx: &C) -> bool {
        self.success.is_none_or(|check| check(ctx))
    }
}

/// Builder for [`Specification`].
pub struct SpecBuilder<S, C, A: ?Sized> {
    name: String,
    version: String,
    start: S,
    terminal: HashSet<S>,
    fail: HashSet<S>,
    states: Vec<(S, StateDef<S, C, A>)>,
    transitions: Vec<Transition<S, C>>,
    success: Option<Guard<C>>,
}

impl<S: StateId, C, A: ?Sized> SpecBuilder<S, C, A> {
    /// Declare a state with hooks.
    pub fn state(mut self, state: S, def: StateDef<S, C, A>) -> Self {
        self.states.push((state, def));
        self
    }

    /// Declare a state without hooks.
    pub fn plain(self, state: S) -> Self {
        self.state(state, StateDef::new())
    }

    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.insert(state);
        self
    }

    pub fn fail(mut self, state: S) -> Self {
        self.fail.insert(state);
        self
    }

    /// Unconditional transition.
    pub fn transition(mut self, from: S, to: S, label: &str) -> Self {
        self.transitions.push(Transition {
            from,
            to,
            guard: None,
            label: label.to_string(),
        });
        self
    }

    pub fn guarded(mut self, from: S, to: S, label: &str, guard: Guard<C>) -> Self {
        self.transitions.push(Transition {
            from,
            to,
            guard: Some(guard),
            label: label.to_string(),
        });
        self
    }

    /// Extra success condition checked when a terminal state is reached.
    pub fn success_when(mut self, check: Guard<C>) -> Self {
        self.success = Some(check);
        self
    }

    /// Build and check referential integrity.
    ///
    /// Terminal and fail states need not be declared; every other state a
    /// transition touches must be.
    pub fn build(self) -> Result<Specification<S, C, A>, SpecError> {
        let spec = self.name.clone();
        let mut declared = HashSet::new();
        for (state, _) in &self.states {
            if !declared.insert(*state) {
                return Err(SpecError::DuplicateState {
                    spec,
                    state: state.name(),
                });
            }
        }

        if let Some(state) = self.terminal.intersection(&self.fail).next() {
            return Err(SpecError::TerminalAndFail {
                spec,
                state: state.name(),
            });
        }

        let is_end = |s: &S| self.terminal.contains(s) || self.fail.contains(s);

        if !declared.contains(&self.start) && !is_end(&self.start) {
            return Err(SpecError::UndeclaredStart {
                spec,
                state: self.start.name(),
            });
        }

        for t in &self.transitions {
            if is_end(&t.from) {
                return Err(SpecError::TransitionFromEnd {
                    spec,
                    label: t.label.clone(),
                    state: t.from.name(),
                });
            }
            if !declared.contains(&t.from) {
                return Err(SpecError::UndeclaredSource {
                    spec,
                    label: t.label.clone(),
                    state: t.from.name(),
                });
            }
            if !declared.contains(&t.to) && !is_end(&t.to) {
                return Err(SpecError::UndeclaredTarget {
                    spec,
                    label: t.label.clone(),
                    state: t.to.name(),
                });
            }
        }

        Ok(self.build_unchecked())
    }

    /// Build without integrity checks. Undeclared states then surface at run
    /// time as `MissingState`.
    pub fn build_unchecked(self) -> Specification<S, C, A> {
        Specification {
            name: self.name,
            version: self.version,
            start: self.start,
            terminal: self.terminal,
            fail: self.fail,
            states: self.states.into_iter().collect(),
            transitions: self.transitions,
            success: self.success,
        }
    }
}
