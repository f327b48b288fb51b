use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a state inside one specification.
///
/// Implemented by a closed enum per specification so that transition tables
/// can be checked when the specification is built.
pub trait StateId: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn name(self) -> &'static str;
}

/// Fail states owned by the engine itself rather than by a specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineFail {
    EngineTimeout,
    ForbiddenState,
    MissingState,
    ActionError,
    GuardsBlocked,
    Stuck,
}

impl EngineFail {
    pub fn name(self) -> &'static str {
        match self {
            EngineFail::EngineTimeout => "EngineTimeout",
            EngineFail::ForbiddenState => "ForbiddenState",
            EngineFail::MissingState => "MissingState",
            EngineFail::ActionError => "ActionError",
            EngineFail::GuardsBlocked => "GuardsBlocked",
            EngineFail::Stuck => "Stuck",
        }
    }
}

impl fmt::Display for EngineFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a run stopped: one of the specification's own states, or an
/// engine-level fail state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndState<S> {
    State(S),
    Engine(EngineFail),
}

impl<S: StateId> EndState<S> {
    pub fn name(&self) -> &'static str {
        match self {
            EndState::State(s) => s.name(),
            EndState::Engine(fail) => fail.name(),
        }
    }

    /// The specification state, if the run ended in one.
    pub fn state(&self) -> Option<S> {
        match self {
            EndState::State(s) => Some(*s),
            EndState::Engine(_) => None,
        }
    }
}

impl<S: StateId> fmt::Display for EndState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a hook tells the engine once it has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<S> {
    /// Keep going: evaluate guards (enter hook) or take the transition (exit hook).
    Continue,
    /// End the run right here in the named fail state.
    Fail { state: S, note: String },
}

impl<S> Flow<S> {
    pub fn fail(state: S, note: impl Into<String>) -> Self {
        Flow::Fail {
            state,
            note: note.into(),
        }
    }
}

/// Kind of trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Enter,
    Exit,
    Guard,
    Transition,
    Error,
    Done,
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceKind::Enter => write!(f, "enter"),
            TraceKind::Exit => write!(f, "exit"),
            TraceKind::Guard => write!(f, "guard"),
            TraceKind::Transition => write!(f, "transition"),
            TraceKind::Error => write!(f, "error"),
            TraceKind::Done => write!(f, "done"),
        }
    }
}

/// Error descriptor attached to `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// `hook`, `panic`, `fail` or `engine`.
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// One immutable entry of a run's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts: DateTime<Utc>,
    pub kind: TraceKind,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub guard: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorInfo>,
}

impl TraceEvent {
    pub fn new(kind: TraceKind, state: &str) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            state: state.to_string(),
            to: None,
            label: None,
            guard: None,
            error: None,
        }
    }
}

/// Per-run engine options.
#[derive(Debug, Clone)]
pub struct RunOptions<S> {
    /// Ceiling on the number of states processed in one run.
    pub max_steps: usize,
    /// When set, entering any state outside this set ends the run in `ForbiddenState`.
    pub allowed_states: Option<HashSet<S>>,
}

pub const DEFAULT_MAX_STEPS: usize = 64;

impl<S> Default for RunOptions<S> {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            allowed_states: None,
        }
    }
}

impl<S: StateId> RunOptions<S> {
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn allow(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.allowed_states = Some(states.into_iter().collect());
        self
    }
}

/// Terminal artifact of a run. Built once when the run stops.
#[derive(Debug, Clone)]
pub struct RunResult<S, C> {
    pub ok: bool,
    pub spec: String,
    pub version: String,
    pub start: S,
    pub end: EndState<S>,
    pub steps: usize,
    pub trace: Vec<TraceEvent>,
    pub ctx: C,
    /// Note from an explicit fail or the message of the error that ended the run.
    pub note: Option<String>,
}

impl<S: StateId, C> RunResult<S, C> {
    /// True if the run stopped in the given specification state.
    pub fn ended_in(&self, state: S) -> bool {
        self.end == EndState::State(state)
    }

    /// Events of one kind, in order.
    pub fn events(&self, kind: TraceKind) -> impl Iterator<Item = &TraceEvent> {
        self.trace.iter().filter(move |e| e.kind == kind)
    }

    /// Names of the states entered, in order.
    pub fn path(&self) -> Vec<&str> {
        self.events(TraceKind::Enter)
            .map(|e| e.state.as_str())
            .collect()
    }
}
