//! Admission control: a scored gate that approves, throttles or denies a
//! requested action.

use std::fmt;
use std::future::ready;

use anyhow::Result;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::engine::types::{Flow, RunOptions, RunResult, StateId};
use crate::engine::{SpecError, Specification, StateDef};

pub const GOVERNOR_NAME: &str = "governor";
pub const GOVERNOR_VERSION: &str = "1.0.0";

/// Below this, the signal set itself is considered misconfigured.
pub const SAFETY_FLOOR: f64 = 20.0;
pub const RISK_BUDGET_FLOOR: f64 = 10.0;
pub const REGIME_ALIGNMENT_FLOOR: f64 = 25.0;

// safety, regime alignment, conviction, risk budget, execution allowance
const WEIGHTS: [f64; 5] = [0.30, 0.25, 0.20, 0.15, 0.10];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GovernorState {
    Start,
    Normalize,
    Gate,
    Score,
    Approved,
    Throttled,
    Denied,
    BadConfig,
}

impl StateId for GovernorState {
    fn name(self) -> &'static str {
        match self {
            GovernorState::Start => "Start",
            GovernorState::Normalize => "Normalize",
            GovernorState::Gate => "Gate",
            GovernorState::Score => "Score",
            GovernorState::Approved => "Approved",
            GovernorState::Throttled => "Throttled",
            GovernorState::Denied => "Denied",
            GovernorState::BadConfig => "BadConfig",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GovernorMode {
    #[default]
    Private,
    Public,
}

impl std::str::FromStr for GovernorMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PRIVATE" => Ok(GovernorMode::Private),
            "PUBLIC" => Ok(GovernorMode::Public),
            _ => anyhow::bail!("Invalid mode '{}'. Use: PRIVATE, PUBLIC", s),
        }
    }
}

/// Market regime the request is evaluated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    #[default]
    Accumulation,
    Expansion,
    Distribution,
    Collapse,
}

impl Regime {
    pub fn is_adverse(self) -> bool {
        matches!(self, Regime::Distribution | Regime::Collapse)
    }

    /// Points added to both thresholds.
    fn threshold_raise(self) -> f64 {
        match self {
            Regime::Accumulation | Regime::Expansion => 0.0,
            Regime::Distribution => 5.0,
            Regime::Collapse => 10.0,
        }
    }

    /// Suggested wait before retrying a throttled request.
    pub fn throttle_delay_secs(self) -> u64 {
        match self {
            Regime::Accumulation => 300,
            Regime::Expansion => 600,
            Regime::Distribution => 1800,
            Regime::Collapse => 3600,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Accumulation => write!(f, "ACCUMULATION"),
            Regime::Expansion => write!(f, "EXPANSION"),
            Regime::Distribution => write!(f, "DISTRIBUTION"),
            Regime::Collapse => write!(f, "COLLAPSE"),
        }
    }
}

impl std::str::FromStr for Regime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACCUMULATION" => Ok(Regime::Accumulation),
            "EXPANSION" => Ok(Regime::Expansion),
            "DISTRIBUTION" => Ok(Regime::Distribution),
            "COLLAPSE" => Ok(Regime::Collapse),
            _ => anyhow::bail!(
                "Invalid regime '{}'. Use: ACCUMULATION, EXPANSION, DISTRIBUTION, COLLAPSE",
                s
            ),
        }
    }
}

/// Raw request signals, each nominally 0..=100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorInput {
    pub safety: f64,
    pub regime_alignment: f64,
    pub conviction: f64,
    pub risk_budget: f64,
    pub execution_allowance: f64,
    #[serde(default)]
    pub mode: GovernorMode,
    #[serde(default)]
    pub regime: Regime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Approved,
    Throttled,
    Denied,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "APPROVED"),
            Decision::Throttled => write!(f, "THROTTLED"),
            Decision::Denied => write!(f, "DENIED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub approve: f64,
    pub throttle: f64,
}

impl Thresholds {
    pub fn for_request(mode: GovernorMode, regime: Regime) -> Self {
        let (approve, throttle) = match mode {
            GovernorMode::Private => (70.0, 50.0),
            GovernorMode::Public => (78.0, 60.0),
        };
        let raise = regime.threshold_raise();
        Self {
            approve: approve + raise,
            throttle: throttle + raise,
        }
    }
}

/// Per-run context of the governor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorCtx {
    pub input: GovernorInput,
    /// Clamped signals, in weight order.
    pub normalized: Option<[f64; 5]>,
    pub composite: Option<f64>,
    pub thresholds: Option<Thresholds>,
    pub decision: Option<Decision>,
    pub reasons: Vec<String>,
    pub suggested_delay_secs: Option<u64>,
}

impl GovernorCtx {
    pub fn new(input: GovernorInput) -> Self {
        Self {
            input,
            normalized: None,
            composite: None,
            thresholds: None,
            decision: None,
            reasons: Vec::new(),
            suggested_delay_secs: None,
        }
    }

    fn deny(&mut self, reason: impl Into<String>) {
        self.decision = Some(Decision::Denied);
        self.reasons.push(reason.into());
    }

    fn decided(&self, decision: Decision) -> bool {
        self.decision == Some(decision)
    }
}

/// Clamp to 0..=100; non-finite values count as 0.
pub fn clamp_signal(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

pub fn composite_score(signals: &[f64; 5]) -> f64 {
    signals.iter().zip(WEIGHTS).map(|(s, w)| s * w).sum()
}

pub type GovernorSpec = Specification<GovernorState, GovernorCtx, ()>;

type StepFuture<'a> = BoxFuture<'a, Result<Flow<GovernorState>>>;

fn enter_normalize<'a>(ctx: &'a mut GovernorCtx, _: &'a ()) -> StepFuture<'a> {
    let input = &ctx.input;
    ctx.normalized = Some([
        clamp_signal(input.safety),
        clamp_signal(input.regime_alignment),
        clamp_signal(input.conviction),
        clamp_signal(input.risk_budget),
        clamp_signal(input.execution_allowance),
    ]);
    Box::pin(ready(Ok(Flow::Continue)))
}

fn enter_gate<'a>(ctx: &'a mut GovernorCtx, _: &'a ()) -> StepFuture<'a> {
    Box::pin(ready(gate(ctx)))
}

// Order matters: allowance first, then the safety floor, then the remaining floors.
fn gate(ctx: &mut GovernorCtx) -> Result<Flow<GovernorState>> {
    let [safety, alignment, _, risk_budget, _] =
        ctx.normalized.ok_or_else(|| anyhow::anyhow!("signals were not normalized"))?;

    let allowance = ctx.input.execution_allowance;
    if allowance.is_nan() || allowance <= 0.0 {
        ctx.deny("execution allowance exhausted");
        return Ok(Flow::Continue);
    }

    if safety < SAFETY_FLOOR {
        return Ok(Flow::fail(
            GovernorState::BadConfig,
            format!("safety {:.1} is below the floor of {:.0}", safety, SAFETY_FLOOR),
        ));
    }

    if risk_budget < RISK_BUDGET_FLOOR {
        ctx.deny(format!(
            "risk budget {:.1} is below the floor of {:.0}",
            risk_budget, RISK_BUDGET_FLOOR
        ));
    }
    if alignment < REGIME_ALIGNMENT_FLOOR {
        ctx.deny(format!(
            "regime alignment {:.1} is below the floor of {:.0}",
            alignment, REGIME_ALIGNMENT_FLOOR
        ));
    }
    Ok(Flow::Continue)
}

fn enter_score<'a>(ctx: &'a mut GovernorCtx, _: &'a ()) -> StepFuture<'a> {
    Box::pin(ready(score(ctx)))
}

fn score(ctx: &mut GovernorCtx) -> Result<Flow<GovernorState>> {
    let signals = ctx
        .normalized
        .ok_or_else(|| anyhow::anyhow!("signals were not normalized"))?;
    let composite = composite_score(&signals);
    let thresholds = Thresholds::for_request(ctx.input.mode, ctx.input.regime);

    ctx.composite = Some(composite);
    ctx.thresholds = Some(thresholds);

    if composite >= thresholds.approve {
        ctx.decision = Some(Decision::Approved);
        ctx.reasons.push(format!(
            "composite {:.2} meets approve threshold {:.0}",
            composite, thresholds.approve
        ));
    } else if composite >= thresholds.throttle {
        ctx.decision = Some(Decision::Throttled);
        ctx.suggested_delay_secs = Some(ctx.input.regime.throttle_delay_secs());
        ctx.reasons.push(format!(
            "composite {:.2} between throttle {:.0} and approve {:.0}",
            composite, thresholds.throttle, thresholds.approve
        ));
    } else {
        ctx.deny(format!(
            "composite {:.2} below throttle threshold {:.0}",
            composite, thresholds.throttle
        ));
    }
    Ok(Flow::Continue)
}

/// Build the governor specification.
pub fn specification() -> Result<GovernorSpec, SpecError> {
    use GovernorState::*;

    Specification::builder(GOVERNOR_NAME, GOVERNOR_VERSION, Start)
        .plain(Start)
        .state(Normalize, StateDef::new().on_enter(enter_normalize))
        .state(Gate, StateDef::new().on_enter(enter_gate))
        .state(Score, StateDef::new().on_enter(enter_score))
        .terminal(Approved)
        .terminal(Throttled)
        .terminal(Denied)
        .fail(BadConfig)
        .transition(Start, Normalize, "begin")
        .transition(Normalize, Gate, "normalized")
        .guarded(Gate, Denied, "hard gate", |c| c.decided(Decision::Denied))
        .transition(Gate, Score, "gates passed")
        .guarded(Score, Approved, "approve", |c| c.decided(Decision::Approved))
        .guarded(Score, Throttled, "throttle", |c| c.decided(Decision::Throttled))
        .guarded(Score, Denied, "deny", |c| c.decided(Decision::Denied))
        .build()
}

/// The admission gate, ready to evaluate requests.
pub struct Governor {
    spec: GovernorSpec,
    options: RunOptions<GovernorState>,
}

impl Governor {
    pub fn new() -> Result<Self, SpecError> {
        Ok(Self {
            spec: specification()?,
            options: RunOptions::default(),
        })
    }

    pub fn spec(&self) -> &GovernorSpec {
        &self.spec
    }

    pub async fn evaluate(&self, input: GovernorInput) -> RunResult<GovernorState, GovernorCtx> {
        crate::engine::run(&self.spec, GovernorCtx::new(input), &(), &self.options).await
    }
}
