//! Integration tests for the state machine engine.

use commitflow::engine::types::*;
use commitflow::engine::{SpecError, Specification, StateDef, run};
use futures_util::future::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Door {
    Closed,
    Opening,
    Open,
    Locked,
    Jammed,
    Limbo,
}

impl StateId for Door {
    fn name(self) -> &'static str {
        match self {
            Door::Closed => "Closed",
            Door::Opening => "Opening",
            Door::Open => "Open",
            Door::Locked => "Locked",
            Door::Jammed => "Jammed",
            Door::Limbo => "Limbo",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct DoorCtx {
    pushes: u32,
    key: bool,
    exits: Vec<&'static str>,
}

type DoorSpec = Specification<Door, DoorCtx, ()>;
type Step<'a> = BoxFuture<'a, anyhow::Result<Flow<Door>>>;

fn push<'a>(ctx: &'a mut DoorCtx, _: &'a ()) -> Step<'a> {
    Box::pin(async move {
        ctx.pushes += 1;
        Ok(Flow::Continue)
    })
}

fn hinge_snaps<'a>(_ctx: &'a mut DoorCtx, _: &'a ()) -> Step<'a> {
    Box::pin(async move { Err(anyhow::anyhow!("hinge snapped")) })
}

fn hinge_panics<'a>(ctx: &'a mut DoorCtx, _: &'a ()) -> Step<'a> {
    Box::pin(async move {
        if ctx.pushes < 100 {
            panic!("boom");
        }
        Ok(Flow::Continue)
    })
}

fn jam<'a>(_ctx: &'a mut DoorCtx, _: &'a ()) -> Step<'a> {
    Box::pin(async move { Ok(Flow::fail(Door::Jammed, "frame warped")) })
}

fn record_exit<'a>(ctx: &'a mut DoorCtx, _: &'a ()) -> Step<'a> {
    Box::pin(async move {
        ctx.exits.push("closed");
        Ok(Flow::Continue)
    })
}

fn builder() -> commitflow::engine::SpecBuilder<Door, DoorCtx, ()> {
    Specification::builder("door", "0.1.0", Door::Closed)
        .terminal(Door::Open)
        .fail(Door::Jammed)
}

async fn run_default(spec: &DoorSpec, ctx: DoorCtx) -> RunResult<Door, DoorCtx> {
    run(spec, ctx, &(), &RunOptions::default()).await
}

// --- Guard evaluation ---

#[tokio::test]
async fn first_eligible_transition_wins() {
    let spec = builder()
        .plain(Door::Closed)
        .plain(Door::Locked)
        .transition(Door::Closed, Door::Open, "open")
        .transition(Door::Closed, Door::Locked, "lock")
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert!(result.ok);
    assert!(result.ended_in(Door::Open));
    assert_eq!(result.steps, 1);
    assert_eq!(result.events(TraceKind::Guard).count(), 1);
}

#[tokio::test]
async fn false_guards_are_skipped_in_declaration_order() {
    let spec = builder()
        .plain(Door::Closed)
        .plain(Door::Locked)
        .guarded(Door::Closed, Door::Locked, "lock", |c| c.pushes > 5)
        .guarded(Door::Closed, Door::Open, "open", |c| c.key)
        .build()
        .unwrap();

    let ctx = DoorCtx {
        key: true,
        ..Default::default()
    };
    let result = run_default(&spec, ctx).await;

    assert!(result.ended_in(Door::Open));
    let guards: Vec<_> = result.events(TraceKind::Guard).collect();
    assert_eq!(guards.len(), 2);
    assert_eq!(guards[0].guard, Some(false));
    assert_eq!(guards[0].label.as_deref(), Some("lock"));
    assert_eq!(guards[1].guard, Some(true));
    assert_eq!(guards[1].to.as_deref(), Some("Open"));
}

#[tokio::test]
async fn no_matching_guard_is_guards_blocked() {
    let spec = builder()
        .plain(Door::Closed)
        .guarded(Door::Closed, Door::Open, "open", |c| c.key)
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert!(!result.ok);
    assert_eq!(result.end, EndState::Engine(EngineFail::GuardsBlocked));
}

#[tokio::test]
async fn state_without_outgoing_transitions_is_stuck() {
    let spec = builder()
        .plain(Door::Closed)
        .plain(Door::Opening)
        .transition(Door::Closed, Door::Opening, "push")
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert!(!result.ok);
    assert_eq!(result.end, EndState::Engine(EngineFail::Stuck));
    assert_eq!(result.path(), vec!["Closed", "Opening"]);
}

// --- Termination ---

fn revolving_door() -> DoorSpec {
    builder()
        .plain(Door::Closed)
        .state(Door::Opening, StateDef::new().on_enter(push))
        .transition(Door::Closed, Door::Opening, "push")
        .transition(Door::Opening, Door::Closed, "swing back")
        .build()
        .unwrap()
}

#[tokio::test]
async fn cycle_stops_at_step_budget() {
    let spec = revolving_door();
    let options = RunOptions::default().with_max_steps(10);

    let result = run(&spec, DoorCtx::default(), &(), &options).await;

    assert!(!result.ok);
    assert_eq!(result.end, EndState::Engine(EngineFail::EngineTimeout));
    assert_eq!(result.steps, 10);
    assert_eq!(result.ctx.pushes, 5);
}

#[tokio::test]
async fn default_step_budget_bounds_every_run() {
    let spec = revolving_door();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert_eq!(result.end, EndState::Engine(EngineFail::EngineTimeout));
    assert_eq!(result.steps, DEFAULT_MAX_STEPS);
    assert!(result.note.unwrap().contains("step budget"));
}

#[tokio::test]
async fn state_outside_allowlist_is_forbidden() {
    let spec = revolving_door();
    let options = RunOptions::default().allow([Door::Closed]);

    let result = run(&spec, DoorCtx::default(), &(), &options).await;

    assert_eq!(result.end, EndState::Engine(EngineFail::ForbiddenState));
    assert_eq!(result.steps, 1);
    assert_eq!(result.ctx.pushes, 0);
}

#[tokio::test]
async fn undefined_state_is_missing_state() {
    let spec: DoorSpec = builder()
        .plain(Door::Closed)
        .transition(Door::Closed, Door::Limbo, "vanish")
        .build_unchecked();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert_eq!(result.end, EndState::Engine(EngineFail::MissingState));
    assert!(!result.ok);
}

// --- Hooks ---

#[tokio::test]
async fn hook_error_ends_in_action_error() {
    let spec = builder()
        .plain(Door::Closed)
        .state(Door::Opening, StateDef::new().on_enter(hinge_snaps))
        .transition(Door::Closed, Door::Opening, "push")
        .transition(Door::Opening, Door::Open, "swing")
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert!(!result.ok);
    assert_eq!(result.end, EndState::Engine(EngineFail::ActionError));
    assert_eq!(result.note.as_deref(), Some("hinge snapped"));
    let error = result.events(TraceKind::Error).last().unwrap();
    assert_eq!(error.state, "Opening");
    assert_eq!(error.error.as_ref().unwrap().kind, "hook");
}

#[tokio::test]
async fn hook_panic_is_contained() {
    let spec = builder()
        .plain(Door::Closed)
        .state(Door::Opening, StateDef::new().on_enter(hinge_panics))
        .transition(Door::Closed, Door::Opening, "push")
        .transition(Door::Opening, Door::Open, "swing")
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert_eq!(result.end, EndState::Engine(EngineFail::ActionError));
    let error = result.events(TraceKind::Error).last().unwrap();
    assert_eq!(error.error.as_ref().unwrap().kind, "panic");
    assert!(error.error.as_ref().unwrap().message.contains("boom"));
}

#[tokio::test]
async fn explicit_fail_ends_in_named_fail_state() {
    let spec = builder()
        .plain(Door::Closed)
        .state(Door::Opening, StateDef::new().on_enter(jam))
        .transition(Door::Closed, Door::Opening, "push")
        .transition(Door::Opening, Door::Open, "swing")
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert!(!result.ok);
    assert!(result.ended_in(Door::Jammed));
    assert_eq!(result.note.as_deref(), Some("frame warped"));
    // Guards of the failing state are never evaluated.
    assert!(result.events(TraceKind::Guard).all(|e| e.state != "Opening"));
}

#[tokio::test]
async fn exit_hook_runs_between_guard_and_transition() {
    let spec = builder()
        .state(Door::Closed, StateDef::new().on_exit(record_exit))
        .transition(Door::Closed, Door::Open, "open")
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert!(result.ok);
    assert_eq!(result.ctx.exits, vec!["closed"]);
    let kinds: Vec<TraceKind> = result.trace.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TraceKind::Enter,
            TraceKind::Guard,
            TraceKind::Exit,
            TraceKind::Transition,
            TraceKind::Done,
        ]
    );
}

#[tokio::test]
async fn success_predicate_can_veto_terminal_state() {
    let spec = builder()
        .plain(Door::Closed)
        .transition(Door::Closed, Door::Open, "open")
        .success_when(|c| c.key)
        .build()
        .unwrap();

    let denied = run_default(&spec, DoorCtx::default()).await;
    assert!(denied.ended_in(Door::Open));
    assert!(!denied.ok);

    let allowed = run_default(
        &spec,
        DoorCtx {
            key: true,
            ..Default::default()
        },
    )
    .await;
    assert!(allowed.ok);
}

#[tokio::test]
async fn start_in_end_state_takes_no_steps() {
    let spec: DoorSpec = Specification::builder("door", "0.1.0", Door::Open)
        .terminal(Door::Open)
        .build()
        .unwrap();

    let result = run_default(&spec, DoorCtx::default()).await;

    assert!(result.ok);
    assert_eq!(result.steps, 0);
    let done = result.trace.last().unwrap();
    assert_eq!(done.kind, TraceKind::Done);
    assert_eq!(done.guard, Some(true));
}

// --- Specification integrity ---

#[test]
fn duplicate_state_is_rejected() {
    let err = builder()
        .plain(Door::Closed)
        .plain(Door::Closed)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SpecError::DuplicateState { state: "Closed", .. }));
}

#[test]
fn undeclared_start_is_rejected() {
    let err = builder().plain(Door::Opening).build().err().unwrap();
    assert!(matches!(err, SpecError::UndeclaredStart { .. }));
}

#[test]
fn transition_to_undeclared_state_is_rejected() {
    let err = builder()
        .plain(Door::Closed)
        .transition(Door::Closed, Door::Limbo, "vanish")
        .build()
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SpecError::UndeclaredTarget { state: "Limbo", .. }
    ));
}

#[test]
fn transition_from_undeclared_state_is_rejected() {
    let err = builder()
        .plain(Door::Closed)
        .transition(Door::Limbo, Door::Open, "reappear")
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SpecError::UndeclaredSource { .. }));
}

#[test]
fn transition_leaving_end_state_is_rejected() {
    let err = builder()
        .plain(Door::Closed)
        .transition(Door::Open, Door::Closed, "close")
        .build()
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SpecError::TransitionFromEnd { state: "Open", .. }
    ));
}

#[test]
fn terminal_and_fail_overlap_is_rejected() {
    let err = builder()
        .plain(Door::Closed)
        .fail(Door::Open)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SpecError::TerminalAndFail { .. }));
}

#[test]
fn outgoing_preserves_declaration_order() {
    let spec = builder()
        .plain(Door::Closed)
        .plain(Door::Locked)
        .transition(Door::Closed, Door::Locked, "first")
        .transition(Door::Locked, Door::Open, "other")
        .transition(Door::Closed, Door::Open, "second")
        .build()
        .unwrap();

    let labels: Vec<&str> = spec
        .outgoing(Door::Closed)
        .map(|t| t.label.as_str())
        .collect();
    assert_eq!(labels, vec!["first", "second"]);
}
