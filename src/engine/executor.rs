use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::engine::spec::{Hook, Specification, Transition};
use crate::engine::types::*;

/// Why a hook stopped the run.
enum HookStop<S> {
    Fail { state: S, note: String },
    Error(String),
    Panic(String),
}

/// Drive `ctx` through `spec` until it stops in an end state.
///
/// Hook errors and panics never escape: they end the run in `ActionError`.
pub async fn run<S, C, A>(
    spec: &Specification<S, C, A>,
    ctx: C,
    adapters: &A,
    options: &RunOptions<S>,
) -> RunResult<S, C>
where
    S: StateId,
    C: Send,
    A: ?Sized + Sync,
{
    let mut ctx = ctx;
    let mut trace: Vec<TraceEvent> = Vec::new();
    let mut state = spec.start();
    let mut steps = 0usize;
    let mut note: Option<String> = None;

    info!(spec = %spec.name(), version = %spec.version(), start = state.name(), "Starting run");

    let end = loop {
        if spec.is_terminal(state) || spec.is_fail(state) {
            break EndState::State(state);
        }

        if steps >= options.max_steps {
            let msg = format!("step budget of {} exhausted", options.max_steps);
            trace.push(error_event(state, ErrorInfo::new("engine", msg.clone())));
            note = Some(msg);
            break EndState::Engine(EngineFail::EngineTimeout);
        }

        if let Some(allowed) = &options.allowed_states
            && !allowed.contains(&state)
        {
            let msg = format!("state '{}' is not in the allowlist", state.name());
            trace.push(error_event(state, ErrorInfo::new("engine", msg.clone())));
            note = Some(msg);
            break EndState::Engine(EngineFail::ForbiddenState);
        }

        let Some(def) = spec.state(state) else {
            let msg = format!("state '{}' has no definition", state.name());
            trace.push(error_event(state, ErrorInfo::new("engine", msg.clone())));
            note = Some(msg);
            break EndState::Engine(EngineFail::MissingState);
        };

        steps += 1;
        debug!(spec = %spec.name(), state = state.name(), step = steps, "Entering state");
        trace.push(TraceEvent::new(TraceKind::Enter, state.name()));

        if let Some(enter) = def.enter
            && let Err(stop) = invoke(enter, &mut ctx, adapters).await
        {
            let (end, msg) = stopped(spec, state, stop, &mut trace);
            note = Some(msg);
            break end;
        }

        let outgoing: Vec<&Transition<S, C>> = spec.outgoing(state).collect();
        if outgoing.is_empty() {
            let msg = format!("state '{}' has no outgoing transitions", state.name());
            trace.push(error_event(state, ErrorInfo::new("engine", msg.clone())));
            note = Some(msg);
            break EndState::Engine(EngineFail::Stuck);
        }

        // First match in declaration order wins.
        let mut selected = None;
        for t in outgoing {
            let passed = t.guard.is_none_or(|guard| guard(&ctx));
            let mut event = TraceEvent::new(TraceKind::Guard, state.name());
            event.to = Some(t.to.name().to_string());
            event.label = Some(t.label.clone());
            event.guard = Some(passed);
            trace.push(event);
            if passed {
                selected = Some(t);
                break;
            }
        }

        let Some(t) = selected else {
            let msg = format!("no guard matched in state '{}'", state.name());
            trace.push(error_event(state, ErrorInfo::new("engine", msg.clone())));
            note = Some(msg);
            break EndState::Engine(EngineFail::GuardsBlocked);
        };

        if let Some(exit) = def.exit {
            trace.push(TraceEvent::new(TraceKind::Exit, state.name()));
            if let Err(stop) = invoke(exit, &mut ctx, adapters).await {
                let (end, msg) = stopped(spec, state, stop, &mut trace);
                note = Some(msg);
                break end;
            }
        }

        let mut event = TraceEvent::new(TraceKind::Transition, state.name());
        event.to = Some(t.to.name().to_string());
        event.label = Some(t.label.clone());
        trace.push(event);
        state = t.to;
    };

    let ok = match end {
        EndState::State(s) => spec.is_terminal(s) && spec.succeeded(&ctx),
        EndState::Engine(_) => false,
    };

    let mut done = TraceEvent::new(TraceKind::Done, end.name());
    done.guard = Some(ok);
    trace.push(done);

    if ok {
        info!(spec = %spec.name(), end = end.name(), steps, "Run complete");
    } else {
        warn!(spec = %spec.name(), end = end.name(), steps, note = ?note, "Run ended unsuccessfully");
    }

    RunResult {
        ok,
        spec: spec.name().to_string(),
        version: spec.version().to_string(),
        start: spec.start(),
        end,
        steps,
        trace,
        ctx,
        note,
    }
}

/// Run a hook, turning errors and panics into a stop reason.
async fn invoke<S, C, A>(hook: Hook<S, C, A>, ctx: &mut C, adapters: &A) -> Result<(), HookStop<S>>
where
    S: StateId,
    A: ?Sized,
{
    match AssertUnwindSafe(hook(ctx, adapters)).catch_unwind().await {
        Ok(Ok(Flow::Continue)) => Ok(()),
        Ok(Ok(Flow::Fail { state, note })) => Err(HookStop::Fail { state, note }),
        Ok(Err(e)) => Err(HookStop::Error(format!("{:#}", e))),
        Err(panic) => Err(HookStop::Panic(format!(
            "hook panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn stopped<S, C, A>(
    spec: &Specification<S, C, A>,
    state: S,
    stop: HookStop<S>,
    trace: &mut Vec<TraceEvent>,
) -> (EndState<S>, String)
where
    S: StateId,
    A: ?Sized,
{
    match stop {
        HookStop::Fail { state: target, note } => {
            if !spec.is_fail(target) {
                warn!(spec = %spec.name(), state = target.name(), "Hook failed into a state outside the fail set");
            }
            let mut event = error_event(state, ErrorInfo::new("fail", note.clone()));
            event.to = Some(target.name().to_string());
            trace.push(event);
            (EndState::State(target), note)
        }
        HookStop::Error(msg) => {
            warn!(spec = %spec.name(), state = state.name(), error = %msg, "Hook raised");
            trace.push(error_event(state, ErrorInfo::new("hook", msg.clone())));
            (EndState::Engine(EngineFail::ActionError), msg)
        }
        HookStop::Panic(msg) => {
            warn!(spec = %spec.name(), state = state.name(), error = %msg, "Hook panicked");
            trace.push(error_event(state, ErrorInfo::new("panic", msg.clone())));
            (EndState::Engine(EngineFail::ActionError), msg)
        }
    }
}

fn error_event<S: StateId>(state: S, error: ErrorInfo) -> TraceEvent {
    let mut event = TraceEvent::new(TraceKind::Error, state.name());
    event.error = Some(error);
    event
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
