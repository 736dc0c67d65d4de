//! A single task state: its logic, duration policy, callbacks and
//! successors.
//!
//! A state runs one step per tick and is complete when either its own
//! logic reports finished or its resolved maximum duration elapses.
//! Duration-triggered completion uses the outcome the same tick's step
//! reported (0 when the step reported none), so an explicit outcome
//! always takes priority over the timeout default.

use crate::error::{RigError, RigResult};
use crate::machine::context::TaskCtx;
use rand::Rng;

/// Effectively-unbounded default state duration, in seconds.
pub const DEFAULT_MAX_TIME_S: f64 = 1_000_000.0;

/// What one step of state logic reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    /// The state completed through its own logic this tick.
    pub finished: bool,
    /// Index into a [`Successor::ByOutcome`] list; ignored for single
    /// successors.
    pub outcome: usize,
}

impl StepResult {
    /// Keep running.
    pub fn running() -> Self {
        Self {
            finished: false,
            outcome: 0,
        }
    }

    /// Finished with outcome 0.
    pub fn done() -> Self {
        Self {
            finished: true,
            outcome: 0,
        }
    }

    /// Finished with an explicit outcome.
    pub fn done_with(outcome: usize) -> Self {
        Self {
            finished: true,
            outcome,
        }
    }
}

/// The behavior of a state, implemented by task code. Every method
/// receives the explicit [`TaskCtx`] handle; errors propagate out of the
/// tick rather than being swallowed.
pub trait StateLogic: Send {
    /// Runs once when the state is (re)entered, after its start
    /// callbacks.
    fn on_start(&mut self, _ctx: &mut TaskCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// One tick of state-specific work.
    fn step(&mut self, ctx: &mut TaskCtx<'_>) -> anyhow::Result<StepResult>;

    /// Runs when the state completes; `finished` is false when the
    /// completion came from the duration guard.
    fn on_end(&mut self, _ctx: &mut TaskCtx<'_>, _finished: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Closure adapter for simple step-only states.
pub struct StepFn<F>(pub F);

impl<F> StateLogic for StepFn<F>
where
    F: FnMut(&mut TaskCtx<'_>) -> anyhow::Result<StepResult> + Send,
{
    fn step(&mut self, ctx: &mut TaskCtx<'_>) -> anyhow::Result<StepResult> {
        (self.0)(ctx)
    }
}

/// How a state's maximum duration is resolved at every (re)activation.
pub enum DurationPolicy {
    /// A fixed number of seconds, used as-is.
    Fixed(f64),
    /// Resampled uniformly from `(min, max)` seconds.
    Uniform(f64, f64),
    /// A zero-argument sampler invoked per activation.
    Sampled(Box<dyn FnMut() -> f64 + Send>),
}

impl DurationPolicy {
    fn resolve(&mut self) -> f64 {
        match self {
            DurationPolicy::Fixed(secs) => *secs,
            DurationPolicy::Uniform(min, max) => rand::thread_rng().gen_range(*min..=*max),
            DurationPolicy::Sampled(sampler) => sampler(),
        }
    }
}

/// Where a state hands control when it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Successor {
    /// A single next state.
    Single(String),
    /// Outcome-indexed next states; the step's reported outcome selects
    /// the entry.
    ByOutcome(Vec<String>),
}

impl From<&str> for Successor {
    fn from(name: &str) -> Self {
        Successor::Single(name.to_string())
    }
}

impl From<String> for Successor {
    fn from(name: String) -> Self {
        Successor::Single(name)
    }
}

impl<const N: usize> From<[&str; N]> for Successor {
    fn from(names: [&str; N]) -> Self {
        Successor::ByOutcome(names.iter().map(|n| n.to_string()).collect())
    }
}

impl From<Vec<String>> for Successor {
    fn from(names: Vec<String>) -> Self {
        Successor::ByOutcome(names)
    }
}

/// Start callback: runs on every (re)entry, before the state's own
/// startup logic.
pub type StartHook = Box<dyn FnMut(&mut TaskCtx<'_>) -> anyhow::Result<()> + Send>;
/// End callback: runs on completion; the flag is false on timeout.
pub type EndHook = Box<dyn FnMut(&mut TaskCtx<'_>, bool) -> anyhow::Result<()> + Send>;

/// How and why a state completed this tick.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Resolved name of the next state.
    pub next: String,
    /// Whether this completion also closes a trial.
    pub trial_complete: bool,
    /// True when the step's own signal completed the state, false on
    /// timeout.
    pub finished_by_step: bool,
}

/// A named node of a task graph.
pub struct State {
    pub(crate) name: String,
    logic: Box<dyn StateLogic>,
    duration: DurationPolicy,
    resolved_max_s: f64,
    start_time_ms: i64,
    run_at_start: Vec<StartHook>,
    run_at_end: Vec<EndHook>,
    successor: Successor,
    trial_complete: bool,
}

impl State {
    /// A state from custom logic and its successor(s).
    pub fn new(logic: impl StateLogic + 'static, successor: impl Into<Successor>) -> Self {
        Self {
            name: String::new(),
            logic: Box::new(logic),
            duration: DurationPolicy::Fixed(DEFAULT_MAX_TIME_S),
            resolved_max_s: DEFAULT_MAX_TIME_S,
            start_time_ms: 0,
            run_at_start: Vec::new(),
            run_at_end: Vec::new(),
            successor: successor.into(),
            trial_complete: false,
        }
    }

    /// A state from a bare step closure.
    pub fn from_fn<F>(step: F, successor: impl Into<Successor>) -> Self
    where
        F: FnMut(&mut TaskCtx<'_>) -> anyhow::Result<StepResult> + Send + 'static,
    {
        Self::new(StepFn(step), successor)
    }

    /// Fixed maximum duration in seconds.
    pub fn max_time(mut self, secs: f64) -> Self {
        self.duration = DurationPolicy::Fixed(secs);
        self.resolved_max_s = secs;
        self
    }

    /// Maximum duration resampled uniformly per (re)activation.
    pub fn max_time_range(mut self, min_s: f64, max_s: f64) -> Self {
        self.duration = DurationPolicy::Uniform(min_s, max_s);
        self
    }

    /// Maximum duration sampled by a custom function per (re)activation.
    pub fn max_time_fn(mut self, sampler: impl FnMut() -> f64 + Send + 'static) -> Self {
        self.duration = DurationPolicy::Sampled(Box::new(sampler));
        self
    }

    /// Add a start callback.
    pub fn run_at_start(
        mut self,
        hook: impl FnMut(&mut TaskCtx<'_>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.run_at_start.push(Box::new(hook));
        self
    }

    /// Add an end callback.
    pub fn run_at_end(
        mut self,
        hook: impl FnMut(&mut TaskCtx<'_>, bool) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.run_at_end.push(Box::new(hook));
        self
    }

    /// Completing this state closes a trial.
    pub fn trial_complete(mut self) -> Self {
        self.trial_complete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn successor(&self) -> &Successor {
        &self.successor
    }

    pub fn is_trial_complete(&self) -> bool {
        self.trial_complete
    }

    /// Milliseconds since the state's current activation.
    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.start_time_ms
    }

    /// Reset the time origin and resolve a fresh maximum duration.
    pub(crate) fn reset_time(&mut self, now_ms: i64) {
        self.start_time_ms = now_ms;
        self.resolved_max_s = self.duration.resolve();
    }

    /// Full (re)entry: time origin, start callbacks, then the state's own
    /// startup logic. Only after this returns is the state exposed as
    /// current, so a concurrently running consumer never observes a
    /// half-initialized state.
    pub(crate) fn activate(&mut self, ctx: &mut TaskCtx<'_>) -> RigResult<()> {
        self.reset_time(ctx.now_ms);
        for hook in &mut self.run_at_start {
            hook(ctx).map_err(RigError::Callback)?;
        }
        self.logic.on_start(ctx).map_err(RigError::Callback)?;
        Ok(())
    }

    /// One tick. Returns the completion when the step finished or the
    /// duration guard fired, `None` while still running.
    pub(crate) fn run_tick(&mut self, ctx: &mut TaskCtx<'_>) -> RigResult<Option<Completion>> {
        let step = self.logic.step(ctx).map_err(RigError::Callback)?;
        let timed_out =
            (ctx.now_ms - self.start_time_ms) as f64 > self.resolved_max_s * 1000.0;
        if !step.finished && !timed_out {
            return Ok(None);
        }

        self.logic
            .on_end(ctx, step.finished)
            .map_err(RigError::Callback)?;
        for hook in &mut self.run_at_end {
            hook(ctx, step.finished).map_err(RigError::Callback)?;
        }

        let next = match &self.successor {
            Successor::Single(name) => name.clone(),
            Successor::ByOutcome(names) => names.get(step.outcome).cloned().ok_or_else(|| {
                RigError::StateGraph(format!(
                    "state '{}' completed with outcome {} but lists only {} successors",
                    self.name,
                    step.outcome,
                    names.len()
                ))
            })?,
        };
        Ok(Some(Completion {
            next,
            trial_complete: self.trial_complete,
            finished_by_step: step.finished,
        }))
    }

    /// Tick a permanent background state: completions only re-anchor its
    /// timer, successors are ignored.
    pub(crate) fn run_permanent(&mut self, ctx: &mut TaskCtx<'_>) -> RigResult<()> {
        if self.run_tick(ctx)?.is_some() {
            self.reset_time(ctx.now_ms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::RunControls;
    use crate::event_log::{EventLog, SessionInfo};
    use crate::machine::context::TaskCommand;
    use crate::schema::{InputFrame, OutputFrame};

    struct Harness {
        inputs: InputFrame,
        outputs: OutputFrame,
        log: EventLog,
        controls: RunControls,
        commands: Vec<TaskCommand>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                inputs: InputFrame::new(),
                outputs: OutputFrame::new(),
                log: EventLog::new(SessionInfo::new("_")),
                controls: RunControls::new(true),
                commands: Vec::new(),
            }
        }

        fn ctx(&mut self, now_ms: i64) -> TaskCtx<'_> {
            TaskCtx {
                inputs: &mut self.inputs,
                outputs: &mut self.outputs,
                log: &mut self.log,
                controls: &self.controls,
                now_ms,
                state_name: String::new(),
                commands: &mut self.commands,
            }
        }
    }

    #[test]
    fn step_completion_resolves_single_successor() {
        let mut harness = Harness::new();
        let mut state = State::from_fn(|_| Ok(StepResult::done()), "next_state");
        state.name = "current".into();
        state.reset_time(0);

        let completion = state.run_tick(&mut harness.ctx(10)).unwrap().unwrap();
        assert_eq!(completion.next, "next_state");
        assert!(completion.finished_by_step);
        assert!(!completion.trial_complete);
    }

    #[test]
    fn timeout_fires_once_elapsed_exceeds_max() {
        let mut harness = Harness::new();
        let mut state = State::from_fn(|_| Ok(StepResult::running()), "late").max_time(2.0);
        state.reset_time(0);

        assert!(state.run_tick(&mut harness.ctx(1_999)).unwrap().is_none());
        assert!(state.run_tick(&mut harness.ctx(2_000)).unwrap().is_none());
        let completion = state.run_tick(&mut harness.ctx(2_001)).unwrap().unwrap();
        assert!(!completion.finished_by_step);
    }

    #[test]
    fn timeout_selects_outcome_zero_by_default() {
        let mut harness = Harness::new();
        let mut state =
            State::from_fn(|_| Ok(StepResult::running()), ["timeout_next", "other"]).max_time(0.5);
        state.reset_time(0);

        let completion = state.run_tick(&mut harness.ctx(600)).unwrap().unwrap();
        assert_eq!(completion.next, "timeout_next");
    }

    #[test]
    fn explicit_outcome_takes_priority_over_timeout() {
        let mut harness = Harness::new();
        // reports a non-zero outcome in the same tick the timeout fires
        let mut state = State::from_fn(
            |_| Ok(StepResult { finished: false, outcome: 1 }),
            ["zero", "one"],
        )
        .max_time(0.5);
        state.reset_time(0);

        let completion = state.run_tick(&mut harness.ctx(600)).unwrap().unwrap();
        assert_eq!(completion.next, "one");
    }

    #[test]
    fn outcome_beyond_successor_list_is_a_graph_error() {
        let mut harness = Harness::new();
        let mut state = State::from_fn(|_| Ok(StepResult::done_with(5)), ["a", "b"]);
        state.name = "chooser".into();
        state.reset_time(0);

        assert!(matches!(
            state.run_tick(&mut harness.ctx(1)),
            Err(RigError::StateGraph(_))
        ));
    }

    #[test]
    fn end_callbacks_learn_how_the_state_completed() {
        use std::sync::{Arc, Mutex};
        let seen: Arc<Mutex<Vec<bool>>> = Arc::default();
        let seen_hook = seen.clone();

        let mut harness = Harness::new();
        let mut state = State::from_fn(|_| Ok(StepResult::running()), "x")
            .max_time(0.1)
            .run_at_end(move |_, finished| {
                seen_hook.lock().unwrap().push(finished);
                Ok(())
            });
        state.reset_time(0);

        state.run_tick(&mut harness.ctx(200)).unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[test]
    fn hook_errors_propagate() {
        let mut harness = Harness::new();
        let mut state = State::from_fn(|_| Ok(StepResult::done()), "x")
            .run_at_end(|_, _| anyhow::bail!("actuator still engaged"));
        state.reset_time(0);

        assert!(matches!(
            state.run_tick(&mut harness.ctx(1)),
            Err(RigError::Callback(_))
        ));
    }

    #[test]
    fn uniform_duration_resamples_within_range() {
        let mut state =
            State::from_fn(|_| Ok(StepResult::running()), "x").max_time_range(1.0, 2.0);
        for _ in 0..20 {
            state.reset_time(0);
            assert!((1.0..=2.0).contains(&state.resolved_max_s));
        }
    }

    #[test]
    fn sampled_duration_invokes_the_sampler_per_activation() {
        let mut calls = 0u32;
        let mut state = State::from_fn(|_| Ok(StepResult::running()), "x").max_time_fn(move || {
            calls += 1;
            f64::from(calls)
        });
        state.reset_time(0);
        assert_eq!(state.resolved_max_s, 1.0);
        state.reset_time(0);
        assert_eq!(state.resolved_max_s, 2.0);
    }

    #[test]
    fn permanent_states_reanchor_instead_of_transitioning() {
        let mut harness = Harness::new();
        let mut state = State::from_fn(|_| Ok(StepResult::running()), "x").max_time(1.0);
        state.reset_time(0);

        state.run_permanent(&mut harness.ctx(1_500)).unwrap();
        // timer re-anchored at 1500; not yet expired again at 2000
        assert!(state.run_tick(&mut harness.ctx(2_000)).unwrap().is_none());
    }
}
