//! The hierarchical task state machine.
//!
//! A task is a set of named [`Block`]s, alternate graph topologies,
//! each an insertion-ordered collection of named [`State`]s. The machine
//! tracks the current block and state, per-block trial bookkeeping, and
//! appends every transition to the event log. Task graphs are validated
//! at load time so a dangling successor can never surface mid-run.
//!
//! Start and stop are idempotent and monotonic: starting an already
//! active or previously stopped session is a no-op, since a stopped
//! session cannot resume without corrupting already-logged relative
//! timestamps.

pub mod context;
pub mod state;

pub use context::{TaskCommand, TaskCtx};
pub use state::{
    Completion, DurationPolicy, StartHook, State, StateLogic, StepFn, StepResult, Successor,
};

use crate::controls::RunControls;
use crate::error::{RigError, RigResult};
use crate::schema::{OutputFrame, SIGNAL_START, SIGNAL_STOP, START_STOP_CHANNEL};
use log::info;

/// One alternate topology of a task: named states in insertion order.
/// The first inserted state is the block's entry point.
#[derive(Default)]
pub struct Block {
    states: Vec<State>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named state; insertion order is the block's order.
    pub fn state(mut self, name: &str, mut state: State) -> Self {
        state.name = name.to_string();
        self.states.push(state);
        self
    }

    pub fn first_state_name(&self) -> Option<&str> {
        self.states.first().map(State::name)
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(State::name)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s.name == name)
    }

    /// Load-time validation: non-empty, unique state names, every
    /// successor present.
    fn validate(&self, block_name: &str) -> RigResult<()> {
        if self.states.is_empty() {
            return Err(RigError::StateGraph(format!(
                "block '{block_name}' has no states"
            )));
        }
        for (i, state) in self.states.iter().enumerate() {
            if self.states[..i].iter().any(|s| s.name == state.name) {
                return Err(RigError::StateGraph(format!(
                    "duplicate state '{}' in block '{block_name}'",
                    state.name
                )));
            }
            let successors: Vec<&String> = match state.successor() {
                Successor::Single(name) => vec![name],
                Successor::ByOutcome(names) => {
                    if names.is_empty() {
                        return Err(RigError::StateGraph(format!(
                            "state '{}' in block '{block_name}' has an empty successor list",
                            state.name
                        )));
                    }
                    names.iter().collect()
                }
            };
            for successor in successors {
                if self.index_of(successor).is_none() {
                    return Err(RigError::StateGraph(format!(
                        "state '{}' in block '{block_name}' references missing successor '{successor}'",
                        state.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The task state machine: blocks, the current state pointer, and trial
/// bookkeeping.
pub struct StateMachine {
    blocks: Vec<(String, Block)>,
    current_block: usize,
    current_state: usize,
    completed_trials: usize,
    was_stopped: bool,
}

impl StateMachine {
    /// Build and validate a machine from named blocks. `start_block`
    /// defaults to the first block.
    pub fn new(blocks: Vec<(String, Block)>, start_block: Option<&str>) -> RigResult<Self> {
        if blocks.is_empty() {
            return Err(RigError::StateGraph("task defines no blocks".into()));
        }
        for (i, (name, block)) in blocks.iter().enumerate() {
            if blocks[..i].iter().any(|(n, _)| n == name) {
                return Err(RigError::StateGraph(format!("duplicate block '{name}'")));
            }
            block.validate(name)?;
        }
        let current_block = match start_block {
            Some(name) => blocks
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| RigError::StateGraph(format!("start block '{name}' not found")))?,
            None => 0,
        };
        Ok(Self {
            blocks,
            current_block,
            current_state: 0,
            completed_trials: 0,
            was_stopped: false,
        })
    }

    /// Enter the configured start block: logs the transition, opens the
    /// first trial, activates the first state. Run once by the engine
    /// before the session opens.
    pub(crate) fn enter_start_block(&mut self, ctx: &mut TaskCtx<'_>) -> RigResult<()> {
        let name = self.blocks[self.current_block].0.clone();
        self.switch_block(&name, ctx)
    }

    /// Switch to another block: appends a block-transition record, opens
    /// a new trial, activates the block's first state and resets its
    /// completed-trial counter.
    pub fn switch_block(&mut self, name: &str, ctx: &mut TaskCtx<'_>) -> RigResult<()> {
        let idx = self
            .blocks
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| RigError::StateGraph(format!("block '{name}' not found")))?;
        self.current_block = idx;
        info!("switching to block: {name}");
        ctx.log.record_block(ctx.now_ms, name);
        self.progress_trial(ctx);
        let first = self.blocks[idx]
            .1
            .first_state_name()
            .map(str::to_string)
            .ok_or_else(|| RigError::StateGraph(format!("block '{name}' has no states")))?;
        self.progress_state(&first, ctx)?;
        self.completed_trials = 0;
        Ok(())
    }

    /// Activate a state of the current block. The upcoming state is
    /// fully activated (time origin, callbacks, startup logic) before it
    /// becomes the current state any other reader can observe.
    pub fn progress_state(&mut self, name: &str, ctx: &mut TaskCtx<'_>) -> RigResult<()> {
        let (block_name, block) = &mut self.blocks[self.current_block];
        let idx = block.index_of(name).ok_or_else(|| {
            RigError::StateGraph(format!("state '{name}' not found in block '{block_name}'"))
        })?;
        ctx.state_name = name.to_string();
        block.states[idx].activate(ctx)?;
        self.current_state = idx;
        info!("progressed to state: {name}");
        ctx.log.record_state(ctx.now_ms, name);
        Ok(())
    }

    /// Open a new trial record and count it against the current block.
    pub fn progress_trial(&mut self, ctx: &mut TaskCtx<'_>) {
        ctx.log.open_trial(ctx.now_ms);
        self.completed_trials += 1;
    }

    /// One tick of the current state.
    pub(crate) fn run_current(&mut self, ctx: &mut TaskCtx<'_>) -> RigResult<Option<Completion>> {
        let state = &mut self.blocks[self.current_block].1.states[self.current_state];
        ctx.state_name = state.name.clone();
        state.run_tick(ctx)
    }

    /// Re-anchor the current state's time origin, absorbing startup
    /// handshake latency.
    pub(crate) fn reanchor_current(&mut self, now_ms: i64) {
        self.blocks[self.current_block].1.states[self.current_state].reset_time(now_ms);
    }

    pub fn current_block_name(&self) -> &str {
        &self.blocks[self.current_block].0
    }

    pub fn current_state_name(&self) -> &str {
        self.blocks[self.current_block].1.states[self.current_state].name()
    }

    /// Trials completed within the current block.
    pub fn completed_trials(&self) -> usize {
        self.completed_trials
    }

    /// Begin the session: raises the hardware clock-start signal and
    /// schedules activation through the loop's startup handshake. No-op
    /// if already active or previously stopped: a stopped session
    /// cannot resume, since resuming would corrupt already-logged
    /// relative timestamps.
    pub fn start(&mut self, outputs: &mut OutputFrame, controls: &RunControls) -> RigResult<()> {
        if self.was_stopped {
            info!("state machine was already started and stopped - no action taken");
            return Ok(());
        }
        if controls.active() || controls.beginning() {
            info!("state machine already active - no action taken");
            return Ok(());
        }
        outputs.set(START_STOP_CHANNEL, SIGNAL_START)?;
        controls.set_beginning(true);
        Ok(())
    }

    /// Non-quitting end of the experiment clock. No-op when inactive.
    pub fn stop(&mut self, outputs: &mut OutputFrame, controls: &RunControls) -> RigResult<()> {
        if !controls.active() {
            info!("state machine already inactive - no action taken");
            return Ok(());
        }
        info!("stopping state machine and resetting the hardware clock");
        outputs.set(START_STOP_CHANNEL, SIGNAL_STOP)?;
        controls.set_active(false);
        self.was_stopped = true;
        Ok(())
    }

    /// Request session shutdown: the loop drains one more exchange, runs
    /// the at-quit hooks, flushes the log and closes the channel.
    pub fn quit(&self, controls: &RunControls) {
        controls.set_quitting(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLog, SessionInfo};
    use crate::schema::{devices, InputFrame, OutputFrame};

    fn two_block_machine() -> StateMachine {
        let easy = Block::new()
            .state("a", State::from_fn(|_| Ok(StepResult::running()), "b"))
            .state("b", State::from_fn(|_| Ok(StepResult::running()), "a"));
        let hard = Block::new()
            .state("x", State::from_fn(|_| Ok(StepResult::running()), "x"));
        StateMachine::new(vec![("easy".into(), easy), ("hard".into(), hard)], None).unwrap()
    }

    struct Harness {
        inputs: InputFrame,
        outputs: OutputFrame,
        log: EventLog,
        controls: RunControls,
        commands: Vec<TaskCommand>,
    }

    impl Harness {
        fn new() -> Self {
            let mut outputs = OutputFrame::new();
            outputs.push(devices::start_stop());
            Self {
                inputs: InputFrame::new(),
                outputs,
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
    fn missing_successor_fails_at_load_time() {
        let block = Block::new().state(
            "only",
            State::from_fn(|_| Ok(StepResult::running()), "elsewhere"),
        );
        let err = StateMachine::new(vec![("main".into(), block)], None);
        assert!(matches!(err, Err(RigError::StateGraph(_))));
    }

    #[test]
    fn outcome_successors_are_validated_too() {
        let block = Block::new()
            .state("choice", State::from_fn(|_| Ok(StepResult::running()), ["choice", "gone"]));
        assert!(StateMachine::new(vec![("main".into(), block)], None).is_err());
    }

    #[test]
    fn empty_blocks_are_rejected() {
        assert!(StateMachine::new(vec![("main".into(), Block::new())], None).is_err());
    }

    #[test]
    fn switch_block_resets_counter_opens_trial_and_enters_first_state() {
        let mut machine = two_block_machine();
        let mut harness = Harness::new();

        machine.enter_start_block(&mut harness.ctx(0)).unwrap();
        machine.progress_trial(&mut harness.ctx(10));
        machine.progress_trial(&mut harness.ctx(20));
        assert_eq!(machine.completed_trials(), 2);

        machine.switch_block("hard", &mut harness.ctx(30)).unwrap();
        assert_eq!(machine.completed_trials(), 0);
        assert_eq!(machine.current_block_name(), "hard");
        assert_eq!(machine.current_state_name(), "x");
        // initial trial + 2 progressed + 1 opened by the switch
        assert_eq!(harness.log.trials.len(), 4);
        assert_eq!(harness.log.trials.last().unwrap().start, 30);
        assert_eq!(harness.log.blocks.last().unwrap().block, "hard");
    }

    #[test]
    fn start_is_monotonic_after_stop() {
        let mut machine = two_block_machine();
        let mut outputs = OutputFrame::new();
        outputs.push(devices::start_stop());
        let controls = RunControls::new(false);

        machine.start(&mut outputs, &controls).unwrap();
        assert!(controls.beginning());
        assert_eq!(outputs.value(START_STOP_CHANNEL).unwrap(), SIGNAL_START);

        controls.set_beginning(false);
        controls.set_active(true);
        outputs.set(START_STOP_CHANNEL, 0).unwrap();

        machine.stop(&mut outputs, &controls).unwrap();
        assert!(!controls.active());
        assert_eq!(outputs.value(START_STOP_CHANNEL).unwrap(), SIGNAL_STOP);

        // a previously-stopped machine cannot restart
        outputs.set(START_STOP_CHANNEL, 0).unwrap();
        machine.start(&mut outputs, &controls).unwrap();
        assert!(!controls.beginning());
        assert!(!controls.active());
        assert_eq!(outputs.value(START_STOP_CHANNEL).unwrap(), 0);
    }

    #[test]
    fn stop_on_inactive_machine_is_a_noop() {
        let mut machine = two_block_machine();
        let mut outputs = OutputFrame::new();
        outputs.push(devices::start_stop());
        let controls = RunControls::new(false);

        machine.stop(&mut outputs, &controls).unwrap();
        assert!(!controls.active());
        assert!(!controls.quitting());
        assert_eq!(outputs.value(START_STOP_CHANNEL).unwrap(), 0);
    }

    #[test]
    fn activation_runs_before_state_is_current() {
        // start callbacks run against the activating state's context,
        // before the machine exposes it as current
        use std::sync::{Arc, Mutex};
        let observed: Arc<Mutex<Vec<String>>> = Arc::default();
        let observed_hook = observed.clone();

        let block = Block::new()
            .state("first", State::from_fn(|_| Ok(StepResult::done()), "second"))
            .state(
                "second",
                State::from_fn(|_| Ok(StepResult::running()), "first").run_at_start(
                    move |ctx| {
                        observed_hook.lock().unwrap().push(ctx.state_name.clone());
                        Ok(())
                    },
                ),
            );
        let mut machine = StateMachine::new(vec![("main".into(), block)], None).unwrap();
        let mut harness = Harness::new();
        machine.enter_start_block(&mut harness.ctx(0)).unwrap();

        machine.progress_state("second", &mut harness.ctx(5)).unwrap();
        // the hook ran against the activating state's context
        assert_eq!(*observed.lock().unwrap(), vec!["second".to_string()]);
        assert_eq!(machine.current_state_name(), "second");
        assert_eq!(harness.log.states.last().unwrap().state, "second");
    }
}
