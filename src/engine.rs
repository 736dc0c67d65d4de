//! The synchronization loop: one driver thread tying hardware exchanges,
//! task execution and the event log together.
//!
//! Each tick performs at most one protocol exchange and applies it fully
//! before any task logic runs; outbound effects produced by the task are
//! transmitted within the same tick, on the confirmed exchange. The loop
//! owns the startup and shutdown handshakes with the firmware clock, and
//! paces itself to a configured maximum rate; ticks requested faster
//! return immediately without running the body.
//!
//! Channel failures never abort the loop: they are absorbed inside the
//! wire codec. The loop ends only on an explicit quit request, or on an
//! error raised by a user-supplied hook (which may signal a
//! safety-relevant task bug and is therefore never swallowed).

use crate::controls::RunControls;
use crate::error::{RigError, RigResult};
use crate::event_log::{flush_log, EventLog, LogSink};
use crate::machine::{Completion, State, StateMachine, TaskCommand, TaskCtx};
use crate::schema::{
    InputFrame, OutputFrame, SIGNAL_START, SIGNAL_STOP, START_STOP_CHANNEL,
};
use crate::validation;
use crate::wire::{ReadOutcome, Wire};
use log::info;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Clock readings below this threshold confirm a freshly reset hardware
/// clock during the startup handshake.
pub const START_FRESH_MS: i64 = 1000;

/// Rounds of deferred task commands applied per tick before the engine
/// declares the transitions non-converging.
const MAX_COMMAND_ROUNDS: usize = 16;

/// What one `tick()` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Called faster than the configured pace; body not run.
    Skipped,
    /// Startup handshake in progress.
    Starting,
    /// Steady-state tick.
    Running,
    /// Shutdown requested, draining the final exchange.
    ShuttingDown,
    /// Session closed; further ticks are no-ops.
    Stopped,
}

/// A session lifecycle hook (at-start, at-quit, post-trial).
pub type LifecycleHook = Box<dyn FnMut(&mut TaskCtx<'_>) -> anyhow::Result<()> + Send>;

/// The lifecycle hooks a task may install.
#[derive(Default)]
pub struct Hooks {
    /// Run exactly once, on the first successful post-start exchange.
    pub at_start: Vec<LifecycleHook>,
    /// Run exactly once, on the exchange that completes shutdown.
    pub at_quit: Vec<LifecycleHook>,
    /// Run after every trial-complete state resolves.
    pub post_trial: Vec<LifecycleHook>,
}

enum HookKind {
    AtStart,
    AtQuit,
    PostTrial,
}

/// Change tracking for one output entry: a changed value is logged only
/// on the following confirmed exchange, when the action is known to have
/// been transmitted.
struct OutputTracker {
    name: String,
    last: i64,
    pending: bool,
}

struct LiveShared {
    clock_ms: AtomicI64,
    inputs: RwLock<BTreeMap<String, i64>>,
    outputs: RwLock<BTreeMap<String, i64>>,
}

/// Read-only snapshot view of the live entry map for collaborator
/// threads (capture pipelines, rendering). Values are published once per
/// tick; reads never block the loop.
#[derive(Clone)]
pub struct LiveView {
    shared: Arc<LiveShared>,
}

impl LiveView {
    fn new() -> Self {
        Self {
            shared: Arc::new(LiveShared {
                clock_ms: AtomicI64::new(0),
                inputs: RwLock::new(BTreeMap::new()),
                outputs: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// The canonical clock as of the last published tick.
    pub fn clock_ms(&self) -> i64 {
        self.shared.clock_ms.load(Ordering::SeqCst)
    }

    pub fn input(&self, name: &str) -> Option<i64> {
        self.shared.inputs.read().ok()?.get(name).copied()
    }

    pub fn output(&self, name: &str) -> Option<i64> {
        self.shared.outputs.read().ok()?.get(name).copied()
    }

    /// Snapshot of all input values.
    pub fn input_snapshot(&self) -> BTreeMap<String, i64> {
        self.shared
            .inputs
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn publish(&self, inputs: &InputFrame, outputs: &OutputFrame) {
        self.shared
            .clock_ms
            .store(inputs.clock_ms(), Ordering::SeqCst);
        if let Ok(mut map) = self.shared.inputs.write() {
            for entry in inputs.entries() {
                map.insert(entry.name.clone(), entry.value);
            }
        }
        if let Ok(mut map) = self.shared.outputs.write() {
            for entry in outputs.entries() {
                map.insert(entry.name.clone(), entry.value);
            }
        }
    }
}

/// The entry frames, event log and command queue the task context
/// borrows from. Split from the engine so the machine can be driven
/// while a context is alive.
struct Shared {
    inputs: InputFrame,
    outputs: OutputFrame,
    log: EventLog,
    commands: Vec<TaskCommand>,
}

impl Shared {
    fn ctx<'a>(
        &'a mut self,
        controls: &'a RunControls,
        now_ms: i64,
        state_name: String,
    ) -> TaskCtx<'a> {
        TaskCtx {
            inputs: &mut self.inputs,
            outputs: &mut self.outputs,
            log: &mut self.log,
            controls,
            now_ms,
            state_name,
            commands: &mut self.commands,
        }
    }
}

/// The synchronization loop driver.
pub struct Engine {
    wire: Box<dyn Wire>,
    shared: Shared,
    machine: StateMachine,
    controls: Arc<RunControls>,
    sink: Option<Box<dyn LogSink>>,
    hooks: Hooks,
    permanent: Vec<State>,
    trackers: Vec<OutputTracker>,
    min_tick: Duration,
    last_tick: Option<Instant>,
    start_hooks_done: bool,
    terminated: bool,
    live: LiveView,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        wire: Box<dyn Wire>,
        inputs: InputFrame,
        outputs: OutputFrame,
        machine: StateMachine,
        controls: Arc<RunControls>,
        mut log: EventLog,
        sink: Option<Box<dyn LogSink>>,
        hooks: Hooks,
        mut permanent: Vec<State>,
        max_tick_rate_hz: f64,
    ) -> RigResult<Self> {
        validation::is_valid_rate(max_tick_rate_hz)
            .map_err(|e| RigError::Configuration(e.to_string()))?;

        // seed the control histories with each output's initial value
        let trackers: Vec<OutputTracker> = outputs
            .entries()
            .iter()
            .filter(|e| e.name != START_STOP_CHANNEL)
            .map(|e| OutputTracker {
                name: e.name.clone(),
                last: e.value,
                pending: false,
            })
            .collect();
        for tracker in &trackers {
            log.append_control(&tracker.name, 0, tracker.last);
        }

        for state in &mut permanent {
            state.reset_time(0);
        }

        let mut engine = Self {
            wire,
            shared: Shared {
                inputs,
                outputs,
                log,
                commands: Vec::new(),
            },
            machine,
            controls,
            sink,
            hooks,
            permanent,
            trackers,
            min_tick: Duration::from_secs_f64(1.0 / max_tick_rate_hz),
            last_tick: None,
            start_hooks_done: false,
            terminated: false,
            live: LiveView::new(),
        };

        // enter the start block before the session opens: the first
        // state is fully activated and the t=0 block/trial/state records
        // are on the timeline
        let mut ctx = engine.shared.ctx(&engine.controls, 0, String::new());
        engine.machine.enter_start_block(&mut ctx)?;
        engine.apply_commands()?;
        engine.live.publish(&engine.shared.inputs, &engine.shared.outputs);
        Ok(engine)
    }

    /// Transmit the initial outbound frame, priming the exchange
    /// ping-pong with the firmware. Run once before ticking.
    pub fn prime(&mut self) -> RigResult<()> {
        self.wire.write(&mut self.shared.outputs)
    }

    /// Drive the loop until shutdown completes.
    pub fn run(&mut self) -> RigResult<()> {
        self.prime()?;
        while !self.terminated {
            if self.tick()? == TickOutcome::Skipped {
                thread::sleep(Duration::from_micros(50));
            }
        }
        Ok(())
    }

    /// One paced tick. See the module docs for the phase order.
    pub fn tick(&mut self) -> RigResult<TickOutcome> {
        if self.terminated {
            return Ok(TickOutcome::Stopped);
        }
        if let Some(last) = self.last_tick {
            if last.elapsed() < self.min_tick {
                return Ok(TickOutcome::Skipped);
            }
        }
        self.last_tick = Some(Instant::now());

        if self.controls.beginning() {
            return self.tick_starting();
        }
        if self.controls.quitting() {
            return self.tick_quitting();
        }
        self.tick_steady()
    }

    /// Startup gating: raise the clock-start signal and poll until the
    /// firmware reports a freshly reset clock. No task logic runs here.
    fn tick_starting(&mut self) -> RigResult<TickOutcome> {
        self.shared.outputs.set(START_STOP_CHANNEL, SIGNAL_START)?;
        let outcome = self.read_exchange()?;
        if outcome.updated {
            if !self.start_hooks_done {
                self.run_hooks(HookKind::AtStart)?;
                self.apply_commands()?;
                self.start_hooks_done = true;
            }
            self.wire.write(&mut self.shared.outputs)?;
            let now = self.shared.inputs.clock_ms();
            if now < START_FRESH_MS {
                self.controls.set_beginning(false);
                self.controls.set_active(true);
                // the handshake took time; absorb it so the first state's
                // duration starts now
                self.machine.reanchor_current(now);
                info!("session active, hardware clock at {now} ms");
            }
        }
        self.live.publish(&self.shared.inputs, &self.shared.outputs);
        Ok(TickOutcome::Starting)
    }

    /// Shutdown gating: drain one exchange, then run the at-quit hooks,
    /// stop the hardware clock, flush the log and close the channel.
    fn tick_quitting(&mut self) -> RigResult<TickOutcome> {
        let outcome = self.read_exchange()?;
        if !outcome.updated {
            return Ok(TickOutcome::ShuttingDown);
        }

        self.run_hooks(HookKind::AtQuit)?;
        self.apply_commands()?;
        // stop the pulse clock so a stale signal cannot fake the next
        // session's synchronization
        self.shared.outputs.set(START_STOP_CHANNEL, SIGNAL_STOP)?;
        self.wire.write(&mut self.shared.outputs)?;
        if let Some(sink) = self.sink.as_mut() {
            flush_log(sink.as_mut(), &self.shared.log)?;
        }
        self.wire.close()?;
        self.terminated = true;
        info!("session closed");
        Ok(TickOutcome::Stopped)
    }

    /// Steady state: read, log input deltas, run the task, run permanent
    /// states, then log confirmed output changes and write.
    fn tick_steady(&mut self) -> RigResult<TickOutcome> {
        let outcome = self.read_exchange()?;
        let now = self.shared.inputs.clock_ms();
        let active = self.controls.active();

        if outcome.updated && active && !self.wire.archivist() {
            // direct mode: delta-log inputs keyed by the canonical clock
            // (archivist histories were already appended by the codec)
            for entry in self.shared.inputs.entries() {
                if entry.logging {
                    self.shared
                        .log
                        .append_sensor_if_changed(&entry.name, now, entry.value);
                }
            }
        }

        if active {
            self.machine_tick(now)?;
        }

        self.run_permanent_states()?;

        if outcome.updated {
            if self.controls.active() {
                for tracker in &mut self.trackers {
                    if tracker.pending {
                        // the previous change is confirmed transmitted by
                        // this exchange; log it at the confirmation time
                        self.shared.log.append_control(&tracker.name, now, tracker.last);
                        tracker.pending = false;
                    }
                    let current = self.shared.outputs.value(&tracker.name)?;
                    if current != tracker.last {
                        tracker.last = current;
                        tracker.pending = true;
                    }
                }
            }
            self.wire.write(&mut self.shared.outputs)?;
            if self.controls.active() {
                if let Some(perf) = self.shared.log.perf.as_mut() {
                    perf.t_exchange.push(now);
                }
            }
        }
        if self.controls.active() {
            if let Some(perf) = self.shared.log.perf.as_mut() {
                perf.t_loop.push(now);
            }
        }

        self.live.publish(&self.shared.inputs, &self.shared.outputs);
        Ok(TickOutcome::Running)
    }

    fn read_exchange(&mut self) -> RigResult<ReadOutcome> {
        let active = self.controls.active();
        self.wire
            .read(&mut self.shared.inputs, &mut self.shared.log, active)
    }

    /// One tick of the current state plus the transitions it triggered.
    fn machine_tick(&mut self, now: i64) -> RigResult<()> {
        let completion = {
            let mut ctx = self.shared.ctx(&self.controls, now, String::new());
            self.machine.run_current(&mut ctx)?
        };
        // commands issued by the step itself (manual overrides) take
        // precedence over the step's own completion
        let switched = self.apply_commands()?;
        if let Some(completion) = completion {
            if switched {
                return Ok(());
            }
            if completion.trial_complete {
                self.complete_trial(&completion)?;
            } else {
                let mut ctx = self.shared.ctx(&self.controls, now, String::new());
                self.machine.progress_state(&completion.next, &mut ctx)?;
                self.apply_commands()?;
            }
        }
        Ok(())
    }

    /// A trial-complete state resolved: run the post-trial hooks first;
    /// if one of them already switched blocks (which opens a trial of
    /// its own), the regular progression is skipped.
    fn complete_trial(&mut self, completion: &Completion) -> RigResult<()> {
        self.run_hooks(HookKind::PostTrial)?;
        let switched = self.apply_commands()?;
        if !switched {
            let now = self.shared.inputs.clock_ms();
            let mut ctx = self.shared.ctx(&self.controls, now, String::new());
            self.machine.progress_trial(&mut ctx);
            let mut ctx = self.shared.ctx(&self.controls, now, String::new());
            self.machine.progress_state(&completion.next, &mut ctx)?;
            self.apply_commands()?;
        }
        Ok(())
    }

    /// Apply deferred task commands until the queue settles. Returns
    /// whether a block switch executed.
    fn apply_commands(&mut self) -> RigResult<bool> {
        let mut switched = false;
        for _ in 0..MAX_COMMAND_ROUNDS {
            if self.shared.commands.is_empty() {
                return Ok(switched);
            }
            let queue = std::mem::take(&mut self.shared.commands);
            for command in queue {
                let now = self.shared.inputs.clock_ms();
                match command {
                    TaskCommand::SwitchBlock(name) => {
                        let mut ctx = self.shared.ctx(&self.controls, now, String::new());
                        self.machine.switch_block(&name, &mut ctx)?;
                        switched = true;
                    }
                    TaskCommand::ProgressState(name) => {
                        let mut ctx = self.shared.ctx(&self.controls, now, String::new());
                        self.machine.progress_state(&name, &mut ctx)?;
                    }
                    TaskCommand::Stop => {
                        self.machine.stop(&mut self.shared.outputs, &self.controls)?;
                    }
                    TaskCommand::Quit => self.controls.set_quitting(true),
                }
            }
        }
        if self.shared.commands.is_empty() {
            Ok(switched)
        } else {
            Err(RigError::StateGraph(
                "task transition commands did not settle".into(),
            ))
        }
    }

    fn run_hooks(&mut self, kind: HookKind) -> RigResult<()> {
        let mut hooks = match kind {
            HookKind::AtStart => std::mem::take(&mut self.hooks.at_start),
            HookKind::AtQuit => std::mem::take(&mut self.hooks.at_quit),
            HookKind::PostTrial => std::mem::take(&mut self.hooks.post_trial),
        };
        let now = self.shared.inputs.clock_ms();
        let state_name = self.machine.current_state_name().to_string();
        let mut result = Ok(());
        for hook in hooks.iter_mut() {
            let mut ctx = self.shared.ctx(&self.controls, now, state_name.clone());
            if let Err(err) = hook(&mut ctx) {
                result = Err(RigError::Callback(err));
                break;
            }
        }
        match kind {
            HookKind::AtStart => self.hooks.at_start = hooks,
            HookKind::AtQuit => self.hooks.at_quit = hooks,
            HookKind::PostTrial => self.hooks.post_trial = hooks,
        }
        result
    }

    fn run_permanent_states(&mut self) -> RigResult<()> {
        let mut permanent = std::mem::take(&mut self.permanent);
        let now = self.shared.inputs.clock_ms();
        let mut result = Ok(());
        for state in permanent.iter_mut() {
            let name = state.name().to_string();
            let mut ctx = self.shared.ctx(&self.controls, now, name);
            if let Err(err) = state.run_permanent(&mut ctx) {
                result = Err(err);
                break;
            }
        }
        self.permanent = permanent;
        result
    }

    // ----- session control surface -----

    /// Begin the session (idempotent, monotonic).
    pub fn start(&mut self) -> RigResult<()> {
        self.machine.start(&mut self.shared.outputs, &self.controls)
    }

    /// End the experiment clock without shutting down.
    pub fn stop(&mut self) -> RigResult<()> {
        self.machine.stop(&mut self.shared.outputs, &self.controls)
    }

    /// Request shutdown; the loop drains one more exchange, flushes the
    /// log and terminates.
    pub fn quit(&self) {
        self.controls.set_quitting(true);
    }

    /// Shared lifecycle flags, for collaborator threads.
    pub fn controls(&self) -> Arc<RunControls> {
        Arc::clone(&self.controls)
    }

    /// Read-only live entry view, for collaborator threads.
    pub fn live_view(&self) -> LiveView {
        self.live.clone()
    }

    pub fn log(&self) -> &EventLog {
        &self.shared.log
    }

    /// Mutable log access for collaborator append hooks (e.g. camera
    /// frame timing).
    pub fn log_mut(&mut self) -> &mut EventLog {
        &mut self.shared.log
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn inputs(&self) -> &InputFrame {
        &self.shared.inputs
    }

    pub fn outputs(&self) -> &OutputFrame {
        &self.shared.outputs
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
