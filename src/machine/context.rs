//! The per-tick handle passed to every task callback.
//!
//! All task code, whether state logic, start/end callbacks or lifecycle
//! hooks, receives a `TaskCtx` instead of reaching into ambient global state.
//! The context gives mutable access to the live entry frames and the
//! event log, read access to the run controls, and a deferred command
//! queue for machine transitions: a hook that wants to switch blocks or
//! jump states enqueues the request, and the engine applies it after the
//! hook returns, keeping the state machine borrow-safe while a state is
//! executing.

use crate::controls::RunControls;
use crate::error::RigResult;
use crate::event_log::EventLog;
use crate::schema::{InputFrame, OutputFrame};

/// A machine transition requested from task code, applied by the engine
/// after the requesting callback returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// Switch to another block (resets its trial counter, opens a trial,
    /// activates its first state).
    SwitchBlock(String),
    /// Jump to another state of the current block.
    ProgressState(String),
    /// End the experiment clock without quitting the process.
    Stop,
    /// Stop, flush the log and shut the session down.
    Quit,
}

/// The handle task callbacks run against.
pub struct TaskCtx<'a> {
    pub inputs: &'a mut InputFrame,
    pub outputs: &'a mut OutputFrame,
    pub log: &'a mut EventLog,
    pub controls: &'a RunControls,
    /// Canonical clock value for this tick, in milliseconds.
    pub now_ms: i64,
    /// Name of the state this callback belongs to.
    pub state_name: String,
    pub(crate) commands: &'a mut Vec<TaskCommand>,
}

impl TaskCtx<'_> {
    /// Current value of a named sensor channel.
    pub fn read_in(&self, name: &str) -> RigResult<i64> {
        self.inputs.value(name)
    }

    /// Command a named actuator channel.
    pub fn send_out(&mut self, name: &str, value: i64) -> RigResult<()> {
        self.outputs.set(name, value)
    }

    /// The canonical clock, in milliseconds.
    pub fn time_ms(&self) -> i64 {
        self.now_ms
    }

    /// Request a block switch, applied after this callback returns.
    pub fn switch_block(&mut self, name: &str) {
        self.commands.push(TaskCommand::SwitchBlock(name.to_string()));
    }

    /// Request a jump to another state of the current block.
    pub fn progress_state(&mut self, name: &str) {
        self.commands
            .push(TaskCommand::ProgressState(name.to_string()));
    }

    /// Request a non-quitting end to the experiment clock.
    pub fn stop(&mut self) {
        self.commands.push(TaskCommand::Stop);
    }

    /// Request session shutdown.
    pub fn quit(&mut self) {
        self.commands.push(TaskCommand::Quit);
    }

    /// Append a free-form event at the current clock time.
    pub fn record_event(&mut self, message: impl Into<String>) {
        let t = self.now_ms;
        self.log.record_event(t, message);
    }

    /// Annotate the currently open trial.
    pub fn annotate_trial(&mut self, key: &str, value: serde_json::Value) {
        if let Some(trial) = self.log.current_trial_mut() {
            trial.notes.insert(key.to_string(), value);
        }
    }
}
