//! Session assembly.
//!
//! `SessionBuilder` collects everything a run needs (the device schema,
//! the task blocks, lifecycle hooks, settings), validates the lot before
//! any hardware is touched, and produces a ready [`Engine`]. Reserved
//! channels are injected, the log directory is created and named after
//! the subject and wall-clock start time, and the wire implementation is
//! chosen from the configured operation mode.

use crate::config::{OperationMode, Settings, WireMode};
use crate::controls::RunControls;
use crate::engine::{Engine, Hooks, LifecycleHook};
use crate::error::{RigError, RigResult};
use crate::event_log::{EventLog, JsonLogSink, LogSink, SessionInfo};
use crate::machine::{Block, State, StateMachine, TaskCtx};
use crate::schema::{
    ensure_reserved_channels, InputEntry, InputFrame, OutputEntry, OutputFrame, CLOCK_CHANNEL,
};
use crate::wire::{DummyWire, KeySource, ScriptedAgent, SerialWire, Wire};
use chrono::Local;
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Builder for a complete session.
pub struct SessionBuilder {
    settings: Settings,
    subject: String,
    inputs: InputFrame,
    outputs: OutputFrame,
    blocks: Vec<(String, Block)>,
    start_block: Option<String>,
    hooks: Hooks,
    permanent: Vec<State>,
    key_source: Option<Box<dyn KeySource>>,
    agent: Option<Box<dyn ScriptedAgent>>,
    sink: Option<Box<dyn LogSink>>,
    wire_override: Option<Box<dyn Wire>>,
    metadata: Vec<(String, String)>,
}

impl SessionBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            subject: "_".to_string(),
            inputs: InputFrame::new(),
            outputs: OutputFrame::new(),
            blocks: Vec::new(),
            start_block: None,
            hooks: Hooks::default(),
            permanent: Vec::new(),
            key_source: None,
            agent: None,
            sink: None,
            wire_override: None,
            metadata: Vec::new(),
        }
    }

    /// Subject identification, used in the log directory name.
    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    /// Add a sensor channel. Declaration order is wire order.
    pub fn input(mut self, entry: InputEntry) -> Self {
        self.inputs.push(entry);
        self
    }

    /// Add an actuator channel. Declaration order is wire order.
    pub fn output(mut self, entry: OutputEntry) -> Self {
        self.outputs.push(entry);
        self
    }

    /// Add a named task block.
    pub fn block(mut self, name: &str, block: Block) -> Self {
        self.blocks.push((name.to_string(), block));
        self
    }

    /// Single-topology convenience: the task's only block.
    pub fn task(self, block: Block) -> Self {
        self.block("block", block)
    }

    /// Start in a specific block instead of the first declared one.
    pub fn start_block(mut self, name: &str) -> Self {
        self.start_block = Some(name.to_string());
        self
    }

    /// Hook run exactly once on the first successful post-start
    /// exchange (e.g. drive motors to their starting position).
    pub fn at_start(
        mut self,
        hook: impl FnMut(&mut TaskCtx<'_>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.hooks.at_start.push(Box::new(hook) as LifecycleHook);
        self
    }

    /// Hook run exactly once during shutdown, before the log flush.
    pub fn at_quit(
        mut self,
        hook: impl FnMut(&mut TaskCtx<'_>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.hooks.at_quit.push(Box::new(hook) as LifecycleHook);
        self
    }

    /// Hook run after every completed trial.
    pub fn post_trial(
        mut self,
        hook: impl FnMut(&mut TaskCtx<'_>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.hooks.post_trial.push(Box::new(hook) as LifecycleHook);
        self
    }

    /// Add a permanent background state, run unconditionally every tick.
    pub fn permanent_state(mut self, name: &str, mut state: State) -> Self {
        state.name = name.to_string();
        self.permanent.push(state);
        self
    }

    /// Key-state provider for keyboard mode.
    pub fn key_source(mut self, source: Box<dyn KeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    /// Scripted agent for agent mode.
    pub fn agent(mut self, agent: Box<dyn ScriptedAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Replace the default JSON log sink.
    pub fn log_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Inject a custom wire, bypassing the configured operation mode.
    /// Used by tests and by collaborators with exotic transports.
    pub fn wire(mut self, wire: Box<dyn Wire>) -> Self {
        self.wire_override = Some(wire);
        self
    }

    /// Attach free-form session metadata (experimenter, rig name, ...).
    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.push((key.to_string(), value.to_string()));
        self
    }

    /// Validate everything and assemble the engine. Fails before any
    /// hardware write on schema or task-graph errors.
    pub fn build(mut self) -> RigResult<Engine> {
        ensure_reserved_channels(&mut self.inputs, &mut self.outputs);
        if self.settings.log_performance {
            if let Some(clock) = self.inputs.get_mut(CLOCK_CHANNEL) {
                clock.logging = true;
            }
        }
        self.inputs.validate()?;
        self.outputs.validate()?;

        let machine = StateMachine::new(self.blocks, self.start_block.as_deref())?;
        let controls = Arc::new(RunControls::new(self.settings.autostart));

        let mut session = SessionInfo::new(&self.subject);
        for (key, value) in self.metadata {
            session.extra.insert(key, value);
        }
        let mut log = EventLog::new(session);
        if self.settings.log_performance {
            log.enable_perf();
        }

        let sink = match self.sink {
            Some(sink) => Some(sink),
            None => match &self.settings.log_root {
                Some(root) => {
                    let dir = create_log_dir(root, &self.subject)?;
                    Some(Box::new(JsonLogSink::new(&dir)) as Box<dyn LogSink>)
                }
                None => {
                    info!("running without log saving - the session log stays in memory");
                    None
                }
            },
        };

        let archivist = self.settings.wire_mode == WireMode::Archivist;
        let wire: Box<dyn Wire> = match self.wire_override {
            Some(wire) => wire,
            None => match self.settings.mode {
                OperationMode::Hardware => {
                    let mut wire =
                        SerialWire::connect(&self.settings.serial_identifier, archivist)?;
                    wire.prime(self.outputs.payload_len())?;
                    Box::new(wire)
                }
                // hardware-free operation is always direct mode; there is
                // no firmware to archive histories
                OperationMode::Keyboard => {
                    let source = self.key_source.ok_or_else(|| {
                        RigError::Configuration(
                            "keyboard mode requires a key source".to_string(),
                        )
                    })?;
                    Box::new(DummyWire::keyboard(source))
                }
                OperationMode::Agent => {
                    let agent = self.agent.ok_or_else(|| {
                        RigError::Configuration("agent mode requires an agent".to_string())
                    })?;
                    Box::new(DummyWire::agent(agent))
                }
            },
        };

        Engine::new(
            wire,
            self.inputs,
            self.outputs,
            machine,
            controls,
            log,
            sink,
            self.hooks,
            self.permanent,
            self.settings.max_tick_rate_hz,
        )
    }
}

/// Create `<root>/<subject>_<timestamp>` for this session's artifacts.
fn create_log_dir(root: &str, subject: &str) -> RigResult<PathBuf> {
    let stem = if subject == "_" { "session" } else { subject };
    let dir = PathBuf::from(root).join(format!(
        "{stem}_{}",
        Local::now().format("%Y-%m-%d_%H;%M;%S")
    ));
    fs::create_dir_all(&dir)?;
    info!("session log directory: {dir:?}");
    Ok(dir)
}
