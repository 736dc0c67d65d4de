//! # rig_runner
//!
//! A real-time controller bridging a host process to a
//! microcontroller-driven experimental rig: sensors and actuators wired
//! to physical hardware, scripted timing-sensitive procedures, and a
//! millisecond-fidelity record of everything that happened.
//!
//! The crate is the device communication and task orchestration engine:
//! the wire protocol codec, the hierarchical task state machine, and the
//! synchronization loop that ties hardware I/O cycles to state execution
//! and event logging with strict ordering and failure recovery.
//! Rendering, capture pipelines and GUIs are external collaborators:
//! they poll the [`controls::RunControls`] flags and the
//! [`engine::LiveView`] snapshot, and never call into the codec or the
//! machine.
//!
//! ## Crate Structure
//!
//! - **`schema`**: the declarative device schema: channel entries,
//!   ordered frames, the device constructor catalog, reserved-channel
//!   injection.
//! - **`wire`**: the byte-exact protocol codec and its transports
//!   (serial hardware, keyboard/agent dummy, scripted mock), including
//!   reconnection and desync recovery.
//! - **`machine`**: blocks, states, duration policies, the task context
//!   handle, and trial bookkeeping.
//! - **`engine`**: the synchronization loop driving one exchange per
//!   tick through read → task → write, with startup/shutdown gating.
//! - **`event_log`**: the append-only session record and its flush
//!   sinks.
//! - **`controls`**: the shared `beginning`/`active`/`quitting`
//!   lifecycle flags.
//! - **`session`**: the builder assembling schema, task and settings
//!   into a validated, ready-to-run engine.
//! - **`config`**: TOML-loadable session settings.
//! - **`error`**: the central `RigError` type.
//! - **`validation`**: small validators shared by schema and session
//!   checks.

pub mod config;
pub mod controls;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod machine;
pub mod schema;
pub mod session;
pub mod validation;
pub mod wire;

pub use config::{OperationMode, Settings, WireMode};
pub use controls::RunControls;
pub use engine::{Engine, Hooks, LiveView, TickOutcome};
pub use error::{RigError, RigResult};
pub use event_log::{EventLog, JsonLogSink, LogSink, Trial};
pub use machine::{Block, State, StateLogic, StateMachine, StepResult, Successor, TaskCtx};
pub use schema::{devices, Encoding, InputEntry, InputFrame, OutputEntry, OutputFrame};
pub use session::SessionBuilder;
pub use wire::{DummyWire, KeySource, MockWire, ScriptedAgent, SerialWire, Wire};

/// Initialize `env_logger` at the given default level; `RUST_LOG` still
/// overrides. Call once from the hosting binary.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}
