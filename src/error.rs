//! Custom error types for the crate.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! controller. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from channel I/O and configuration issues to task-graph problems.
//!
//! ## Error Hierarchy
//!
//! `RigError` is an enum that consolidates the error sources:
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically file
//!   parsing or format issues in the settings files.
//! - **`Configuration`**: Semantic errors in a device schema or session
//!   setup that pass parsing but are logically incorrect (e.g. a byte width
//!   that cannot represent the declared encoding). Always detected before
//!   any hardware write occurs.
//! - **`Io`** / **`Channel`**: Transport failures on the serial link. These
//!   are recovered as low in the stack as possible (inside the wire codec)
//!   and are never fatal on the read path.
//! - **`Desync`**: A frame declared more or fewer bytes than were actually
//!   available. Treated exactly like a lost connection: the codec
//!   resynchronizes rather than misaligning subsequent field decoding.
//! - **`StateGraph`**: A referenced successor state absent from the active
//!   block. Validated at task-load time so it cannot surface mid-run.
//! - **`Callback`**: An error raised from a user-supplied task hook. These
//!   are propagated, never swallowed, since a failing hook may signal a
//!   safety-relevant task bug such as an actuator left engaged.
//!
//! By using `#[from]`, `RigError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the
//! `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// The unified error type for the controller.
#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial channel error: {0}")]
    Channel(String),

    #[error("Protocol desync: {0}")]
    Desync(String),

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Value {value} out of range for channel '{channel}'")]
    ValueRange { channel: String, value: i64 },

    #[error("State graph error: {0}")]
    StateGraph(String),

    #[error("Task callback failed: {0}")]
    Callback(#[source] anyhow::Error),
}

impl From<serialport::Error> for RigError {
    fn from(value: serialport::Error) -> Self {
        RigError::Channel(value.to_string())
    }
}

impl RigError {
    /// Whether the wire codec may absorb this error and recover by
    /// reconnecting. Configuration and task-graph errors are fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RigError::Io(_) | RigError::Channel(_) | RigError::Desync(_)
        )
    }
}
