//! The append-only session record.
//!
//! Everything observable about a session converges here: block, state and
//! trial transition timelines, per-channel sensor histories, confirmed
//! actuator changes, and free-form timestamped events. All timestamps are
//! the canonical hardware clock's milliseconds, so the record is a single
//! consistent timeline regardless of which path appended an entry.
//!
//! The log is held in memory for the run and flushed exactly once at
//! session end through a [`LogSink`]. The exact on-disk serialization is a
//! collaborator concern; the whole structure derives `Serialize` so a sink
//! can choose its format, and [`JsonLogSink`] provides the default.

use crate::error::RigResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Session identity and metadata recorded at log creation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub session_id: String,
    /// Subject identification, `_` when unspecified.
    pub subject: String,
    /// Wall-clock session start.
    pub started: DateTime<Utc>,
    /// Free-form caller-supplied metadata (experimenter, rig name, ...).
    pub extra: BTreeMap<String, String>,
}

impl SessionInfo {
    pub fn new(subject: &str) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            started: Utc::now(),
            extra: BTreeMap::new(),
        }
    }
}

/// One completed pass through a trial-complete state. Created when the
/// trial opens; annotatable until the next trial begins.
#[derive(Debug, Clone, Serialize)]
pub struct Trial {
    /// Canonical clock value at trial start.
    pub start: i64,
    /// Task-supplied annotations (outcome, stimulus parameters, ...).
    pub notes: BTreeMap<String, serde_json::Value>,
}

impl Trial {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            notes: BTreeMap::new(),
        }
    }
}

/// A block transition on the session timeline.
#[derive(Debug, Clone, Serialize)]
pub struct BlockRecord {
    pub t: i64,
    pub block: String,
}

/// A state transition on the session timeline.
#[derive(Debug, Clone, Serialize)]
pub struct StateRecord {
    pub t: i64,
    pub state: String,
}

/// Optional per-tick performance samples, enabled via settings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerfRecords {
    /// Clock value at each loop iteration while active.
    pub t_loop: Vec<i64>,
    /// Clock value at each confirmed exchange while active.
    pub t_exchange: Vec<i64>,
}

/// The full in-memory session record.
#[derive(Debug, Serialize)]
pub struct EventLog {
    pub session: SessionInfo,
    /// Free-form `(t, message)` events.
    pub events: Vec<(i64, String)>,
    pub trials: Vec<Trial>,
    pub blocks: Vec<BlockRecord>,
    pub states: Vec<StateRecord>,
    /// Per-input-channel `(t, value)` change histories.
    pub sensors: BTreeMap<String, Vec<(i64, i64)>>,
    /// Per-output-channel `(t, value)` histories of confirmed changes.
    pub controls: BTreeMap<String, Vec<(i64, i64)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perf: Option<PerfRecords>,
}

impl EventLog {
    pub fn new(session: SessionInfo) -> Self {
        Self {
            session,
            events: Vec::new(),
            trials: Vec::new(),
            blocks: Vec::new(),
            states: Vec::new(),
            sensors: BTreeMap::new(),
            controls: BTreeMap::new(),
            perf: None,
        }
    }

    /// Append a free-form event at clock time `t`.
    pub fn record_event(&mut self, t: i64, message: impl Into<String>) {
        self.events.push((t, message.into()));
    }

    pub fn record_block(&mut self, t: i64, block: &str) {
        self.blocks.push(BlockRecord {
            t,
            block: block.to_string(),
        });
    }

    pub fn record_state(&mut self, t: i64, state: &str) {
        self.states.push(StateRecord {
            t,
            state: state.to_string(),
        });
    }

    /// Open a new trial record at clock time `t`.
    pub fn open_trial(&mut self, t: i64) {
        self.trials.push(Trial::new(t));
    }

    /// The most recently opened trial, for annotation.
    pub fn current_trial_mut(&mut self) -> Option<&mut Trial> {
        self.trials.last_mut()
    }

    /// Append a sensor reading unconditionally, preserving wire order.
    pub fn append_sensor(&mut self, channel: &str, t: i64, value: i64) {
        self.sensors
            .entry(channel.to_string())
            .or_default()
            .push((t, value));
    }

    /// Append a sensor reading only when it differs from the last logged
    /// value for that channel. Returns whether an append happened.
    pub fn append_sensor_if_changed(&mut self, channel: &str, t: i64, value: i64) -> bool {
        let history = self.sensors.entry(channel.to_string()).or_default();
        if history.last().map(|&(_, v)| v) != Some(value) {
            history.push((t, value));
            true
        } else {
            false
        }
    }

    /// Append a confirmed output change.
    pub fn append_control(&mut self, channel: &str, t: i64, value: i64) {
        self.controls
            .entry(channel.to_string())
            .or_default()
            .push((t, value));
    }

    /// Enable performance sampling.
    pub fn enable_perf(&mut self) {
        self.perf = Some(PerfRecords::default());
    }
}

/// Append path used by the archivist-mode codec: decoded `(timestamp,
/// value)` history pairs are pushed here in wire order.
pub trait HistorySink {
    fn append_history(&mut self, channel: &str, t_ms: u32, value: i64);
}

impl HistorySink for EventLog {
    fn append_history(&mut self, channel: &str, t_ms: u32, value: i64) {
        self.append_sensor(channel, i64::from(t_ms), value);
    }
}

/// A sink that ignores every append, for paths where no log exists yet.
#[derive(Debug, Default)]
pub struct NullSink;

impl HistorySink for NullSink {
    fn append_history(&mut self, _channel: &str, _t_ms: u32, _value: i64) {}
}

/// Destination the event log is flushed to once at session end.
pub trait LogSink: Send {
    fn flush(&mut self, log: &EventLog) -> Result<()>;
}

/// Default sink: pretty-printed JSON in the session's log directory.
pub struct JsonLogSink {
    path: PathBuf,
}

impl JsonLogSink {
    /// Sink writing `log.json` inside `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("log.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonLogSink {
    fn flush(&mut self, log: &EventLog) -> Result<()> {
        let json = serde_json::to_string_pretty(log)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write session log to {:?}", self.path))?;
        log::info!("session log saved to {:?}", self.path);
        Ok(())
    }
}

/// Flush helper used by the engine at shutdown.
pub fn flush_log(sink: &mut dyn LogSink, event_log: &EventLog) -> RigResult<()> {
    sink.flush(event_log)
        .map_err(crate::error::RigError::Callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn delta_logging_skips_unchanged_values() {
        let mut log = EventLog::new(SessionInfo::new("_"));
        assert!(log.append_sensor_if_changed("lick", 10, 1));
        assert!(!log.append_sensor_if_changed("lick", 12, 1));
        assert!(log.append_sensor_if_changed("lick", 15, 0));
        assert_eq!(log.sensors["lick"], vec![(10, 1), (15, 0)]);
    }

    #[test]
    fn first_reading_is_always_logged() {
        let mut log = EventLog::new(SessionInfo::new("_"));
        assert!(log.append_sensor_if_changed("wheel", 0, 0));
    }

    #[test]
    fn trials_annotate_until_next_opens() {
        let mut log = EventLog::new(SessionInfo::new("subj1"));
        log.open_trial(100);
        if let Some(trial) = log.current_trial_mut() {
            trial
                .notes
                .insert("outcome".into(), serde_json::json!("rewarded"));
        }
        log.open_trial(900);
        assert_eq!(log.trials.len(), 2);
        assert_eq!(log.trials[0].notes["outcome"], "rewarded");
        assert!(log.trials[1].notes.is_empty());
    }

    #[test]
    fn history_sink_preserves_wire_order() {
        let mut log = EventLog::new(SessionInfo::new("_"));
        log.append_history("wheel", 5, 10);
        log.append_history("wheel", 6, 11);
        log.append_history("wheel", 7, 9);
        assert_eq!(log.sensors["wheel"], vec![(5, 10), (6, 11), (7, 9)]);
    }

    #[test]
    fn json_sink_writes_the_record() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::new(SessionInfo::new("subj2"));
        log.record_event(42, "session note");
        log.record_block(0, "main");

        let mut sink = JsonLogSink::new(dir.path());
        sink.flush(&log).unwrap();

        let written = fs::read_to_string(sink.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["session"]["subject"], "subj2");
        assert_eq!(parsed["blocks"][0]["block"], "main");
        assert_eq!(parsed["events"][0][1], "session note");
    }
}
