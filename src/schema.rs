//! Device schema: the declarative description of every channel on the rig.
//!
//! A schema is a pair of frames, one for sensor inputs and one for
//! actuator outputs, whose entry order is fixed at session start and must match the
//! field order compiled into the firmware. Entries are created once at
//! configuration time and mutated in place on every exchange for the life
//! of the session.
//!
//! The [`devices`] module provides constructors for the common channel
//! kinds wired to a rig (digital and analog sensors, rotary encoders,
//! valves, servos, tone generators, pulse clocks). Two reserved channels
//! must exist in every session and are injected with defaults when a
//! caller's schema omits them: the canonical millisecond clock input
//! [`CLOCK_CHANNEL`] and the start/stop output [`START_STOP_CHANNEL`].

use crate::error::{RigError, RigResult};
use crate::validation;
use serde::{Deserialize, Serialize};

/// Name of the canonical millisecond-clock input entry.
pub const CLOCK_CHANNEL: &str = "t_ms";
/// Name of the optional microsecond-clock input entry.
pub const MICROS_CHANNEL: &str = "t_us";
/// Name of the reserved start/stop output entry.
pub const START_STOP_CHANNEL: &str = "start_stop";

/// `start_stop` value meaning "no clock action".
pub const SIGNAL_IDLE: i64 = 0;
/// `start_stop` value that resets and starts the hardware clock.
pub const SIGNAL_START: i64 = 1;
/// `start_stop` value that stops the hardware clock.
pub const SIGNAL_STOP: i64 = 2;

/// How a channel value is represented on the wire.
///
/// The byte width lives on the entry; the encoding only fixes signedness.
/// `Bool` always occupies a single byte (`0x00`/`0x01`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Bool,
    Unsigned,
    Signed,
}

/// Fixed-signature mapping from pressed-key states (and the previous value)
/// to a new channel value, used by the keyboard-driven dummy wire.
pub type KeyControl = Box<dyn FnMut(&[bool], i64) -> i64 + Send>;

/// Keyboard metadata for an input entry: the key names to sample and the
/// mapping that turns their pressed states into a channel value.
pub struct KeyBinding {
    pub keys: Vec<String>,
    pub control: KeyControl,
}

/// One named sensor channel read from the firmware every exchange.
pub struct InputEntry {
    pub name: String,
    pub encoding: Encoding,
    pub width: usize,
    pub value: i64,
    /// Whether value changes are appended to the session log.
    pub logging: bool,
    /// Optional keyboard mapping for dummy-wire operation.
    pub key_binding: Option<KeyBinding>,
}

impl InputEntry {
    pub fn new(name: &str, encoding: Encoding, width: usize, logging: bool) -> Self {
        Self {
            name: name.to_string(),
            encoding,
            width,
            value: 0,
            logging,
            key_binding: None,
        }
    }

    /// Attach a keyboard binding for keyboard-mode sessions.
    pub fn with_keys<I, S>(mut self, keys: I, control: KeyControl) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_binding = Some(KeyBinding {
            keys: keys.into_iter().map(Into::into).collect(),
            control,
        });
        self
    }

    fn validate(&self) -> RigResult<()> {
        validate_common(&self.name, self.encoding, self.width, self.value)
    }
}

/// One named actuator channel written to the firmware every exchange.
pub struct OutputEntry {
    pub name: String,
    pub encoding: Encoding,
    pub width: usize,
    pub value: i64,
    /// Value the entry reverts to when `reset_after_send` is set.
    pub default: i64,
    /// Revert to `default` locally right after encoding, independent of
    /// transmission success.
    pub reset_after_send: bool,
}

impl OutputEntry {
    pub fn new(
        name: &str,
        encoding: Encoding,
        width: usize,
        default: i64,
        reset_after_send: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            encoding,
            width,
            value: default,
            default,
            reset_after_send,
        }
    }

    fn validate(&self) -> RigResult<()> {
        validate_common(&self.name, self.encoding, self.width, self.value)?;
        validate_common(&self.name, self.encoding, self.width, self.default)
    }
}

fn validate_common(name: &str, encoding: Encoding, width: usize, value: i64) -> RigResult<()> {
    validation::is_not_empty(name)
        .map_err(|e| RigError::Configuration(format!("channel name: {e}")))?;
    validation::is_valid_width(width)
        .map_err(|e| RigError::Configuration(format!("channel '{name}': {e}")))?;
    let fits = match encoding {
        Encoding::Bool => {
            if width != 1 {
                return Err(RigError::Configuration(format!(
                    "channel '{name}': boolean channels must have byte width 1"
                )));
            }
            validation::fits_unsigned(value, 1)
        }
        Encoding::Unsigned => validation::fits_unsigned(value, width),
        Encoding::Signed => validation::fits_signed(value, width),
    };
    fits.map_err(|e| RigError::Configuration(format!("channel '{name}': {e}")))
}

/// Range check for a runtime value assignment against an entry's declared
/// encoding and width.
pub fn value_in_range(encoding: Encoding, width: usize, value: i64) -> bool {
    match encoding {
        Encoding::Bool => (0..=1).contains(&value),
        Encoding::Unsigned => validation::fits_unsigned(value, width).is_ok(),
        Encoding::Signed => validation::fits_signed(value, width).is_ok(),
    }
}

/// The insertion-ordered sequence of input entries transmitted inbound per
/// exchange. Order is set once and matches the firmware's field order.
#[derive(Default)]
pub struct InputFrame {
    entries: Vec<InputEntry>,
}

impl InputFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the end of the frame.
    pub fn push(&mut self, entry: InputEntry) {
        self.entries.push(entry);
    }

    /// Insert an entry at the front of the frame (reserved channels come
    /// first on the wire).
    pub fn push_front(&mut self, entry: InputEntry) {
        self.entries.insert(0, entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&InputEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut InputEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    /// Current value of a named channel.
    pub fn value(&self, name: &str) -> RigResult<i64> {
        self.get(name)
            .map(|e| e.value)
            .ok_or_else(|| RigError::UnknownChannel(name.to_string()))
    }

    pub fn set(&mut self, name: &str, value: i64) -> RigResult<()> {
        let entry = self
            .get_mut(name)
            .ok_or_else(|| RigError::UnknownChannel(name.to_string()))?;
        entry.value = value;
        Ok(())
    }

    /// Current value of the canonical millisecond clock, 0 when absent.
    pub fn clock_ms(&self) -> i64 {
        self.get(CLOCK_CHANNEL).map(|e| e.value).unwrap_or(0)
    }

    pub fn entries(&self) -> &[InputEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [InputEntry] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate every entry and reject duplicate names. Fatal at session
    /// start, before any hardware write occurs.
    pub fn validate(&self) -> RigResult<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            entry.validate()?;
            if self.entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(RigError::Configuration(format!(
                    "duplicate input channel '{}'",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

/// The insertion-ordered sequence of output entries transmitted outbound
/// per exchange.
#[derive(Default)]
pub struct OutputFrame {
    entries: Vec<OutputEntry>,
}

impl OutputFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: OutputEntry) {
        self.entries.push(entry);
    }

    pub fn push_front(&mut self, entry: OutputEntry) {
        self.entries.insert(0, entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&OutputEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut OutputEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    pub fn value(&self, name: &str) -> RigResult<i64> {
        self.get(name)
            .map(|e| e.value)
            .ok_or_else(|| RigError::UnknownChannel(name.to_string()))
    }

    /// Assign a value to a named channel, range-checked against its
    /// declared encoding and width.
    pub fn set(&mut self, name: &str, value: i64) -> RigResult<()> {
        let entry = self
            .get_mut(name)
            .ok_or_else(|| RigError::UnknownChannel(name.to_string()))?;
        if !value_in_range(entry.encoding, entry.width, value) {
            return Err(RigError::ValueRange {
                channel: name.to_string(),
                value,
            });
        }
        entry.value = value;
        Ok(())
    }

    pub fn entries(&self) -> &[OutputEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [OutputEntry] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total outbound payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.entries.iter().map(|e| e.width).sum()
    }

    pub fn validate(&self) -> RigResult<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            entry.validate()?;
            if self.entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(RigError::Configuration(format!(
                    "duplicate output channel '{}'",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

/// Inject the reserved channels every session requires: the millisecond
/// clock input and the start/stop output. Injected at the front of their
/// frames when the caller's schema omits them.
pub fn ensure_reserved_channels(inputs: &mut InputFrame, outputs: &mut OutputFrame) {
    if !inputs.contains(CLOCK_CHANNEL) {
        inputs.push_front(devices::time_millis(false));
    }
    if !outputs.contains(START_STOP_CHANNEL) {
        outputs.push_front(devices::start_stop());
    }
}

/// Constructors for the channel kinds commonly wired to a rig.
pub mod devices {
    use super::*;

    /// A digital read of a pin (HIGH or LOW). Suitable for buttons, beam
    /// breaks and integrated touch sensors.
    pub fn binary_read(name: &str, logging: bool) -> InputEntry {
        InputEntry::new(name, Encoding::Unsigned, 1, logging)
    }

    /// Analog read of a pin, 0 to 1023. Suitable for potentiometers or
    /// photoresistors.
    pub fn analog_read(name: &str, logging: bool) -> InputEntry {
        InputEntry::new(name, Encoding::Unsigned, 2, logging)
    }

    /// Rotation position of a rotary encoder, full signed 32-bit range.
    pub fn rotary_encoder(name: &str, logging: bool) -> InputEntry {
        InputEntry::new(name, Encoding::Signed, 4, logging)
    }

    /// Reset control paired with a rotary encoder: sending `1` zeroes the
    /// firmware-side position counter.
    pub fn rotary_encoder_reset(name: &str) -> OutputEntry {
        OutputEntry::new(name, Encoding::Bool, 1, 0, true)
    }

    /// Capacitance sensing of a connected object; the range depends on the
    /// wiring.
    pub fn capacitive_touch(name: &str, logging: bool) -> InputEntry {
        InputEntry::new(name, Encoding::Signed, 4, logging)
    }

    /// A periodically toggling HIGH/LOW synchronization signal, mirrored
    /// back as a sensor so external recording hardware can be aligned with
    /// the session timeline. Counts only while the session is active.
    pub fn pulse_clock(name: &str, logging: bool) -> InputEntry {
        InputEntry::new(name, Encoding::Unsigned, 1, logging)
    }

    /// The canonical millisecond clock. Required as `t_ms` in every
    /// session and auto-injected when absent.
    pub fn time_millis(logging: bool) -> InputEntry {
        InputEntry::new(CLOCK_CHANNEL, Encoding::Unsigned, 4, logging)
    }

    /// Microsecond clock, mainly useful for performance testing the
    /// sampling path.
    pub fn time_micros(logging: bool) -> InputEntry {
        InputEntry::new(MICROS_CHANNEL, Encoding::Unsigned, 4, logging)
    }

    /// Directly hold a pin HIGH (1) or LOW (0): valves, LEDs, buzzers.
    pub fn direct_on(name: &str, start_value: bool) -> OutputEntry {
        OutputEntry::new(name, Encoding::Bool, 1, i64::from(start_value), false)
    }

    /// Hold a pin HIGH for the written number of milliseconds (0..65535),
    /// then drop it LOW firmware-side. The host value resets after send so
    /// a single write produces a single timed activation.
    pub fn timed_on(name: &str) -> OutputEntry {
        OutputEntry::new(name, Encoding::Unsigned, 2, 0, true)
    }

    /// Tone frequency for a passive buzzer or piezo, 0 for silence.
    pub fn tone(name: &str) -> OutputEntry {
        OutputEntry::new(name, Encoding::Unsigned, 2, 0, false)
    }

    /// Servo motor angle, 0 to 255.
    pub fn servo(name: &str) -> OutputEntry {
        OutputEntry::new(name, Encoding::Unsigned, 1, 127, false)
    }

    /// The reserved session start/stop control. Managed by the engine;
    /// auto-injected when absent.
    pub fn start_stop() -> OutputEntry {
        OutputEntry::new(START_STOP_CHANNEL, Encoding::Unsigned, 1, SIGNAL_IDLE, true)
    }
}
