//! The wire protocol layer: byte-exact codec plus the transport seam.
//!
//! [`Wire`] is the boundary between the synchronization loop and any
//! transport. Three implementations exist:
//!
//! - [`serial::SerialWire`]: the real thing, over a USB serial link.
//! - [`dummy::DummyWire`]: keyboard- or agent-driven operation with no
//!   hardware attached.
//! - [`mock::MockWire`]: scripted exchanges for tests.
//!
//! Channel values travel little-endian, sized to each entry's declared
//! byte width; booleans are a single `0x00`/`0x01` byte. The inbound frame
//! comes in two variants: *direct* mode carries one snapshot value per
//! entry, *archivist* mode carries per-entry timestamped change histories
//! accumulated firmware-side since the previous exchange.

pub mod dummy;
pub mod mock;
pub mod serial;

pub use dummy::{DummyWire, KeySource, ScriptedAgent};
pub use mock::{MockLink, MockWire};
pub use serial::{list_ports, RawLink, SerialPortLink, SerialWire};

use crate::error::RigResult;
use crate::event_log::HistorySink;
use crate::schema::{Encoding, InputFrame, OutputFrame};

/// Result of one read poll.
///
/// An explicit result type rather than exceptions-as-signals: "the
/// firmware has not answered yet" is an expected outcome, distinct from a
/// genuine channel failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Whether an inbound frame was applied to the input entries.
    pub updated: bool,
    /// Firmware-originated debug text trailing the frame, when present.
    pub debug: Option<String>,
}

impl ReadOutcome {
    /// No bytes were pending; nothing changed.
    pub fn idle() -> Self {
        Self::default()
    }

    /// A frame was applied.
    pub fn updated() -> Self {
        Self {
            updated: true,
            debug: None,
        }
    }
}

/// A duplex exchange transport for one session.
pub trait Wire: Send {
    /// Poll for an inbound frame and apply it to `inputs`. Never stalls
    /// the caller on "no data yet". In archivist mode, decoded history
    /// pairs for logging entries are appended to `sink` when `active`.
    fn read(
        &mut self,
        inputs: &mut InputFrame,
        sink: &mut dyn HistorySink,
        active: bool,
    ) -> RigResult<ReadOutcome>;

    /// Serialize and transmit the outbound frame. Entries flagged
    /// reset-after-send revert to their defaults locally right after
    /// encoding, independent of transmission success.
    fn write(&mut self, outputs: &mut OutputFrame) -> RigResult<()>;

    /// Release the underlying channel.
    fn close(&mut self) -> RigResult<()>;

    /// Whether the inbound frame carries archivist-mode histories.
    fn archivist(&self) -> bool;
}

/// Encode one channel value little-endian into `buf`, sized to `width`.
pub fn encode_value(value: i64, encoding: Encoding, width: usize, buf: &mut Vec<u8>) {
    match encoding {
        Encoding::Bool => buf.push(u8::from(value != 0)),
        Encoding::Unsigned | Encoding::Signed => {
            let bytes = value.to_le_bytes();
            buf.extend_from_slice(&bytes[..width]);
        }
    }
}

/// Decode one little-endian channel value; sign-extends iff the encoding
/// is signed.
pub fn decode_value(bytes: &[u8], encoding: Encoding) -> i64 {
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    let unsigned = i64::from_le_bytes(raw);
    match encoding {
        Encoding::Bool => i64::from(unsigned != 0),
        Encoding::Unsigned => unsigned,
        Encoding::Signed => {
            let width = bytes.len();
            if width < 8 {
                let shift = 64 - 8 * width as u32;
                (unsigned << shift) >> shift
            } else {
                unsigned
            }
        }
    }
}
