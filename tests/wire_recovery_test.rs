//! Codec recovery behavior over a scripted raw link: reconnect storms,
//! desync handling, and the reset-after-send invariant under failure.

use rig_runner::event_log::{EventLog, NullSink, SessionInfo};
use rig_runner::schema::{devices, InputFrame, OutputFrame};
use rig_runner::wire::{MockLink, ReadOutcome, SerialWire, Wire};

fn frame() -> InputFrame {
    let mut inputs = InputFrame::new();
    inputs.push(devices::time_millis(false));
    inputs.push(devices::binary_read("button", true));
    inputs
}

#[test]
fn three_read_failures_then_a_consistent_fourth_read() {
    let link = MockLink::new();
    let mut wire = SerialWire::with_link(link.clone(), false);
    let mut inputs = frame();
    let mut sink = NullSink::default();

    for _ in 0..3 {
        link.push_direct_frame(&[0, 0, 0, 0, 0]);
        link.fail_next_reads(1);
        // the codec absorbs the failure: no error escapes, the link is
        // reopened, and the caller's handshake is not starved
        let outcome = wire.read(&mut inputs, &mut sink, false).unwrap();
        assert!(outcome.updated);
        assert!(outcome.debug.is_none());
    }
    assert_eq!(link.reopen_count(), 3);

    link.push_direct_frame(&[0x40, 0x00, 0x00, 0x00, 0x01]);
    let outcome = wire.read(&mut inputs, &mut sink, false).unwrap();
    assert_eq!(
        outcome,
        ReadOutcome {
            updated: true,
            debug: None
        }
    );
    assert_eq!(inputs.value("t_ms").unwrap(), 0x40);
    assert_eq!(inputs.value("button").unwrap(), 1);
}

#[test]
fn desync_clears_the_buffer_so_later_frames_decode_cleanly() {
    let link = MockLink::new();
    let mut wire = SerialWire::with_link(link.clone(), false);
    let mut inputs = frame();
    let mut sink = NullSink::default();

    // a truncated frame followed by garbage that would misalign decoding
    link.push_bytes(&[0x05, 0xAA, 0xBB]);
    wire.read(&mut inputs, &mut sink, false).unwrap();
    assert_eq!(link.pending(), 0);
    assert!(link.clear_count() >= 1);

    // the next full frame decodes as if nothing happened
    link.push_direct_frame(&[0x10, 0x00, 0x00, 0x00, 0x00]);
    wire.read(&mut inputs, &mut sink, false).unwrap();
    assert_eq!(inputs.value("t_ms").unwrap(), 0x10);
    assert_eq!(inputs.value("button").unwrap(), 0);
}

#[test]
fn reset_after_send_holds_across_a_write_failure_and_reconnect() {
    let link = MockLink::new();
    let mut wire = SerialWire::with_link(link.clone(), false);

    let mut outputs = OutputFrame::new();
    outputs.push(devices::start_stop());
    outputs.push(devices::timed_on("reward"));
    outputs.set("reward", 120).unwrap();

    link.fail_next_writes(1);
    wire.write(&mut outputs).unwrap();

    // the entry reverted the moment it was encoded, not when (or
    // whether) the bytes made it out
    assert_eq!(outputs.value("reward").unwrap(), 0);
    assert_eq!(link.reopen_count(), 1);
    assert_eq!(link.written(), vec![vec![0x00, 120, 0x00]]);
}

#[test]
fn archivist_histories_survive_an_interleaved_reconnect() {
    let link = MockLink::new();
    let mut wire = SerialWire::with_link(link.clone(), true);

    let mut inputs = InputFrame::new();
    inputs.push(devices::binary_read("lick", true));
    let mut log = EventLog::new(SessionInfo::new("_"));

    // first frame: two history pairs
    link.push_bytes(&[0x02, 0x00]);
    link.push_bytes(&[10, 0, 0, 0, 11, 0, 0, 0]);
    link.push_bytes(&[1, 0]);
    wire.read(&mut inputs, &mut log, true).unwrap();

    // a failure in between
    link.push_bytes(&[0xFF]);
    link.fail_next_reads(1);
    wire.read(&mut inputs, &mut log, true).unwrap();

    // recovery frame with one more pair: appended in order, nothing
    // duplicated or misattributed
    link.push_bytes(&[0x01, 0x00]);
    link.push_bytes(&[42, 0, 0, 0]);
    link.push_bytes(&[0]);
    wire.read(&mut inputs, &mut log, true).unwrap();

    assert_eq!(log.sensors["lick"], vec![(10, 1), (11, 0), (42, 0)]);
    assert_eq!(inputs.value("lick").unwrap(), 0);
}
