//! Hardware-free operation: keyboard- or agent-driven input.
//!
//! `DummyWire` substitutes for a missing physical link so a task can be
//! developed and piloted on any machine. It derives the millisecond clock
//! from wall time, anchored when the session's start signal goes out, and
//! fills input entries either from live key state (through each entry's
//! [`crate::schema::KeyBinding`]) or from a scripted agent invoked at its
//! configured frequency. Reset-after-send is honored identically to the
//! real link. Always direct mode, as there is no firmware-side history to
//! archive.

use crate::error::RigResult;
use crate::event_log::HistorySink;
use crate::schema::{InputFrame, OutputFrame, CLOCK_CHANNEL, MICROS_CHANNEL, SIGNAL_START, START_STOP_CHANNEL};
use crate::wire::{ReadOutcome, Wire};
use log::info;
use std::time::Instant;

/// Live key-state provider for keyboard mode. Implementations wrap
/// whatever key hook the host platform offers.
pub trait KeySource: Send {
    /// Whether the named key is currently held down.
    fn is_pressed(&mut self, key: &str) -> bool;
}

/// A scripted agent driving the rig's inputs, for closed-loop testing or
/// simulated subjects.
pub trait ScriptedAgent: Send {
    /// How often `act` should be invoked, in Hz.
    fn act_frequency_hz(&self) -> f64;
    /// Update input entries for the current moment.
    fn act(&mut self, inputs: &mut InputFrame);
}

enum DummyMode {
    Keyboard(Box<dyn KeySource>),
    Agent(Box<dyn ScriptedAgent>),
}

/// The hardware-free [`Wire`].
pub struct DummyWire {
    mode: DummyMode,
    anchor: Option<Instant>,
    last_agent_act_ms: Option<i64>,
}

impl DummyWire {
    /// Keyboard-driven operation; entries with a key binding derive their
    /// values from `source`.
    pub fn keyboard(source: Box<dyn KeySource>) -> Self {
        info!("running dummy wire with keyboard inputs - no connected rig needed");
        Self {
            mode: DummyMode::Keyboard(source),
            anchor: None,
            last_agent_act_ms: None,
        }
    }

    /// Agent-driven operation.
    pub fn agent(agent: Box<dyn ScriptedAgent>) -> Self {
        info!("running dummy wire with a scripted agent - no connected rig needed");
        Self {
            mode: DummyMode::Agent(agent),
            anchor: None,
            last_agent_act_ms: None,
        }
    }

    fn now_ms(&mut self) -> i64 {
        let anchor = *self.anchor.get_or_insert_with(Instant::now);
        anchor.elapsed().as_millis() as i64
    }
}

impl Wire for DummyWire {
    fn read(
        &mut self,
        inputs: &mut InputFrame,
        _sink: &mut dyn HistorySink,
        _active: bool,
    ) -> RigResult<ReadOutcome> {
        let t = self.now_ms();
        if inputs.contains(CLOCK_CHANNEL) {
            inputs.set(CLOCK_CHANNEL, t)?;
        }
        if inputs.contains(MICROS_CHANNEL) {
            inputs.set(MICROS_CHANNEL, t * 1000)?;
        }

        match &mut self.mode {
            DummyMode::Keyboard(source) => {
                for entry in inputs.entries_mut() {
                    if let Some(binding) = &mut entry.key_binding {
                        let pressed: Vec<bool> = binding
                            .keys
                            .iter()
                            .map(|key| source.is_pressed(key))
                            .collect();
                        entry.value = (binding.control)(&pressed, entry.value);
                    }
                }
            }
            DummyMode::Agent(agent) => {
                let period_ms = (1000.0 / agent.act_frequency_hz()) as i64;
                let due = self
                    .last_agent_act_ms
                    .map_or(true, |last| t >= last + period_ms);
                if due {
                    self.last_agent_act_ms = Some(t);
                    agent.act(inputs);
                }
            }
        }

        Ok(ReadOutcome::updated())
    }

    fn write(&mut self, outputs: &mut OutputFrame) -> RigResult<()> {
        for entry in outputs.entries_mut() {
            // the start signal resets the simulated hardware clock, just
            // as it resets the firmware clock on a real rig
            if entry.name == START_STOP_CHANNEL && entry.value == SIGNAL_START {
                self.anchor = Some(Instant::now());
            }
            if entry.reset_after_send {
                entry.value = entry.default;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> RigResult<()> {
        Ok(())
    }

    fn archivist(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::NullSink;
    use crate::schema::{devices, InputEntry, Encoding};

    struct HeldKeys(Vec<&'static str>);

    impl KeySource for HeldKeys {
        fn is_pressed(&mut self, key: &str) -> bool {
            self.0.contains(&key)
        }
    }

    #[test]
    fn key_bindings_drive_bound_entries() {
        let mut inputs = InputFrame::new();
        inputs.push(devices::time_millis(false));
        inputs.push(
            InputEntry::new("lick", Encoding::Unsigned, 1, true).with_keys(
                ["space"],
                Box::new(|pressed, _prev| i64::from(pressed[0])),
            ),
        );
        inputs.push(devices::analog_read("unbound", true));

        let mut wire = DummyWire::keyboard(Box::new(HeldKeys(vec!["space"])));
        let outcome = wire
            .read(&mut inputs, &mut NullSink::default(), true)
            .unwrap();

        assert!(outcome.updated);
        assert_eq!(inputs.value("lick").unwrap(), 1);
        assert_eq!(inputs.value("unbound").unwrap(), 0);
    }

    #[test]
    fn mapping_receives_previous_value() {
        let mut inputs = InputFrame::new();
        inputs.push(
            InputEntry::new("wheel", Encoding::Signed, 4, true).with_keys(
                ["left", "right"],
                Box::new(|pressed, prev| {
                    prev + i64::from(pressed[1]) - i64::from(pressed[0])
                }),
            ),
        );

        let mut wire = DummyWire::keyboard(Box::new(HeldKeys(vec!["right"])));
        for _ in 0..3 {
            wire.read(&mut inputs, &mut NullSink::default(), true)
                .unwrap();
        }
        assert_eq!(inputs.value("wheel").unwrap(), 3);
    }

    #[test]
    fn start_signal_anchors_the_clock() {
        let mut wire = DummyWire::keyboard(Box::new(HeldKeys(vec![])));
        let mut inputs = InputFrame::new();
        inputs.push(devices::time_millis(false));
        wire.read(&mut inputs, &mut NullSink::default(), false)
            .unwrap();

        let mut outputs = OutputFrame::new();
        outputs.push(devices::start_stop());
        outputs.set(START_STOP_CHANNEL, SIGNAL_START).unwrap();
        wire.write(&mut outputs).unwrap();

        // the reserved control resets after send, and the re-anchored
        // clock restarts near zero
        assert_eq!(outputs.value(START_STOP_CHANNEL).unwrap(), 0);
        wire.read(&mut inputs, &mut NullSink::default(), false)
            .unwrap();
        assert!(inputs.clock_ms() < 100);
    }

    struct Flipper {
        last: i64,
    }

    impl ScriptedAgent for Flipper {
        fn act_frequency_hz(&self) -> f64 {
            1000.0
        }

        fn act(&mut self, inputs: &mut InputFrame) {
            self.last = 1 - self.last;
            let _ = inputs.set("button", self.last);
        }
    }

    #[test]
    fn agent_acts_through_the_read_path() {
        let mut inputs = InputFrame::new();
        inputs.push(devices::time_millis(false));
        inputs.push(devices::binary_read("button", true));

        let mut wire = DummyWire::agent(Box::new(Flipper { last: 0 }));
        wire.read(&mut inputs, &mut NullSink::default(), true)
            .unwrap();
        assert_eq!(inputs.value("button").unwrap(), 1);
    }
}
