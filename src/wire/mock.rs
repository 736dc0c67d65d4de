//! Mock transports for testing without physical hardware.
//!
//! Two seams are covered:
//! - [`MockLink`] implements [`RawLink`] with a scripted byte buffer and
//!   controllable failure injection, exercising the full codec.
//! - [`MockWire`] implements [`Wire`] directly with scripted per-exchange
//!   value assignments, for driving the synchronization loop in tests.
//!
//! Both keep their state behind a shared handle so a test can keep
//! inspecting after ownership moves into the codec or the engine.

use crate::error::{RigError, RigResult};
use crate::event_log::HistorySink;
use crate::schema::{InputFrame, OutputFrame};
use crate::wire::serial::RawLink;
use crate::wire::{ReadOutcome, Wire};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct LinkState {
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    fail_reads: usize,
    fail_writes: usize,
    fail_reopens: usize,
    reopens: usize,
    clears: usize,
    closed: bool,
}

/// Scripted raw byte channel with failure injection.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw inbound bytes.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().inbound.extend(bytes);
    }

    /// Queue a direct-mode frame: one length byte plus the payload.
    pub fn push_direct_frame(&self, payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.inbound.push_back(payload.len() as u8);
        state.inbound.extend(payload);
    }

    /// Queue a trailing debug block.
    pub fn push_debug(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        state.inbound.push_back(text.len() as u8);
        state.inbound.extend(text.as_bytes());
    }

    /// Fail the next `n` read calls.
    pub fn fail_next_reads(&self, n: usize) {
        self.state.lock().unwrap().fail_reads = n;
    }

    /// Fail the next `n` write calls.
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().unwrap().fail_writes = n;
    }

    /// Fail the next `n` reopen attempts.
    pub fn fail_next_reopens(&self, n: usize) {
        self.state.lock().unwrap().fail_reopens = n;
    }

    /// Number of successful reopens so far.
    pub fn reopen_count(&self) -> usize {
        self.state.lock().unwrap().reopens
    }

    /// Number of input-buffer clears so far.
    pub fn clear_count(&self) -> usize {
        self.state.lock().unwrap().clears
    }

    /// Successful writes, one byte vector per call.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    /// Inbound bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().inbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl RawLink for MockLink {
    fn reopen(&mut self) -> RigResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reopens > 0 {
            state.fail_reopens -= 1;
            return Err(RigError::Channel("injected reopen failure".into()));
        }
        state.reopens += 1;
        state.closed = false;
        Ok(())
    }

    fn bytes_available(&mut self) -> RigResult<usize> {
        Ok(self.state.lock().unwrap().inbound.len())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> RigResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(RigError::Channel("injected read failure".into()));
        }
        if state.inbound.len() < buf.len() {
            return Err(RigError::Desync(format!(
                "requested {} bytes with {} available",
                buf.len(),
                state.inbound.len()
            )));
        }
        for slot in buf.iter_mut() {
            if let Some(byte) = state.inbound.pop_front() {
                *slot = byte;
            }
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> RigResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(RigError::Channel("injected write failure".into()));
        }
        state.written.push(bytes.to_vec());
        Ok(())
    }

    fn clear_input(&mut self) -> RigResult<()> {
        let mut state = self.state.lock().unwrap();
        state.clears += 1;
        state.inbound.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }

    fn describe(&self) -> String {
        "mock-link".to_string()
    }
}

#[derive(Default)]
struct WireState {
    exchanges: VecDeque<Vec<(String, i64)>>,
    written: Vec<Vec<(String, i64)>>,
    closed: bool,
}

/// Scripted [`Wire`] for driving the synchronization loop directly: each
/// queued exchange is a set of input assignments applied on one read.
#[derive(Clone, Default)]
pub struct MockWire {
    state: Arc<Mutex<WireState>>,
}

impl MockWire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one exchange worth of input assignments.
    pub fn script_exchange(&self, assignments: &[(&str, i64)]) {
        self.state.lock().unwrap().exchanges.push_back(
            assignments
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        );
    }

    /// Snapshots of every transmitted outbound frame, captured before
    /// reset-after-send reverts.
    pub fn written(&self) -> Vec<Vec<(String, i64)>> {
        self.state.lock().unwrap().written.clone()
    }

    /// Value of `channel` in transmitted frame `index`.
    pub fn written_value(&self, index: usize, channel: &str) -> Option<i64> {
        self.state.lock().unwrap().written.get(index).and_then(|frame| {
            frame
                .iter()
                .find(|(name, _)| name == channel)
                .map(|&(_, value)| value)
        })
    }

    pub fn exchanges_left(&self) -> usize {
        self.state.lock().unwrap().exchanges.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Wire for MockWire {
    fn read(
        &mut self,
        inputs: &mut InputFrame,
        _sink: &mut dyn HistorySink,
        _active: bool,
    ) -> RigResult<ReadOutcome> {
        let exchange = self.state.lock().unwrap().exchanges.pop_front();
        match exchange {
            Some(assignments) => {
                for (name, value) in assignments {
                    inputs.set(&name, value)?;
                }
                Ok(ReadOutcome::updated())
            }
            None => Ok(ReadOutcome::idle()),
        }
    }

    fn write(&mut self, outputs: &mut OutputFrame) -> RigResult<()> {
        let snapshot = outputs
            .entries()
            .iter()
            .map(|e| (e.name.clone(), e.value))
            .collect();
        self.state.lock().unwrap().written.push(snapshot);
        for entry in outputs.entries_mut() {
            if entry.reset_after_send {
                entry.value = entry.default;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> RigResult<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    fn archivist(&self) -> bool {
        false
    }
}
