//! In-memory doubles for the libei backend, used by unit tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::emitter::KeySink;
use crate::error::{InputError, NegotiationError};
use crate::negotiate::{Backend, BackendEvent, Capabilities, PollOutcome};

/// One call observed by a [`RecordingSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOp {
    Press(u32),
    Release(u32),
    Frame,
    Dispatch,
}

/// Records every key, frame and dispatch call in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub ops: Vec<SinkOp>,
    /// Index of the key call that fails (once) with a transport error.
    pub fail_at: Option<usize>,
    key_calls: usize,
}

impl RecordingSink {
    pub fn failing_at(call: usize) -> Self {
        Self {
            fail_at: Some(call),
            ..Self::default()
        }
    }

    /// Only the press and release calls.
    pub fn key_events(&self) -> Vec<SinkOp> {
        self.ops
            .iter()
            .copied()
            .filter(|op| matches!(op, SinkOp::Press(_) | SinkOp::Release(_)))
            .collect()
    }

    pub fn dispatches(&self) -> usize {
        self.ops.iter().filter(|op| **op == SinkOp::Dispatch).count()
    }
}

impl KeySink for RecordingSink {
    fn key(&mut self, keycode: u32, pressed: bool) -> Result<(), InputError> {
        let call = self.key_calls;
        self.key_calls += 1;
        if self.fail_at == Some(call) {
            return Err(InputError::Transport("mock failure".into()));
        }
        self.ops.push(if pressed {
            SinkOp::Press(keycode)
        } else {
            SinkOp::Release(keycode)
        });
        Ok(())
    }

    fn frame(&mut self) -> Result<(), InputError> {
        self.ops.push(SinkOp::Frame);
        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), InputError> {
        self.ops.push(SinkOp::Dispatch);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSeat {
    pub id: u32,
    pub caps: Capabilities,
}

impl MockSeat {
    pub fn new(id: u32, caps: Capabilities) -> Self {
        Self { id, caps }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub id: u32,
    pub keyboard: bool,
}

impl MockDevice {
    pub fn new(id: u32, keyboard: bool) -> Self {
        Self { id, keyboard }
    }
}

/// What a single poll of a [`ScriptedBackend`] observes.
#[derive(Debug)]
pub enum Step {
    /// The poll reports data; these events decode on the next dispatch.
    Readable(Vec<BackendEvent<MockSeat, MockDevice>>),
    /// The poll times out, yet these events still decode on dispatch.
    Timeout(Vec<BackendEvent<MockSeat, MockDevice>>),
    Interrupted,
    Error(String),
}

/// A backend that replays a fixed script of poll results.
///
/// Once the script runs out every poll times out.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    pub steps: VecDeque<Step>,
    pub polls: usize,
    pub dispatches: usize,
    pub bound: Vec<(u32, Capabilities)>,
    pub started: Vec<MockDevice>,
    pub fail_start: bool,
    /// Trip the token once this many polls have happened.
    pub cancel_after_polls: Option<(usize, CancelToken)>,
    staged: Vec<BackendEvent<MockSeat, MockDevice>>,
    pending: VecDeque<BackendEvent<MockSeat, MockDevice>>,
}

impl ScriptedBackend {
    pub fn with_steps(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            ..Self::default()
        }
    }

    /// A backend whose `start_emulating` is refused.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }
}

impl Backend for ScriptedBackend {
    type Seat = MockSeat;
    type Device = MockDevice;
    type Keyboard = RecordingSink;

    fn wait_readable(&mut self, _timeout: Duration) -> Result<PollOutcome, NegotiationError> {
        self.polls += 1;
        if let Some((after, token)) = &self.cancel_after_polls {
            if self.polls >= *after {
                token.cancel();
            }
        }
        match self.steps.pop_front() {
            Some(Step::Readable(events)) => {
                self.staged.extend(events);
                Ok(PollOutcome::Readable)
            }
            Some(Step::Timeout(events)) => {
                self.staged.extend(events);
                Ok(PollOutcome::Timeout)
            }
            Some(Step::Interrupted) => Ok(PollOutcome::Interrupted),
            Some(Step::Error(e)) => Err(NegotiationError::Backend(e)),
            None => Ok(PollOutcome::Timeout),
        }
    }

    fn dispatch(&mut self) -> Result<(), NegotiationError> {
        self.dispatches += 1;
        self.pending.extend(self.staged.drain(..));
        Ok(())
    }

    fn next_event(&mut self) -> Option<BackendEvent<MockSeat, MockDevice>> {
        self.pending.pop_front()
    }

    fn seat_capabilities(&self, seat: &MockSeat) -> Capabilities {
        seat.caps
    }

    fn bind_capabilities(
        &mut self,
        seat: &MockSeat,
        caps: Capabilities,
    ) -> Result<(), NegotiationError> {
        self.bound.push((seat.id, caps));
        Ok(())
    }

    fn has_keyboard(&self, device: &MockDevice) -> bool {
        device.keyboard
    }

    fn start_emulating(&mut self, device: &MockDevice) -> Result<(), NegotiationError> {
        if self.fail_start {
            return Err(NegotiationError::Backend("start_emulating refused".into()));
        }
        self.started.push(device.clone());
        Ok(())
    }

    fn into_keyboard(self, device: MockDevice) -> Result<RecordingSink, NegotiationError> {
        if !device.keyboard {
            return Err(NegotiationError::Backend("device has no keyboard".into()));
        }
        Ok(RecordingSink::default())
    }
}
