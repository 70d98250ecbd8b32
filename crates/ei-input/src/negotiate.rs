//! Readiness negotiation with the EIS server.
//!
//! The server announces the connection, seats, devices and device
//! resumption asynchronously. [`negotiate`] drives a [`Backend`] with a
//! poll, dispatch, drain loop and folds every event into a
//! [`Negotiator`], an explicit state machine that only ever moves
//! forward:
//!
//! ```text
//! AwaitingConnect -> AwaitingSeat -> AwaitingDevice
//!     -> AwaitingResumeConfirmation -> Ready
//! ```
//!
//! Any state may instead end in `Failed` or `TimedOut`. No key event can
//! be sent before `Ready`, because the keyboard handle is only released to
//! the caller once that state is reached.

use std::fmt;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::emitter::KeySink;
use crate::error::NegotiationError;

/// Device capability flags, matching libei's `ei_device_capability`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const POINTER: Self = Self(1 << 0);
    pub const POINTER_ABSOLUTE: Self = Self(1 << 1);
    pub const KEYBOARD: Self = Self(1 << 2);
    pub const TOUCH: Self = Self(1 << 3);
    pub const SCROLL: Self = Self(1 << 4);
    pub const BUTTON: Self = Self(1 << 5);

    /// All six capabilities. Compositors hand these out as one group per
    /// seat, so they are always requested and bound together.
    pub const ALL: Self = Self(0b11_1111);

    const NAMED: [(Self, &'static str); 6] = [
        (Self::POINTER, "pointer"),
        (Self::POINTER_ABSOLUTE, "pointer_absolute"),
        (Self::KEYBOARD, "keyboard"),
        (Self::TOUCH, "touch"),
        (Self::SCROLL, "scroll"),
        (Self::BUTTON, "button"),
    ];

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterate over the individual flags set in `self`.
    pub fn iter(self) -> impl Iterator<Item = Self> {
        Self::NAMED
            .into_iter()
            .map(|(cap, _)| cap)
            .filter(move |cap| self.contains(*cap))
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Capabilities({})", names.join("|"))
    }
}

/// Protocol events the negotiation cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent<S, D> {
    /// The server accepted the connection.
    Connected,
    /// A seat and its capabilities have been announced.
    SeatAdded(S),
    /// A device has been fully described.
    DeviceAdded(D),
    /// The server allows emulation on this device.
    DeviceResumed(D),
    /// The server ended the connection.
    Disconnected(String),
}

/// Result of waiting on the backend's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Data is ready to be dispatched.
    Readable,
    /// The wait timed out without data.
    Timeout,
    /// The wait was interrupted by a signal.
    Interrupted,
}

/// An EIS connection as seen by the negotiation loop.
pub trait Backend {
    type Seat;
    type Device: Clone + PartialEq;
    /// The emission handle for a negotiated device.
    type Keyboard: KeySink;

    /// Wait up to `timeout` for the event channel to become readable.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Backend`] if the wait itself fails.
    fn wait_readable(&mut self, timeout: Duration) -> Result<PollOutcome, NegotiationError>;

    /// Read and decode whatever protocol data is available.
    ///
    /// Must not block when nothing is available.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Backend`] if the channel fails.
    fn dispatch(&mut self) -> Result<(), NegotiationError>;

    /// Pop the next decoded event.
    fn next_event(&mut self) -> Option<BackendEvent<Self::Seat, Self::Device>>;

    /// Capabilities advertised by a seat.
    fn seat_capabilities(&self, seat: &Self::Seat) -> Capabilities;

    /// Bind capabilities on a seat so the server creates devices for them.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Backend`] if the request cannot be sent.
    fn bind_capabilities(
        &mut self,
        seat: &Self::Seat,
        caps: Capabilities,
    ) -> Result<(), NegotiationError>;

    /// Whether a device accepts keyboard events.
    fn has_keyboard(&self, device: &Self::Device) -> bool;

    /// Tell the server that emulation on `device` begins now.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Backend`] if the request cannot be sent.
    fn start_emulating(&mut self, device: &Self::Device) -> Result<(), NegotiationError>;

    /// Turn the connection into an emission handle for a ready device.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Backend`] if the device lacks a keyboard
    /// interface.
    fn into_keyboard(self, device: Self::Device) -> Result<Self::Keyboard, NegotiationError>
    where
        Self: Sized;
}

/// Negotiation progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingConnect,
    AwaitingSeat,
    AwaitingDevice,
    AwaitingResumeConfirmation,
    Ready,
    Failed(NegotiationError),
    TimedOut,
}

impl NegotiationState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_) | Self::TimedOut)
    }
}

/// Timing parameters for [`negotiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationConfig {
    /// How long a single poll waits for data.
    pub poll_timeout: Duration,
    /// Consecutive poll timeouts after which negotiation gives up.
    pub max_timeouts: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            max_timeouts: 10,
        }
    }
}

/// The negotiation state machine.
///
/// Holds the keyboard device once one has been announced. The device is
/// only handed out by [`Negotiator::into_device`] once `Ready`.
pub struct Negotiator<B: Backend> {
    state: NegotiationState,
    device: Option<B::Device>,
}

impl<B: Backend> Default for Negotiator<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Negotiator<B> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: NegotiationState::AwaitingConnect,
            device: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// The keyboard device, available only once `Ready`.
    #[must_use]
    pub fn into_device(self) -> Option<B::Device> {
        match self.state {
            NegotiationState::Ready => self.device,
            _ => None,
        }
    }

    /// Fold one backend event into the state machine.
    pub fn handle(&mut self, backend: &mut B, event: BackendEvent<B::Seat, B::Device>) {
        use NegotiationState as S;

        if self.state.is_terminal() {
            tracing::trace!(state = ?self.state, "Ignoring event after negotiation ended");
            return;
        }

        match event {
            BackendEvent::Connected => {
                if self.state == S::AwaitingConnect {
                    self.transition(S::AwaitingSeat);
                }
            }
            BackendEvent::SeatAdded(seat) => {
                if self.state == S::AwaitingConnect {
                    tracing::debug!("Seat announced before connection, ignoring");
                    return;
                }
                // Every seat must offer a keyboard and gets the full set
                // bound; only the first one moves the state forward.
                let caps = backend.seat_capabilities(&seat);
                tracing::debug!(?caps, state = ?self.state, "Seat added");
                if !caps.contains(Capabilities::KEYBOARD) {
                    self.fail(NegotiationError::NoKeyboardCapability);
                    return;
                }
                match backend.bind_capabilities(&seat, Capabilities::ALL) {
                    Ok(()) if self.state == S::AwaitingSeat => self.transition(S::AwaitingDevice),
                    Ok(()) => {}
                    Err(e) => self.fail(e),
                }
            }
            BackendEvent::DeviceAdded(device) => {
                if self.state != S::AwaitingDevice {
                    tracing::debug!(state = ?self.state, "Device added, not waiting for one");
                    return;
                }
                if backend.has_keyboard(&device) {
                    tracing::debug!("Keyboard device added");
                    self.device = Some(device);
                    self.transition(S::AwaitingResumeConfirmation);
                } else {
                    tracing::debug!("Device without keyboard, ignoring");
                }
            }
            BackendEvent::DeviceResumed(device) => {
                if self.state != S::AwaitingResumeConfirmation
                    || self.device.as_ref() != Some(&device)
                {
                    tracing::debug!("Resume for another device, ignoring");
                    return;
                }
                match backend.start_emulating(&device) {
                    Ok(()) => self.transition(S::Ready),
                    Err(e) => self.fail(e),
                }
            }
            BackendEvent::Disconnected(reason) => {
                self.fail(NegotiationError::Disconnected(reason));
            }
        }
    }

    /// Give up waiting. No-op once terminal.
    pub fn time_out(&mut self) {
        if !self.state.is_terminal() {
            self.transition(NegotiationState::TimedOut);
        }
    }

    fn fail(&mut self, error: NegotiationError) {
        tracing::debug!(%error, "Negotiation failed");
        self.device = None;
        self.transition(NegotiationState::Failed(error));
    }

    fn transition(&mut self, next: NegotiationState) {
        tracing::debug!(from = ?self.state, to = ?next, "Negotiation transition");
        self.state = next;
    }
}

/// Wait until the backend offers a resumed keyboard device.
///
/// Each iteration waits up to `config.poll_timeout`, then always
/// dispatches (data may have arrived after the wait returned) and drains
/// every pending event into the state machine.
///
/// # Errors
///
/// - [`NegotiationError::NoKeyboardCapability`] if the seat has no keyboard
/// - [`NegotiationError::Disconnected`] if the server hangs up
/// - [`NegotiationError::TimedOut`] after `config.max_timeouts` consecutive
///   empty polls
/// - [`NegotiationError::Cancelled`] if `cancel` is tripped
/// - [`NegotiationError::Backend`] if the channel fails
pub fn negotiate<B: Backend>(
    backend: &mut B,
    config: &NegotiationConfig,
    cancel: &CancelToken,
) -> Result<B::Device, NegotiationError> {
    let mut negotiator = Negotiator::<B>::new();
    let mut timeouts = 0u32;

    loop {
        if cancel.is_cancelled() {
            negotiator.time_out();
            return Err(NegotiationError::Cancelled);
        }

        match backend.wait_readable(config.poll_timeout)? {
            PollOutcome::Readable => timeouts = 0,
            PollOutcome::Timeout => {
                timeouts += 1;
                tracing::debug!(timeouts, max = config.max_timeouts, "Poll timeout");
            }
            PollOutcome::Interrupted => {}
        }

        backend.dispatch()?;
        while let Some(event) = backend.next_event() {
            negotiator.handle(backend, event);
        }

        match negotiator.state() {
            NegotiationState::Ready => {
                tracing::debug!("Keyboard ready for emulation");
                return negotiator
                    .into_device()
                    .ok_or_else(|| NegotiationError::Backend("ready without a device".into()));
            }
            NegotiationState::Failed(e) => return Err(e.clone()),
            _ => {}
        }

        if timeouts >= config.max_timeouts {
            negotiator.time_out();
            return Err(NegotiationError::TimedOut { polls: timeouts });
        }
    }
}
