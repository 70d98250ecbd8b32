//! Direct `reis` (libei) backend.
//!
//! Speaks the libei protocol over an already-authorized EIS socket:
//! handshake, seat and device discovery feed the [`negotiate`] state
//! machine, and the negotiated device becomes an [`EiKeyboard`].
//!
//! [`negotiate`]: crate::negotiate

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::thread;
use std::time::{Duration, SystemTime};

use reis::ei;
use reis::handshake::ei_handshake_blocking;
use reis::PendingRequestResult;
use rustix::event::{PollFd, PollFlags};
use rustix::io::Errno;

use crate::emitter::KeySink;
use crate::error::{InputError, NegotiationError};
use crate::negotiate::{Backend, BackendEvent, Capabilities, PollOutcome};
use crate::portal::EisChannel;

/// How long the libei handshake may take before giving up.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const FLUSH_MAX_RETRIES: u32 = 50;
const FLUSH_INITIAL_DELAY: Duration = Duration::from_millis(1);
const FLUSH_MAX_DELAY: Duration = Duration::from_millis(100);

/// Map an `ei_*` interface name to the capability it provides.
#[must_use]
pub fn capability_for_interface(name: &str) -> Capabilities {
    match name {
        "ei_pointer" => Capabilities::POINTER,
        "ei_pointer_absolute" => Capabilities::POINTER_ABSOLUTE,
        "ei_keyboard" => Capabilities::KEYBOARD,
        "ei_touchscreen" => Capabilities::TOUCH,
        "ei_scroll" => Capabilities::SCROLL,
        "ei_button" => Capabilities::BUTTON,
        _ => Capabilities::NONE,
    }
}

/// Combined protocol mask for the advertised interfaces covered by `caps`.
fn bind_mask(advertised: &HashMap<String, u64>, caps: Capabilities) -> u64 {
    advertised
        .iter()
        .filter(|(name, _)| {
            let cap = capability_for_interface(name);
            cap != Capabilities::NONE && caps.contains(cap)
        })
        .fold(0, |mask, (_, bits)| mask | bits)
}

/// Current time in microseconds for frame events.
#[allow(clippy::cast_possible_truncation)]
fn timestamp_us() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map_or(0, |d| d.as_micros() as u64)
}

/// Run `op` until it stops failing with `WouldBlock`, backing off between
/// attempts. A full socket buffer is common while typing long input.
fn retry_would_block<E>(mut op: impl FnMut() -> Result<(), E>) -> io::Result<()>
where
    io::Error: From<E>,
{
    let mut delay = FLUSH_INITIAL_DELAY;
    let mut retries = 0;
    loop {
        let err = match op() {
            Ok(()) => return Ok(()),
            Err(e) => io::Error::from(e),
        };
        if err.kind() != ErrorKind::WouldBlock {
            return Err(err);
        }
        retries += 1;
        if retries > FLUSH_MAX_RETRIES {
            return Err(io::Error::new(
                ErrorKind::WouldBlock,
                format!("socket buffer still full after {FLUSH_MAX_RETRIES} retries"),
            ));
        }
        tracing::trace!(retries, ?delay, "EIS socket full, retrying flush");
        thread::sleep(delay);
        delay = (delay * 2).min(FLUSH_MAX_DELAY);
    }
}

fn flush(context: &ei::Context) -> io::Result<()> {
    retry_would_block(|| context.flush())
}

/// Read whatever the socket has without blocking. Returns `false` once the
/// server has closed the connection.
fn read_available(context: &ei::Context) -> io::Result<bool> {
    match context.read() {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) => {
            let e = io::Error::from(e);
            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
                Ok(true)
            } else {
                Err(e)
            }
        }
    }
}

/// Unwrap one decoded message. Messages for unknown objects are skipped;
/// a parse error leaves the stream unusable.
fn decoded<T>(result: PendingRequestResult<T>) -> Result<Option<T>, String> {
    match result {
        PendingRequestResult::Request(event) => Ok(Some(event)),
        PendingRequestResult::ParseError(e) => Err(format!("parse error: {e:?}")),
        PendingRequestResult::InvalidObject(id) => {
            tracing::debug!(id, "Event for unknown object");
            Ok(None)
        }
    }
}

/// Interfaces announced for one device.
#[derive(Default)]
struct DeviceData {
    interfaces: HashMap<String, reis::Object>,
}

impl DeviceData {
    fn interface<T: reis::Interface>(&self) -> Option<T> {
        self.interfaces.get(T::NAME)?.clone().downcast()
    }
}

/// A handshaken EIS connection that has not produced a keyboard yet.
pub struct EiBackend {
    context: ei::Context,
    serial: u32,
    sequence: u32,
    seats: HashMap<ei::Seat, HashMap<String, u64>>,
    devices: HashMap<ei::Device, DeviceData>,
    queue: VecDeque<BackendEvent<ei::Seat, ei::Device>>,
    _guard: Option<ei_dbus::BusGuard>,
}

impl EiBackend {
    /// Perform the libei handshake on `channel` as a sender named `name`.
    ///
    /// The handshake blocks, so it runs on the blocking pool and is
    /// bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Setup`] if the handshake fails or times out.
    pub async fn connect(
        channel: EisChannel,
        name: &str,
        timeout: Duration,
    ) -> Result<Self, InputError> {
        let EisChannel { context, guard } = channel;

        let name = name.to_owned();
        let handshake = tokio::task::spawn_blocking(move || {
            ei_handshake_blocking(&context, &name, ei::handshake::ContextType::Sender)
                .map(|resp| (context, resp))
        });

        let (context, resp) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| InputError::Setup(format!("handshake timed out after {timeout:?}")))?
            .map_err(|e| InputError::Setup(format!("handshake task panicked: {e}")))?
            .map_err(|e| InputError::Setup(format!("handshake failed: {e}")))?;

        tracing::debug!(
            serial = resp.serial,
            interfaces = ?resp.negotiated_interfaces,
            "libei handshake complete"
        );

        rustix::io::ioctl_fionbio(&context, true)
            .map_err(|e| InputError::Setup(format!("non-blocking socket: {e}")))?;

        // KWin expects a sync round-trip before it announces seats.
        let _callback = resp.connection.sync(1);
        flush(&context).map_err(|e| InputError::Setup(format!("flush: {e}")))?;

        Ok(Self::from_handshake(context, resp.serial, guard))
    }

    fn from_handshake(
        context: ei::Context,
        serial: u32,
        guard: Option<ei_dbus::BusGuard>,
    ) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(BackendEvent::Connected);
        Self {
            context,
            serial,
            sequence: 0,
            seats: HashMap::new(),
            devices: HashMap::new(),
            queue,
            _guard: guard,
        }
    }

    fn translate(&mut self, event: ei::Event) {
        match event {
            ei::Event::Connection(_, event) => match event {
                ei::connection::Event::Seat { seat } => {
                    tracing::debug!("Seat announced");
                    self.seats.insert(seat, HashMap::new());
                }
                ei::connection::Event::Ping { ping } => {
                    ping.done(0);
                    if let Err(e) = flush(&self.context) {
                        tracing::warn!("Failed to answer ping: {e}");
                    }
                }
                ei::connection::Event::Disconnected {
                    last_serial,
                    reason,
                    explanation,
                } => {
                    tracing::debug!(last_serial, ?reason, ?explanation, "EIS disconnected");
                    self.queue.push_back(BackendEvent::Disconnected(format!(
                        "{reason:?} ({explanation:?})"
                    )));
                }
                _ => {}
            },
            ei::Event::Seat(seat, event) => match event {
                ei::seat::Event::Capability { mask, interface } => {
                    tracing::debug!(%interface, mask, "Seat capability");
                    self.seats.entry(seat).or_default().insert(interface, mask);
                }
                ei::seat::Event::Done => self.queue.push_back(BackendEvent::SeatAdded(seat)),
                ei::seat::Event::Device { device } => {
                    self.devices.insert(device, DeviceData::default());
                }
                _ => {}
            },
            ei::Event::Device(device, event) => match event {
                ei::device::Event::Interface { object } => {
                    if let Some(data) = self.devices.get_mut(&device) {
                        data.interfaces
                            .insert(object.interface().to_string(), object);
                    }
                }
                ei::device::Event::Done => {
                    self.queue.push_back(BackendEvent::DeviceAdded(device));
                }
                ei::device::Event::Resumed { serial } => {
                    self.serial = serial;
                    self.queue.push_back(BackendEvent::DeviceResumed(device));
                }
                ei::device::Event::Paused { serial } => {
                    self.serial = serial;
                    tracing::debug!(serial, "Device paused");
                }
                _ => {}
            },
            _ => {}
        }
    }
}

impl Backend for EiBackend {
    type Seat = ei::Seat;
    type Device = ei::Device;
    type Keyboard = EiKeyboard;

    fn wait_readable(&mut self, timeout: Duration) -> Result<PollOutcome, NegotiationError> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        match rustix::event::poll(&mut [PollFd::new(&self.context, PollFlags::IN)], timeout_ms) {
            Ok(0) => Ok(PollOutcome::Timeout),
            Ok(_) => Ok(PollOutcome::Readable),
            Err(e) if e == Errno::INTR => Ok(PollOutcome::Interrupted),
            Err(e) => Err(NegotiationError::Backend(format!("poll error: {e}"))),
        }
    }

    fn dispatch(&mut self) -> Result<(), NegotiationError> {
        let open = read_available(&self.context)
            .map_err(|e| NegotiationError::Backend(format!("read error: {e}")))?;
        if !open {
            self.queue
                .push_back(BackendEvent::Disconnected("connection closed".into()));
        }

        while let Some(result) = self.context.pending_event() {
            if let Some(event) = decoded(result).map_err(NegotiationError::Backend)? {
                self.translate(event);
            }
        }

        flush(&self.context).map_err(|e| NegotiationError::Backend(format!("flush: {e}")))
    }

    fn next_event(&mut self) -> Option<BackendEvent<ei::Seat, ei::Device>> {
        self.queue.pop_front()
    }

    fn seat_capabilities(&self, seat: &ei::Seat) -> Capabilities {
        self.seats.get(seat).map_or(Capabilities::NONE, |advertised| {
            advertised
                .keys()
                .map(|name| capability_for_interface(name))
                .fold(Capabilities::NONE, Capabilities::union)
        })
    }

    fn bind_capabilities(
        &mut self,
        seat: &ei::Seat,
        caps: Capabilities,
    ) -> Result<(), NegotiationError> {
        let mask = self.seats.get(seat).map_or(0, |advertised| bind_mask(advertised, caps));
        tracing::debug!(?caps, mask, "Binding seat capabilities");
        seat.bind(mask);
        flush(&self.context).map_err(|e| NegotiationError::Backend(format!("flush: {e}")))
    }

    fn has_keyboard(&self, device: &ei::Device) -> bool {
        self.devices
            .get(device)
            .is_some_and(|data| data.interface::<ei::Keyboard>().is_some())
    }

    fn start_emulating(&mut self, device: &ei::Device) -> Result<(), NegotiationError> {
        device.start_emulating(self.serial, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        flush(&self.context).map_err(|e| NegotiationError::Backend(format!("flush: {e}")))
    }

    fn into_keyboard(mut self, device: ei::Device) -> Result<EiKeyboard, NegotiationError> {
        let keyboard = self
            .devices
            .remove(&device)
            .and_then(|data| data.interface::<ei::Keyboard>())
            .ok_or_else(|| NegotiationError::Backend("device has no keyboard interface".into()))?;

        Ok(EiKeyboard {
            context: self.context,
            device,
            keyboard,
            serial: self.serial,
            _guard: self._guard,
        })
    }
}

/// An emulating libei keyboard.
///
/// Emulation stops when the keyboard is dropped.
pub struct EiKeyboard {
    context: ei::Context,
    device: ei::Device,
    keyboard: ei::Keyboard,
    serial: u32,
    _guard: Option<ei_dbus::BusGuard>,
}

impl KeySink for EiKeyboard {
    fn key(&mut self, keycode: u32, pressed: bool) -> Result<(), InputError> {
        let state = if pressed {
            ei::keyboard::KeyState::Press
        } else {
            ei::keyboard::KeyState::Released
        };
        self.keyboard.key(keycode, state);
        Ok(())
    }

    fn frame(&mut self) -> Result<(), InputError> {
        self.device.frame(self.serial, timestamp_us());
        flush(&self.context).map_err(|e| InputError::Transport(format!("flush: {e}")))
    }

    fn dispatch(&mut self) -> Result<(), InputError> {
        flush(&self.context).map_err(|e| InputError::Transport(format!("flush: {e}")))?;

        let open = read_available(&self.context)
            .map_err(|e| InputError::Transport(format!("read error: {e}")))?;
        if !open {
            return Err(InputError::Transport("EIS connection closed".into()));
        }

        while let Some(result) = self.context.pending_event() {
            let Some(event) = decoded(result).map_err(InputError::Transport)? else {
                continue;
            };
            match event {
                ei::Event::Connection(_, ei::connection::Event::Ping { ping }) => ping.done(0),
                ei::Event::Connection(_, ei::connection::Event::Disconnected { reason, .. }) => {
                    return Err(InputError::Transport(format!("disconnected: {reason:?}")));
                }
                ei::Event::Device(device, ei::device::Event::Resumed { serial })
                    if device == self.device =>
                {
                    self.serial = serial;
                }
                ei::Event::Device(device, ei::device::Event::Paused { serial })
                    if device == self.device =>
                {
                    tracing::warn!(serial, "Keyboard paused by compositor");
                    self.serial = serial;
                }
                _ => {}
            }
        }

        flush(&self.context).map_err(|e| InputError::Transport(format!("flush: {e}")))
    }
}

impl Drop for EiKeyboard {
    fn drop(&mut self) {
        self.device.stop_emulating(self.serial);
        let _ = self.context.flush();
    }
}
