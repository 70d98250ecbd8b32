//! Text and combo typing on top of a negotiated keyboard.

use std::io::{ErrorKind, Read};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::emitter::{self, KeySink};
use crate::error::InputError;
use crate::keymap::{self, KeyInstruction};
use crate::negotiate::{self, Backend, NegotiationConfig};

/// Bytes requested from the input per read.
///
/// Longer lines are simply read in several pieces; nothing is truncated.
pub const READ_CHUNK: usize = 4096;

/// Pacing between key events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingConfig {
    /// Pause after every input character, mapped or not.
    pub key_delay: Duration,
    /// How long the base key stays down.
    pub hold: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            key_delay: Duration::from_millis(5),
            hold: Duration::from_millis(5),
        }
    }
}

/// What to type once the keyboard is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Type everything read from the input stream.
    Text,
    /// Send a single pre-parsed key combo.
    Combo(KeyInstruction),
}

/// Counters from a typing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypingStats {
    /// Characters turned into key strokes.
    pub typed: usize,
    /// Characters with no key on the layout.
    pub skipped: usize,
    /// Whether the run stopped early because of cancellation.
    pub cancelled: bool,
}

/// Negotiate a keyboard on `backend`, then carry out `job`.
///
/// `on_ready` runs once the keyboard is emulating, before any input is
/// read. It never runs if negotiation fails.
///
/// # Errors
///
/// Returns [`InputError::Negotiation`] if no keyboard became ready, and
/// any error from [`type_text`] or [`send_combo`].
pub fn run<B: Backend, R: Read>(
    mut backend: B,
    job: &Job,
    input: R,
    negotiation: &NegotiationConfig,
    typing: &TypingConfig,
    cancel: &CancelToken,
    on_ready: impl FnOnce(),
) -> Result<TypingStats, InputError> {
    let device = negotiate::negotiate(&mut backend, negotiation, cancel)?;
    let mut keyboard = backend.into_keyboard(device)?;
    tracing::debug!("Ready to type");
    on_ready();

    match job {
        Job::Combo(combo) => {
            send_combo(&mut keyboard, combo, typing)?;
            Ok(TypingStats {
                typed: 1,
                ..TypingStats::default()
            })
        }
        Job::Text => type_text(input, &mut keyboard, typing, cancel),
    }
}

/// Send one key combo and wait out the key delay.
///
/// # Errors
///
/// Returns [`InputError::UnmappedCombo`] for an unmapped instruction and
/// [`InputError::Transport`] if emission fails.
pub fn send_combo<K: KeySink + ?Sized>(
    sink: &mut K,
    combo: &KeyInstruction,
    config: &TypingConfig,
) -> Result<(), InputError> {
    if !combo.is_mapped() {
        return Err(InputError::UnmappedCombo);
    }
    tracing::debug!(keycode = combo.keycode, modifiers = ?combo.modifiers, "Sending key combo");
    emitter::emit(sink, combo, config.hold)?;
    emitter::pause(config.key_delay);
    Ok(())
}

/// Type every character read from `input`.
///
/// Input is consumed in [`READ_CHUNK`]-sized pieces and decoded as UTF-8
/// across piece boundaries; invalid bytes count as one unmapped
/// character each run. Unmapped characters are skipped silently, but the
/// key delay still follows every character so the typing rhythm does not
/// depend on content.
///
/// Stops at end of input, or before the next character once `cancel` is
/// tripped.
///
/// # Errors
///
/// Returns [`InputError::Read`] if reading fails and
/// [`InputError::Transport`] if emission fails. Emission errors are
/// fatal; typing does not continue past them.
pub fn type_text<R: Read, K: KeySink + ?Sized>(
    mut input: R,
    sink: &mut K,
    config: &TypingConfig,
    cancel: &CancelToken,
) -> Result<TypingStats, InputError> {
    let mut typist = Typist {
        sink,
        config,
        cancel,
        stats: TypingStats::default(),
    };
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);

    loop {
        if cancel.is_cancelled() {
            typist.stats.cancelled = true;
            break;
        }

        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(InputError::Read(e)),
        };
        pending.extend_from_slice(&buf[..n]);

        let consumed = typist.type_utf8(&pending, false)?;
        pending.drain(..consumed);
        if typist.stats.cancelled {
            break;
        }
    }

    if !pending.is_empty() && !typist.stats.cancelled {
        typist.type_utf8(&pending, true)?;
    }

    let stats = typist.stats;
    tracing::debug!(typed = stats.typed, skipped = stats.skipped, cancelled = stats.cancelled, "Typing finished");
    Ok(stats)
}

struct Typist<'a, K: KeySink + ?Sized> {
    sink: &'a mut K,
    config: &'a TypingConfig,
    cancel: &'a CancelToken,
    stats: TypingStats,
}

impl<K: KeySink + ?Sized> Typist<'_, K> {
    /// Type the decodable prefix of `bytes` and return how many bytes were
    /// used. An incomplete trailing sequence is left for the next read
    /// unless `at_eof`.
    fn type_utf8(&mut self, mut bytes: &[u8], at_eof: bool) -> Result<usize, InputError> {
        let total = bytes.len();
        loop {
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    self.type_str(text)?;
                    return Ok(total);
                }
                Err(e) => {
                    let (valid, rest) = bytes.split_at(e.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.type_str(text)?;
                    }
                    if self.stats.cancelled {
                        return Ok(total - rest.len());
                    }
                    match e.error_len() {
                        Some(bad) => {
                            self.type_char(char::REPLACEMENT_CHARACTER)?;
                            bytes = &rest[bad..];
                        }
                        None if at_eof => {
                            self.type_char(char::REPLACEMENT_CHARACTER)?;
                            return Ok(total);
                        }
                        None => return Ok(total - rest.len()),
                    }
                }
            }
        }
    }

    fn type_str(&mut self, text: &str) -> Result<(), InputError> {
        for c in text.chars() {
            if self.cancel.is_cancelled() {
                self.stats.cancelled = true;
                return Ok(());
            }
            self.type_char(c)?;
        }
        Ok(())
    }

    fn type_char(&mut self, c: char) -> Result<(), InputError> {
        let instruction = keymap::char_to_key(c);
        if instruction.is_mapped() {
            emitter::emit(self.sink, &instruction, self.config.hold)?;
            self.stats.typed += 1;
        } else {
            tracing::trace!(ch = %c.escape_debug(), "Skipping unmapped character");
            self.stats.skipped += 1;
        }
        emitter::pause(self.config.key_delay);
        Ok(())
    }
}
