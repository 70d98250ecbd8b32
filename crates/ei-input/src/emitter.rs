//! Ordered press/release emission of a [`KeyInstruction`].

use std::thread;
use std::time::Duration;

use crate::error::InputError;
use crate::keymap::KeyInstruction;

/// A keyboard that accepts raw key state changes.
///
/// Implemented by the negotiated libei keyboard and by test doubles.
pub trait KeySink {
    /// Queue a key press (`pressed == true`) or release.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Transport`] if the event cannot be queued.
    fn key(&mut self, keycode: u32, pressed: bool) -> Result<(), InputError>;

    /// Close the current frame and flush it to the compositor.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Transport`] if the flush fails.
    fn frame(&mut self) -> Result<(), InputError>;

    /// Deliver anything still buffered and process incoming protocol
    /// traffic (pings, serial updates).
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Transport`] if the connection failed.
    fn dispatch(&mut self) -> Result<(), InputError>;
}

/// Emit one key stroke.
///
/// Modifiers are pressed in order, then the base key is pressed, held for
/// `hold` and released, then modifiers are released in reverse order.
/// Every individual press or release is followed by a frame. A final
/// dispatch delivers the sequence before the caller moves on.
///
/// Unmapped instructions emit nothing.
///
/// # Errors
///
/// Returns the first transport error. Keys already pressed when the
/// error occurred are released on a best-effort basis before returning.
pub fn emit<K: KeySink + ?Sized>(
    sink: &mut K,
    instruction: &KeyInstruction,
    hold: Duration,
) -> Result<(), InputError> {
    if !instruction.is_mapped() {
        return Ok(());
    }

    let mut held: Vec<u32> = Vec::with_capacity(instruction.modifiers.len() + 1);

    let result = (|| {
        for &code in instruction.modifiers.iter().chain([&instruction.keycode]) {
            tracing::trace!(code, "press");
            sink.key(code, true)?;
            held.push(code);
            sink.frame()?;
        }

        pause(hold);

        while let Some(&code) = held.last() {
            tracing::trace!(code, "release");
            sink.key(code, false)?;
            held.pop();
            sink.frame()?;
        }

        sink.dispatch()
    })();

    if let Err(e) = result {
        if !held.is_empty() {
            tracing::warn!(held = ?held, "Releasing held keys after transport failure");
            release_all(sink, &held);
        }
        return Err(e);
    }

    Ok(())
}

/// Release keys in reverse press order, ignoring failures.
fn release_all<K: KeySink + ?Sized>(sink: &mut K, held: &[u32]) {
    for &code in held.iter().rev() {
        if let Err(e) = sink.key(code, false).and_then(|()| sink.frame()) {
            tracing::debug!(code, "Best-effort release failed: {e}");
        }
    }
    let _ = sink.dispatch();
}

/// Sleep for a pacing interval; zero means no sleep at all.
pub(crate) fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymap::{self, KEY_C, KEY_LEFTCTRL, KEY_LEFTSHIFT};
    use crate::testing::{RecordingSink, SinkOp};

    fn assert_balanced(ops: &[SinkOp]) {
        let mut stack = Vec::new();
        for op in ops {
            match *op {
                SinkOp::Press(code) => stack.push(code),
                SinkOp::Release(code) => {
                    assert_eq!(stack.pop(), Some(code), "release out of order in {ops:?}");
                }
                SinkOp::Frame | SinkOp::Dispatch => {}
            }
        }
        assert!(stack.is_empty(), "keys left pressed: {stack:?}");
    }

    #[test]
    fn plain_key_is_press_then_release() {
        let mut sink = RecordingSink::default();
        emit(&mut sink, &keymap::char_to_key('c'), Duration::ZERO).unwrap();

        assert_eq!(
            sink.ops,
            vec![
                SinkOp::Press(KEY_C),
                SinkOp::Frame,
                SinkOp::Release(KEY_C),
                SinkOp::Frame,
                SinkOp::Dispatch,
            ]
        );
    }

    #[test]
    fn modifiers_nest_around_base_key() {
        let mut sink = RecordingSink::default();
        let combo = keymap::parse_combo("ctrl+shift+c").unwrap();
        emit(&mut sink, &combo, Duration::ZERO).unwrap();

        assert_eq!(
            sink.key_events(),
            vec![
                SinkOp::Press(KEY_LEFTCTRL),
                SinkOp::Press(KEY_LEFTSHIFT),
                SinkOp::Press(KEY_C),
                SinkOp::Release(KEY_C),
                SinkOp::Release(KEY_LEFTSHIFT),
                SinkOp::Release(KEY_LEFTCTRL),
            ]
        );
        assert_balanced(&sink.ops);
    }

    #[test]
    fn every_key_change_is_framed() {
        let mut sink = RecordingSink::default();
        emit(&mut sink, &keymap::char_to_key('?'), Duration::ZERO).unwrap();

        let mut ops = sink.ops.iter();
        while let Some(op) = ops.next() {
            match op {
                SinkOp::Press(_) | SinkOp::Release(_) => {
                    assert_eq!(ops.next(), Some(&SinkOp::Frame));
                }
                SinkOp::Dispatch => assert!(ops.next().is_none()),
                SinkOp::Frame => panic!("frame without key change"),
            }
        }
    }

    #[test]
    fn presses_equal_releases_for_all_printable_ascii() {
        for b in 0x20u8..0x7f {
            let mut sink = RecordingSink::default();
            emit(&mut sink, &keymap::char_to_key(char::from(b)), Duration::ZERO).unwrap();
            assert_balanced(&sink.ops);
            assert_eq!(sink.dispatches(), 1);
        }
    }

    #[test]
    fn unmapped_is_noop() {
        let mut sink = RecordingSink::default();
        emit(&mut sink, &KeyInstruction::UNMAPPED, Duration::ZERO).unwrap();
        assert!(sink.ops.is_empty());
    }

    #[test]
    fn failure_releases_already_pressed_keys() {
        // Fail on the third key call: ctrl and shift are down, C is not.
        let mut sink = RecordingSink::failing_at(2);
        let combo = keymap::parse_combo("ctrl+shift+c").unwrap();
        let err = emit(&mut sink, &combo, Duration::ZERO).unwrap_err();

        assert!(matches!(err, InputError::Transport(_)));
        assert_eq!(
            sink.key_events(),
            vec![
                SinkOp::Press(KEY_LEFTCTRL),
                SinkOp::Press(KEY_LEFTSHIFT),
                SinkOp::Release(KEY_LEFTSHIFT),
                SinkOp::Release(KEY_LEFTCTRL),
            ]
        );
        assert_balanced(&sink.ops);
    }

    #[test]
    fn failure_during_release_finishes_remaining_releases() {
        // Presses succeed (calls 0..=2); releasing C (call 3) fails.
        let mut sink = RecordingSink::failing_at(3);
        let combo = keymap::parse_combo("ctrl+shift+c").unwrap();
        assert!(emit(&mut sink, &combo, Duration::ZERO).is_err());

        assert_eq!(
            sink.key_events(),
            vec![
                SinkOp::Press(KEY_LEFTCTRL),
                SinkOp::Press(KEY_LEFTSHIFT),
                SinkOp::Press(KEY_C),
                SinkOp::Release(KEY_C),
                SinkOp::Release(KEY_LEFTSHIFT),
                SinkOp::Release(KEY_LEFTCTRL),
            ]
        );
    }
}
