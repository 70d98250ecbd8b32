//! Keyboard injection core for ei-type.
//!
//! Turns text or a key combo into evdev key events and delivers them to
//! the focused window through an emulated libei keyboard.
//!
//! - [`keymap`]: characters and combo strings to evdev key codes (US layout)
//! - [`emitter`]: ordered, framed press/release emission
//! - [`negotiate`]: connection readiness state machine
//! - [`typing`]: the text and combo loops
//! - [`libei`]: `reis` backend
//! - [`portal`]: obtaining an authorized EIS socket

pub mod cancel;
pub mod emitter;
pub mod error;
pub mod keymap;
pub mod libei;
pub mod negotiate;
pub mod portal;
pub mod typing;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use emitter::KeySink;
pub use error::{ComboError, InputError, NegotiationError};
pub use keymap::{char_to_key, parse_combo, KeyInstruction};
pub use libei::{EiBackend, EiKeyboard};
pub use negotiate::{negotiate, Backend, NegotiationConfig};
pub use portal::{authorize, AuthSource, EisChannel};
pub use typing::{run, Job, TypingConfig, TypingStats};
