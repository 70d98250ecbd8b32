//! Character and key-combo to evdev keycode mapping.
//!
//! Text is typed against a US QWERTY layout: every printable ASCII
//! character resolves to a base evdev keycode plus, for the upper row of
//! each key, a held left shift. Combo strings such as `ctrl+shift+a`
//! resolve to an ordered modifier list and one base key.

use crate::error::ComboError;

// Evdev keycodes (linux/input-event-codes.h)
pub const KEY_ESC: u32 = 1;
pub const KEY_1: u32 = 2;
pub const KEY_2: u32 = 3;
pub const KEY_3: u32 = 4;
pub const KEY_4: u32 = 5;
pub const KEY_5: u32 = 6;
pub const KEY_6: u32 = 7;
pub const KEY_7: u32 = 8;
pub const KEY_8: u32 = 9;
pub const KEY_9: u32 = 10;
pub const KEY_0: u32 = 11;
pub const KEY_MINUS: u32 = 12;
pub const KEY_EQUAL: u32 = 13;
pub const KEY_BACKSPACE: u32 = 14;
pub const KEY_TAB: u32 = 15;
pub const KEY_Q: u32 = 16;
pub const KEY_W: u32 = 17;
pub const KEY_E: u32 = 18;
pub const KEY_R: u32 = 19;
pub const KEY_T: u32 = 20;
pub const KEY_Y: u32 = 21;
pub const KEY_U: u32 = 22;
pub const KEY_I: u32 = 23;
pub const KEY_O: u32 = 24;
pub const KEY_P: u32 = 25;
pub const KEY_LEFTBRACE: u32 = 26;
pub const KEY_RIGHTBRACE: u32 = 27;
pub const KEY_ENTER: u32 = 28;
pub const KEY_LEFTCTRL: u32 = 29;
pub const KEY_A: u32 = 30;
pub const KEY_S: u32 = 31;
pub const KEY_D: u32 = 32;
pub const KEY_F: u32 = 33;
pub const KEY_G: u32 = 34;
pub const KEY_H: u32 = 35;
pub const KEY_J: u32 = 36;
pub const KEY_K: u32 = 37;
pub const KEY_L: u32 = 38;
pub const KEY_SEMICOLON: u32 = 39;
pub const KEY_APOSTROPHE: u32 = 40;
pub const KEY_GRAVE: u32 = 41;
pub const KEY_LEFTSHIFT: u32 = 42;
pub const KEY_BACKSLASH: u32 = 43;
pub const KEY_Z: u32 = 44;
pub const KEY_X: u32 = 45;
pub const KEY_C: u32 = 46;
pub const KEY_V: u32 = 47;
pub const KEY_B: u32 = 48;
pub const KEY_N: u32 = 49;
pub const KEY_M: u32 = 50;
pub const KEY_COMMA: u32 = 51;
pub const KEY_DOT: u32 = 52;
pub const KEY_SLASH: u32 = 53;
pub const KEY_LEFTALT: u32 = 56;
pub const KEY_SPACE: u32 = 57;
pub const KEY_F1: u32 = 59;
pub const KEY_F11: u32 = 87;
pub const KEY_F12: u32 = 88;
pub const KEY_HOME: u32 = 102;
pub const KEY_UP: u32 = 103;
pub const KEY_PAGEUP: u32 = 104;
pub const KEY_LEFT: u32 = 105;
pub const KEY_RIGHT: u32 = 106;
pub const KEY_END: u32 = 107;
pub const KEY_DOWN: u32 = 108;
pub const KEY_PAGEDOWN: u32 = 109;
pub const KEY_INSERT: u32 = 110;
pub const KEY_DELETE: u32 = 111;
pub const KEY_LEFTMETA: u32 = 125;

/// Maximum number of modifiers a combo may hold down.
///
/// Modifiers past this limit are dropped with a warning rather than
/// rejected.
pub const MAX_MODIFIERS: usize = 4;

const AZ_CODES: [u32; 26] = [
    KEY_A, KEY_B, KEY_C, KEY_D, KEY_E, KEY_F, KEY_G, KEY_H, KEY_I,
    KEY_J, KEY_K, KEY_L, KEY_M, KEY_N, KEY_O, KEY_P, KEY_Q, KEY_R,
    KEY_S, KEY_T, KEY_U, KEY_V, KEY_W, KEY_X, KEY_Y, KEY_Z,
];

/// One logical key stroke: modifiers held around a single base key.
///
/// A `keycode` of 0 is the unmapped sentinel; such an instruction emits
/// nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyInstruction {
    /// Evdev keycode of the base key, 0 if unmapped.
    pub keycode: u32,
    /// Modifier keycodes, pressed in order and released in reverse.
    pub modifiers: Vec<u32>,
}

impl KeyInstruction {
    /// The unmapped sentinel.
    pub const UNMAPPED: Self = Self {
        keycode: 0,
        modifiers: Vec::new(),
    };

    /// A base key with no modifiers.
    #[must_use]
    pub const fn plain(keycode: u32) -> Self {
        Self {
            keycode,
            modifiers: Vec::new(),
        }
    }

    /// A base key typed with left shift held.
    #[must_use]
    pub fn shifted(keycode: u32) -> Self {
        Self {
            keycode,
            modifiers: vec![KEY_LEFTSHIFT],
        }
    }

    /// Whether this instruction produces any key events.
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.keycode != 0
    }
}

/// Modifier keys accepted in combo strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Ctrl,
    Shift,
    Alt,
    Super,
}

impl Modifier {
    /// Look up a modifier by its (lowercase) combo name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ctrl" | "control" => Some(Self::Ctrl),
            "shift" => Some(Self::Shift),
            "alt" => Some(Self::Alt),
            "super" | "meta" => Some(Self::Super),
            _ => None,
        }
    }

    /// The left-hand evdev keycode for this modifier.
    #[must_use]
    pub const fn keycode(self) -> u32 {
        match self {
            Self::Ctrl => KEY_LEFTCTRL,
            Self::Shift => KEY_LEFTSHIFT,
            Self::Alt => KEY_LEFTALT,
            Self::Super => KEY_LEFTMETA,
        }
    }
}

/// Map a character to the key stroke that types it on a US layout.
///
/// Total over `char`: anything outside printable ASCII, space, tab and
/// newline yields [`KeyInstruction::UNMAPPED`].
#[must_use]
pub fn char_to_key(c: char) -> KeyInstruction {
    match base_key(c) {
        Some((code, false)) => KeyInstruction::plain(code),
        Some((code, true)) => KeyInstruction::shifted(code),
        None => KeyInstruction::UNMAPPED,
    }
}

/// Resolve a character to `(keycode, needs_shift)`.
fn base_key(c: char) -> Option<(u32, bool)> {
    #[allow(clippy::match_same_arms)]
    let key = match c {
        'a'..='z' => (AZ_CODES[(c as u8 - b'a') as usize], false),
        'A'..='Z' => (AZ_CODES[(c as u8 - b'A') as usize], true),
        '1'..='9' => (KEY_1 + (c as u32 - '1' as u32), false),
        '0' => (KEY_0, false),
        ' ' => (KEY_SPACE, false),
        '\n' => (KEY_ENTER, false),
        '\t' => (KEY_TAB, false),
        // Unshifted punctuation
        '-' => (KEY_MINUS, false),
        '=' => (KEY_EQUAL, false),
        '[' => (KEY_LEFTBRACE, false),
        ']' => (KEY_RIGHTBRACE, false),
        '\\' => (KEY_BACKSLASH, false),
        ';' => (KEY_SEMICOLON, false),
        '\'' => (KEY_APOSTROPHE, false),
        '`' => (KEY_GRAVE, false),
        ',' => (KEY_COMMA, false),
        '.' => (KEY_DOT, false),
        '/' => (KEY_SLASH, false),
        // Shifted punctuation
        '!' => (KEY_1, true),
        '@' => (KEY_2, true),
        '#' => (KEY_3, true),
        '$' => (KEY_4, true),
        '%' => (KEY_5, true),
        '^' => (KEY_6, true),
        '&' => (KEY_7, true),
        '*' => (KEY_8, true),
        '(' => (KEY_9, true),
        ')' => (KEY_0, true),
        '_' => (KEY_MINUS, true),
        '+' => (KEY_EQUAL, true),
        '{' => (KEY_LEFTBRACE, true),
        '}' => (KEY_RIGHTBRACE, true),
        '|' => (KEY_BACKSLASH, true),
        ':' => (KEY_SEMICOLON, true),
        '"' => (KEY_APOSTROPHE, true),
        '~' => (KEY_GRAVE, true),
        '<' => (KEY_COMMA, true),
        '>' => (KEY_DOT, true),
        '?' => (KEY_SLASH, true),
        _ => return None,
    };
    Some(key)
}

/// Map a named key (lowercase) to its evdev keycode.
fn named_key(name: &str) -> Option<u32> {
    let code = match name {
        "enter" | "return" => KEY_ENTER,
        "tab" => KEY_TAB,
        "space" => KEY_SPACE,
        "esc" | "escape" => KEY_ESC,
        "backspace" => KEY_BACKSPACE,
        "delete" | "del" => KEY_DELETE,
        "insert" => KEY_INSERT,
        "home" => KEY_HOME,
        "end" => KEY_END,
        "pageup" | "pgup" => KEY_PAGEUP,
        "pagedown" | "pgdn" => KEY_PAGEDOWN,
        "up" => KEY_UP,
        "down" => KEY_DOWN,
        "left" => KEY_LEFT,
        "right" => KEY_RIGHT,
        "f11" => KEY_F11,
        "f12" => KEY_F12,
        _ => return function_key(name),
    };
    Some(code)
}

/// F1 through F10 are contiguous in evdev.
fn function_key(name: &str) -> Option<u32> {
    let n: u32 = name.strip_prefix('f')?.parse().ok()?;
    (1..=10).contains(&n).then(|| KEY_F1 + n - 1)
}

/// Parse a key combo such as `ctrl+v`, `enter` or `ctrl+shift+a`.
///
/// Tokens are split on `+` and case-folded. Every token but the last
/// names a modifier; the last is either a single character (resolved via
/// [`char_to_key`], whose shift requirement joins the modifier list unless
/// shift is already held) or a key name like `enter` or `esc`. At most
/// [`MAX_MODIFIERS`] modifiers are kept; later ones are dropped.
///
/// # Errors
///
/// Returns a [`ComboError`] for an empty combo, an empty key token, an
/// unknown modifier name or an unknown key.
pub fn parse_combo(combo: &str) -> Result<KeyInstruction, ComboError> {
    if combo.is_empty() {
        return Err(ComboError::Empty);
    }

    let (modifier_part, key_part) = match combo.rsplit_once('+') {
        Some((mods, key)) => (Some(mods), key),
        None => (None, combo),
    };

    let mut modifiers = Vec::with_capacity(MAX_MODIFIERS);
    for name in modifier_part.into_iter().flat_map(|m| m.split('+')) {
        let name = name.to_lowercase();
        let modifier =
            Modifier::from_name(&name).ok_or_else(|| ComboError::UnknownModifier(name.clone()))?;
        push_modifier(&mut modifiers, modifier.keycode());
    }

    let key = key_part.to_lowercase();
    if key.is_empty() {
        return Err(ComboError::EmptyKey);
    }

    let mut chars = key.chars();
    let keycode = match (chars.next(), chars.next()) {
        (Some(c), None) => {
            let resolved = char_to_key(c);
            if !resolved.is_mapped() {
                return Err(ComboError::UnknownKey(key));
            }
            if resolved.modifiers.contains(&KEY_LEFTSHIFT) && !modifiers.contains(&KEY_LEFTSHIFT) {
                push_modifier(&mut modifiers, KEY_LEFTSHIFT);
            }
            resolved.keycode
        }
        _ => named_key(&key).ok_or(ComboError::UnknownKey(key))?,
    };

    Ok(KeyInstruction { keycode, modifiers })
}

/// Append a modifier unless the list is already full.
fn push_modifier(modifiers: &mut Vec<u32>, code: u32) {
    if modifiers.len() >= MAX_MODIFIERS {
        tracing::warn!(code, max = MAX_MODIFIERS, "Too many modifiers, dropping");
        return;
    }
    modifiers.push(code);
}
