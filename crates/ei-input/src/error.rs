//! Error types for key injection.

/// A malformed key combo string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComboError {
    #[error("empty key combo")]
    Empty,

    #[error("key combo has no key after the last '+'")]
    EmptyKey,

    #[error("unknown modifier '{0}'")]
    UnknownModifier(String),

    #[error("unknown key '{0}'")]
    UnknownKey(String),
}

/// Why the backend never became ready for emulation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    /// The first seat offered does not support keyboard input.
    #[error("seat does not have keyboard capability")]
    NoKeyboardCapability,

    /// The EIS server hung up before a keyboard was ready.
    #[error("disconnected by backend: {0}")]
    Disconnected(String),

    /// Too many consecutive polls without any backend activity.
    #[error("timeout waiting for EIS events ({polls} polls without a response)")]
    TimedOut { polls: u32 },

    /// Interrupted by a signal before the keyboard became ready.
    #[error("cancelled while waiting for keyboard device")]
    Cancelled,

    /// The event channel itself failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors from the input injection pipeline.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// Obtaining or setting up the EIS channel failed.
    #[error("failed to set up input backend: {0}")]
    Setup(String),

    /// No keyboard device became ready.
    #[error("failed to get keyboard device: {0}")]
    Negotiation(#[from] NegotiationError),

    /// A key combo could not be parsed.
    #[error("invalid key combo: {0}")]
    Parse(#[from] ComboError),

    /// A combo resolved to no key at all.
    #[error("key combo does not map to a key")]
    UnmappedCombo,

    /// Reading the text to type failed.
    #[error("failed to read input: {0}")]
    Read(#[source] std::io::Error),

    /// Sending events to the compositor failed.
    #[error("transport failure: {0}")]
    Transport(String),
}
