//! Well-known KWin names.
//!
//! The service, path and interface mirror the `#[zbus::proxy]` attributes on
//! [`KwinEisProxy`](crate::KwinEisProxy), which only accept literals.

/// D-Bus service name of the KWin compositor.
pub const KWIN_SERVICE: &str = "org.kde.KWin";

/// D-Bus object path of KWin's EIS remote desktop endpoint.
pub const EIS_OBJECT_PATH: &str = "/org/kde/KWin/EIS/RemoteDesktop";

/// D-Bus interface of KWin's EIS remote desktop endpoint.
pub const EIS_INTERFACE: &str = "org.kde.KWin.EIS.RemoteDesktop";

/// Capability bitmask requested from KWin.
///
/// KWin hands out EIS access per capability group and only accepts the
/// full set (pointer, absolute pointer, keyboard, touch, scroll, button).
pub const CAPABILITIES_ALL: u32 = 0b11_1111;
