//! KWin EIS authorization for ei-type.
//!
//! KWin exposes `org.kde.KWin.EIS.RemoteDesktop.connectToEIS` on the
//! session bus. The call returns a socket connected to the compositor's
//! EIS server and a cookie for the grant.
//!
//! - [`client`]: zbus proxy for the remote desktop interface
//! - [`constants`]: well-known names and the capability mask

pub mod client;
pub mod constants;

use std::os::fd::OwnedFd;

pub use client::KwinEisProxy;

/// A granted EIS channel.
///
/// KWin revokes the channel as soon as the requesting bus connection goes
/// away, so the connection travels with the fd and must be kept alive for
/// as long as the socket is in use.
pub struct EisGrant {
    /// Socket connected to the compositor's EIS server.
    pub fd: OwnedFd,
    /// Cookie identifying this grant.
    pub cookie: i32,
    /// Session bus connection the grant is tied to.
    pub connection: zbus::Connection,
}

impl std::fmt::Debug for EisGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EisGrant")
            .field("fd", &self.fd)
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}

impl EisGrant {
    /// Split the grant into the socket and a guard that keeps the bus
    /// connection, and with it the grant, alive.
    #[must_use]
    pub fn into_parts(self) -> (OwnedFd, BusGuard) {
        (self.fd, BusGuard(self.connection))
    }
}

/// Holds the session bus connection an EIS grant depends on.
pub struct BusGuard(zbus::Connection);

impl std::fmt::Debug for BusGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BusGuard")
            .field(&self.0.unique_name())
            .finish()
    }
}

/// Ask KWin for an EIS socket on the session bus.
///
/// # Errors
///
/// Returns [`DbusError::Connect`] if the session bus is unreachable and
/// [`DbusError::Call`] if the method call fails.
pub async fn connect_to_eis(capabilities: u32) -> Result<EisGrant, DbusError> {
    let connection = zbus::Connection::session()
        .await
        .map_err(DbusError::Connect)?;

    let proxy = KwinEisProxy::new(&connection)
        .await
        .map_err(DbusError::Call)?;

    #[allow(clippy::cast_possible_wrap)]
    let (fd, cookie) = proxy
        .connect_to_eis(capabilities as i32)
        .await
        .map_err(DbusError::Call)?;

    tracing::debug!(
        cookie,
        capabilities,
        service = constants::KWIN_SERVICE,
        path = constants::EIS_OBJECT_PATH,
        interface = constants::EIS_INTERFACE,
        "KWin granted EIS socket"
    );

    Ok(EisGrant {
        fd: fd.into(),
        cookie,
        connection,
    })
}

/// Errors from the KWin authorization call.
#[derive(Debug, thiserror::Error)]
pub enum DbusError {
    /// Could not connect to the session bus.
    #[error("failed to connect to session bus: {0}")]
    Connect(#[source] zbus::Error),

    /// `connectToEIS` failed.
    #[error("D-Bus connectToEIS failed: {0}")]
    Call(#[source] zbus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_mask_covers_all_six_groups() {
        assert_eq!(constants::CAPABILITIES_ALL, 63);
        assert_eq!(constants::CAPABILITIES_ALL.count_ones(), 6);
    }

    #[test]
    fn names_are_consistent() {
        assert!(constants::EIS_OBJECT_PATH.starts_with("/org/kde/KWin"));
        assert!(constants::EIS_INTERFACE.starts_with(constants::KWIN_SERVICE));
    }

    #[test]
    fn names_match_proxy_attributes() {
        let source = include_str!("client.rs");
        for name in [
            constants::KWIN_SERVICE,
            constants::EIS_OBJECT_PATH,
            constants::EIS_INTERFACE,
        ] {
            assert!(source.contains(&format!("\"{name}\"")), "{name} not in proxy");
        }
    }
}
