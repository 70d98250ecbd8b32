//! Obtaining an authorized EIS socket.
//!
//! `LIBEI_SOCKET` always wins when set. Otherwise the socket comes from
//! KWin's `connectToEIS` call or from the XDG `RemoteDesktop` portal.

use std::os::unix::net::UnixStream;

use ashpd::desktop::remote_desktop::{DeviceType, RemoteDesktop};
use ashpd::desktop::PersistMode;
use reis::ei;

use crate::error::InputError;

/// Where to get the EIS socket from when `LIBEI_SOCKET` is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthSource {
    /// KWin's `org.kde.KWin.EIS.RemoteDesktop` interface.
    #[default]
    Kwin,
    /// The XDG desktop `RemoteDesktop` portal.
    Portal,
}

/// An EIS context plus whatever keeps its authorization valid.
pub struct EisChannel {
    pub(crate) context: ei::Context,
    pub(crate) guard: Option<ei_dbus::BusGuard>,
}

impl std::fmt::Debug for EisChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EisChannel")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Obtain an EIS channel.
///
/// # Errors
///
/// Returns [`InputError::Setup`] if no socket could be obtained.
pub async fn authorize(source: AuthSource) -> Result<EisChannel, InputError> {
    match ei::Context::connect_to_env() {
        Ok(Some(context)) => {
            tracing::info!("Connected to ei via LIBEI_SOCKET");
            return Ok(EisChannel {
                context,
                guard: None,
            });
        }
        Ok(None) => {}
        Err(e) => return Err(InputError::Setup(format!("LIBEI_SOCKET: {e}"))),
    }

    match source {
        AuthSource::Kwin => kwin_channel().await,
        AuthSource::Portal => portal_channel().await,
    }
}

async fn kwin_channel() -> Result<EisChannel, InputError> {
    let grant = ei_dbus::connect_to_eis(ei_dbus::constants::CAPABILITIES_ALL)
        .await
        .map_err(|e| InputError::Setup(e.to_string()))?;
    let (fd, guard) = grant.into_parts();

    let context = ei::Context::new(UnixStream::from(fd))
        .map_err(|e| InputError::Setup(format!("ei context: {e}")))?;

    tracing::info!("Connected to ei via KWin EIS");
    Ok(EisChannel {
        context,
        guard: Some(guard),
    })
}

async fn portal_channel() -> Result<EisChannel, InputError> {
    let remote_desktop = RemoteDesktop::new()
        .await
        .map_err(|e| InputError::Setup(format!("RemoteDesktop proxy: {e}")))?;

    let session = remote_desktop
        .create_session()
        .await
        .map_err(|e| InputError::Setup(format!("create session: {e}")))?;

    remote_desktop
        .select_devices(
            &session,
            DeviceType::Keyboard.into(),
            None,
            PersistMode::DoNot,
        )
        .await
        .map_err(|e| InputError::Setup(format!("select devices: {e}")))?;

    remote_desktop
        .start(&session, None)
        .await
        .map_err(|e| InputError::Setup(format!("start session: {e}")))?
        .response()
        .map_err(|e| InputError::Setup(format!("start response: {e}")))?;

    let fd = remote_desktop
        .connect_to_eis(&session)
        .await
        .map_err(|e| InputError::Setup(format!("connect to EIS: {e}")))?;

    let context = ei::Context::new(UnixStream::from(fd))
        .map_err(|e| InputError::Setup(format!("ei context: {e}")))?;

    tracing::info!("Connected to ei via RemoteDesktop portal");
    Ok(EisChannel {
        context,
        guard: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kwin_is_the_default_source() {
        assert_eq!(AuthSource::default(), AuthSource::Kwin);
    }
}
