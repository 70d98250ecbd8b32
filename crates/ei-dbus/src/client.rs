/// D-Bus proxy for KWin's EIS remote desktop endpoint.
///
/// `connectToEIS` hands out a socket to the compositor's EIS
/// implementation plus a cookie identifying the grant.
#[zbus::proxy(
    interface = "org.kde.KWin.EIS.RemoteDesktop",
    default_service = "org.kde.KWin",
    default_path = "/org/kde/KWin/EIS/RemoteDesktop"
)]
pub trait KwinEis {
    /// Request an EIS socket for the given capability bitmask.
    #[zbus(name = "connectToEIS")]
    fn connect_to_eis(&self, capabilities: i32) -> zbus::Result<(zbus::zvariant::OwnedFd, i32)>;
}
