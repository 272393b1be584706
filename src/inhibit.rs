use eyre::Result;
use logind_zbus::manager::{InhibitType, ManagerProxy};
use tracing::debug;
use zbus::{zvariant::OwnedFd, Connection};

/// Takes logind inhibitor locks that stay in force for as long as the
/// returned fds are kept open.
pub async fn take_wake_lock(conn: &Connection) -> Result<Vec<OwnedFd>> {
    let proxy = ManagerProxy::new(conn).await?;

    // Block everything logind lets us block. A suspend in the middle of
    // partitioning or pacstrap leaves the disk in an undefined state.
    let inhibited = [
        InhibitType::Sleep,
        InhibitType::Idle,
        InhibitType::HandlePowerKey,
        InhibitType::HandleSuspendKey,
        InhibitType::HandleHibernateKey,
        InhibitType::HandleLidSwitch,
    ];

    let mut fds = Vec::with_capacity(inhibited.len());
    for what in inhibited {
        let fd = proxy
            .inhibit(what, "Archkit", "Archkit is installing a system", "block")
            .await?;
        fds.push(fd);
    }

    debug!("Holding {} inhibitor locks: {fds:?}", fds.len());

    Ok(fds)
}
