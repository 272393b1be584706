use disk::run::{RunCmdError, Runner};

use crate::{mount::MOUNT_ROOT, DesktopEnvironment};

/// Installs the desktop package group inside the target and enables its
/// display manager. A display manager that fails to enable only warns.
pub(crate) fn install_desktop(
    desktop: &DesktopEnvironment,
    runner: &Runner,
) -> Result<(), RunCmdError> {
    runner.log(&format!(
        "Installing {}: {}",
        desktop.name,
        desktop.packages.join(" ")
    ));

    let mut args = vec![
        MOUNT_ROOT.to_string(),
        "pacman".to_string(),
        "-S".to_string(),
        "--noconfirm".to_string(),
    ];
    args.extend(desktop.packages.iter().cloned());
    runner.run("arch-chroot", args)?;

    if let Some(dm) = &desktop.display_manager {
        let result = runner.run_unchecked(
            "arch-chroot",
            [MOUNT_ROOT, "systemctl", "enable", dm.as_str()],
        );
        if !result.success() {
            runner.log(&format!("Warning: could not enable {dm}"));
        }
    }

    Ok(())
}
