use std::{fs, path::Path};

use disk::run::{RunCmdError, Runner};
use snafu::{ResultExt, Snafu};

/// Where the new system is assembled. arch-chroot takes care of the
/// bind mounts below this point.
pub(crate) const MOUNT_ROOT: &str = "/mnt";

#[derive(Debug, Snafu)]
pub enum MountError {
    #[snafu(display("Failed to create mount point {path}"))]
    CreateMountPoint {
        path: String,
        source: std::io::Error,
    },
    #[snafu(transparent)]
    Run { source: RunCmdError },
}

/// Mounts the root partition at /mnt and the ESP at /mnt/boot/efi.
pub(crate) fn mount_partitions(efi: &Path, root: &Path, runner: &Runner) -> Result<(), MountError> {
    fs::create_dir_all(MOUNT_ROOT).context(CreateMountPointSnafu { path: MOUNT_ROOT })?;
    let root_s = root.display().to_string();
    runner.run("mount", [root_s.as_str(), MOUNT_ROOT])?;

    let efi_dir = format!("{MOUNT_ROOT}/boot/efi");
    fs::create_dir_all(&efi_dir).context(CreateMountPointSnafu {
        path: efi_dir.as_str(),
    })?;
    let efi_s = efi.display().to_string();
    runner.run("mount", [efi_s.as_str(), efi_dir.as_str()])?;

    Ok(())
}

/// Flushes caches and recursively unmounts the target. Safe to call
/// whether or not anything is still mounted.
pub(crate) fn unmount_all(runner: &Runner) {
    runner.log("Syncing disks and unmounting the target");
    disk::sync_disk();
    runner.run_unchecked("umount", ["-R", MOUNT_ROOT]);
}
