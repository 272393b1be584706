use std::{io, path::Path, path::PathBuf};

use thiserror::Error;

pub mod devices;
pub mod partition;
pub mod regions;
pub mod run;

pub use run::Runner;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("Failed to list block devices: {err}")]
    ListBlockDevices { err: io::Error },
    #[error("Failed to parse block device list: {err}")]
    ParseBlockDevices { err: serde_json::Error },
    #[error("No EFI system partition was selected")]
    MissingEfiPartition,
    #[error("No partition of another operating system was selected")]
    MissingOtherOsPartition,
    #[error("No free space found on {}", path.display())]
    NoFreeSpace { path: PathBuf },
    #[error("No free region is large enough, need {need_mb} MB")]
    InsufficientFreeSpace { need_mb: u64 },
    #[error("Shrinking the existing system to {shrink_to_gb:.1} GiB would leave it too small")]
    ShrinkTooSmall { shrink_to_gb: f64 },
    #[error("Could not read a partition number from {}", path.display())]
    PartitionNumber { path: PathBuf },
    #[error("Could not find the newly created partition on {}", path.display())]
    PartitionDetection { path: PathBuf },
    #[error(transparent)]
    Run(#[from] run::RunCmdError),
}

/// A machine booted via UEFI exposes its firmware variables here.
pub fn is_efi_booted() -> bool {
    Path::new("/sys/firmware/efi").exists()
}

pub fn sync_disk() {
    rustix::fs::sync();
}
