use std::path::Path;

use disk::run::{RunCmdError, Runner};

use crate::PartitionMode;

/// Formats the root partition as ext4. The ESP is only formatted after a
/// full wipe; an ESP shared with other systems keeps its contents.
pub(crate) fn format_partitions(
    efi: &Path,
    root: &Path,
    mode: PartitionMode,
    runner: &Runner,
) -> Result<(), RunCmdError> {
    let root_s = root.display().to_string();
    runner.log(&format!("Formatting {root_s} as ext4"));
    runner.run("mkfs.ext4", ["-F", root_s.as_str()])?;

    let efi_s = efi.display().to_string();
    if mode == PartitionMode::Wipe {
        runner.log(&format!("Formatting {efi_s} as FAT32"));
        runner.run("mkfs.fat", ["-F32", efi_s.as_str()])?;
    } else {
        runner.log(&format!("Keeping existing ESP {efi_s} untouched"));
    }

    Ok(())
}
