use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use fancy_regex::Regex;

use crate::{
    devices::{partition_path, Partition},
    regions::{free_regions, new_partition_bounds, select_free_region},
    run::Runner,
    PartitionError,
};

/// Least space another operating system keeps after shrinking, in GiB.
pub const MIN_OTHER_OS_GB: f64 = 20.0;

/// The partitions an install strategy hands over to the later stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTargets {
    pub efi: PathBuf,
    pub root: PathBuf,
}

pub fn gb_to_mb(gb: f64) -> u64 {
    (gb * 1024.0) as u64
}

/// Destroys everything on `dev` and creates a 512 MiB ESP plus a root
/// partition spanning the rest of the disk.
pub fn wipe_disk(dev: &Path, runner: &Runner) -> Result<PartitionTargets, PartitionError> {
    let dev_s = dev.display().to_string();
    runner.log(&format!("Wiping {dev_s} and creating a fresh GPT layout"));

    runner.run("wipefs", ["-a", dev_s.as_str()])?;
    runner.run("sgdisk", ["--zap-all", dev_s.as_str()])?;
    runner.run(
        "sgdisk",
        [
            "-n",
            "1:0:+512M",
            "-t",
            "1:ef00",
            "-c",
            "1:EFI",
            "-n",
            "2:0:0",
            "-t",
            "2:8300",
            "-c",
            "2:root",
            dev_s.as_str(),
        ],
    )?;
    settle(dev, runner)?;

    let efi = partition_path(dev, 1);
    let root = partition_path(dev, 2);
    runner.log(&format!(
        "Created EFI partition {} and root partition {}",
        efi.display(),
        root.display()
    ));

    Ok(PartitionTargets { efi, root })
}

/// Creates a root partition inside the largest free gap of `dev`,
/// leaving every existing partition alone. The ESP of the running
/// system must already exist and is reused as-is.
pub fn use_free_space(
    dev: &Path,
    efi: Option<&Partition>,
    size_gb: f64,
    runner: &Runner,
) -> Result<PartitionTargets, PartitionError> {
    let efi = efi.ok_or(PartitionError::MissingEfiPartition)?;
    runner.log(&format!(
        "Creating a root partition in free space, reusing ESP {}",
        efi.path.display()
    ));

    let regions = free_regions(dev, runner)?;
    if regions.is_empty() {
        return Err(PartitionError::NoFreeSpace {
            path: dev.to_path_buf(),
        });
    }

    let need_mb = gb_to_mb(size_gb);
    let region = select_free_region(&regions, need_mb)
        .ok_or(PartitionError::InsufficientFreeSpace { need_mb })?;
    runner.log(&format!(
        "Selected free region {:.0}MB..{:.0}MB ({:.0}MB)",
        region.start_mb, region.end_mb, region.size_mb
    ));

    let (start_mb, end_mb) = new_partition_bounds(&region, need_mb);
    let dev_s = dev.display().to_string();
    let start_arg = format!("{start_mb}MB");
    let end_arg = format!("{end_mb}MB");
    runner.run(
        "parted",
        [
            "-s",
            dev_s.as_str(),
            "mkpart",
            "primary",
            "ext4",
            start_arg.as_str(),
            end_arg.as_str(),
        ],
    )?;
    settle(dev, runner)?;

    let root = last_partition(dev, runner)?;
    runner.log(&format!("New root partition: {}", root.display()));

    Ok(PartitionTargets {
        efi: efi.path.clone(),
        root,
    })
}

/// Shrinks the NTFS partition of another operating system by `size_gb`
/// GiB and creates the root partition in the space that frees up.
pub fn shrink_and_create(
    dev: &Path,
    efi: Option<&Partition>,
    other: Option<&Partition>,
    size_gb: f64,
    runner: &Runner,
) -> Result<PartitionTargets, PartitionError> {
    let efi = efi.ok_or(PartitionError::MissingEfiPartition)?;
    let other = other.ok_or(PartitionError::MissingOtherOsPartition)?;

    let plan = plan_shrink(other.size, size_gb)?;
    let other_s = other.path.display().to_string();
    runner.log(&format!(
        "Shrinking {} to {:.1} GiB",
        other_s, plan.shrink_to_gb
    ));

    let size_arg = plan.shrink_bytes.to_string();
    runner.run(
        "ntfsresize",
        ["--force", "--size", size_arg.as_str(), other_s.as_str()],
    )?;

    let num = partition_number(&other.path).ok_or_else(|| PartitionError::PartitionNumber {
        path: other.path.clone(),
    })?;

    let dev_s = dev.display().to_string();
    let num_arg = num.to_string();
    let shrink_arg = format!("{}MB", plan.shrink_mb);
    runner.run(
        "parted",
        [
            "-s",
            dev_s.as_str(),
            "resizepart",
            num_arg.as_str(),
            shrink_arg.as_str(),
        ],
    )?;
    settle(dev, runner)?;

    let end_arg = format!("{}MB", plan.new_end_mb);
    runner.run(
        "parted",
        [
            "-s",
            dev_s.as_str(),
            "mkpart",
            "primary",
            "ext4",
            shrink_arg.as_str(),
            end_arg.as_str(),
        ],
    )?;
    settle(dev, runner)?;

    let root = last_partition(dev, runner)?;
    runner.log(&format!(
        "Dual boot layout ready, EFI: {} root: {}",
        efi.path.display(),
        root.display()
    ));

    Ok(PartitionTargets {
        efi: efi.path.clone(),
        root,
    })
}

/// Arithmetic of a dual boot shrink, kept apart from the tool calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShrinkPlan {
    pub shrink_to_gb: f64,
    pub shrink_bytes: u64,
    pub shrink_mb: u64,
    pub new_end_mb: u64,
}

pub fn plan_shrink(other_size_bytes: u64, size_gb: f64) -> Result<ShrinkPlan, PartitionError> {
    let other_gb = other_size_bytes as f64 / 1024.0 / 1024.0 / 1024.0;
    let shrink_to_gb = other_gb - size_gb;
    if shrink_to_gb < MIN_OTHER_OS_GB {
        return Err(PartitionError::ShrinkTooSmall { shrink_to_gb });
    }

    let shrink_mb = gb_to_mb(shrink_to_gb);

    Ok(ShrinkPlan {
        shrink_to_gb,
        shrink_bytes: (shrink_to_gb * 1024.0 * 1024.0 * 1024.0) as u64,
        shrink_mb,
        new_end_mb: shrink_mb + gb_to_mb(size_gb),
    })
}

/// Trailing partition number of a device path, `p`-separated or not.
pub fn partition_number(path: &Path) -> Option<u32> {
    let path = path.display().to_string();

    for pattern in [r"p(\d+)$", r"(\d+)$"] {
        let re = Regex::new(pattern).ok()?;
        if let Ok(Some(caps)) = re.captures(&path) {
            if let Some(m) = caps.get(1) {
                return m.as_str().parse().ok();
            }
        }
    }

    None
}

/// Lets the kernel re-read the partition table after parted changed it.
fn settle(dev: &Path, runner: &Runner) -> Result<(), PartitionError> {
    thread::sleep(Duration::from_secs(1));
    let dev_s = dev.display().to_string();
    runner.run("partprobe", [dev_s.as_str()])?;

    Ok(())
}

/// The partition parted appended last, read back via lsblk.
fn last_partition(dev: &Path, runner: &Runner) -> Result<PathBuf, PartitionError> {
    let dev_s = dev.display().to_string();
    let output = runner.run_capture("lsblk", ["-ln", "-o", "NAME", dev_s.as_str()])?;

    let disk_name = dev
        .file_name()
        .map(|x| x.to_string_lossy().to_string())
        .unwrap_or_default();

    let last = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != disk_name)
        .last();

    match last {
        Some(name) => Ok(PathBuf::from(format!("/dev/{name}"))),
        None => Err(PartitionError::PartitionDetection {
            path: dev.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number(Path::new("/dev/nvme0n1p3")), Some(3));
        assert_eq!(partition_number(Path::new("/dev/mmcblk0p12")), Some(12));
        assert_eq!(partition_number(Path::new("/dev/sda2")), Some(2));
        assert_eq!(partition_number(Path::new("/dev/sda")), None);
    }

    #[test]
    fn shrink_leaves_at_least_the_minimum_for_the_other_system() {
        let hundred_gb = 100 * 1024 * 1024 * 1024_u64;

        // 100 - 85 leaves 15 GiB, below the floor
        let err = plan_shrink(hundred_gb, 85.0).unwrap_err();
        match err {
            PartitionError::ShrinkTooSmall { shrink_to_gb } => {
                assert!((shrink_to_gb - 15.0).abs() < 1e-9);
            }
            other => panic!("unexpected error: {other}"),
        }

        let plan = plan_shrink(hundred_gb, 50.0).unwrap();
        assert!((plan.shrink_to_gb - 50.0).abs() < 1e-9);
        assert_eq!(plan.shrink_mb, 51200);
        assert_eq!(plan.new_end_mb, 102400);
        assert_eq!(plan.shrink_bytes, 50 * 1024 * 1024 * 1024);
    }

    #[test]
    fn shrink_plan_new_partition_starts_at_the_shrunk_end() {
        let plan = plan_shrink(200 * 1024 * 1024 * 1024, 60.5).unwrap();
        assert_eq!(plan.new_end_mb - plan.shrink_mb, gb_to_mb(60.5));
    }

    #[test]
    fn test_gb_to_mb() {
        assert_eq!(gb_to_mb(40.0), 40960);
        assert_eq!(gb_to_mb(0.5), 512);
        assert_eq!(gb_to_mb(60.9), 62361);
    }
}
