use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
};

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::PartitionError;

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,FSTYPE,MOUNTPOINT,PARTTYPE,MODEL";

/// A whole disk the installer may operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub path: PathBuf,
    pub model: String,
    pub size: u64,
    pub partitions: Vec<Partition>,
}

/// One partition on a disk, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub path: PathBuf,
    pub size: u64,
    pub fs_type: Option<String>,
    pub mount_point: Option<String>,
    pub part_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Debug, Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    entry_type: String,
    fstype: Option<String>,
    mountpoint: Option<String>,
    parttype: Option<String>,
    model: Option<String>,
    #[serde(default)]
    children: Vec<LsblkEntry>,
}

/// Asks lsblk for every disk suitable as an install target. Virtual
/// devices such as loop and zram are filtered out by name.
pub fn list_devices() -> Result<Vec<Device>, PartitionError> {
    let output = Command::new("lsblk")
        .args(["-J", "-b", "-o", LSBLK_COLUMNS])
        .output()
        .map_err(|err| PartitionError::ListBlockDevices { err })?;

    if !output.status.success() {
        return Err(PartitionError::ListBlockDevices {
            err: io::Error::new(
                io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).to_string(),
            ),
        });
    }

    parse_lsblk(&String::from_utf8_lossy(&output.stdout))
}

/// Partitions of one disk, in kernel order.
pub fn list_partitions(dev: &Path) -> Result<Vec<Partition>, PartitionError> {
    let devices = list_devices()?;

    Ok(devices
        .into_iter()
        .find(|d| d.path == dev)
        .map(|d| d.partitions)
        .unwrap_or_default())
}

pub fn parse_lsblk(json: &str) -> Result<Vec<Device>, PartitionError> {
    let parsed: LsblkOutput =
        serde_json::from_str(json).map_err(|err| PartitionError::ParseBlockDevices { err })?;

    let mut devices = vec![];
    for entry in parsed.blockdevices {
        if entry.entry_type != "disk" {
            continue;
        }

        let is_sata = device_is_sata(&entry.name);
        info!("{} is sata: {is_sata}", entry.name);

        let is_sdcard = device_is_sdcard(&entry.name);
        info!("{} is sdcard: {is_sdcard}", entry.name);

        let is_nvme = device_is_nvme(&entry.name);
        info!("{} is nvme: {is_nvme}", entry.name);

        if !(is_sata || is_sdcard || is_nvme) {
            continue;
        }

        let partitions = entry
            .children
            .iter()
            .filter(|c| c.entry_type == "part")
            .map(to_partition)
            .collect();

        devices.push(Device {
            path: PathBuf::from(format!("/dev/{}", entry.name)),
            model: entry.model.clone().unwrap_or_default().trim().to_string(),
            size: entry.size,
            partitions,
        });
    }

    Ok(devices)
}

fn to_partition(entry: &LsblkEntry) -> Partition {
    Partition {
        path: PathBuf::from(format!("/dev/{}", entry.name)),
        size: entry.size,
        fs_type: entry.fstype.clone(),
        mount_point: entry.mountpoint.clone(),
        part_type: entry.parttype.clone(),
    }
}

/// Path of partition `num` on `disk`. NVMe and eMMC device names need a
/// `p` separator before the partition number.
pub fn partition_path(disk: &Path, num: u32) -> PathBuf {
    let disk = disk.display().to_string();

    if disk.contains("nvme") || disk.contains("mmcblk") {
        PathBuf::from(format!("{disk}p{num}"))
    } else {
        PathBuf::from(format!("{disk}{num}"))
    }
}

fn device_is_sata(name: &str) -> bool {
    device_is_match(name, r"^([^0-9]+)$")
}

fn device_is_sdcard(name: &str) -> bool {
    device_is_match(name, r"^(mmcblk[0-9]+)$")
}

fn device_is_nvme(name: &str) -> bool {
    device_is_match(name, r"^(nvme[0-9]+n[0-9]+)$")
}

fn device_is_match(name: &str, pattern: &str) -> bool {
    Regex::new(pattern)
        .ok()
        .and_then(|x| x.is_match(name).ok())
        .unwrap_or(false)
}
