use std::path::Path;

use fancy_regex::Regex;
use serde::Serialize;

use crate::{run::Runner, PartitionError};

/// Matches one "Free Space" row of `parted unit MB print free`.
const FREE_SPACE_PATTERN: &str = r"^\s*([0-9.]+)MB\s+([0-9.]+)MB\s+([0-9.]+)MB\s+Free Space\s*$";

/// A gap in the partition table, in parted's MB units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FreeRegion {
    pub start_mb: f64,
    pub end_mb: f64,
    pub size_mb: f64,
}

/// All free regions of `dev`, in disk order. An empty list means the
/// table has no usable gap at all.
pub fn free_regions(dev: &Path, runner: &Runner) -> Result<Vec<FreeRegion>, PartitionError> {
    let dev_s = dev.display().to_string();
    let output = runner.run_capture("parted", ["-s", dev_s.as_str(), "unit", "MB", "print", "free"])?;

    Ok(parse_free_regions(&output))
}

pub fn parse_free_regions(parted_output: &str) -> Vec<FreeRegion> {
    let re = match Regex::new(FREE_SPACE_PATTERN) {
        Ok(re) => re,
        Err(_) => return vec![],
    };

    let mut regions = vec![];
    for line in parted_output.lines() {
        let caps = match re.captures(line) {
            Ok(Some(caps)) => caps,
            _ => continue,
        };

        let field = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<f64>().ok())
        };

        if let (Some(start_mb), Some(end_mb), Some(size_mb)) = (field(1), field(2), field(3)) {
            regions.push(FreeRegion {
                start_mb,
                end_mb,
                size_mb,
            });
        }
    }

    regions
}

/// Picks the largest region that can hold `need_mb`. Equally sized
/// candidates resolve to the one further into the disk.
pub fn select_free_region(regions: &[FreeRegion], need_mb: u64) -> Option<FreeRegion> {
    let need = need_mb as f64;
    let mut best: Option<FreeRegion> = None;

    for region in regions {
        if region.size_mb < need {
            continue;
        }

        let replace = match best {
            Some(b) => {
                region.size_mb > b.size_mb
                    || (region.size_mb == b.size_mb && region.start_mb > b.start_mb)
            }
            None => true,
        };
        if replace {
            best = Some(*region);
        }
    }

    best
}

/// Whole-MB bounds for a new partition at the front of `region`. The end
/// is derived from the start so the partition is exactly `need_mb` long.
pub fn new_partition_bounds(region: &FreeRegion, need_mb: u64) -> (u64, u64) {
    let start = region.start_mb as u64;
    (start, start + need_mb)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTED_OUTPUT: &str = "\
Model: ATA QEMU HARDDISK (scsi)
Disk /dev/sda: 64425MB
Sector size (logical/physical): 512B/512B
Partition Table: gpt
Disk Flags:

Number  Start    End      Size     File system  Name  Flags
        0.02MB   1.05MB   1.03MB   Free Space
 1      1.05MB   538MB    537MB    fat32        EFI   boot, esp
 2      538MB    32212MB  31674MB  ntfs
        32212MB  64424MB  32212MB  Free Space
";

    #[test]
    fn parse_free_regions_finds_gaps_and_skips_partitions() {
        let regions = parse_free_regions(PARTED_OUTPUT);

        assert_eq!(regions.len(), 2);
        assert_eq!(
            regions[0],
            FreeRegion {
                start_mb: 0.02,
                end_mb: 1.05,
                size_mb: 1.03
            }
        );
        assert_eq!(
            regions[1],
            FreeRegion {
                start_mb: 32212.0,
                end_mb: 64424.0,
                size_mb: 32212.0
            }
        );
    }

    #[test]
    fn parse_free_regions_tolerates_empty_output() {
        assert!(parse_free_regions("").is_empty());
        assert!(parse_free_regions("Error: unrecognised disk label").is_empty());
    }

    #[test]
    fn select_rejects_regions_that_are_all_too_small() {
        let regions = [
            FreeRegion {
                start_mb: 0.0,
                end_mb: 1000.0,
                size_mb: 1000.0,
            },
            FreeRegion {
                start_mb: 1000.0,
                end_mb: 1100.0,
                size_mb: 100.0,
            },
        ];

        assert_eq!(select_free_region(&regions, 40960), None);
    }

    #[test]
    fn select_takes_the_largest_region() {
        let regions = [
            FreeRegion {
                start_mb: 1.0,
                end_mb: 2049.0,
                size_mb: 2048.0,
            },
            FreeRegion {
                start_mb: 10000.0,
                end_mb: 60000.0,
                size_mb: 50000.0,
            },
        ];

        let selected = select_free_region(&regions, 40960).unwrap();
        assert_eq!(selected.start_mb, 10000.0);
    }

    #[test]
    fn select_breaks_size_ties_towards_the_disk_end() {
        let regions = [
            FreeRegion {
                start_mb: 0.0,
                end_mb: 100.0,
                size_mb: 100.0,
            },
            FreeRegion {
                start_mb: 500.0,
                end_mb: 600.0,
                size_mb: 100.0,
            },
        ];

        let selected = select_free_region(&regions, 50).unwrap();
        assert_eq!(selected.start_mb, 500.0);
    }

    #[test]
    fn new_partition_is_exactly_the_requested_size() {
        let region = FreeRegion {
            start_mb: 1000.4,
            end_mb: 60000.0,
            size_mb: 58999.6,
        };

        let (start, end) = new_partition_bounds(&region, 40960);
        assert_eq!(start, 1000);
        assert_eq!(end - start, 40960);
    }
}
