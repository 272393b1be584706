use std::{fs, path::Path};

use disk::run::{RunCmdError, Runner};
use snafu::{ResultExt, Snafu};

use crate::{mount::MOUNT_ROOT, PartitionMode};

const BOOTLOADER_ID: &str = "Archkit";
const THEME_SOURCE: &str = "/usr/local/share/archkit-grub";
const THEME_TARGET: &str = "/mnt/boot/grub/themes/archkit";
const GRUB_DEFAULTS: &str = "/mnt/etc/default/grub";

/// Directives removed from /etc/default/grub before ours are appended.
const STRIPPED_DIRECTIVES: &[&str] = &[
    "GRUB_THEME=",
    "GRUB_BACKGROUND=",
    "GRUB_GFXMODE=",
    "GRUB_GFXPAYLOAD_LINUX=",
    "GRUB_DISABLE_OS_PROBER=",
];

const APPENDED_DIRECTIVES: &[&str] = &[
    "GRUB_THEME=\"/boot/grub/themes/archkit/theme.txt\"",
    "GRUB_GFXMODE=\"auto\"",
    "GRUB_GFXPAYLOAD_LINUX=\"keep\"",
    "GRUB_DISABLE_OS_PROBER=false",
];

#[derive(Debug, Snafu)]
pub enum GrubError {
    #[snafu(display("Failed to copy bootloader theme: {path}"))]
    CopyTheme {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to update {path}"))]
    UpdateDefaults {
        path: String,
        source: std::io::Error,
    },
    #[snafu(transparent)]
    Run { source: RunCmdError },
}

/// Runs grub-install into the mounted ESP, applies our defaults and
/// generates grub.cfg. On dual boot layouts os-prober runs first so the
/// generated menu lists the other system.
pub(crate) fn install_bootloader(mode: PartitionMode, runner: &Runner) -> Result<(), GrubError> {
    runner.log("Installing GRUB for x86_64-efi");
    let id_arg = format!("--bootloader-id={BOOTLOADER_ID}");
    runner.run(
        "arch-chroot",
        [
            MOUNT_ROOT,
            "grub-install",
            "--target=x86_64-efi",
            "--efi-directory=/boot/efi",
            id_arg.as_str(),
            "--recheck",
            "--removable",
        ],
    )?;

    copy_theme(Path::new(THEME_SOURCE), Path::new(THEME_TARGET), runner)?;
    update_defaults(Path::new(GRUB_DEFAULTS))?;
    runner.log("GRUB defaults updated");

    if mode == PartitionMode::Dualboot {
        runner.run_unchecked("arch-chroot", [MOUNT_ROOT, "os-prober"]);
    }

    runner.run(
        "arch-chroot",
        [MOUNT_ROOT, "grub-mkconfig", "-o", "/boot/grub/grub.cfg"],
    )?;

    prioritize_boot_entry(runner);

    Ok(())
}

fn copy_theme(source: &Path, target: &Path, runner: &Runner) -> Result<(), GrubError> {
    if !source.is_dir() {
        runner.log(&format!(
            "Warning: no GRUB theme at {}, keeping the default look",
            source.display()
        ));
        return Ok(());
    }

    runner.log("Copying GRUB theme");
    if target.exists() {
        fs::remove_dir_all(target).context(CopyThemeSnafu {
            path: target.display().to_string(),
        })?;
    }
    fs::create_dir_all(target).context(CopyThemeSnafu {
        path: target.display().to_string(),
    })?;

    copy_dir(source, target)
}

/// Plain files first, then subdirectories, depth first.
fn copy_dir(source: &Path, target: &Path) -> Result<(), GrubError> {
    let mut subdirs = vec![];

    let entries = fs::read_dir(source).context(CopyThemeSnafu {
        path: source.display().to_string(),
    })?;
    for entry in entries {
        let entry = entry.context(CopyThemeSnafu {
            path: source.display().to_string(),
        })?;
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
            continue;
        }

        let name = match path.file_name() {
            Some(name) => name,
            None => continue,
        };
        fs::copy(&path, target.join(name)).context(CopyThemeSnafu {
            path: path.display().to_string(),
        })?;
    }

    for dir in subdirs {
        let name = match dir.file_name() {
            Some(name) => name.to_os_string(),
            None => continue,
        };
        let target = target.join(&name);
        fs::create_dir_all(&target).context(CopyThemeSnafu {
            path: target.display().to_string(),
        })?;
        copy_dir(&dir, &target)?;
    }

    Ok(())
}

fn update_defaults(path: &Path) -> Result<(), GrubError> {
    let config = fs::read_to_string(path).context(UpdateDefaultsSnafu {
        path: path.display().to_string(),
    })?;

    let updated = rewrite_grub_defaults(&config);
    fs::write(path, updated).context(UpdateDefaultsSnafu {
        path: path.display().to_string(),
    })?;

    Ok(())
}

/// Strips every theme, graphics and os-prober directive and appends our
/// fixed set. Running this over its own output changes nothing.
pub(crate) fn rewrite_grub_defaults(config: &str) -> String {
    let mut lines: Vec<&str> = config
        .lines()
        .filter(|line| !STRIPPED_DIRECTIVES.iter().any(|key| line.starts_with(key)))
        .collect();

    while let Some(last) = lines.last() {
        if last.trim().is_empty() {
            lines.pop();
        } else {
            break;
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    for directive in APPENDED_DIRECTIVES {
        out.push('\n');
        out.push_str(directive);
    }
    out.push('\n');

    out
}

/// Puts this system's boot entry at the front of the firmware BootOrder.
/// Firmware quirks abound here, so every failure only logs a warning.
fn prioritize_boot_entry(runner: &Runner) {
    let output = match runner.run_capture("arch-chroot", [MOUNT_ROOT, "efibootmgr"]) {
        Ok(output) => output,
        Err(e) => {
            runner.log(&format!("Warning: could not read EFI boot entries: {e}"));
            return;
        }
    };

    let order = match preferred_boot_order(&output) {
        Some(order) => order,
        None => {
            runner.log("Warning: found no boot entry to prioritize");
            return;
        }
    };

    let result = runner.run_unchecked(
        "arch-chroot",
        [MOUNT_ROOT, "efibootmgr", "-o", order.as_str()],
    );
    if result.success() {
        runner.log(&format!("EFI BootOrder set to {order}"));
    } else {
        runner.log("Warning: could not update the EFI BootOrder");
    }
}

/// Parses efibootmgr output and builds a BootOrder with our entry first.
/// Returns None when there is no BootOrder or no entry of ours.
pub(crate) fn preferred_boot_order(efibootmgr_output: &str) -> Option<String> {
    let mut boot_order: Vec<String> = vec![];
    let mut entries: Vec<(String, String)> = vec![];

    for line in efibootmgr_output.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("BootOrder:") {
            boot_order = rest
                .split(',')
                .map(|id| id.trim().to_uppercase())
                .filter(|id| !id.is_empty())
                .collect();
            continue;
        }

        if line.starts_with("Boot") && line.contains('*') && line.len() >= 8 {
            let id = match line.get(4..8) {
                Some(id) if id.chars().all(|c| c.is_ascii_hexdigit()) => id.to_uppercase(),
                _ => continue,
            };
            let label = match line.split_once('*') {
                Some((_, label)) => label.trim().to_lowercase(),
                None => continue,
            };
            entries.push((id, label));
        }
    }

    if boot_order.is_empty() {
        return None;
    }

    let lowered_id = BOOTLOADER_ID.to_lowercase();
    let (preferred_id, _) = entries.iter().find(|(_, label)| {
        label.contains(&lowered_id) || label.contains("arch linux") || label.as_str() == "arch"
    })?;

    let mut new_order = vec![preferred_id.clone()];
    for id in &boot_order {
        if id != preferred_id {
            new_order.push(id.clone());
        }
    }

    Some(new_order.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULTS: &str = "\
GRUB_DEFAULT=0
GRUB_TIMEOUT=5
GRUB_DISTRIBUTOR=\"Arch\"
GRUB_CMDLINE_LINUX_DEFAULT=\"loglevel=3 quiet\"
GRUB_THEME=\"/usr/share/grub/themes/old/theme.txt\"
GRUB_GFXMODE=1920x1080
GRUB_DISABLE_OS_PROBER=true
";

    #[test]
    fn rewrite_replaces_old_directives() {
        let updated = rewrite_grub_defaults(DEFAULTS);

        assert!(updated.contains("GRUB_DEFAULT=0"));
        assert!(updated.contains("GRUB_THEME=\"/boot/grub/themes/archkit/theme.txt\""));
        assert!(updated.contains("GRUB_DISABLE_OS_PROBER=false"));
        assert!(!updated.contains("themes/old"));
        assert!(!updated.contains("1920x1080"));
    }

    #[test]
    fn rewrite_appends_each_directive_exactly_once() {
        let updated = rewrite_grub_defaults(DEFAULTS);

        for key in STRIPPED_DIRECTIVES {
            if *key == "GRUB_BACKGROUND=" {
                continue;
            }
            let count = updated.lines().filter(|l| l.starts_with(key)).count();
            assert_eq!(count, 1, "{key} must appear exactly once");
        }
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite_grub_defaults(DEFAULTS);
        let twice = rewrite_grub_defaults(&once);
        assert_eq!(once, twice);
    }

    const EFIBOOTMGR: &str = "\
BootCurrent: 0003
Timeout: 1 seconds
BootOrder: 0000,0003,0001
Boot0000* Windows Boot Manager
Boot0001* UEFI: Samsung SSD 860
Boot0002  Disabled Entry
Boot0003* Archkit
";

    #[test]
    fn boot_order_moves_our_entry_to_the_front() {
        let order = preferred_boot_order(EFIBOOTMGR).unwrap();
        assert_eq!(order, "0003,0000,0001");
    }

    #[test]
    fn boot_order_accepts_arch_linux_entries() {
        let output = "\
BootOrder: 0000,0001
Boot0000* Windows Boot Manager
Boot0001* Arch Linux
";
        let order = preferred_boot_order(output).unwrap();
        assert_eq!(order, "0001,0000");
    }

    #[test]
    fn boot_order_without_our_entry_is_left_alone() {
        let output = "\
BootOrder: 0000,0001
Boot0000* Windows Boot Manager
Boot0001* UEFI: Samsung SSD 860
";
        assert_eq!(preferred_boot_order(output), None);
    }

    #[test]
    fn missing_boot_order_line_is_left_alone() {
        let output = "Boot0000* Archkit\n";
        assert_eq!(preferred_boot_order(output), None);
    }

    #[test]
    fn inactive_entries_are_ignored() {
        // Boot0002 has no star and must not be picked up
        let order = preferred_boot_order(EFIBOOTMGR).unwrap();
        assert!(!order.contains("0002"));
    }
}
