use std::{collections::HashSet, fs};

use disk::run::{RunCmdError, Runner};
use tracing::warn;

use crate::{mount::MOUNT_ROOT, InstallConfig};

/// Installed on every system, independent of hardware and user choice.
/// The kernel is added separately so alternatives like the LTS kernel
/// stay selectable.
pub(crate) const BASE_PACKAGES: &[&str] = &[
    "base",
    "base-devel",
    "linux-firmware",
    "mkinitcpio",
    "networkmanager",
    "iwd",
    "sudo",
    "nano",
    "vim",
    "git",
    "curl",
    "wget",
    "grub",
    "efibootmgr",
    "os-prober",
    "bash-completion",
    "man-db",
    "man-pages",
];

const PACMAN_CONF: &str = "/etc/pacman.conf";

/// Installs the package set into the mounted target with pacstrap.
pub(crate) fn bootstrap_system(config: &InstallConfig, runner: &Runner) -> Result<(), RunCmdError> {
    enable_live_multilib(runner);

    let packages = package_set(config);
    runner.log(&format!("Running pacstrap with {} packages", packages.len()));

    let mut args = vec![MOUNT_ROOT.to_string()];
    args.extend(packages);
    runner.run("pacstrap", args)?;

    Ok(())
}

/// The full package list: base set, kernel, hardware drivers, then user
/// extras. Extras already covered by an earlier group or by the desktop
/// environment are dropped; first occurrence keeps its position.
pub(crate) fn package_set(config: &InstallConfig) -> Vec<String> {
    let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|x| x.to_string()).collect();
    packages.extend(config.kernel.packages().iter().map(|x| x.to_string()));
    packages.extend(config.cpu_packages.iter().cloned());
    packages.extend(config.gpu_packages.iter().cloned());

    let desktop_packages: HashSet<&str> = config
        .desktop
        .as_ref()
        .map(|de| de.packages.iter().map(|x| x.as_str()).collect())
        .unwrap_or_default();

    let mut seen: HashSet<String> = packages.iter().cloned().collect();
    for extra in config.user_packages.iter().chain(&config.system_packages) {
        if seen.contains(extra) || desktop_packages.contains(extra.as_str()) {
            continue;
        }
        seen.insert(extra.clone());
        packages.push(extra.clone());
    }

    packages
}

/// Uncomments the multilib section of pacman.conf so the live session
/// can install lib32 packages. Best effort, a read-only ISO only warns.
fn enable_live_multilib(runner: &Runner) {
    let conf = match fs::read_to_string(PACMAN_CONF) {
        Ok(conf) => conf,
        Err(e) => {
            warn!("Could not read {PACMAN_CONF}: {e}");
            return;
        }
    };

    let updated = match enable_multilib_repo(&conf) {
        Some(updated) => updated,
        None => return,
    };

    if let Err(e) = fs::write(PACMAN_CONF, updated) {
        runner.log(&format!("Warning: could not enable multilib: {e}"));
        return;
    }

    runner.run_unchecked("pacman", ["-Sy", "--noconfirm"]);
    runner.log("Multilib enabled on the live ISO");
}

/// Rewrites pacman.conf text with the multilib section activated.
/// Returns None when there is nothing to change.
pub(crate) fn enable_multilib_repo(conf: &str) -> Option<String> {
    if !conf.contains("#[multilib]") {
        return None;
    }

    Some(conf.replace("#[multilib]\n#Include", "[multilib]\nInclude"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{DesktopEnvironment, InstallConfig, KernelChoice, PartitionMode, User};

    fn test_config() -> InstallConfig {
        InstallConfig {
            locale: "en_US.UTF-8".to_string(),
            timezone: "Europe/Berlin".to_string(),
            keymap: "us".to_string(),
            disk: "/dev/sda".into(),
            mode: PartitionMode::Wipe,
            size_gb: 0.0,
            efi_partition: None,
            other_os_partition: None,
            kernel: KernelChoice::Linux,
            hostname: "archbox".to_string(),
            user: User {
                username: "alice".to_string(),
                password: "secret".to_string(),
            },
            desktop: None,
            cpu_packages: vec![],
            gpu_packages: vec![],
            user_packages: vec![],
            system_packages: vec![],
            services: vec![],
        }
    }

    #[test]
    fn package_set_contains_base_and_kernel() {
        let config = test_config();
        let packages = package_set(&config);

        assert!(packages.iter().any(|p| p == "base"));
        assert!(packages.iter().any(|p| p == "linux"));
        assert!(packages.iter().any(|p| p == "linux-headers"));
        assert!(packages.iter().any(|p| p == "grub"));
    }

    #[test]
    fn alternative_kernels_replace_the_default() {
        let mut config = test_config();
        config.kernel = KernelChoice::LinuxLts;

        let packages = package_set(&config);
        assert!(packages.iter().any(|p| p == "linux-lts"));
        assert!(packages.iter().any(|p| p == "linux-lts-headers"));
        assert!(!packages.iter().any(|p| p == "linux-headers"));
    }

    #[test]
    fn package_set_has_no_duplicates() {
        let mut config = test_config();
        config.cpu_packages = vec!["intel-ucode".to_string()];
        config.gpu_packages = vec!["mesa".to_string()];
        config.user_packages = vec![
            "firefox".to_string(),
            "mesa".to_string(),
            "vim".to_string(),
        ];
        config.system_packages = vec!["firefox".to_string(), "htop".to_string()];

        let packages = package_set(&config);
        let unique: HashSet<&String> = packages.iter().collect();
        assert_eq!(packages.len(), unique.len());
    }

    #[test]
    fn extras_covered_by_the_desktop_are_dropped() {
        let mut config = test_config();
        config.desktop = Some(DesktopEnvironment {
            name: "KDE Plasma".to_string(),
            packages: vec!["plasma".to_string(), "konsole".to_string()],
            display_manager: Some("sddm".to_string()),
        });
        config.user_packages = vec!["konsole".to_string(), "firefox".to_string()];

        let packages = package_set(&config);
        assert!(!packages.iter().any(|p| p == "konsole"));
        assert!(packages.iter().any(|p| p == "firefox"));
    }

    #[test]
    fn extra_ordering_does_not_change_the_set() {
        let mut first = test_config();
        first.user_packages = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        first.system_packages = vec!["d".to_string(), "b".to_string()];

        let mut second = test_config();
        second.user_packages = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        second.system_packages = vec!["b".to_string(), "d".to_string()];

        let left: HashSet<String> = package_set(&first).into_iter().collect();
        let right: HashSet<String> = package_set(&second).into_iter().collect();
        assert_eq!(left, right);
    }

    #[test]
    fn multilib_rewrite_uncomments_the_section_once() {
        let conf = "\
[core]
Include = /etc/pacman.d/mirrorlist

#[multilib]
#Include = /etc/pacman.d/mirrorlist
";

        let enabled = enable_multilib_repo(conf).unwrap();
        assert!(enabled.contains("[multilib]\nInclude"));
        assert!(!enabled.contains("#[multilib]"));

        // a second pass has nothing left to do
        assert_eq!(enable_multilib_repo(&enabled), None);
    }

    #[test]
    fn multilib_rewrite_ignores_configs_without_the_section() {
        let conf = "[core]\nInclude = /etc/pacman.d/mirrorlist\n";
        assert_eq!(enable_multilib_repo(conf), None);
    }
}
