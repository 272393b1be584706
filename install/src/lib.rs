use std::path::{Path, PathBuf};

use disk::{
    devices::Partition,
    partition::{shrink_and_create, use_free_space, wipe_disk, PartitionTargets},
    run::{RunCmdError, Runner},
    PartitionError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    bootstrap::bootstrap_system,
    configure::{configure_system, is_valid_hostname, is_valid_username, ConfigureError},
    desktop::install_desktop,
    format::format_partitions,
    genfstab::{generate_fstab, GenFstabError},
    grub::{install_bootloader, GrubError},
    mount::{mount_partitions, unmount_all, MountError, MOUNT_ROOT},
    stage::Stage,
};

mod bootstrap;
mod configure;
mod desktop;
mod format;
mod genfstab;
mod grub;
mod mount;
pub mod stage;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Value {0:?} is not set")]
    IsNotSet(NotSetValue),
    #[error("Hostname is not valid: {0}")]
    InvalidHostname(String),
    #[error("Username is not valid: {0}")]
    InvalidUsername(String),
    #[error("Password must not be empty or contain control characters")]
    InvalidPassword,
    #[error("Requested size {0} GiB is not usable")]
    InvalidSize(f64),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    RunCommand(#[from] RunCmdError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    GenFstab(#[from] GenFstabError),
    #[error(transparent)]
    Configure(#[from] ConfigureError),
    #[error(transparent)]
    Grub(#[from] GrubError),
}

#[derive(Debug, Clone, Copy)]
pub enum NotSetValue {
    Locale,
    Timezone,
    Keymap,
    TargetDisk,
    PartitionMode,
    Size,
    Hostname,
    User,
}

/// How the target disk is carved up.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartitionMode {
    /// Destroy the disk and lay out ESP plus root.
    Wipe,
    /// Create root inside an existing free region, reusing the ESP.
    Freespace,
    /// Shrink another operating system first, then create root.
    Dualboot,
}

impl PartitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionMode::Wipe => "wipe",
            PartitionMode::Freespace => "freespace",
            PartitionMode::Dualboot => "dualboot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KernelChoice {
    #[default]
    Linux,
    LinuxLts,
    LinuxZen,
    LinuxHardened,
}

impl KernelChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelChoice::Linux => "linux",
            KernelChoice::LinuxLts => "linux-lts",
            KernelChoice::LinuxZen => "linux-zen",
            KernelChoice::LinuxHardened => "linux-hardened",
        }
    }

    pub fn packages(&self) -> [&'static str; 2] {
        match self {
            KernelChoice::Linux => ["linux", "linux-headers"],
            KernelChoice::LinuxLts => ["linux-lts", "linux-lts-headers"],
            KernelChoice::LinuxZen => ["linux-zen", "linux-zen-headers"],
            KernelChoice::LinuxHardened => ["linux-hardened", "linux-hardened-headers"],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DesktopEnvironment {
    pub name: String,
    pub packages: Vec<String>,
    pub display_manager: Option<String>,
}

/// Everything the frontend sets field by field before an install can
/// start. Converting into [`InstallConfig`] validates the whole set.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct InstallConfigPrepare {
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub keymap: Option<String>,
    pub disk: Option<PathBuf>,
    pub mode: Option<PartitionMode>,
    pub size_gb: Option<f64>,
    pub efi_partition: Option<Partition>,
    pub other_os_partition: Option<Partition>,
    #[serde(default)]
    pub kernel: KernelChoice,
    pub hostname: Option<String>,
    pub user: Option<User>,
    pub desktop: Option<DesktopEnvironment>,
    #[serde(default)]
    pub cpu_packages: Vec<String>,
    #[serde(default)]
    pub gpu_packages: Vec<String>,
    #[serde(default)]
    pub user_packages: Vec<String>,
    #[serde(default)]
    pub system_packages: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// A fully validated install request. Immutable once built; a running
/// install never observes config changes.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub locale: String,
    pub timezone: String,
    pub keymap: String,
    pub disk: PathBuf,
    pub mode: PartitionMode,
    pub size_gb: f64,
    pub efi_partition: Option<Partition>,
    pub other_os_partition: Option<Partition>,
    pub kernel: KernelChoice,
    pub hostname: String,
    pub user: User,
    pub desktop: Option<DesktopEnvironment>,
    pub cpu_packages: Vec<String>,
    pub gpu_packages: Vec<String>,
    pub user_packages: Vec<String>,
    pub system_packages: Vec<String>,
    pub services: Vec<String>,
}

impl TryFrom<InstallConfigPrepare> for InstallConfig {
    type Error = InstallError;

    fn try_from(value: InstallConfigPrepare) -> Result<Self, Self::Error> {
        let mode = value
            .mode
            .ok_or(InstallError::IsNotSet(NotSetValue::PartitionMode))?;

        // A wipe always takes the whole disk, only the other two modes
        // need a requested size.
        let size_gb = match mode {
            PartitionMode::Wipe => value.size_gb.unwrap_or(0.0),
            PartitionMode::Freespace | PartitionMode::Dualboot => {
                let size = value.size_gb.ok_or(InstallError::IsNotSet(NotSetValue::Size))?;
                if !size.is_finite() || size <= 0.0 {
                    return Err(InstallError::InvalidSize(size));
                }
                size
            }
        };

        let hostname = value
            .hostname
            .ok_or(InstallError::IsNotSet(NotSetValue::Hostname))?;
        if !is_valid_hostname(&hostname) {
            return Err(InstallError::InvalidHostname(hostname));
        }

        let user = value.user.ok_or(InstallError::IsNotSet(NotSetValue::User))?;
        if !is_valid_username(&user.username) {
            return Err(InstallError::InvalidUsername(user.username));
        }
        if user.password.is_empty() || user.password.chars().any(|c| c.is_control()) {
            return Err(InstallError::InvalidPassword);
        }

        Ok(Self {
            locale: value
                .locale
                .ok_or(InstallError::IsNotSet(NotSetValue::Locale))?,
            timezone: value
                .timezone
                .ok_or(InstallError::IsNotSet(NotSetValue::Timezone))?,
            keymap: value
                .keymap
                .ok_or(InstallError::IsNotSet(NotSetValue::Keymap))?,
            disk: value
                .disk
                .ok_or(InstallError::IsNotSet(NotSetValue::TargetDisk))?,
            mode,
            size_gb,
            efi_partition: value.efi_partition,
            other_os_partition: value.other_os_partition,
            kernel: value.kernel,
            hostname,
            user,
            desktop: value.desktop,
            cpu_packages: value.cpu_packages,
            gpu_packages: value.gpu_packages,
            user_packages: value.user_packages,
            system_packages: value.system_packages,
            services: value.services,
        })
    }
}

impl InstallConfig {
    /// Drives a complete install. `progress` receives the step label and
    /// its percentage, `log` every line of install output, both in the
    /// order they happen. On failure the target is unmounted before the
    /// error is returned.
    pub fn start_install<F, F2>(&self, progress: F, log: F2) -> Result<(), InstallError>
    where
        F: Fn(&str, u8),
        F2: Fn(&str),
    {
        let runner = Runner::new(&log);

        match self.run_stages(&runner, &progress) {
            Ok(()) => Ok(()),
            Err(e) => {
                unmount_all(&runner);
                Err(e)
            }
        }
    }

    fn run_stages<F>(&self, runner: &Runner, progress: &F) -> Result<(), InstallError>
    where
        F: Fn(&str, u8),
    {
        info!("Starting install to {}", self.disk.display());

        stage_progress(runner, progress, stage::PARTITION, None);
        let targets = self.partition(runner)?;

        stage_progress(runner, progress, stage::FORMAT, None);
        format_partitions(&targets.efi, &targets.root, self.mode, runner)?;

        stage_progress(runner, progress, stage::MOUNT, None);
        mount_partitions(&targets.efi, &targets.root, runner)?;

        stage_progress(runner, progress, stage::BOOTSTRAP, None);
        bootstrap_system(self, runner)?;

        stage_progress(runner, progress, stage::FSTAB, None);
        generate_fstab(Path::new(MOUNT_ROOT), runner)?;

        stage_progress(runner, progress, stage::CONFIGURE, None);
        configure_system(self, runner)?;

        stage_progress(runner, progress, stage::BOOTLOADER, None);
        install_bootloader(self.mode, runner)?;

        if let Some(desktop) = &self.desktop {
            if !desktop.packages.is_empty() {
                let label = format!("Installing {}...", desktop.name);
                stage_progress(runner, progress, stage::DESKTOP, Some(&label));
                install_desktop(desktop, runner)?;
            }
        }

        stage_progress(runner, progress, stage::CLEANUP, None);
        unmount_all(runner);

        stage_progress(runner, progress, stage::DONE, None);
        info!("Install to {} finished", self.disk.display());

        Ok(())
    }

    fn partition(&self, runner: &Runner) -> Result<PartitionTargets, InstallError> {
        let targets = match self.mode {
            PartitionMode::Wipe => wipe_disk(&self.disk, runner)?,
            PartitionMode::Freespace => use_free_space(
                &self.disk,
                self.efi_partition.as_ref(),
                self.size_gb,
                runner,
            )?,
            PartitionMode::Dualboot => shrink_and_create(
                &self.disk,
                self.efi_partition.as_ref(),
                self.other_os_partition.as_ref(),
                self.size_gb,
                runner,
            )?,
        };

        Ok(targets)
    }
}

fn stage_progress<F>(runner: &Runner, progress: &F, stage: Stage, label: Option<&str>)
where
    F: Fn(&str, u8),
{
    let label = label.unwrap_or(stage.label);
    progress(label, stage.start);
    runner.log(&format!("[{}%] {}", stage.start, label));
}
