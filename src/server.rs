use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use disk::{
    devices::{list_devices, list_partitions, Partition},
    regions::free_regions,
    run::Runner,
};
use install::{
    DesktopEnvironment, InstallConfig, InstallConfigPrepare, KernelChoice, PartitionMode, User,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use zbus::interface;

use crate::error::ArchkitError;

/// Host used for the network reachability probe.
const NET_CHECK_HOST: &str = "archlinux.org";

#[derive(Debug)]
pub struct ArchkitServer {
    config: InstallConfigPrepare,
    status: Arc<Mutex<InstallStatus>>,
    logs: Arc<Mutex<Vec<String>>>,
    event_tx: Sender<InstallEvent>,
    _event_handle: JoinHandle<()>,
    install_thread: Option<JoinHandle<()>>,
}

impl Default for ArchkitServer {
    fn default() -> Self {
        let status = Arc::new(Mutex::new(InstallStatus::Pending));
        let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
        let (event_tx, event_rx) = mpsc::channel();

        let status_clone = status.clone();
        let logs_clone = logs.clone();

        Self {
            config: InstallConfigPrepare::default(),
            status,
            logs,
            event_tx,
            // One aggregator drains the worker's events, so status and
            // log order always match the order on the install thread.
            _event_handle: thread::spawn(move || {
                while let Ok(event) = event_rx.recv() {
                    if let InstallEvent::Log(line) = &event {
                        logs_clone.lock().unwrap().push(line.clone());
                    }
                    status_clone.lock().unwrap().apply(&event);
                }
            }),
            install_thread: None,
        }
    }
}

/// One observation from the install worker.
#[derive(Debug)]
pub enum InstallEvent {
    Progress { message: String, percent: u8 },
    Log(String),
    Done,
    Failed { message: String },
}

/// What the frontend sees when it polls. Done and Failed are terminal,
/// events arriving after them are dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstallStatus {
    Pending,
    Working { message: String, percent: u8 },
    Done,
    Failed { message: String },
}

impl InstallStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, InstallStatus::Done | InstallStatus::Failed { .. })
    }

    fn apply(&mut self, event: &InstallEvent) {
        if self.is_terminal() {
            return;
        }

        match event {
            InstallEvent::Progress { message, percent } => {
                *self = InstallStatus::Working {
                    message: message.clone(),
                    percent: *percent,
                };
            }
            InstallEvent::Log(_) => {}
            InstallEvent::Done => *self = InstallStatus::Done,
            InstallEvent::Failed { message } => {
                *self = InstallStatus::Failed {
                    message: message.clone(),
                };
            }
        }
    }
}

#[interface(name = "org.archkit.Archkit1")]
impl ArchkitServer {
    fn get_config(&self, field: &str) -> String {
        if field.is_empty() {
            match serde_json::to_string(&self.config) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to get config: {e}");
                    serde_json::to_string(&ArchkitError::get_config(e))
                        .unwrap_or_else(|_| "Failed to serialize".to_string())
                }
            }
        } else {
            match field {
                "locale" => self
                    .config
                    .locale
                    .clone()
                    .unwrap_or_else(|| not_set_error(field)),
                "timezone" => self
                    .config
                    .timezone
                    .clone()
                    .unwrap_or_else(|| not_set_error(field)),
                "keymap" => self
                    .config
                    .keymap
                    .clone()
                    .unwrap_or_else(|| not_set_error(field)),
                "hostname" => self
                    .config
                    .hostname
                    .clone()
                    .unwrap_or_else(|| not_set_error(field)),
                "disk" => self
                    .config
                    .disk
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| not_set_error(field)),
                "mode" => self
                    .config
                    .mode
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| not_set_error(field)),
                "size_gb" => self
                    .config
                    .size_gb
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| not_set_error(field)),
                "kernel" => self.config.kernel.as_str().to_string(),
                "user" => serde_json::to_string(&self.config.user.clone())
                    .unwrap_or_else(|_| not_set_error(field)),
                "desktop" => serde_json::to_string(&self.config.desktop.clone())
                    .unwrap_or_else(|_| not_set_error(field)),
                "efi_partition" => serde_json::to_string(&self.config.efi_partition.clone())
                    .unwrap_or_else(|_| not_set_error(field)),
                "other_os_partition" => {
                    serde_json::to_string(&self.config.other_os_partition.clone())
                        .unwrap_or_else(|_| not_set_error(field))
                }
                "cpu_packages" => serde_json::to_string(&self.config.cpu_packages)
                    .unwrap_or_else(|_| not_set_error(field)),
                "gpu_packages" => serde_json::to_string(&self.config.gpu_packages)
                    .unwrap_or_else(|_| not_set_error(field)),
                "user_packages" => serde_json::to_string(&self.config.user_packages)
                    .unwrap_or_else(|_| not_set_error(field)),
                "system_packages" => serde_json::to_string(&self.config.system_packages)
                    .unwrap_or_else(|_| not_set_error(field)),
                "services" => serde_json::to_string(&self.config.services)
                    .unwrap_or_else(|_| not_set_error(field)),
                _ => {
                    error!("Unknown field: {field}");
                    serde_json::to_string(&ArchkitError::unknown_field(field))
                        .unwrap_or_else(|_| "Failed to serialize".to_string())
                }
            }
        }
    }

    fn set_config(&mut self, field: &str, value: &str) -> String {
        match set_config_inner(&mut self.config, field, value) {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                error!("Failed to set config: {e}");
                serde_json::to_string(&e).unwrap_or_else(|_| "Failed to serialize error".to_string())
            }
        }
    }

    fn reset_config(&mut self) -> String {
        self.config = InstallConfigPrepare::default();
        "ok".to_string()
    }

    fn get_progress(&self) -> String {
        let status = self.status.lock().unwrap();
        serde_json::to_string(&*status).unwrap_or_else(|_| "Failed to serialize".to_string())
    }

    /// Install log lines starting at index `since`, so pollers only
    /// fetch what they have not seen yet.
    fn get_logs(&self, since: u64) -> String {
        let logs = self.logs.lock().unwrap();
        let start = (since as usize).min(logs.len());
        serde_json::to_string(&logs[start..]).unwrap_or_else(|_| "Failed to serialize".to_string())
    }

    fn get_list_devices(&self) -> String {
        match list_devices() {
            Ok(devices) => serde_json::to_string(&devices)
                .unwrap_or_else(|_| "Failed to serialize".to_string()),
            Err(e) => {
                error!("Failed to list devices: {e}");
                serde_json::to_string(&ArchkitError::InspectDevices(e.to_string()))
                    .unwrap_or_else(|_| "Failed to serialize".to_string())
            }
        }
    }

    fn get_list_partitions(&self, dev: &str) -> String {
        match list_partitions(Path::new(dev)) {
            Ok(partitions) => serde_json::to_string(&partitions)
                .unwrap_or_else(|_| "Failed to serialize".to_string()),
            Err(e) => {
                error!("Failed to list partitions of {dev}: {e}");
                serde_json::to_string(&ArchkitError::InspectDevices(e.to_string()))
                    .unwrap_or_else(|_| "Failed to serialize".to_string())
            }
        }
    }

    fn get_free_regions(&self, dev: &str) -> String {
        let log = |line: &str| info!("{line}");
        let runner = Runner::new(&log);

        match free_regions(Path::new(dev), &runner) {
            Ok(regions) => serde_json::to_string(&regions)
                .unwrap_or_else(|_| "Failed to serialize".to_string()),
            Err(e) => {
                error!("Failed to read free regions of {dev}: {e}");
                serde_json::to_string(&ArchkitError::InspectDevices(e.to_string()))
                    .unwrap_or_else(|_| "Failed to serialize".to_string())
            }
        }
    }

    fn is_efi_booted(&self) -> bool {
        disk::is_efi_booted()
    }

    fn is_online(&self) -> bool {
        let online = Command::new("ping")
            .args(["-c", "1", "-W", "2", NET_CHECK_HOST])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        info!("Network probe against {NET_CHECK_HOST}: online = {online}");

        online
    }

    fn start_install(&mut self) -> String {
        if let Some(handle) = &self.install_thread {
            if !handle.is_finished() {
                error!("Rejecting start_install, an install is already running");
                return serde_json::to_string(&ArchkitError::Install(
                    "An install is already running".to_string(),
                ))
                .unwrap_or_else(|_| "Failed to serialize".to_string());
            }
        }

        {
            let mut status = self.status.lock().unwrap();
            *status = InstallStatus::Working {
                message: "Starting install".to_string(),
                percent: 0,
            };
        }
        self.logs.lock().unwrap().clear();

        match start_install_inner(self.config.clone(), self.event_tx.clone()) {
            Ok(handle) => self.install_thread = Some(handle),
            Err(e) => {
                let mut status = self.status.lock().unwrap();
                *status = InstallStatus::Failed {
                    message: e.to_string(),
                };
                return serde_json::to_string(&e)
                    .unwrap_or_else(|_| "Failed to serialize".to_string());
            }
        }

        "ok".to_string()
    }
}

fn set_config_inner(
    config: &mut InstallConfigPrepare,
    field: &str,
    value: &str,
) -> Result<(), ArchkitError> {
    match field {
        "locale" => {
            config.locale = Some(value.to_string());
            Ok(())
        }
        "timezone" => {
            config.timezone = Some(value.to_string());
            Ok(())
        }
        "keymap" => {
            config.keymap = Some(value.to_string());
            Ok(())
        }
        "hostname" => {
            config.hostname = Some(value.to_string());
            Ok(())
        }
        "disk" => {
            config.disk = Some(PathBuf::from(value));
            Ok(())
        }
        "mode" => match value {
            "wipe" => {
                config.mode = Some(PartitionMode::Wipe);
                Ok(())
            }
            "freespace" => {
                config.mode = Some(PartitionMode::Freespace);
                Ok(())
            }
            "dualboot" => {
                config.mode = Some(PartitionMode::Dualboot);
                Ok(())
            }
            _ => Err(ArchkitError::SetValue(
                field.to_string(),
                value.to_string(),
            )),
        },
        "size_gb" => {
            let size = value
                .parse::<f64>()
                .map_err(|_| ArchkitError::SetValue(field.to_string(), value.to_string()))?;
            config.size_gb = Some(size);
            Ok(())
        }
        "kernel" => match value {
            "linux" => {
                config.kernel = KernelChoice::Linux;
                Ok(())
            }
            "linux-lts" => {
                config.kernel = KernelChoice::LinuxLts;
                Ok(())
            }
            "linux-zen" => {
                config.kernel = KernelChoice::LinuxZen;
                Ok(())
            }
            "linux-hardened" => {
                config.kernel = KernelChoice::LinuxHardened;
                Ok(())
            }
            _ => Err(ArchkitError::SetValue(
                field.to_string(),
                value.to_string(),
            )),
        },
        "user" => {
            let user = serde_json::from_str::<User>(value)
                .map_err(|_| ArchkitError::SetValue(field.to_string(), value.to_string()))?;
            config.user = Some(user);
            Ok(())
        }
        "desktop" => {
            let desktop = serde_json::from_str::<DesktopEnvironment>(value)
                .map_err(|_| ArchkitError::SetValue(field.to_string(), value.to_string()))?;
            config.desktop = Some(desktop);
            Ok(())
        }
        "efi_partition" => {
            let p = serde_json::from_str::<Partition>(value)
                .map_err(|_| ArchkitError::SetValue(field.to_string(), value.to_string()))?;
            config.efi_partition = Some(p);
            Ok(())
        }
        "other_os_partition" => {
            let p = serde_json::from_str::<Partition>(value)
                .map_err(|_| ArchkitError::SetValue(field.to_string(), value.to_string()))?;
            config.other_os_partition = Some(p);
            Ok(())
        }
        "cpu_packages" => {
            config.cpu_packages = parse_string_list(field, value)?;
            Ok(())
        }
        "gpu_packages" => {
            config.gpu_packages = parse_string_list(field, value)?;
            Ok(())
        }
        "user_packages" => {
            config.user_packages = parse_string_list(field, value)?;
            Ok(())
        }
        "system_packages" => {
            config.system_packages = parse_string_list(field, value)?;
            Ok(())
        }
        "services" => {
            config.services = parse_string_list(field, value)?;
            Ok(())
        }
        _ => {
            error!("Unknown field: {field}");
            Err(ArchkitError::unknown_field(field))
        }
    }
}

fn parse_string_list(field: &str, value: &str) -> Result<Vec<String>, ArchkitError> {
    serde_json::from_str::<Vec<String>>(value)
        .map_err(|_| ArchkitError::SetValue(field.to_string(), value.to_string()))
}

fn not_set_error(field: &str) -> String {
    error!("field {field} is not set");
    serde_json::to_string(&ArchkitError::not_set(field))
        .unwrap_or_else(|_| "Failed to serialize".to_string())
}

fn start_install_inner(
    config: InstallConfigPrepare,
    event_tx: Sender<InstallEvent>,
) -> Result<JoinHandle<()>, ArchkitError> {
    let config =
        InstallConfig::try_from(config).map_err(|e| ArchkitError::Install(e.to_string()))?;

    info!("Starting install to {}", config.disk.display());

    let handle = thread::spawn(move || {
        let progress_tx = event_tx.clone();
        let log_tx = event_tx.clone();

        let result = config.start_install(
            move |message, percent| {
                progress_tx
                    .send(InstallEvent::Progress {
                        message: message.to_string(),
                        percent,
                    })
                    .ok();
            },
            move |line| {
                log_tx.send(InstallEvent::Log(line.to_string())).ok();
            },
        );

        match result {
            Ok(()) => {
                info!("Install finished");
                event_tx.send(InstallEvent::Done).ok();
            }
            Err(e) => {
                error!("Install failed: {e}");
                event_tx
                    .send(InstallEvent::Failed {
                        message: e.to_string(),
                    })
                    .ok();
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn status_follows_progress_events() {
        let mut status = InstallStatus::Pending;

        status.apply(&InstallEvent::Progress {
            message: "Partitioning disk...".to_string(),
            percent: 5,
        });
        assert_eq!(
            status,
            InstallStatus::Working {
                message: "Partitioning disk...".to_string(),
                percent: 5
            }
        );

        status.apply(&InstallEvent::Log("$ wipefs -a /dev/sda".to_string()));
        assert!(matches!(status, InstallStatus::Working { .. }));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut status = InstallStatus::Working {
            message: "Cleaning up...".to_string(),
            percent: 97,
        };

        status.apply(&InstallEvent::Done);
        assert_eq!(status, InstallStatus::Done);

        status.apply(&InstallEvent::Progress {
            message: "late".to_string(),
            percent: 50,
        });
        assert_eq!(status, InstallStatus::Done);

        status.apply(&InstallEvent::Failed {
            message: "late failure".to_string(),
        });
        assert_eq!(status, InstallStatus::Done);
    }

    #[test]
    fn failed_status_is_sticky_too() {
        let mut status = InstallStatus::Working {
            message: "Formatting partitions...".to_string(),
            percent: 15,
        };

        status.apply(&InstallEvent::Failed {
            message: "mkfs.ext4 exited with 1".to_string(),
        });
        status.apply(&InstallEvent::Done);

        assert!(matches!(status, InstallStatus::Failed { .. }));
    }

    #[test]
    fn aggregator_orders_logs_and_reaches_done() {
        let server = ArchkitServer::default();

        for line in ["[5%] Partitioning disk...", "$ wipefs -a /dev/sda", "done"] {
            server
                .event_tx
                .send(InstallEvent::Log(line.to_string()))
                .unwrap();
        }
        server
            .event_tx
            .send(InstallEvent::Progress {
                message: "Partitioning disk...".to_string(),
                percent: 5,
            })
            .unwrap();
        server.event_tx.send(InstallEvent::Done).unwrap();

        // the aggregator thread drains the channel in order
        let mut waited = 0;
        loop {
            {
                let status = server.status.lock().unwrap();
                if *status == InstallStatus::Done {
                    break;
                }
            }
            thread::sleep(Duration::from_millis(10));
            waited += 1;
            assert!(waited < 500, "aggregator never reached Done");
        }

        let logs = server.logs.lock().unwrap();
        assert_eq!(
            *logs,
            vec![
                "[5%] Partitioning disk...".to_string(),
                "$ wipefs -a /dev/sda".to_string(),
                "done".to_string()
            ]
        );
    }

    #[test]
    fn set_config_accepts_known_modes_only() {
        let mut config = InstallConfigPrepare::default();

        set_config_inner(&mut config, "mode", "wipe").unwrap();
        assert_eq!(config.mode, Some(PartitionMode::Wipe));

        set_config_inner(&mut config, "mode", "dualboot").unwrap();
        assert_eq!(config.mode, Some(PartitionMode::Dualboot));

        let err = set_config_inner(&mut config, "mode", "btrfs-raid").unwrap_err();
        assert!(matches!(err, ArchkitError::SetValue(..)));
        // the previous valid value stays
        assert_eq!(config.mode, Some(PartitionMode::Dualboot));
    }

    #[test]
    fn set_config_parses_structured_fields() {
        let mut config = InstallConfigPrepare::default();

        set_config_inner(
            &mut config,
            "user",
            r#"{"username": "alice", "password": "hunter2"}"#,
        )
        .unwrap();
        assert_eq!(config.user.as_ref().map(|u| u.username.as_str()), Some("alice"));

        set_config_inner(&mut config, "size_gb", "40.5").unwrap();
        assert_eq!(config.size_gb, Some(40.5));

        set_config_inner(&mut config, "services", r#"["sshd.service"]"#).unwrap();
        assert_eq!(config.services, vec!["sshd.service".to_string()]);

        set_config_inner(
            &mut config,
            "efi_partition",
            r#"{"path": "/dev/sda1", "size": 536870912, "fs_type": "vfat",
                "mount_point": null, "part_type": "c12a7328-f81f-11d2-ba4b-00a0c93ec93b"}"#,
        )
        .unwrap();
        assert_eq!(
            config.efi_partition.as_ref().map(|p| p.path.clone()),
            Some(PathBuf::from("/dev/sda1"))
        );

        assert!(set_config_inner(&mut config, "size_gb", "a lot").is_err());
        assert!(set_config_inner(&mut config, "kernel", "linux-rt").is_err());
        assert!(set_config_inner(&mut config, "no_such_field", "x").is_err());
    }
}
