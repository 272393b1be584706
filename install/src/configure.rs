use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use disk::run::{RunCmdError, Runner};
use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::{mount::MOUNT_ROOT, InstallConfig};

const SETUP_SCRIPT: &str = "/mnt/root/archkit_setup.sh";
const SETUP_SCRIPT_IN_TARGET: &str = "/root/archkit_setup.sh";

#[derive(Debug, Snafu)]
pub enum ConfigureError {
    #[snafu(display("Failed to write setup script {path}"))]
    WriteScript {
        path: String,
        source: std::io::Error,
    },
    #[snafu(transparent)]
    Run { source: RunCmdError },
}

/// Renders the in-target setup script, runs it through arch-chroot and
/// removes it again. The script carries the user's password, so it is
/// removed even when the run fails.
pub(crate) fn configure_system(
    config: &InstallConfig,
    runner: &Runner,
) -> Result<(), ConfigureError> {
    let script = render_setup_script(config);
    write_script(Path::new(SETUP_SCRIPT), &script)?;

    runner.log("Applying system configuration inside the target");
    let result = runner.run("arch-chroot", [MOUNT_ROOT, SETUP_SCRIPT_IN_TARGET]);

    if let Err(e) = fs::remove_file(SETUP_SCRIPT) {
        warn!("Could not remove {SETUP_SCRIPT}: {e}");
    }

    result?;

    Ok(())
}

fn write_script(path: &Path, script: &str) -> Result<(), ConfigureError> {
    fs::write(path, script).context(WriteScriptSnafu {
        path: path.display().to_string(),
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).context(WriteScriptSnafu {
        path: path.display().to_string(),
    })?;

    Ok(())
}

/// The configuration script run inside the target. Every user supplied
/// value lands in a quoted shell variable up front; the body never
/// interpolates them directly.
pub(crate) fn render_setup_script(config: &InstallConfig) -> String {
    let services = config
        .services
        .iter()
        .map(|svc| sh_quote(svc))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"#!/bin/bash
set -e

NEW_TIMEZONE={timezone}
NEW_LOCALE={locale}
NEW_HOSTNAME={hostname}
NEW_KEYMAP={keymap}
NEW_USER={username}
NEW_PASSWORD={password}

# Time
ln -sf "/usr/share/zoneinfo/$NEW_TIMEZONE" /etc/localtime
hwclock --systohc

# Locale
echo "$NEW_LOCALE UTF-8" >> /etc/locale.gen
locale-gen
echo "LANG=$NEW_LOCALE" > /etc/locale.conf

# Multilib repository of the installed system
sed -i '/^#\[multilib\]/{{N;s/#\[multilib\]\n#Include/[multilib]\nInclude/}}' /etc/pacman.conf || true

# Hostname
echo "$NEW_HOSTNAME" > /etc/hostname
cat > /etc/hosts << EOF
127.0.0.1   localhost
::1         localhost
127.0.1.1   $NEW_HOSTNAME.localdomain $NEW_HOSTNAME
EOF

# Console and X11 keymap
echo "KEYMAP=$NEW_KEYMAP" > /etc/vconsole.conf
mkdir -p /etc/X11/xorg.conf.d
cat > /etc/X11/xorg.conf.d/00-keyboard.conf << KEYEOF
Section "InputClass"
    Identifier "system-keyboard"
    MatchIsKeyboard "on"
    Option "XkbLayout" "$NEW_KEYMAP"
EndSection
KEYEOF

# Initramfs warnings about missing firmware are not fatal
mkinitcpio -P || echo "mkinitcpio reported warnings, continuing"

# Primary user; root stays locked and wheel gets sudo
passwd -l root
useradd -m -G wheel,audio,video,storage,optical -s /bin/bash "$NEW_USER"
echo "$NEW_USER:$NEW_PASSWORD" | chpasswd
echo "%wheel ALL=(ALL:ALL) ALL" > /etc/sudoers.d/wheel
chmod 440 /etc/sudoers.d/wheel

# Networking
systemctl enable NetworkManager.service || echo "WARNING: could not enable NetworkManager"
systemctl enable systemd-resolved.service 2>/dev/null || true
systemctl enable iwd.service 2>/dev/null || true

for svc in {services}; do
    systemctl enable "$svc" 2>/dev/null || echo "Note: could not enable $svc"
done
"#,
        timezone = sh_quote(&config.timezone),
        locale = sh_quote(&config.locale),
        hostname = sh_quote(&config.hostname),
        keymap = sh_quote(&config.keymap),
        username = sh_quote(&config.user.username),
        password = sh_quote(&config.user.password),
        services = services,
    )
}

/// POSIX single quoting. The result is one shell word, no matter what
/// the input contains.
pub(crate) fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.starts_with('-') {
        return false;
    }

    for c in hostname.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' {
            return false;
        }
    }

    true
}

/// POSIX portable user names: lowercase, digits, dash and underscore,
/// not starting with a digit or dash.
pub(crate) fn is_valid_username(username: &str) -> bool {
    if username.is_empty() || username.len() > 32 {
        return false;
    }

    let first = username.as_bytes()[0];
    if !(first.is_ascii_lowercase() || first == b'_') {
        return false;
    }

    username
        .bytes()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-' || c == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstallConfig, KernelChoice, PartitionMode, User};

    fn test_config() -> InstallConfig {
        InstallConfig {
            locale: "de_DE.UTF-8".to_string(),
            timezone: "Europe/Berlin".to_string(),
            keymap: "de".to_string(),
            disk: "/dev/sda".into(),
            mode: PartitionMode::Wipe,
            size_gb: 0.0,
            efi_partition: None,
            other_os_partition: None,
            kernel: KernelChoice::Linux,
            hostname: "archbox".to_string(),
            user: User {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
            },
            desktop: None,
            cpu_packages: vec![],
            gpu_packages: vec![],
            user_packages: vec![],
            system_packages: vec![],
            services: vec!["sshd.service".to_string()],
        }
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote("$HOME `id`"), "'$HOME `id`'");
    }

    #[test]
    fn script_assigns_quoted_values() {
        let script = render_setup_script(&test_config());

        assert!(script.starts_with("#!/bin/bash\nset -e\n"));
        assert!(script.contains("NEW_HOSTNAME='archbox'"));
        assert!(script.contains("NEW_USER='alice'"));
        assert!(script.contains("NEW_PASSWORD='hunter2'"));
        assert!(script.contains("for svc in 'sshd.service'; do"));
    }

    #[test]
    fn hostile_values_stay_inside_single_quotes() {
        let mut config = test_config();
        config.user.password = "x'; reboot; echo '".to_string();

        let script = render_setup_script(&config);
        assert!(script.contains(r"NEW_PASSWORD='x'\''; reboot; echo '\'''"));
        assert!(!script.contains("\n; reboot"));
    }

    #[test]
    fn script_keeps_the_sed_braces_intact() {
        let script = render_setup_script(&test_config());
        assert!(script.contains(r"{N;s/#\[multilib\]\n#Include/[multilib]\nInclude/}"));
    }

    #[test]
    fn script_populates_hosts_and_keyboard_config() {
        let script = render_setup_script(&test_config());

        assert!(script.contains("127.0.1.1   $NEW_HOSTNAME.localdomain $NEW_HOSTNAME"));
        assert!(script.contains("Option \"XkbLayout\" \"$NEW_KEYMAP\""));
        assert!(script.contains("echo \"%wheel ALL=(ALL:ALL) ALL\" > /etc/sudoers.d/wheel"));
    }

    #[test]
    fn empty_service_list_renders_an_empty_loop() {
        let mut config = test_config();
        config.services = vec![];

        let script = render_setup_script(&config);
        assert!(script.contains("for svc in ; do"));
    }

    #[test]
    fn test_hostname_validation() {
        assert!(is_valid_hostname("archbox"));
        assert!(is_valid_hostname("web-01"));
        assert!(is_valid_hostname("X250"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-leading-dash"));
        assert!(!is_valid_hostname("has space"));
        assert!(!is_valid_hostname("has_underscore"));
        assert!(!is_valid_hostname("emoji🐱"));
    }

    #[test]
    fn test_username_validation() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("_daemon"));
        assert!(is_valid_username("dev-user2"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("Alice"));
        assert!(!is_valid_username("9lives"));
        assert!(!is_valid_username("a b"));
        assert!(!is_valid_username("root:0"));
        assert!(!is_valid_username(&"a".repeat(33)));
    }
}
