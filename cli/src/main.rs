use std::time::Duration;

use clap::Parser;
use eyre::{bail, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
use zbus::Result as zResult;
use zbus::{proxy, Connection};

#[proxy(
    interface = "org.archkit.Archkit1",
    default_service = "org.archkit.Archkit",
    default_path = "/org/archkit/Archkit"
)]
trait Archkit {
    async fn set_config(&self, field: &str, value: &str) -> zResult<String>;
    async fn get_config(&self, field: &str) -> zResult<String>;
    async fn reset_config(&self) -> zResult<String>;
    async fn get_progress(&self) -> zResult<String>;
    async fn get_logs(&self, since: u64) -> zResult<String>;
    async fn get_list_devices(&self) -> zResult<String>;
    async fn get_list_partitions(&self, dev: &str) -> zResult<String>;
    async fn get_free_regions(&self, dev: &str) -> zResult<String>;
    async fn is_efi_booted(&self) -> zResult<bool>;
    async fn is_online(&self) -> zResult<bool>;
    async fn start_install(&self) -> zResult<String>;
}

#[derive(Parser, Debug)]
struct Args {
    /// Target disk to install to (e.g., /dev/sda)
    #[clap(long)]
    disk: String,
    /// Partitioning mode: wipe, freespace or dualboot
    #[clap(long, default_value = "wipe")]
    mode: String,
    /// Size of the new root partition in GiB (freespace and dualboot)
    #[clap(long)]
    size_gb: Option<f64>,
    /// Name of the default user
    #[clap(long)]
    user: String,
    /// Password for the default user
    #[clap(long)]
    password: String,
    /// Device hostname
    #[clap(long, default_value = "archkit")]
    hostname: String,
    /// Default timezone
    #[clap(long, default_value = "UTC")]
    timezone: String,
    /// Default locale (affects display language, units, time/date format etc.)
    #[clap(long, default_value = "en_US.UTF-8")]
    locale: String,
    /// Console and X11 keymap
    #[clap(long, default_value = "us")]
    keymap: String,
    /// Kernel package set: linux, linux-lts, linux-zen or linux-hardened
    #[clap(long, default_value = "linux")]
    kernel: String,
    /// Show devices, partitions and machine state instead of configuring
    #[clap(long, action = clap::ArgAction::SetTrue)]
    probe: bool,
    /// Start the install and poll progress until it is finished
    #[clap(long, action = clap::ArgAction::SetTrue)]
    run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_log = EnvFilter::try_from_default_env();

    if let Ok(filter) = env_log {
        tracing_subscriber::registry()
            .with(fmt::layer().with_filter(filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(LevelFilter::DEBUG)
            .init();
    }

    let connection = Connection::system().await?;
    let proxy = ArchkitProxy::new(&connection).await?;

    if args.probe {
        println!("efi: {}", proxy.is_efi_booted().await?);
        println!("online: {}", proxy.is_online().await?);
        println!("devices: {}", proxy.get_list_devices().await?);
        println!(
            "partitions: {}",
            proxy.get_list_partitions(&args.disk).await?
        );
        println!("free: {}", proxy.get_free_regions(&args.disk).await?);
        return Ok(());
    }

    set_field(&proxy, "disk", &args.disk).await?;
    set_field(&proxy, "mode", &args.mode).await?;
    if let Some(size_gb) = args.size_gb {
        set_field(&proxy, "size_gb", &size_gb.to_string()).await?;
    }
    set_field(&proxy, "timezone", &args.timezone).await?;
    set_field(&proxy, "locale", &args.locale).await?;
    set_field(&proxy, "keymap", &args.keymap).await?;
    set_field(&proxy, "hostname", &args.hostname).await?;
    set_field(&proxy, "kernel", &args.kernel).await?;
    set_field(
        &proxy,
        "user",
        &serde_json::json! {{
            "username": &args.user,
            "password": &args.password,
        }}
        .to_string(),
    )
    .await?;

    println!("{}", proxy.get_config("").await?);

    if !args.run {
        return Ok(());
    }

    let ret = proxy.start_install().await?;
    if ret != "ok" {
        bail!("Failed to start install: {ret}");
    }

    let mut cursor = 0u64;
    loop {
        let logs: Vec<String> =
            serde_json::from_str(&proxy.get_logs(cursor).await?).unwrap_or_default();
        for line in &logs {
            println!("{line}");
        }
        cursor += logs.len() as u64;

        let status: serde_json::Value = serde_json::from_str(&proxy.get_progress().await?)?;
        if status == serde_json::json!("Done") {
            println!("Install finished");
            return Ok(());
        }
        if let Some(failed) = status.get("Failed") {
            bail!("Install failed: {failed}");
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn set_field(proxy: &ArchkitProxy<'_>, field: &str, value: &str) -> Result<()> {
    let ret = proxy.set_config(field, value).await?;
    if ret != "ok" {
        bail!("Failed to set {field}: {ret}");
    }

    Ok(())
}
