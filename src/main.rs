use std::future::pending;

use crate::server::ArchkitServer;
use eyre::{bail, Result};
use inhibit::take_wake_lock;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use zbus::{connection, Connection};

mod error;
mod inhibit;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let env_log = EnvFilter::try_from_default_env();

    // one log file per day
    let file_appender = tracing_appender::rolling::daily("/tmp", "archkit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    if let Ok(filter) = env_log {
        tracing_subscriber::registry()
            .with(fmt::layer().with_filter(filter))
            .with(fmt::layer().with_writer(non_blocking))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(LevelFilter::DEBUG)
            .with(fmt::layer().with_writer(non_blocking))
            .init();
    }

    info!("Archkit backend version: {}", env!("CARGO_PKG_VERSION"));

    if !rustix::process::geteuid().is_root() {
        bail!("archkit-backend must run as root");
    }

    ctrlc::set_handler(|| {
        info!("Received termination signal, exiting");
        std::process::exit(0);
    })?;

    let conn = Connection::system().await?;
    let fds = take_wake_lock(&conn).await?;

    let archkit_server = ArchkitServer::default();

    let _conn = connection::Builder::system()?
        .name("org.archkit.Archkit")?
        .serve_at("/org/archkit/Archkit", archkit_server)?
        .build()
        .await?;

    debug!("D-Bus service registered, waiting for calls");
    pending::<()>().await;

    drop(fds);

    Ok(())
}
