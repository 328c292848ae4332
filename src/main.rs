use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use zbus::{
    fdo::{self, RequestNameFlags, RequestNameReply},
    names::WellKnownName,
    ConnectionBuilder,
};

use crate::config::{Config, Environment};

mod config;
mod picker;
mod services;
mod session;

const WELL_KNOWN_NAME: &str = "org.freedesktop.impl.portal.desktop.pikeru";

#[derive(Parser)]
#[command(name = "xdg-desktop-portal-pikeru")]
#[command(about = "xdg-desktop-portal backend that hands file dialogs to an external picker")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug or trace
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    loglevel: log::LevelFilter,

    /// Replace a running instance
    #[arg(short, long)]
    replace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(cli.loglevel)
        .init();

    let env = Environment::from_process();
    let config = Arc::new(Config::resolve(&env, cli.config.as_deref()));
    config.print(log::Level::Info);

    let connection = ConnectionBuilder::session()?.build().await?;

    services::init_all(
        &connection,
        config.clone(),
        env.home().map(Path::to_path_buf),
    )
    .await?;

    let flags = if cli.replace {
        RequestNameFlags::ReplaceExisting
            | RequestNameFlags::AllowReplacement
            | RequestNameFlags::DoNotQueue
    } else {
        RequestNameFlags::DoNotQueue.into()
    };

    let name = WellKnownName::try_from(WELL_KNOWN_NAME)?;
    let dbus = fdo::DBusProxy::new(&connection).await?;
    match dbus.request_name(name.clone(), flags).await? {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {}
        reply => bail!(
            "failed to acquire {}: {:?} (is another portal running? try --replace)",
            WELL_KNOWN_NAME,
            reply
        ),
    }

    log::info!("all services initialized");

    wait_for_shutdown().await?;

    log::info!("shutting down");
    dbus.release_name(name).await?;
    services::shutdown_all(&connection).await?;

    // the services no longer hold the config, so this releases it.
    drop(config);

    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }

    Ok(())
}
