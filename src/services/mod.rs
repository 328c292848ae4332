use std::{path::PathBuf, sync::Arc};

use zbus::Connection;

use crate::config::Config;

use self::filechooser::FileChooser;

pub mod filechooser;
pub mod request;

pub const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";

pub async fn init_all(
    connection: &Connection,
    config: Arc<Config>,
    home: Option<PathBuf>,
) -> zbus::Result<()> {
    FileChooser::init(connection, config, home).await?;

    Ok(())
}

pub async fn shutdown_all(connection: &Connection) -> zbus::Result<()> {
    connection
        .object_server()
        .remove::<FileChooser, _>(PORTAL_PATH)
        .await?;

    Ok(())
}
