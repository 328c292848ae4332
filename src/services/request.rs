use std::future::Future;

use zbus::{dbus_interface, Connection};
use zvariant::OwnedObjectPath;

/// The `Request` object the frontend expects at a call's handle path while
/// the dialog is open.
pub struct Request {
    handle: OwnedObjectPath,
}

impl Request {
    /// Exports a `Request` at `handle`. Returns false when something is
    /// already served there, in which case it is left untouched.
    pub async fn export(connection: &Connection, handle: &OwnedObjectPath) -> zbus::Result<bool> {
        let added = connection
            .object_server()
            .at(
                handle.as_str(),
                Request {
                    handle: handle.clone(),
                },
            )
            .await?;

        if !added {
            log::warn!("duplicate portal request at {}", handle.as_str());
        }

        Ok(added)
    }

    pub async fn remove(connection: &Connection, handle: &OwnedObjectPath) {
        match connection
            .object_server()
            .remove::<Request, _>(handle.as_str())
            .await
        {
            Ok(true) => log::trace!("removed portal request {}", handle.as_str()),
            Ok(false) => log::warn!("portal request {} was already gone", handle.as_str()),
            Err(e) => log::error!("failed to remove portal request {}: {}", handle.as_str(), e),
        }
    }

    /// Runs `call` with a `Request` exported at `handle`, removing it again
    /// afterwards only if this call added it.
    pub async fn scoped<F: Future>(
        connection: &Connection,
        handle: &OwnedObjectPath,
        call: F,
    ) -> zbus::Result<F::Output> {
        let added = Self::export(connection, handle).await?;

        let output = call.await;

        if added {
            Self::remove(connection, handle).await;
        }

        Ok(output)
    }
}

#[dbus_interface(name = "org.freedesktop.impl.portal.Request")]
impl Request {
    fn close(&self) {
        log::info!(
            "close requested for {}, the running picker cannot be interrupted",
            self.handle.as_str()
        );
    }
}
