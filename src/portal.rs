//! D-Bus surface of the idle-monitor portal.
//!
//! Exports the `org.freedesktop.portal.IdleMonitor` interface and one
//! `org.freedesktop.portal.Request` object per in-flight query. Response
//! signals are emitted with an explicit destination so no client ever sees
//! another client's traffic, and a request handle can only be closed by the
//! connection that opened it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zbus::message::Header;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{Connection, fdo};

use crate::domain::{VarMap, varmap_from_wire, varmap_to_wire};
use crate::request::{RequestToken, ResponseSink};
use crate::service::{CallerInfo, IdleMonitorService};

/// Object path the portal lives at.
pub const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";

/// Interface of the per-request objects.
const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";

/// Interface version reported to clients.
const PORTAL_VERSION: u32 = 3;

/// The front-door interface handed to sandboxed clients.
pub struct IdleMonitorPortal {
    service: Arc<IdleMonitorService>,
}

impl IdleMonitorPortal {
    pub fn new(service: Arc<IdleMonitorService>) -> Self {
        Self { service }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.IdleMonitor")]
impl IdleMonitorPortal {
    #[zbus(property, name = "version")]
    fn version(&self) -> u32 {
        PORTAL_VERSION
    }

    /// Start an idle-time query. Replies immediately with the request
    /// handle; the result arrives later as a Response signal on that handle.
    async fn get_idletime(
        &self,
        window: String,
        flags: u32,
        options: HashMap<String, OwnedValue>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<OwnedObjectPath> {
        let sender = header
            .sender()
            .ok_or_else(|| fdo::Error::Failed("Caller has no unique name".to_string()))?
            .to_string();
        let caller = CallerInfo::from_connection_name(&sender);

        let request = self.service.create_request(&caller, |token| {
            Box::new(DbusResponseSink {
                connection: connection.clone(),
                destination: sender.clone(),
                path: token.as_path().to_string(),
            })
        });

        let path = OwnedObjectPath::try_from(request.token().as_path().to_string())
            .map_err(|e| fdo::Error::Failed(format!("Invalid request path: {e}")))?;

        // Export before dispatch: a request must be visible to closure
        // before its response can race the method reply.
        let export = connection
            .object_server()
            .at(
                request.token().as_path(),
                RequestObject::new(
                    Arc::clone(&self.service),
                    request.token().clone(),
                    sender.clone(),
                ),
            )
            .await;
        if let Err(e) = export {
            // A request that never made it onto the bus must not linger in
            // the registry.
            self.service.registry().cancel(request.token());
            return Err(fdo::Error::Failed(format!("Failed to export request: {e}")));
        }
        self.service.registry().export(request.token());

        self.service.dispatch(
            &request,
            caller.app_id.clone(),
            window,
            flags,
            varmap_from_wire(options),
        );

        Ok(path)
    }

    async fn add_watch(&self, _options: HashMap<String, OwnedValue>) -> fdo::Result<u32> {
        Err(fdo::Error::NotSupported(
            "AddWatch is not implemented".to_string(),
        ))
    }

    async fn add_user_active_watch(
        &self,
        _options: HashMap<String, OwnedValue>,
    ) -> fdo::Result<u32> {
        Err(fdo::Error::NotSupported(
            "AddUserActiveWatch is not implemented".to_string(),
        ))
    }

    async fn remove_watch(&self, _watch_id: u32) -> fdo::Result<()> {
        Err(fdo::Error::NotSupported(
            "RemoveWatch is not implemented".to_string(),
        ))
    }
}

/// One exported request handle.
pub struct RequestObject {
    service: Arc<IdleMonitorService>,
    token: RequestToken,
    /// Unique bus name of the connection that opened the request.
    owner: String,
}

impl RequestObject {
    pub fn new(service: Arc<IdleMonitorService>, token: RequestToken, owner: String) -> Self {
        Self {
            service,
            token,
            owner,
        }
    }

    /// Cancel the request if and only if the caller owns it.
    ///
    /// Request paths are predictable, so without this gate any peer could
    /// close another client's query and silence its response forever.
    fn authorize_and_cancel(&self, sender: Option<&str>) -> fdo::Result<bool> {
        let Some(sender) = sender else {
            return Err(fdo::Error::AccessDenied(
                "Caller has no unique name".to_string(),
            ));
        };
        if sender != self.owner {
            return Err(fdo::Error::AccessDenied(
                "Request is owned by another connection".to_string(),
            ));
        }
        Ok(self.service.registry().cancel(&self.token))
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Request")]
impl RequestObject {
    /// Close the request. A closed request never delivers a response.
    async fn close(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.authorize_and_cancel(header.sender().map(|s| s.as_str()))?;
        if let Err(e) = connection
            .object_server()
            .remove::<Self, _>(self.token.as_path())
            .await
        {
            debug!("Request object {} already gone: {}", self.token, e);
        }
        Ok(())
    }
}

/// Response delivery targeted at the one client that made the request.
struct DbusResponseSink {
    connection: Connection,
    destination: String,
    path: String,
}

#[async_trait]
impl ResponseSink for DbusResponseSink {
    async fn deliver(&self, code: u32, results: VarMap) {
        let body = (code, varmap_to_wire(&results));
        if let Err(e) = self
            .connection
            .emit_signal(
                Some(self.destination.as_str()),
                self.path.as_str(),
                REQUEST_INTERFACE,
                "Response",
                &body,
            )
            .await
        {
            warn!("Failed to deliver response for {}: {}", self.path, e);
        }

        // The response retires the request handle.
        if let Err(e) = self
            .connection
            .object_server()
            .remove::<RequestObject, _>(self.path.as_str())
            .await
        {
            debug!("Request object {} already gone: {}", self.path, e);
        }
    }
}

/// Export the portal and take the well-known bus name.
pub async fn serve(
    connection: &Connection,
    service: Arc<IdleMonitorService>,
    bus_name: &str,
    replace_existing: bool,
) -> zbus::Result<()> {
    connection
        .object_server()
        .at(PORTAL_PATH, IdleMonitorPortal::new(service))
        .await?;

    if replace_existing {
        connection
            .request_name_with_flags(bus_name, fdo::RequestNameFlags::ReplaceExisting.into())
            .await?;
    } else {
        connection.request_name(bus_name).await?;
    }
    Ok(())
}

/// Watch for client connections leaving the bus and drop whatever they own.
pub async fn spawn_peer_tracker(
    connection: &Connection,
    service: Arc<IdleMonitorService>,
) -> zbus::Result<JoinHandle<()>> {
    let proxy = fdo::DBusProxy::new(connection).await?;
    let mut stream = proxy.receive_name_owner_changed().await?;
    let connection = connection.clone();

    Ok(tokio::spawn(async move {
        while let Some(signal) = stream.next().await {
            // Raw args: (name, old_owner, new_owner); empty string = none.
            let Ok((name, _old_owner, new_owner)) =
                signal.message().body().deserialize::<(String, String, String)>()
            else {
                continue;
            };
            if new_owner.is_empty() && name.starts_with(':') {
                // Cancelled requests still hold an exported handle; retire
                // those too, or they accumulate for the daemon's lifetime.
                for token in service.handle_client_vanished(&name) {
                    if let Err(e) = connection
                        .object_server()
                        .remove::<RequestObject, _>(token.as_path())
                        .await
                    {
                        debug!("Request object {} already gone: {}", token, e);
                    }
                }
            }
        }
        debug!("NameOwnerChanged stream ended");
    }))
}
