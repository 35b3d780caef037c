//! D-Bus gateway to the `org.freedesktop.impl.portal.IdleMonitor` backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::Connection;
use zbus::zvariant::{ObjectPath, OwnedValue};

use super::{BackendError, IdleBackend};
use crate::domain::{AppId, varmap_from_wire};
use crate::request::RequestToken;
use crate::watch::WatchRouter;

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.IdleMonitor",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait ImplIdleMonitor {
    fn get_idletime(&self, handle: &ObjectPath<'_>, app_id: &str) -> zbus::Result<u64>;

    #[zbus(signal)]
    fn watch_fired(
        &self,
        session_id: String,
        state: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;
}

/// Gateway holding the single long-lived proxy to the trusted backend.
///
/// Constructed once at startup and injected into the service; the connection
/// and its watch-fired subscription live for the process lifetime. zbus
/// method calls wait as long as the backend takes, so a slow backend is
/// bounded only by the caller's own cancellation path.
pub struct PortalIdleBackend {
    proxy: ImplIdleMonitorProxy<'static>,
}

impl PortalIdleBackend {
    /// Connect to the backend implementation owning `backend_name`.
    ///
    /// Failure here is fatal to the capability: without a backend the portal
    /// interface is never registered.
    pub async fn connect(connection: &Connection, backend_name: &str) -> Result<Self, BackendError> {
        let proxy = ImplIdleMonitorProxy::builder(connection)
            .destination(backend_name.to_owned())
            .map_err(|e| BackendError::Connect(e.to_string()))?
            .build()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        info!("Connected to idle-monitor backend {}", backend_name);
        Ok(Self { proxy })
    }

    /// Subscribe to the backend's watch-fired signal, forwarding each event
    /// to the router for the rest of the process lifetime.
    pub async fn start_watch_forwarding(
        &self,
        router: Arc<WatchRouter>,
    ) -> Result<JoinHandle<()>, BackendError> {
        let mut stream = self.proxy.receive_watch_fired().await?;

        Ok(tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let parsed = signal
                    .message()
                    .body()
                    .deserialize::<(String, HashMap<String, OwnedValue>)>();
                match parsed {
                    Ok((session_id, state)) => {
                        router.deliver(&session_id, &varmap_from_wire(state)).await;
                    }
                    Err(e) => warn!("Malformed watch-fired signal from backend: {}", e),
                }
            }
            debug!("Backend watch-fired stream ended");
        }))
    }
}

#[async_trait]
impl IdleBackend for PortalIdleBackend {
    async fn query_idle_time(
        &self,
        handle: &RequestToken,
        app_id: &AppId,
    ) -> Result<u64, BackendError> {
        let path = ObjectPath::try_from(handle.as_path())
            .map_err(|e| BackendError::Call(zbus::Error::Variant(e)))?;
        let idle_millis = self.proxy.get_idletime(&path, app_id.as_str()).await?;
        Ok(idle_millis)
    }
}
