//! Permission store backed by the portal permission-store D-Bus service.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::trace;
use zbus::Connection;
use zbus::zvariant::OwnedValue;

use super::{Permission, PermissionError, PermissionStore};
use crate::domain::AppId;

/// Error name the store raises for an unknown table or id.
const NOT_FOUND_ERROR: &str = "org.freedesktop.portal.Error.NotFound";

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.PermissionStore",
    default_service = "org.freedesktop.impl.portal.PermissionStore",
    default_path = "/org/freedesktop/impl/portal/PermissionStore"
)]
trait PermissionStoreImpl {
    fn lookup(
        &self,
        table: &str,
        id: &str,
    ) -> zbus::Result<(HashMap<String, Vec<String>>, OwnedValue)>;

    fn set_permission(
        &self,
        table: &str,
        create: bool,
        id: &str,
        app: &str,
        permissions: &[&str],
    ) -> zbus::Result<()>;
}

/// Permission store speaking the `org.freedesktop.impl.portal.PermissionStore`
/// wire protocol.
///
/// Stored string lists map onto the tri-state contract: `["yes"]` is `Yes`,
/// `["no"]` is `No`, anything else (including a missing entry, table, or id)
/// is `Unset`.
pub struct DbusPermissionStore {
    proxy: PermissionStoreImplProxy<'static>,
}

impl DbusPermissionStore {
    /// Connect to the permission store service on the given bus.
    pub async fn connect(connection: &Connection) -> Result<Self, PermissionError> {
        let proxy = PermissionStoreImplProxy::new(connection).await?;
        Ok(Self { proxy })
    }
}

#[async_trait]
impl PermissionStore for DbusPermissionStore {
    async fn get(
        &self,
        app_id: &AppId,
        table: &str,
        id: &str,
    ) -> Result<Permission, PermissionError> {
        let (permissions, _data) = match self.proxy.lookup(table, id).await {
            Ok(reply) => reply,
            Err(zbus::Error::MethodError(name, _, _)) if name.as_str() == NOT_FOUND_ERROR => {
                trace!("Permission table {}/{} not found", table, id);
                return Ok(Permission::Unset);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(permissions
            .get(app_id.as_str())
            .map_or(Permission::Unset, |values| parse_permission(values)))
    }

    async fn set(
        &self,
        app_id: &AppId,
        table: &str,
        id: &str,
        permission: Permission,
    ) -> Result<(), PermissionError> {
        let values = serialize_permission(permission);
        self.proxy
            .set_permission(table, true, id, app_id.as_str(), &values)
            .await?;
        Ok(())
    }
}

fn parse_permission(values: &[String]) -> Permission {
    if values.iter().any(|v| v == "no") {
        Permission::No
    } else if values.iter().any(|v| v == "yes") {
        Permission::Yes
    } else {
        Permission::Unset
    }
}

fn serialize_permission(permission: Permission) -> Vec<&'static str> {
    match permission {
        Permission::Yes => vec!["yes"],
        Permission::No => vec!["no"],
        Permission::Unset => vec![],
    }
}
