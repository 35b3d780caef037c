//! Per-application permission policy.
//!
//! The policy store is an external collaborator; this module defines the
//! contract it must satisfy and the idle-monitor gate built on top of it.

mod dbus;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
pub use dbus::DbusPermissionStore;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::AppId;

/// Permission table the idle-monitor capability is keyed under.
pub const PERMISSION_TABLE: &str = "idle-monitor";

/// Permission id within the table.
pub const PERMISSION_ID: &str = "idle-monitor";

/// Stored authorization decision for one (app, table, id) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Yes,
    No,
    Unset,
}

/// Errors from the permission store collaborator.
#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("permission store call failed: {0}")]
    Store(#[from] zbus::Error),
}

/// Contract for the durable permission store.
///
/// Each call may block on IPC to the store service; callers run these off
/// the main dispatch path.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Look up the stored permission for an application.
    async fn get(
        &self,
        app_id: &AppId,
        table: &str,
        id: &str,
    ) -> Result<Permission, PermissionError>;

    /// Persist a permission for an application.
    async fn set(
        &self,
        app_id: &AppId,
        table: &str,
        id: &str,
        permission: Permission,
    ) -> Result<(), PermissionError>;
}

/// Check whether an application may use the idle monitor.
///
/// `No` denies. `Yes` allows. `Unset` is a first-use grant: the call is
/// allowed and `Yes` is persisted so subsequent checks are deterministic.
/// A store read failure is treated as `Unset` so a flaky store service
/// cannot lock every client out.
pub async fn is_idle_monitor_allowed(store: &dyn PermissionStore, app_id: &AppId) -> bool {
    let permission = match store.get(app_id, PERMISSION_TABLE, PERMISSION_ID).await {
        Ok(p) => p,
        Err(e) => {
            warn!("Permission lookup failed for {}: {}", app_id, e);
            Permission::Unset
        }
    };

    match permission {
        Permission::No => false,
        Permission::Yes => true,
        Permission::Unset => {
            debug!("No idle-monitor permission stored for {}: allowing", app_id);
            if let Err(e) = store
                .set(app_id, PERMISSION_TABLE, PERMISSION_ID, Permission::Yes)
                .await
            {
                warn!("Failed to persist idle-monitor grant for {}: {}", app_id, e);
            }
            true
        }
    }
}

/// In-memory permission store.
///
/// Honors the same contract as the D-Bus store without any IPC; used by
/// tests and available as a non-persistent fallback.
#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    entries: Mutex<HashMap<(String, String, String), Permission>>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn get(
        &self,
        app_id: &AppId,
        table: &str,
        id: &str,
    ) -> Result<Permission, PermissionError> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (app_id.as_str().to_string(), table.to_string(), id.to_string());
        Ok(entries.get(&key).copied().unwrap_or(Permission::Unset))
    }

    async fn set(
        &self,
        app_id: &AppId,
        table: &str,
        id: &str,
        permission: Permission,
    ) -> Result<(), PermissionError> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (app_id.as_str().to_string(), table.to_string(), id.to_string());
        entries.insert(key, permission);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str) -> AppId {
        AppId::new(id)
    }

    #[tokio::test]
    async fn test_memory_store_defaults_to_unset() {
        let store = MemoryPermissionStore::new();
        let permission = store
            .get(&app("com.example.A"), PERMISSION_TABLE, PERMISSION_ID)
            .await
            .unwrap();
        assert_eq!(permission, Permission::Unset);
    }

    #[tokio::test]
    async fn test_unset_allows_and_persists_yes() {
        let store = MemoryPermissionStore::new();
        let a = app("com.example.A");

        assert!(is_idle_monitor_allowed(&store, &a).await);

        let stored = store.get(&a, PERMISSION_TABLE, PERMISSION_ID).await.unwrap();
        assert_eq!(stored, Permission::Yes);
    }

    #[tokio::test]
    async fn test_second_call_behaves_like_explicit_yes() {
        let store = MemoryPermissionStore::new();
        let a = app("com.example.A");

        assert!(is_idle_monitor_allowed(&store, &a).await);
        // Second call goes through the Yes branch, not the first-use grant.
        assert!(is_idle_monitor_allowed(&store, &a).await);
        let stored = store.get(&a, PERMISSION_TABLE, PERMISSION_ID).await.unwrap();
        assert_eq!(stored, Permission::Yes);
    }

    #[tokio::test]
    async fn test_no_denies() {
        let store = MemoryPermissionStore::new();
        let a = app("com.example.A");
        store
            .set(&a, PERMISSION_TABLE, PERMISSION_ID, Permission::No)
            .await
            .unwrap();

        assert!(!is_idle_monitor_allowed(&store, &a).await);
        // Denial must not rewrite the stored decision.
        let stored = store.get(&a, PERMISSION_TABLE, PERMISSION_ID).await.unwrap();
        assert_eq!(stored, Permission::No);
    }

    #[tokio::test]
    async fn test_apps_are_keyed_independently() {
        let store = MemoryPermissionStore::new();
        let a = app("com.example.A");
        let b = app("com.example.B");
        store
            .set(&b, PERMISSION_TABLE, PERMISSION_ID, Permission::No)
            .await
            .unwrap();

        assert!(is_idle_monitor_allowed(&store, &a).await);
        assert!(!is_idle_monitor_allowed(&store, &b).await);
    }
}
