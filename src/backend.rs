//! Trusted idle-backend gateway.
//!
//! The backend is the privileged service that actually measures idle time
//! and emits activity-state signals. This module defines the seam the rest
//! of the daemon talks through; the concrete D-Bus gateway lives in
//! [`portal_impl`].

mod portal_impl;

use async_trait::async_trait;
pub use portal_impl::PortalIdleBackend;
use thiserror::Error;

use crate::domain::AppId;
use crate::request::RequestToken;

/// Errors from the backend service.
///
/// Whatever the underlying failure, the client only ever sees the generic
/// failure response code; the detail stays in the logs.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend call failed: {0}")]
    Call(#[from] zbus::Error),

    #[error("backend connection could not be established: {0}")]
    Connect(String),
}

/// Asynchronous query interface to the trusted idle backend.
///
/// One gateway instance serves the whole process; it owns no per-client
/// state. Calls carry the request token so the backend can attribute work,
/// and are not subject to a gateway-imposed timeout: cancellation belongs
/// to the request that issued the query.
#[async_trait]
pub trait IdleBackend: Send + Sync {
    /// Ask the backend how long the user has been idle, in milliseconds.
    async fn query_idle_time(
        &self,
        handle: &RequestToken,
        app_id: &AppId,
    ) -> Result<u64, BackendError>;
}
