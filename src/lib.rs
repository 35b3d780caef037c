//! idle-portald - mediation core for the idle-monitor portal.
//!
//! Gates sandboxed clients' idle-time queries behind a per-application
//! permission policy, forwards allowed queries to the trusted backend, and
//! routes backend watch events back to exactly the client that registered
//! them.

pub mod backend;
pub mod config;
pub mod domain;
pub mod permissions;
pub mod portal;
pub mod request;
pub mod service;
pub mod watch;

pub use backend::{BackendError, IdleBackend, PortalIdleBackend};
pub use config::Config;
pub use domain::{AppId, VarMap, Variant};
pub use permissions::{Permission, PermissionStore};
pub use request::{Request, RequestRegistry, RequestState, RequestToken};
pub use service::{CallerInfo, IdleMonitorService};
pub use watch::WatchRouter;
