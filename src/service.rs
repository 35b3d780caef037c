//! Idle-monitor mediation service.
//!
//! Sits between untrusted callers and the trusted backend: every query is
//! permission-gated before it may reach the backend, runs on its own worker
//! task so a slow backend never blocks the dispatch loop or other clients,
//! and terminates in exactly one response through the request registry.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::backend::IdleBackend;
use crate::domain::{AppId, RESPONSE_OTHER, RESPONSE_SUCCESS, RESULT_IDLE_TIME, VarMap, Variant};
use crate::permissions::{self, PermissionStore};
use crate::request::{Request, RequestRegistry, RequestToken, ResponseSink};
use crate::watch::WatchRouter;

/// Identity of a calling client.
#[derive(Debug, Clone)]
pub struct CallerInfo {
    /// Unique bus name of the calling connection.
    pub connection: String,
    /// Application id the permission decision is keyed by.
    pub app_id: AppId,
}

impl CallerInfo {
    /// Build caller info from a unique bus connection name.
    pub fn from_connection_name(name: &str) -> Self {
        Self {
            connection: name.to_string(),
            app_id: AppId::from_connection_name(name),
        }
    }
}

/// The public-facing idle-monitor capability.
pub struct IdleMonitorService {
    registry: Arc<RequestRegistry>,
    backend: Arc<dyn IdleBackend>,
    permissions: Arc<dyn PermissionStore>,
    router: Arc<WatchRouter>,
    silent_denial: bool,
}

impl IdleMonitorService {
    pub fn new(
        registry: Arc<RequestRegistry>,
        backend: Arc<dyn IdleBackend>,
        permissions: Arc<dyn PermissionStore>,
        router: Arc<WatchRouter>,
        silent_denial: bool,
    ) -> Self {
        Self {
            registry,
            backend,
            permissions,
            router,
            silent_denial,
        }
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<WatchRouter> {
        &self.router
    }

    /// Create and register a request for the given caller, with its
    /// response channel installed.
    pub fn create_request(
        &self,
        caller: &CallerInfo,
        make_sink: impl FnOnce(&RequestToken) -> Box<dyn ResponseSink>,
    ) -> Arc<Request> {
        let request = self.registry.create(&caller.connection);
        request.install_sink(make_sink(request.token()));
        request
    }

    /// Run the permission check and backend query for a request on a worker
    /// task. Returns immediately.
    ///
    /// `window`, `flags` and `options` are opaque caller-supplied values; the
    /// consumed backend interface carries none of them, matching the wire
    /// contract, so they only surface in trace logs here.
    pub fn dispatch(
        self: &Arc<Self>,
        request: &Arc<Request>,
        app_id: AppId,
        window: String,
        flags: u32,
        options: VarMap,
    ) {
        let service = Arc::clone(self);
        let request = Arc::clone(request);
        tokio::spawn(async move {
            service.run_query(request, app_id, window, flags, options).await;
        });
    }

    /// Full query path: create, export, dispatch.
    ///
    /// The returned request's token is valid for cancellation and lookup for
    /// the life of the request; the response arrives later through the sink.
    pub fn get_idle_time(
        self: &Arc<Self>,
        caller: &CallerInfo,
        window: String,
        flags: u32,
        options: VarMap,
        make_sink: impl FnOnce(&RequestToken) -> Box<dyn ResponseSink>,
    ) -> Arc<Request> {
        let request = self.create_request(caller, make_sink);
        self.registry.export(request.token());
        self.dispatch(&request, caller.app_id.clone(), window, flags, options);
        request
    }

    /// Drop everything owned by a client connection that disappeared.
    ///
    /// Returns the tokens of the cancelled requests; their exported bus
    /// objects still need to be retired by the transport layer.
    pub fn handle_client_vanished(&self, connection_name: &str) -> Vec<RequestToken> {
        let cancelled = self.registry.cancel_owner(connection_name);
        let removed = self.router.remove_session(connection_name);
        if !cancelled.is_empty() || removed > 0 {
            debug!(
                "Client {} vanished: cancelled {} requests, removed {} watches",
                connection_name,
                cancelled.len(),
                removed
            );
        }
        cancelled
    }

    async fn run_query(
        self: Arc<Self>,
        request: Arc<Request>,
        app_id: AppId,
        window: String,
        flags: u32,
        options: VarMap,
    ) {
        let token = request.token().clone();
        trace!(
            "Query {} from {}: window={:?} flags={} options={}",
            token,
            app_id,
            window,
            flags,
            options.len()
        );

        if !permissions::is_idle_monitor_allowed(self.permissions.as_ref(), &app_id).await {
            if self.silent_denial {
                // Compatibility mode: the caller is never answered, exactly
                // like the pre-redesign protocol. The request stays pending
                // until the client closes it or its connection goes away.
                debug!("Denied idle-monitor access for {}; leaving {} unanswered", app_id, token);
            } else {
                debug!("Denied idle-monitor access for {}", app_id);
                self.registry.finalize(&token, RESPONSE_OTHER, VarMap::new()).await;
            }
            return;
        }

        debug!("Calling idle-monitor backend for {}", app_id);
        let cancel = request.cancel_token();
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Request {} cancelled before the backend replied", token);
            }
            result = self.backend.query_idle_time(&token, &app_id) => match result {
                Ok(idle_millis) => {
                    let mut results = VarMap::new();
                    results.insert(RESULT_IDLE_TIME.to_string(), Variant::U64(idle_millis));
                    self.registry.finalize(&token, RESPONSE_SUCCESS, results).await;
                }
                Err(e) => {
                    warn!("Idle-monitor backend query failed for {}: {}", app_id, e);
                    self.registry.finalize(&token, RESPONSE_OTHER, VarMap::new()).await;
                }
            },
        }
    }
}
