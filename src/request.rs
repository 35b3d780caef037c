//! In-flight request tracking.
//!
//! Every client query becomes a [`Request`]: a cancellable unit of work that
//! produces at most one terminal response. All state mutation happens under
//! that request's own mutex; there is no lock shared across unrelated
//! requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{VarMap, escape_connection_name};

/// Object-path prefix under which request handles are exported.
const REQUEST_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/request";

/// Opaque request handle, rendered as a D-Bus object path.
///
/// Returned to the client immediately and valid for lookup and cancellation
/// for the life of the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestToken(String);

impl RequestToken {
    /// The token as an object path string.
    pub fn as_path(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Created and registered, not yet visible to external closure.
    Active,
    /// Visible on the bus; may emit a response and be closed by the client.
    Exported,
    /// Terminal: the single response has been claimed.
    Responded,
    /// Terminal: cancelled before any response.
    Cancelled,
}

/// Delivery channel for a request's single response.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Deliver the terminal response to the owning client.
    async fn deliver(&self, code: u32, results: VarMap);
}

/// Outcome of claiming the response slot for a request.
enum ResponseClaim {
    /// This caller won; deliver through the sink.
    Deliver(Box<dyn ResponseSink>),
    /// This caller won, but the request never reached `Exported` (or has no
    /// sink installed); nothing is delivered.
    Suppressed,
    /// The request already reached a terminal state.
    AlreadyTerminal,
}

struct RequestInner {
    state: RequestState,
    sink: Option<Box<dyn ResponseSink>>,
}

/// One tracked client query.
pub struct Request {
    token: RequestToken,
    owner: String,
    cancel: CancellationToken,
    inner: Mutex<RequestInner>,
}

impl Request {
    /// The request's handle.
    pub fn token(&self) -> &RequestToken {
        &self.token
    }

    /// Unique bus name of the owning client connection.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Token that fires when the request is cancelled.
    ///
    /// The dispatch worker selects on this so a cancelled request's backend
    /// call is abandoned instead of racing the cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current state, for diagnostics and tests.
    pub fn state(&self) -> RequestState {
        self.lock().state
    }

    /// Install the response delivery channel.
    ///
    /// Must happen before the request is exported; a sink installed after a
    /// terminal transition is dropped.
    pub fn install_sink(&self, sink: Box<dyn ResponseSink>) {
        let mut inner = self.lock();
        if matches!(inner.state, RequestState::Active | RequestState::Exported) {
            inner.sink = Some(sink);
        }
    }

    /// Mark the request visible to external closure. Idempotent.
    pub fn export(&self) {
        let mut inner = self.lock();
        if inner.state == RequestState::Active {
            inner.state = RequestState::Exported;
        }
    }

    /// Claim the response slot, transitioning to `Responded`.
    fn claim_response(&self) -> ResponseClaim {
        let mut inner = self.lock();
        match inner.state {
            RequestState::Responded | RequestState::Cancelled => ResponseClaim::AlreadyTerminal,
            RequestState::Active => {
                inner.state = RequestState::Responded;
                inner.sink = None;
                ResponseClaim::Suppressed
            }
            RequestState::Exported => {
                inner.state = RequestState::Responded;
                match inner.sink.take() {
                    Some(sink) => ResponseClaim::Deliver(sink),
                    None => ResponseClaim::Suppressed,
                }
            }
        }
    }

    /// Transition to `Cancelled` if no response has been claimed.
    ///
    /// Returns true if this call performed the cancellation.
    fn mark_cancelled(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            RequestState::Responded | RequestState::Cancelled => false,
            RequestState::Active | RequestState::Exported => {
                inner.state = RequestState::Cancelled;
                inner.sink = None;
                drop(inner);
                self.cancel.cancel();
                true
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RequestInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of all in-flight requests, keyed by token.
pub struct RequestRegistry {
    requests: Mutex<HashMap<RequestToken, Arc<Request>>>,
    serial: AtomicU64,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh request owned by the given client connection.
    pub fn create(&self, owner: &str) -> Arc<Request> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        let token = RequestToken(format!(
            "{REQUEST_PATH_PREFIX}/{}/t{serial}",
            escape_connection_name(owner)
        ));
        let request = Arc::new(Request {
            token: token.clone(),
            owner: owner.to_string(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(RequestInner {
                state: RequestState::Active,
                sink: None,
            }),
        });
        self.map().insert(token, Arc::clone(&request));
        request
    }

    /// Look up a live request by token.
    pub fn lookup(&self, token: &RequestToken) -> Option<Arc<Request>> {
        self.map().get(token).cloned()
    }

    /// Mark a request visible to external closure. Idempotent; a no-op for
    /// unknown tokens.
    pub fn export(&self, token: &RequestToken) {
        if let Some(request) = self.lookup(token) {
            request.export();
        }
    }

    /// Deliver the terminal response for a request.
    ///
    /// No-op if the token is unknown (a late backend result for a request
    /// that is already gone) or the request already reached a terminal
    /// state. Returns true if a response was actually delivered.
    pub async fn finalize(&self, token: &RequestToken, code: u32, results: VarMap) -> bool {
        let Some(request) = self.lookup(token) else {
            debug!("Dropping result for unknown request {}", token);
            return false;
        };

        match request.claim_response() {
            ResponseClaim::AlreadyTerminal => false,
            ResponseClaim::Suppressed => {
                self.remove(token);
                false
            }
            ResponseClaim::Deliver(sink) => {
                self.remove(token);
                sink.deliver(code, results).await;
                true
            }
        }
    }

    /// Cancel a request, preventing any later response delivery.
    ///
    /// Returns true if this call performed the cancellation.
    pub fn cancel(&self, token: &RequestToken) -> bool {
        let Some(request) = self.lookup(token) else {
            return false;
        };
        if request.mark_cancelled() {
            self.remove(token);
            debug!("Cancelled request {}", token);
            true
        } else {
            false
        }
    }

    /// Cancel every request owned by a client connection that went away.
    ///
    /// Returns the tokens actually cancelled so callers can retire whatever
    /// else hangs off them (the portal layer removes their exported bus
    /// objects).
    pub fn cancel_owner(&self, owner: &str) -> Vec<RequestToken> {
        let tokens: Vec<RequestToken> = self
            .map()
            .values()
            .filter(|r| r.owner() == owner)
            .map(|r| r.token().clone())
            .collect();
        tokens.into_iter().filter(|t| self.cancel(t)).collect()
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.map().len()
    }

    fn remove(&self, token: &RequestToken) {
        self.map().remove(token);
    }

    fn map(&self) -> MutexGuard<'_, HashMap<RequestToken, Arc<Request>>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RESPONSE_SUCCESS;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<(u32, VarMap)>);

    #[async_trait]
    impl ResponseSink for ChannelSink {
        async fn deliver(&self, code: u32, results: VarMap) {
            let _ = self.0.send((code, results));
        }
    }

    fn sink() -> (Box<dyn ResponseSink>, mpsc::UnboundedReceiver<(u32, VarMap)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(ChannelSink(tx)), rx)
    }

    #[tokio::test]
    async fn test_tokens_are_unique_and_path_shaped() {
        let registry = RequestRegistry::new();
        let a = registry.create(":1.7");
        let b = registry.create(":1.7");
        assert_ne!(a.token(), b.token());
        assert!(a.token().as_path().starts_with("/org/freedesktop/portal/desktop/request/1_7/"));
    }

    #[tokio::test]
    async fn test_finalize_delivers_exactly_once() {
        let registry = RequestRegistry::new();
        let request = registry.create(":1.1");
        let (tx, mut rx) = sink();
        request.install_sink(tx);
        request.export();

        let token = request.token().clone();
        assert!(registry.finalize(&token, RESPONSE_SUCCESS, VarMap::new()).await);
        assert!(!registry.finalize(&token, RESPONSE_SUCCESS, VarMap::new()).await);

        assert_eq!(rx.recv().await.unwrap().0, RESPONSE_SUCCESS);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unexported_request_suppresses_response() {
        let registry = RequestRegistry::new();
        let request = registry.create(":1.1");
        let (tx, mut rx) = sink();
        request.install_sink(tx);
        // Never exported.

        let token = request.token().clone();
        assert!(!registry.finalize(&token, RESPONSE_SUCCESS, VarMap::new()).await);
        assert!(rx.try_recv().is_err());
        assert_eq!(request.state(), RequestState::Responded);
    }

    #[tokio::test]
    async fn test_export_is_idempotent() {
        let registry = RequestRegistry::new();
        let request = registry.create(":1.1");
        registry.export(request.token());
        registry.export(request.token());
        assert_eq!(request.state(), RequestState::Exported);
    }

    #[tokio::test]
    async fn test_cancel_prevents_later_result() {
        let registry = RequestRegistry::new();
        let request = registry.create(":1.1");
        let (tx, mut rx) = sink();
        request.install_sink(tx);
        request.export();
        let token = request.token().clone();

        assert!(registry.cancel(&token));
        assert!(request.cancel_token().is_cancelled());

        // A late backend result is a safe no-op.
        assert!(!registry.finalize(&token, RESPONSE_SUCCESS, VarMap::new()).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_export_discards_request() {
        let registry = RequestRegistry::new();
        let request = registry.create(":1.1");
        let (tx, mut rx) = sink();
        request.install_sink(tx);
        // Export never happened, e.g. because the bus export failed.

        assert!(registry.cancel(request.token()));
        assert_eq!(registry.in_flight(), 0);
        assert!(!registry.finalize(request.token(), RESPONSE_SUCCESS, VarMap::new()).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_after_response_is_noop() {
        let registry = RequestRegistry::new();
        let request = registry.create(":1.1");
        let (tx, _rx) = sink();
        request.install_sink(tx);
        request.export();
        let token = request.token().clone();

        assert!(registry.finalize(&token, RESPONSE_SUCCESS, VarMap::new()).await);
        assert!(!registry.cancel(&token));
    }

    #[tokio::test]
    async fn test_racing_finalize_and_cancel_produce_one_winner() {
        for _ in 0..50 {
            let registry = Arc::new(RequestRegistry::new());
            let request = registry.create(":1.1");
            let (tx, mut rx) = sink();
            request.install_sink(tx);
            request.export();
            let token = request.token().clone();

            let mut tasks = Vec::new();
            for i in 0..8 {
                let registry = Arc::clone(&registry);
                let token = token.clone();
                tasks.push(tokio::spawn(async move {
                    if i % 2 == 0 {
                        registry.finalize(&token, RESPONSE_SUCCESS, VarMap::new()).await
                    } else {
                        registry.cancel(&token)
                    }
                }));
            }

            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "exactly one of finalize/cancel may win");

            let mut delivered = 0;
            while rx.try_recv().is_ok() {
                delivered += 1;
            }
            assert!(delivered <= 1, "at most one response may be delivered");
            assert_eq!(registry.in_flight(), 0);
        }
    }

    #[tokio::test]
    async fn test_cancel_owner_scopes_to_one_connection() {
        let registry = RequestRegistry::new();
        let a = registry.create(":1.1");
        let b = registry.create(":1.2");
        a.export();
        b.export();

        assert_eq!(registry.cancel_owner(":1.1"), vec![a.token().clone()]);
        assert_eq!(a.state(), RequestState::Cancelled);
        assert_eq!(b.state(), RequestState::Exported);
        assert_eq!(registry.in_flight(), 1);
    }
}
