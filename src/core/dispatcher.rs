//! Request dispatcher: the central registry of handlers keyed by method
//! name, and the owner of every in-flight RPC record.
//!
//! The registry follows the same `RwLock<HashMap<String, _>>` shape the
//! teacher uses for `UnifiedMcpServer::tools`, generalized with a sealing
//! flag (registration is only legal before startup completes) and an
//! in-flight table carrying a cancellation handle per correlation id.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub Uuid);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellation handle an outward call can select on. Cloning yields an
/// independent receiver of the same underlying signal.
#[derive(Clone)]
pub struct CancellationHandle {
    rx: watch::Receiver<bool>,
}

impl CancellationHandle {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the handle is cancelled. Intended for use in a
    /// `tokio::select!` alongside the handler's own outward call.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|v| *v).await;
    }
}

#[derive(Debug, Clone)]
pub enum DispatchError {
    UnknownMethod(String),
    InvalidParams(String),
    DeadlineExceeded,
    Cancelled,
    ShuttingDown,
    Handler(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::UnknownMethod(m) => write!(f, "unknown_method: {}", m),
            DispatchError::InvalidParams(m) => write!(f, "invalid_params: {}", m),
            DispatchError::DeadlineExceeded => write!(f, "deadline_exceeded"),
            DispatchError::Cancelled => write!(f, "cancelled"),
            DispatchError::ShuttingDown => write!(f, "shutting_down"),
            DispatchError::Handler(m) => write!(f, "{}", m),
        }
    }
}

impl Error for DispatchError {}

/// Handlers receive the raw params plus a cancellation handle, and return
/// a structured JSON result or a typed error string (surfaced unchanged to
/// the gateway as `{ kind: "handler_error", message }`).
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(
        &self,
        params: serde_json::Value,
        cancellation: CancellationHandle,
    ) -> Result<serde_json::Value, String>;
}

struct Registration {
    handler: Arc<dyn MethodHandler>,
    default_deadline: Duration,
}

struct InFlight {
    cancel_tx: watch::Sender<bool>,
}

/// Central method registry and in-flight RPC record owner.
pub struct Dispatcher {
    methods: RwLock<HashMap<String, Registration>>,
    in_flight: RwLock<HashMap<CorrelationId, InFlight>>,
    sealed: AtomicBool,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            methods: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register a handler for `method`. Rejects duplicates and rejects
    /// registration after [`Dispatcher::seal`] has been called.
    pub async fn register(
        &self,
        method: &str,
        handler: Arc<dyn MethodHandler>,
        default_deadline: Duration,
    ) -> Result<(), DispatchError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        let mut methods = self.methods.write().await;
        if methods.contains_key(method) {
            return Err(DispatchError::InvalidParams(format!("method already registered: {}", method)));
        }
        methods.insert(method.to_string(), Registration { handler, default_deadline });
        Ok(())
    }

    /// Freeze the registry; no further `register` calls succeed.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Dispatch one request. Assigns a correlation id if `correlation_id`
    /// is `None`. At most one live RPC record exists per correlation id at
    /// any instant — the in-flight table is the sole owner of that
    /// invariant, enforced here by the `insert` into a fresh id that can
    /// never collide with a concurrently-live one.
    pub async fn dispatch(
        &self,
        correlation_id: Option<CorrelationId>,
        method: &str,
        params: serde_json::Value,
        deadline_override: Option<Duration>,
    ) -> (CorrelationId, Result<serde_json::Value, DispatchError>) {
        let id = correlation_id.unwrap_or_default();

        if self.shutting_down.load(Ordering::SeqCst) {
            return (id, Err(DispatchError::ShuttingDown));
        }

        let registration = {
            let methods = self.methods.read().await;
            match methods.get(method) {
                Some(reg) => (reg.handler.clone(), reg.default_deadline),
                None => return (id, Err(DispatchError::UnknownMethod(method.to_string()))),
            }
        };
        let (handler, default_deadline) = registration;
        let deadline = deadline_override.unwrap_or(default_deadline);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.in_flight.write().await.insert(id, InFlight { cancel_tx });

        let cancellation = CancellationHandle { rx: cancel_rx };
        let outcome = tokio::time::timeout(deadline, handler.handle(params, cancellation)).await;

        self.in_flight.write().await.remove(&id);

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(DispatchError::Handler(msg)),
            Err(_) => Err(DispatchError::DeadlineExceeded),
        };
        (id, result)
    }

    /// Signal cancellation to a live RPC record's handle. No-op if the
    /// correlation id is not currently in flight.
    pub async fn cancel(&self, id: CorrelationId) {
        if let Some(in_flight) = self.in_flight.read().await.get(&id) {
            let _ = in_flight.cancel_tx.send(true);
        }
    }

    /// Refuse new requests, cancel every in-flight record, and mark the
    /// dispatcher as shut down. Idempotent.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let in_flight = self.in_flight.read().await;
        for entry in in_flight.values() {
            let _ = entry.cancel_tx.send(true);
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct EchoHandler;
    #[async_trait]
    impl MethodHandler for EchoHandler {
        async fn handle(&self, params: serde_json::Value, _c: CancellationHandle) -> Result<serde_json::Value, String> {
            Ok(params)
        }
    }

    struct SlowHandler;
    #[async_trait]
    impl MethodHandler for SlowHandler {
        async fn handle(&self, _params: serde_json::Value, _c: CancellationHandle) -> Result<serde_json::Value, String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(serde_json::Value::Null)
        }
    }

    struct CancelAwareHandler {
        observed_cancel: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl MethodHandler for CancelAwareHandler {
        async fn handle(&self, _params: serde_json::Value, mut c: CancellationHandle) -> Result<serde_json::Value, String> {
            c.cancelled().await;
            self.observed_cancel.fetch_add(1, Ordering::SeqCst);
            Err("cancelled mid-flight".to_string())
        }
    }

    #[tokio::test]
    async fn dispatch_unknown_method_errors() {
        let dispatcher = Dispatcher::new();
        let (_, result) = dispatcher.dispatch(None, "nope", serde_json::json!({}), None).await;
        assert!(matches!(result, Err(DispatchError::UnknownMethod(_))));
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("echo", Arc::new(EchoHandler), Duration::from_secs(5)).await.unwrap();
        dispatcher.seal();
        let (_, result) = dispatcher.dispatch(None, "echo", serde_json::json!({"x": 1}), None).await;
        assert_eq!(result.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("echo", Arc::new(EchoHandler), Duration::from_secs(5)).await.unwrap();
        let second = dispatcher.register("echo", Arc::new(EchoHandler), Duration::from_secs(5)).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn registration_after_seal_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher.seal();
        let result = dispatcher.register("echo", Arc::new(EchoHandler), Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn deadline_exceeded_on_slow_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("slow", Arc::new(SlowHandler), Duration::from_millis(20)).await.unwrap();
        let (_, result) = dispatcher.dispatch(None, "slow", serde_json::json!({}), None).await;
        assert!(matches!(result, Err(DispatchError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn cancellation_reaches_handler() {
        let dispatcher = Arc::new(Dispatcher::new());
        let observed = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register("watch", Arc::new(CancelAwareHandler { observed_cancel: observed.clone() }), Duration::from_secs(5))
            .await
            .unwrap();

        let id = CorrelationId::new();
        let d = dispatcher.clone();
        let handle = tokio::spawn(async move { d.dispatch(Some(id), "watch", serde_json::json!({}), None).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.cancel(id).await;

        let (_, result) = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_refuses_new_requests() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("echo", Arc::new(EchoHandler), Duration::from_secs(5)).await.unwrap();
        dispatcher.shutdown().await;
        dispatcher.shutdown().await;
        let (_, result) = dispatcher.dispatch(None, "echo", serde_json::json!({}), None).await;
        assert!(matches!(result, Err(DispatchError::ShuttingDown)));
    }
}
