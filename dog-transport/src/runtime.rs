use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{BlobRef, FieldMap, RuntimeId, TransportError, TransportResult};

/// Signals a runtime reports while a send is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeSignal {
    /// Fraction of the payload transferred, 0.0..=1.0
    Progress(f64),
    /// Backend accepted the upload
    Load,
    /// Backend or transfer failure; the reason is passed through as-is
    Error(String),
}

/// Where a runtime reports progress and completion for one send
#[derive(Debug, Clone)]
pub struct RuntimeSink {
    tx: mpsc::UnboundedSender<RuntimeSignal>,
}

impl RuntimeSink {
    /// Create a sink and the receiving end the transport listens on
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RuntimeSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once nobody is listening anymore
    pub fn emit(&self, signal: RuntimeSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn progress(&self, ratio: f64) -> bool {
        self.emit(RuntimeSignal::Progress(ratio.clamp(0.0, 1.0)))
    }

    pub fn load(&self) -> bool {
        self.emit(RuntimeSignal::Load)
    }

    pub fn error<S: Into<String>>(&self, reason: S) -> bool {
        self.emit(RuntimeSignal::Error(reason.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a runtime needs to perform one upload
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub method: String,
    pub server: String,
    pub file_field_name: String,
    pub filename: String,
    pub blob: BlobRef,
    pub form_fields: FieldMap,
    pub headers: FieldMap,
    pub allow_credentials: bool,
    pub send_as_binary: bool,
    /// Status the backend answers with on success, when the policy names one
    pub success_status: Option<u16>,
}

/// Backend that actually moves bytes for a blob
#[async_trait]
pub trait ExecutionRuntime: Send + Sync {
    fn id(&self) -> &RuntimeId;

    /// Prepare the runtime for a transport bound to it
    async fn init(&self) -> TransportResult<()>;

    /// Start the upload. Outcome is reported through `sink`, not the return
    /// value, which only covers failing to start.
    async fn send(&self, request: SendRequest, sink: RuntimeSink) -> TransportResult<()>;

    /// Cancel the in-flight send, if any
    async fn abort(&self) -> TransportResult<()>;

    /// Release everything held for the bound transport
    async fn destroy(&self) -> TransportResult<()>;

    /// Status code of the last response, 0 when there is none
    async fn status(&self) -> TransportResult<u16>;
}

/// Resolves a runtime id to a live runtime
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self, id: &RuntimeId) -> TransportResult<Arc<dyn ExecutionRuntime>>;
}

/// In-memory runtime directory
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: Arc<RwLock<HashMap<RuntimeId, Arc<dyn ExecutionRuntime>>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runtime under its own id
    pub fn register<R: ExecutionRuntime + 'static>(&self, runtime: R) -> RuntimeId {
        self.register_arc(Arc::new(runtime))
    }

    pub fn register_arc(&self, runtime: Arc<dyn ExecutionRuntime>) -> RuntimeId {
        let id = runtime.id().clone();
        self.runtimes.write().insert(id.clone(), runtime);
        id
    }

    pub fn remove(&self, id: &RuntimeId) -> Option<Arc<dyn ExecutionRuntime>> {
        self.runtimes.write().remove(id)
    }

    pub fn get(&self, id: &RuntimeId) -> Option<Arc<dyn ExecutionRuntime>> {
        self.runtimes.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.runtimes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.read().is_empty()
    }
}

#[async_trait]
impl RuntimeConnector for RuntimeRegistry {
    async fn connect(&self, id: &RuntimeId) -> TransportResult<Arc<dyn ExecutionRuntime>> {
        self.get(id)
            .ok_or_else(|| TransportError::runtime_not_found(id.as_str()))
    }
}
