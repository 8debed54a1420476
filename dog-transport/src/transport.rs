use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authorize::PendingAuthorization;
use crate::policy::object_key_for;
use crate::{
    AttemptId, AuthorizationClient, AuthorizationPolicy, BlobRef, CallbackToken, ErrorReason,
    EventKind, ExecutionRuntime, FailureReason, FieldMap, FieldValue, HttpPolicySource,
    LifecycleState, ListenerId, NormalizedResponse, PolicySource, RuntimeConnector, RuntimeSignal,
    RuntimeId, RuntimeSink, SendRequest, TransportConfig, TransportError, TransportEvent, TransportResult,
    Watchdog,
};
use crate::events::EventHub;

/// Connection between the transport and its blob's runtime
#[derive(Clone)]
enum Binding {
    Unbound,
    Connecting(u64),
    Ready(u64, Arc<dyn ExecutionRuntime>),
    Failed(u64, String),
}

struct Shared {
    lifecycle: LifecycleState,
    attempt: Option<AttemptId>,
    blob: Option<BlobRef>,
    file_field_name: String,
    filename: Option<String>,
    form_fields: FieldMap,
    headers: FieldMap,
    policy: Option<AuthorizationPolicy>,
    server: String,
    bind_generation: u64,
    bind_task: Option<JoinHandle<()>>,
    attempt_task: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
    pending_token: Option<CallbackToken>,
    destroyed: bool,
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn RuntimeConnector>,
    authorizer: AuthorizationClient,
    events: EventHub,
    watchdog: Watchdog,
    binding: watch::Sender<Binding>,
    shared: Mutex<Shared>,
}

/// Single-attempt upload transport.
///
/// Attach a blob, set any extra form fields, then `send`. The transport
/// fetches a signed policy, merges its fields, hands the upload to the blob's
/// execution runtime and supervises it with an inactivity watchdog. Outcomes
/// are published as [`TransportEvent`]s; once `send` has returned `Ok`,
/// failures are only reported through events.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a transport with its own authorization client
    pub fn new<C, P>(config: TransportConfig, connector: C, source: P) -> Self
    where
        C: RuntimeConnector + 'static,
        P: PolicySource + 'static,
    {
        Self::from_parts(config, Arc::new(connector), AuthorizationClient::new(source))
    }

    /// Create a transport that fetches policies from `config.authorization_endpoint`
    pub fn with_http_policy<C>(config: TransportConfig, connector: C) -> Self
    where
        C: RuntimeConnector + 'static,
    {
        let source = HttpPolicySource::new(config.authorization_endpoint.clone());
        Self::new(config, connector, source)
    }

    /// Create a transport sharing an existing authorization client, so that
    /// concurrent uploads register in one correlation map
    pub fn from_parts(
        config: TransportConfig,
        connector: Arc<dyn RuntimeConnector>,
        authorizer: AuthorizationClient,
    ) -> Self {
        let (binding, _) = watch::channel(Binding::Unbound);
        let shared = Shared {
            lifecycle: LifecycleState::Idle,
            attempt: None,
            blob: None,
            file_field_name: config.file_field_name.clone(),
            filename: None,
            form_fields: config.initial_form_fields.clone(),
            headers: config.initial_headers.clone(),
            policy: None,
            server: config.server_url.clone(),
            bind_generation: 0,
            bind_task: None,
            attempt_task: None,
            pump_task: None,
            pending_token: None,
            destroyed: false,
        };

        Self {
            inner: Arc::new(Inner {
                watchdog: Watchdog::new(config.timeout()),
                config,
                connector,
                authorizer,
                events: EventHub::new(),
                binding,
                shared: Mutex::new(shared),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn authorizer(&self) -> &AuthorizationClient {
        &self.inner.authorizer
    }

    /// Attach the payload. Any previous runtime connection is dropped before
    /// the blob's own runtime is connected and initialised in the background.
    pub fn attach_blob(
        &self,
        blob: BlobRef,
        field_name: Option<&str>,
        filename: Option<&str>,
    ) -> TransportResult<()> {
        let mut shared = self.inner.shared.lock();
        if shared.destroyed {
            return Err(TransportError::Destroyed);
        }
        if is_in_flight(&shared.lifecycle) {
            return Err(TransportError::AttemptInFlight);
        }

        self.inner.disconnect(&mut shared);

        shared.bind_generation += 1;
        let generation = shared.bind_generation;
        self.inner.binding.send_replace(Binding::Connecting(generation));

        if let Some(name) = field_name {
            shared.file_field_name = name.to_string();
        }
        shared.filename = Some(filename.map(str::to_string).unwrap_or_else(|| blob.filename.clone()));

        debug!("Binding transport to runtime {} (generation {})", blob.runtime_id, generation);

        let runtime_id = blob.runtime_id.clone();
        shared.blob = Some(blob);
        shared.bind_task = Some(tokio::spawn(bind_runtime(
            Arc::downgrade(&self.inner),
            runtime_id,
            generation,
        )));
        Ok(())
    }

    /// Set one form field
    pub fn set_field<K: Into<String>, V: Into<FieldValue>>(&self, key: K, value: V) {
        self.inner.shared.lock().form_fields.set(key, value);
    }

    /// Merge many form fields
    pub fn set_fields<I, K, V>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        self.inner.shared.lock().form_fields.extend(entries);
    }

    /// Set one request header
    pub fn set_header<K: Into<String>, V: Into<FieldValue>>(&self, key: K, value: V) {
        self.inner.shared.lock().headers.set(key, value);
    }

    /// Merge many request headers
    pub fn set_headers<I, K, V>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        self.inner.shared.lock().headers.extend(entries);
    }

    /// Start a new attempt. `method` overrides the configured HTTP method.
    pub fn send(&self, method: Option<&str>) -> TransportResult<AttemptId> {
        let mut shared = self.inner.shared.lock();
        if shared.destroyed {
            return Err(TransportError::Destroyed);
        }
        if is_in_flight(&shared.lifecycle) {
            return Err(TransportError::AttemptInFlight);
        }
        let filename = match (&shared.blob, &shared.filename) {
            (Some(_), Some(filename)) => filename.clone(),
            _ => return Err(TransportError::NoBlob),
        };

        let attempt = AttemptId::next();
        shared.attempt = Some(attempt);
        shared.lifecycle = LifecycleState::AwaitingAuthorization;
        shared.policy = None;
        shared.server = self.inner.config.server_url.clone();

        let pending = self.inner.authorizer.begin(object_key_for(&filename));
        shared.pending_token = Some(pending.token().clone());

        let method = method
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| self.inner.config.http_method.clone());

        info!("Starting {} for {} ({})", attempt, filename, pending.token());

        shared.attempt_task = Some(tokio::spawn(run_attempt(
            self.inner.clone(),
            attempt,
            pending,
            method,
        )));
        Ok(attempt)
    }

    /// Cancel the current attempt. A no-op once the attempt is terminal.
    pub async fn abort(&self) -> TransportResult<()> {
        let (previous, runtime) = {
            let mut shared = self.inner.shared.lock();
            if shared.lifecycle.is_terminal() {
                return Ok(());
            }
            let previous = std::mem::replace(&mut shared.lifecycle, LifecycleState::Aborted);
            self.inner.stop_attempt(&mut shared);
            (previous, self.inner.runtime())
        };

        info!("Aborting upload ({})", previous.name());
        self.inner.events.emit(&TransportEvent::Progress(1.0));

        match runtime {
            Some(runtime) => runtime.abort().await,
            None => Ok(()),
        }
    }

    /// Publish `destroy`, drop every listener, tear the runtime down and
    /// disconnect. Calling it again does nothing.
    ///
    /// An attempt still awaiting authorization or sending ends as `Aborted`;
    /// any other state is left as it was.
    pub async fn destroy(&self) -> TransportResult<()> {
        let runtime = {
            let mut shared = self.inner.shared.lock();
            if shared.destroyed {
                return Ok(());
            }
            shared.destroyed = true;
            if is_in_flight(&shared.lifecycle) {
                shared.lifecycle = LifecycleState::Aborted;
            }
            self.inner.stop_attempt(&mut shared);
            self.inner.runtime()
        };

        self.inner.events.emit(&TransportEvent::Destroy);
        self.inner.events.off_all();

        let result = match runtime {
            Some(runtime) => runtime.destroy().await,
            None => Ok(()),
        };

        let mut shared = self.inner.shared.lock();
        self.inner.disconnect(&mut shared);
        info!("Transport destroyed");
        result
    }

    /// Status reported by the bound runtime
    pub async fn status(&self) -> TransportResult<u16> {
        let runtime = self.inner.runtime().ok_or(TransportError::NotBound)?;
        runtime.status().await
    }

    /// Normalized completion record. Before a policy has been received the
    /// `url` is absent.
    pub fn response_json(&self) -> NormalizedResponse {
        let shared = self.inner.shared.lock();
        NormalizedResponse::shape(&shared.form_fields, shared.policy.as_ref())
    }

    /// Normalized completion record as JSON text
    pub fn response(&self) -> TransportResult<String> {
        self.response_json().to_json_string()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.shared.lock().lifecycle.clone()
    }

    pub fn attempt(&self) -> Option<AttemptId> {
        self.inner.shared.lock().attempt
    }

    pub fn policy(&self) -> Option<AuthorizationPolicy> {
        self.inner.shared.lock().policy.clone()
    }

    pub fn field(&self, key: &str) -> Option<FieldValue> {
        self.inner.shared.lock().form_fields.get(key).cloned()
    }

    pub fn fields(&self) -> FieldMap {
        self.inner.shared.lock().form_fields.clone()
    }

    pub fn headers(&self) -> FieldMap {
        self.inner.shared.lock().headers.clone()
    }

    pub fn blob(&self) -> Option<BlobRef> {
        self.inner.shared.lock().blob.clone()
    }

    /// Upload server of the current attempt
    pub fn server(&self) -> String {
        self.inner.shared.lock().server.clone()
    }

    /// Whether a runtime connection is established
    pub fn is_bound(&self) -> bool {
        self.inner.runtime().is_some()
    }

    /// Whether the inactivity watchdog is currently armed
    pub fn is_supervised(&self) -> bool {
        self.inner.watchdog.is_armed()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener)
    }

    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }
}

fn is_in_flight(state: &LifecycleState) -> bool {
    matches!(
        state,
        LifecycleState::AwaitingAuthorization | LifecycleState::Sending
    )
}

impl Inner {
    fn runtime(&self) -> Option<Arc<dyn ExecutionRuntime>> {
        match &*self.binding.borrow() {
            Binding::Ready(_, runtime) => Some(runtime.clone()),
            _ => None,
        }
    }

    /// Drop the runtime connection. Caller holds the shared lock.
    fn disconnect(&self, shared: &mut Shared) {
        if let Some(task) = shared.bind_task.take() {
            task.abort();
        }
        let previous = self.binding.send_replace(Binding::Unbound);
        if !matches!(previous, Binding::Unbound) {
            debug!("Disconnected from previous runtime");
        }
        shared.bind_generation += 1;
    }

    /// Stop supervision and background work of the current attempt.
    /// Caller holds the shared lock.
    fn stop_attempt(&self, shared: &mut Shared) {
        self.watchdog.clear();
        if let Some(task) = shared.attempt_task.take() {
            task.abort();
        }
        if let Some(task) = shared.pump_task.take() {
            task.abort();
        }
        if let Some(token) = shared.pending_token.take() {
            self.authorizer.cancel(&token);
        }
    }

    /// End the current attempt. Caller holds the shared lock, so no rearm
    /// can slip in between the state change and the timer being cleared.
    fn finish(&self, shared: &mut Shared, state: LifecycleState) {
        shared.lifecycle = state;
        shared.pending_token = None;
        self.watchdog.clear();
    }

    /// Every terminal outcome is preceded by a final progress tick
    fn publish_terminal(&self, event: TransportEvent) {
        self.events.emit(&TransportEvent::Progress(1.0));
        self.events.emit(&event);
    }

    /// Arm (or rearm) the inactivity watchdog for `attempt`. Caller holds
    /// the shared lock and has checked that `attempt` is sending.
    fn supervise(self: &Arc<Self>, attempt: AttemptId) {
        let weak = Arc::downgrade(self);
        self.watchdog.arm(move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(attempt).await;
            }
        });
    }

    async fn on_timeout(self: Arc<Self>, attempt: AttemptId) {
        let runtime = {
            let mut shared = self.shared.lock();
            if shared.attempt != Some(attempt) || shared.lifecycle != LifecycleState::Sending {
                return;
            }
            self.finish(&mut shared, LifecycleState::Failed(FailureReason::Timeout));
            if let Some(task) = shared.attempt_task.take() {
                task.abort();
            }
            if let Some(task) = shared.pump_task.take() {
                task.abort();
            }
            self.runtime()
        };

        warn!("{} timed out after {:?} without progress", attempt, self.watchdog.duration());
        self.publish_terminal(TransportEvent::Error(ErrorReason::Timeout));

        // attempt already settled, so a slow abort cannot reach the next one
        if let Some(runtime) = runtime {
            if let Err(e) = runtime.abort().await {
                warn!("Runtime abort after timeout failed: {}", e);
            }
        }
    }

    /// Apply a runtime signal. Returns false once the attempt is over.
    fn handle_signal(self: &Arc<Self>, attempt: AttemptId, signal: RuntimeSignal) -> bool {
        {
            let mut shared = self.shared.lock();
            if shared.attempt != Some(attempt) || shared.lifecycle != LifecycleState::Sending {
                debug!("Dropping {:?} for {}: attempt no longer sending", signal, attempt);
                return false;
            }
            match &signal {
                RuntimeSignal::Progress(_) => self.supervise(attempt),
                RuntimeSignal::Load => self.finish(&mut shared, LifecycleState::Succeeded),
                RuntimeSignal::Error(reason) => self.finish(
                    &mut shared,
                    LifecycleState::Failed(FailureReason::Backend(reason.clone())),
                ),
            }
        }

        match signal {
            RuntimeSignal::Progress(ratio) => {
                self.events.emit(&TransportEvent::Progress(ratio));
                true
            }
            RuntimeSignal::Load => {
                info!("{} uploaded", attempt);
                self.publish_terminal(TransportEvent::Load);
                false
            }
            RuntimeSignal::Error(reason) => {
                warn!("{} failed: {}", attempt, reason);
                self.publish_terminal(TransportEvent::Error(ErrorReason::Backend(reason)));
                false
            }
        }
    }

    /// Terminal failure before the runtime took the upload
    fn fail_before_send(&self, attempt: AttemptId, state: LifecycleState, reason: ErrorReason) {
        {
            let mut shared = self.shared.lock();
            if shared.attempt != Some(attempt) || shared.lifecycle.is_terminal() {
                return;
            }
            self.finish(&mut shared, state);
        }
        warn!("{} failed before dispatch: {}", attempt, reason);
        self.publish_terminal(TransportEvent::Error(reason));
    }

    /// Wait until the runtime connection requested by `attach_blob` settles
    async fn ready_runtime(&self) -> TransportResult<Arc<dyn ExecutionRuntime>> {
        let mut rx = self.binding.subscribe();
        loop {
            let settled = match &*rx.borrow_and_update() {
                Binding::Ready(_, runtime) => Some(Ok(runtime.clone())),
                Binding::Failed(_, reason) => Some(Err(TransportError::backend(
                    std::io::Error::new(std::io::ErrorKind::NotConnected, reason.clone()),
                ))),
                Binding::Unbound => Some(Err(TransportError::NotBound)),
                Binding::Connecting(_) => None,
            };
            if let Some(result) = settled {
                return result;
            }
            rx.changed().await.map_err(|_| TransportError::NotBound)?;
        }
    }
}

async fn bind_runtime(inner: Weak<Inner>, runtime_id: RuntimeId, generation: u64) {
    let Some(transport) = inner.upgrade() else {
        return;
    };
    let connector = transport.connector.clone();
    drop(transport);

    let outcome = match connector.connect(&runtime_id).await {
        Ok(runtime) => runtime.init().await.map(|_| runtime),
        Err(e) => Err(e),
    };

    let Some(transport) = inner.upgrade() else {
        return;
    };
    let shared = transport.shared.lock();
    if shared.bind_generation != generation {
        debug!("Discarding stale runtime binding (generation {})", generation);
        return;
    }

    match outcome {
        Ok(runtime) => {
            debug!("Runtime {} ready", runtime_id);
            transport.binding.send_replace(Binding::Ready(generation, runtime));
        }
        Err(e) => {
            warn!("Runtime {} failed to initialise: {}", runtime_id, e);
            transport
                .binding
                .send_replace(Binding::Failed(generation, e.to_string()));
        }
    }
}

async fn run_attempt(
    inner: Arc<Inner>,
    attempt: AttemptId,
    mut pending: PendingAuthorization,
    method: String,
) {
    let outcome = pending.wait(inner.config.authorization_timeout()).await;
    inner.authorizer.cancel(pending.token());
    drop(pending);

    let policy = match outcome {
        Ok(policy) => policy,
        Err(e) => {
            let reason = e.to_string();
            inner.fail_before_send(
                attempt,
                LifecycleState::AuthorizationFailed(reason.clone()),
                ErrorReason::Authorization(reason),
            );
            return;
        }
    };

    let request = {
        let mut shared = inner.shared.lock();
        if shared.attempt != Some(attempt)
            || shared.lifecycle != LifecycleState::AwaitingAuthorization
        {
            return;
        }
        let Some(blob) = shared.blob.clone() else {
            return;
        };

        policy.apply_to(&mut shared.form_fields);
        if !policy.upload_server.is_empty() {
            shared.server = policy.upload_server.clone();
        }
        shared.pending_token = None;
        shared.lifecycle = LifecycleState::Sending;
        // supervised from here on, including the wait for the runtime binding
        inner.supervise(attempt);

        let request = SendRequest {
            method,
            server: shared.server.clone(),
            file_field_name: shared.file_field_name.clone(),
            filename: shared.filename.clone().unwrap_or_else(|| blob.filename.clone()),
            blob,
            form_fields: shared.form_fields.clone(),
            headers: shared.headers.clone(),
            allow_credentials: inner.config.allow_credentials,
            send_as_binary: inner.config.send_as_binary,
            success_status: policy.success_status_code(),
        };
        shared.policy = Some(policy);
        request
    };

    debug!("{} authorized, uploading to {}", attempt, request.server);

    let runtime = match inner.ready_runtime().await {
        Ok(runtime) => runtime,
        Err(e) => {
            inner.fail_before_send(
                attempt,
                LifecycleState::Failed(FailureReason::Backend(e.to_string())),
                ErrorReason::Backend(e.to_string()),
            );
            return;
        }
    };

    let (sink, rx) = RuntimeSink::channel();
    {
        let mut shared = inner.shared.lock();
        if shared.attempt != Some(attempt) || shared.lifecycle != LifecycleState::Sending {
            return;
        }
        shared.pump_task = Some(tokio::spawn(pump_signals(
            Arc::downgrade(&inner),
            attempt,
            rx,
        )));
    }

    if let Err(e) = runtime.send(request, sink.clone()).await {
        sink.error(e.to_string());
    }
}

async fn pump_signals(
    inner: Weak<Inner>,
    attempt: AttemptId,
    mut rx: mpsc::UnboundedReceiver<RuntimeSignal>,
) {
    while let Some(signal) = rx.recv().await {
        let Some(transport) = inner.upgrade() else {
            return;
        };
        if !transport.handle_signal(attempt, signal) {
            return;
        }
    }
}
