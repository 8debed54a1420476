use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::assert_ok;

use dog_transport::{
    AuthorizationClient, AuthorizationPolicy, BlobRef, ErrorReason, EventKind, ExecutionRuntime,
    FailureReason, FieldValue, LifecycleState, PolicyRequest, PolicySource, RuntimeConnector,
    RuntimeId, RuntimeRegistry, RuntimeSink, SendRequest, Transport, TransportConfig,
    TransportError, TransportEvent, TransportResult, POLICY_FIELDS,
};

/// Test factory functions
fn policy_for(object_key: &str) -> AuthorizationPolicy {
    let key = object_key.trim_start_matches('/').to_string();
    AuthorizationPolicy {
        upload_server: "https://bucket.oss.test".to_string(),
        access_key_id: "AKID".to_string(),
        policy: "eyJjb25kaXRpb25zIjpbXX0=".to_string(),
        signature: "c2lnbmF0dXJl".to_string(),
        url: Some(format!("https://cdn.test/{}", key)),
        object_key: key,
        success_status: FieldValue::from("200"),
    }
}

#[derive(Clone, Copy)]
enum Script {
    Grant,
    Deny,
    Hang,
}

#[derive(Clone)]
struct ScriptedSource {
    script: Script,
    requests: Arc<Mutex<Vec<PolicyRequest>>>,
}

impl ScriptedSource {
    fn new(script: Script) -> Self {
        Self {
            script,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl PolicySource for ScriptedSource {
    async fn fetch(&self, request: &PolicyRequest) -> TransportResult<AuthorizationPolicy> {
        self.requests.lock().unwrap().push(request.clone());
        match self.script {
            Script::Grant => Ok(policy_for(&request.object_key)),
            Script::Deny => Err(TransportError::authorization("denied")),
            Script::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct Calls {
    init: usize,
    send: usize,
    abort: usize,
    destroy: usize,
    last_request: Option<SendRequest>,
}

struct FakeRuntime {
    id: RuntimeId,
    calls: Mutex<Calls>,
    sink: Mutex<Option<RuntimeSink>>,
    abort_delay: Option<Duration>,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: RuntimeId::new(),
            calls: Mutex::new(Calls::default()),
            sink: Mutex::new(None),
            abort_delay: None,
        })
    }

    /// Runtime whose `abort` takes `delay` to complete
    fn with_abort_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: RuntimeId::new(),
            calls: Mutex::new(Calls::default()),
            sink: Mutex::new(None),
            abort_delay: Some(delay),
        })
    }

    fn sink(&self) -> RuntimeSink {
        self.sink.lock().unwrap().clone().expect("runtime was never sent to")
    }

    fn inits(&self) -> usize {
        self.calls.lock().unwrap().init
    }

    fn sends(&self) -> usize {
        self.calls.lock().unwrap().send
    }

    fn aborts(&self) -> usize {
        self.calls.lock().unwrap().abort
    }

    fn destroys(&self) -> usize {
        self.calls.lock().unwrap().destroy
    }

    fn last_request(&self) -> SendRequest {
        self.calls.lock().unwrap().last_request.clone().expect("no request")
    }
}

#[async_trait]
impl ExecutionRuntime for FakeRuntime {
    fn id(&self) -> &RuntimeId {
        &self.id
    }

    async fn init(&self) -> TransportResult<()> {
        self.calls.lock().unwrap().init += 1;
        Ok(())
    }

    async fn send(&self, request: SendRequest, sink: RuntimeSink) -> TransportResult<()> {
        // sink first, so a visible send count implies a usable sink
        *self.sink.lock().unwrap() = Some(sink);
        let mut calls = self.calls.lock().unwrap();
        calls.last_request = Some(request);
        calls.send += 1;
        Ok(())
    }

    async fn abort(&self) -> TransportResult<()> {
        self.calls.lock().unwrap().abort += 1;
        if let Some(delay) = self.abort_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn destroy(&self) -> TransportResult<()> {
        self.calls.lock().unwrap().destroy += 1;
        Ok(())
    }

    async fn status(&self) -> TransportResult<u16> {
        Ok(204)
    }
}

/// Connector whose connection never completes
struct StalledConnector;

#[async_trait]
impl RuntimeConnector for StalledConnector {
    async fn connect(&self, _id: &RuntimeId) -> TransportResult<Arc<dyn ExecutionRuntime>> {
        std::future::pending().await
    }
}

struct Harness {
    transport: Transport,
    runtime: Arc<FakeRuntime>,
    registry: RuntimeRegistry,
    source: ScriptedSource,
    events: Arc<Mutex<Vec<TransportEvent>>>,
}

impl Harness {
    fn new(config: TransportConfig, script: Script) -> Self {
        Self::with_runtime(config, script, FakeRuntime::new())
    }

    fn with_runtime(config: TransportConfig, script: Script, runtime: Arc<FakeRuntime>) -> Self {
        let registry = RuntimeRegistry::new();
        registry.register_arc(runtime.clone());

        let source = ScriptedSource::new(script);
        let transport = Transport::new(config, registry.clone(), source.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        transport.on_any(move |event| recorded.lock().unwrap().push(event.clone()));

        Self {
            transport,
            runtime,
            registry,
            source,
            events,
        }
    }

    fn attach(&self, filename: &str) {
        let blob = BlobRef::new(self.runtime.id.clone(), filename, vec![1u8; 32])
            .with_content_type("image/png");
        assert_ok!(self.transport.attach_blob(blob, None, None));
    }

    fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, wanted: &TransportEvent) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }
}

fn config() -> TransportConfig {
    TransportConfig::new()
        .with_server_url("https://fallback.test")
        .with_timeout_ms(1_000)
        .with_authorization_timeout_ms(500)
}

/// Let spawned tasks run without moving the clock
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll on a real clock, for tests on the multi-threaded runtime
async fn wait_for(mut ready: impl FnMut() -> bool) {
    for _ in 0..400 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

async fn sending_harness(config: TransportConfig) -> Harness {
    let h = Harness::new(config, Script::Grant);
    h.attach("x.png");
    settle().await;
    h.transport.send(None).unwrap();
    settle().await;
    assert_eq!(h.transport.state(), LifecycleState::Sending);
    h
}

#[tokio::test(start_paused = true)]
async fn test_successful_upload_merges_policy_before_dispatch() {
    let h = Harness::new(config(), Script::Grant);
    h.attach("x.png");
    h.transport.set_fields([("name", "x.png"), ("type", "image/png")]);
    h.transport.set_field("size", 32);
    h.transport.set_header("X-Trace", "abc");
    settle().await;
    assert_eq!(h.runtime.inits(), 1);

    h.transport.send(None).unwrap();
    settle().await;

    // the runtime saw every policy field at dispatch time
    let request = h.runtime.last_request();
    for name in POLICY_FIELDS {
        assert!(request.form_fields.contains_key(name), "missing {}", name);
    }
    assert_eq!(request.server, "https://bucket.oss.test");
    assert_eq!(request.method, "POST");
    assert_eq!(request.file_field_name, "file");
    assert_eq!(request.filename, "x.png");
    assert_eq!(request.success_status, Some(200));
    assert_eq!(request.headers.get("X-Trace"), Some(&FieldValue::from("abc")));
    assert!(h.transport.is_supervised());

    let requests = h.source.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].object_key, "/x.png");

    h.runtime.sink().progress(0.5);
    h.runtime.sink().load();
    settle().await;

    assert_eq!(h.transport.state(), LifecycleState::Succeeded);
    assert_eq!(
        h.events(),
        vec![
            TransportEvent::Progress(0.5),
            TransportEvent::Progress(1.0),
            TransportEvent::Load,
        ]
    );
    assert!(!h.transport.is_supervised());
    assert_eq!(h.transport.authorizer().pending(), 0);

    let response = h.transport.response_json();
    assert_eq!(response.url.as_deref(), Some("https://cdn.test/x.png"));
    assert_eq!(response.size, Some(FieldValue::from(32)));
    assert_eq!(response.state, "SUCCESS");
}

#[tokio::test(start_paused = true)]
async fn test_method_override_and_custom_field_name() {
    let h = Harness::new(config(), Script::Grant);
    let blob = BlobRef::new(h.runtime.id.clone(), "raw.bin", vec![0u8; 4]);
    h.transport
        .attach_blob(blob, Some("upload"), Some("renamed.bin"))
        .unwrap();
    settle().await;

    h.transport.send(Some("put")).unwrap();
    settle().await;

    let request = h.runtime.last_request();
    assert_eq!(request.method, "PUT");
    assert_eq!(request.file_field_name, "upload");
    assert_eq!(request.filename, "renamed.bin");
    assert_eq!(h.source.requests.lock().unwrap()[0].object_key, "/renamed.bin");
}

#[tokio::test(start_paused = true)]
async fn test_progress_rearms_inactivity_timeout() {
    let h = sending_harness(config()).await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    h.runtime.sink().progress(0.4);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(h.transport.state(), LifecycleState::Sending);
    assert_eq!(h.runtime.aborts(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        h.transport.state(),
        LifecycleState::Failed(FailureReason::Timeout)
    );
    assert_eq!(h.runtime.aborts(), 1);
    assert_eq!(
        h.events(),
        vec![
            TransportEvent::Progress(0.4),
            TransportEvent::Progress(1.0),
            TransportEvent::Error(ErrorReason::Timeout),
        ]
    );
    assert!(!h.transport.is_supervised());

    // nothing left to fire
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.runtime.aborts(), 1);
    assert_eq!(h.count(&TransportEvent::Error(ErrorReason::Timeout)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_any_progress() {
    let h = sending_harness(config()).await;

    tokio::time::sleep(Duration::from_millis(1_001)).await;

    assert_eq!(
        h.transport.state(),
        LifecycleState::Failed(FailureReason::Timeout)
    );
    assert_eq!(
        h.events(),
        vec![
            TransportEvent::Progress(1.0),
            TransportEvent::Error(ErrorReason::Timeout),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_runtime_abort_leaves_next_attempt_supervised() {
    let runtime = FakeRuntime::with_abort_delay(Duration::from_millis(100));
    let h = Harness::with_runtime(config(), Script::Grant, runtime);
    h.attach("x.png");
    settle().await;
    h.transport.send(None).unwrap();
    settle().await;

    // first attempt times out; the runtime is still busy aborting
    tokio::time::sleep(Duration::from_millis(1_010)).await;
    assert_eq!(
        h.transport.state(),
        LifecycleState::Failed(FailureReason::Timeout)
    );
    assert_eq!(
        h.events(),
        vec![
            TransportEvent::Progress(1.0),
            TransportEvent::Error(ErrorReason::Timeout),
        ]
    );

    h.transport.send(None).unwrap();
    settle().await;
    assert_eq!(h.transport.state(), LifecycleState::Sending);
    assert!(h.transport.is_supervised());

    // the first abort completes without touching the second attempt
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.state(), LifecycleState::Sending);
    assert!(h.transport.is_supervised());
    assert_eq!(h.count(&TransportEvent::Error(ErrorReason::Timeout)), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        h.transport.state(),
        LifecycleState::Failed(FailureReason::Timeout)
    );
    assert_eq!(h.count(&TransportEvent::Error(ErrorReason::Timeout)), 2);
    assert_eq!(h.runtime.aborts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_that_never_connects_still_times_out() {
    let transport = Transport::new(config(), StalledConnector, ScriptedSource::new(Script::Grant));
    let blob = BlobRef::new(RuntimeId::new(), "x.png", vec![0u8; 4]);
    transport.attach_blob(blob, None, None).unwrap();
    settle().await;

    transport.send(None).unwrap();
    settle().await;
    assert_eq!(transport.state(), LifecycleState::Sending);
    assert!(transport.is_supervised());
    assert!(!transport.is_bound());

    tokio::time::sleep(Duration::from_millis(1_001)).await;
    assert_eq!(
        transport.state(),
        LifecycleState::Failed(FailureReason::Timeout)
    );
    assert!(!transport.is_supervised());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_racing_progress_leaves_no_timer() {
    for _ in 0..20 {
        let h = Harness::new(config(), Script::Grant);
        h.attach("x.png");
        wait_for(|| h.transport.is_bound()).await;
        h.transport.send(None).unwrap();
        wait_for(|| h.runtime.sends() == 1).await;

        let sink = h.runtime.sink();
        let ticker = tokio::spawn(async move {
            for i in 0..200 {
                sink.progress(i as f64 / 200.0);
                tokio::task::yield_now().await;
            }
        });
        tokio::task::yield_now().await;
        h.transport.abort().await.unwrap();
        ticker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.transport.state(), LifecycleState::Aborted);
        assert!(!h.transport.is_supervised());
    }
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_never_arms() {
    let h = sending_harness(config().with_timeout_ms(0)).await;
    assert!(!h.transport.is_supervised());

    h.runtime.sink().progress(0.1);
    settle().await;
    assert!(!h.transport.is_supervised());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.transport.state(), LifecycleState::Sending);
    assert_eq!(h.runtime.aborts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backend_error_passes_reason_through() {
    let h = sending_harness(config()).await;

    h.runtime.sink().error("http");
    settle().await;

    assert_eq!(
        h.transport.state(),
        LifecycleState::Failed(FailureReason::Backend("http".to_string()))
    );
    assert_eq!(
        h.events(),
        vec![
            TransportEvent::Progress(1.0),
            TransportEvent::Error(ErrorReason::Backend("http".to_string())),
        ]
    );
    assert!(!h.transport.is_supervised());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.runtime.aborts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_is_idempotent_and_clears_supervision() {
    let h = sending_harness(config()).await;

    h.transport.abort().await.unwrap();
    h.transport.abort().await.unwrap();

    assert_eq!(h.transport.state(), LifecycleState::Aborted);
    assert_eq!(h.runtime.aborts(), 1);
    assert!(!h.transport.is_supervised());
    assert_eq!(h.events(), vec![TransportEvent::Progress(1.0)]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.runtime.aborts(), 1);
    assert_eq!(h.count(&TransportEvent::Error(ErrorReason::Timeout)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_signals_after_terminal_state_are_dropped() {
    let h = sending_harness(config()).await;
    let sink = h.runtime.sink();

    sink.load();
    settle().await;
    sink.error("late");
    sink.progress(0.3);
    settle().await;

    assert_eq!(h.transport.state(), LifecycleState::Succeeded);
    assert_eq!(
        h.events(),
        vec![TransportEvent::Progress(1.0), TransportEvent::Load]
    );
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_awaiting_authorization() {
    let h = Harness::new(config().with_authorization_timeout_ms(0), Script::Hang);
    h.attach("x.png");
    settle().await;

    h.transport.send(None).unwrap();
    settle().await;
    assert_eq!(h.transport.state(), LifecycleState::AwaitingAuthorization);
    assert_eq!(h.transport.authorizer().pending(), 1);

    h.transport.abort().await.unwrap();
    settle().await;

    assert_eq!(h.transport.state(), LifecycleState::Aborted);
    assert_eq!(h.transport.authorizer().pending(), 0);
    assert_eq!(h.runtime.sends(), 0);
    assert_eq!(h.runtime.aborts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_authorization_failure_is_terminal() {
    let h = Harness::new(config(), Script::Deny);
    h.attach("x.png");
    settle().await;

    h.transport.send(None).unwrap();
    settle().await;

    assert!(matches!(
        h.transport.state(),
        LifecycleState::AuthorizationFailed(_)
    ));
    assert_eq!(h.runtime.sends(), 0);
    assert_eq!(h.transport.authorizer().pending(), 0);
    assert!(h.transport.policy().is_none());

    let events = h.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], TransportEvent::Progress(1.0));
    assert!(matches!(
        &events[1],
        TransportEvent::Error(ErrorReason::Authorization(reason)) if reason.contains("denied")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_authorization_handshake_times_out() {
    let h = Harness::new(config(), Script::Hang);
    h.attach("x.png");
    settle().await;

    h.transport.send(None).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.transport.state(), LifecycleState::AwaitingAuthorization);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        h.transport.state(),
        LifecycleState::AuthorizationFailed(_)
    ));
    assert_eq!(h.transport.authorizer().pending(), 0);
    assert_eq!(h.runtime.sends(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_attaching_again_replaces_binding() {
    let h = Harness::new(config(), Script::Grant);
    let second = FakeRuntime::new();
    h.registry.register_arc(second.clone());

    h.attach("first.png");
    let blob = BlobRef::new(second.id.clone(), "second.png", vec![2u8; 8]);
    h.transport.attach_blob(blob, None, None).unwrap();
    settle().await;

    assert_eq!(h.runtime.inits(), 0);
    assert_eq!(second.inits(), 1);
    assert!(h.transport.is_bound());

    h.transport.send(None).unwrap();
    settle().await;

    assert_eq!(h.runtime.sends(), 0);
    assert_eq!(second.sends(), 1);
    assert_eq!(second.last_request().filename, "second.png");
}

#[tokio::test(start_paused = true)]
async fn test_attach_to_unknown_runtime_fails_the_attempt() {
    let h = Harness::new(config(), Script::Grant);
    let blob = BlobRef::new(RuntimeId::from_string("missing".into()), "x.png", vec![0u8; 1]);
    h.transport.attach_blob(blob, None, None).unwrap();
    settle().await;
    assert!(!h.transport.is_bound());

    h.transport.send(None).unwrap();
    settle().await;

    assert!(matches!(
        h.transport.state(),
        LifecycleState::Failed(FailureReason::Backend(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_send_preconditions() {
    let h = Harness::new(config(), Script::Hang);
    assert!(matches!(h.transport.send(None), Err(TransportError::NoBlob)));

    h.attach("x.png");
    settle().await;
    h.transport.send(None).unwrap();
    assert!(matches!(
        h.transport.send(None),
        Err(TransportError::AttemptInFlight)
    ));
    let blob = BlobRef::new(h.runtime.id.clone(), "y.png", vec![0u8; 1]);
    assert!(matches!(
        h.transport.attach_blob(blob, None, None),
        Err(TransportError::AttemptInFlight)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_new_attempt_after_terminal_state() {
    let h = sending_harness(config()).await;
    let first = h.transport.attempt().unwrap();
    h.runtime.sink().error("http");
    settle().await;

    let second = h.transport.send(None).unwrap();
    settle().await;

    assert_ne!(first, second);
    assert_eq!(h.transport.state(), LifecycleState::Sending);
    assert_eq!(h.runtime.sends(), 2);

    let requests = h.source.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].token, requests[1].token);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_tears_down_once() {
    let h = sending_harness(config()).await;
    let destroys = Arc::new(Mutex::new(0));
    let d = destroys.clone();
    h.transport.on(EventKind::Destroy, move |_| *d.lock().unwrap() += 1);

    h.transport.destroy().await.unwrap();
    h.transport.destroy().await.unwrap();

    assert_eq!(*destroys.lock().unwrap(), 1);
    assert_eq!(h.count(&TransportEvent::Destroy), 1);
    assert_eq!(h.runtime.destroys(), 1);
    assert!(!h.transport.is_bound());
    assert!(!h.transport.is_supervised());
    assert!(matches!(h.transport.send(None), Err(TransportError::Destroyed)));

    // listeners are gone
    h.runtime.sink().load();
    settle().await;
    assert_eq!(h.events().last(), Some(&TransportEvent::Destroy));
}

#[tokio::test(start_paused = true)]
async fn test_destroy_keeps_idle_and_finished_states() {
    let idle = Harness::new(config(), Script::Grant);
    idle.attach("x.png");
    settle().await;
    idle.transport.destroy().await.unwrap();
    assert_eq!(idle.transport.state(), LifecycleState::Idle);

    let done = sending_harness(config()).await;
    done.runtime.sink().load();
    settle().await;
    done.transport.destroy().await.unwrap();
    assert_eq!(done.transport.state(), LifecycleState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_cancels_attempt_in_flight() {
    let h = sending_harness(config()).await;
    h.transport.destroy().await.unwrap();
    assert_eq!(h.transport.state(), LifecycleState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn test_status_delegates_to_runtime() {
    let h = Harness::new(config(), Script::Grant);
    assert!(matches!(
        h.transport.status().await,
        Err(TransportError::NotBound)
    ));

    h.attach("x.png");
    settle().await;
    assert_eq!(h.transport.status().await.unwrap(), 204);
}

#[tokio::test(start_paused = true)]
async fn test_shared_authorizer_keeps_attempts_apart() {
    let registry = RuntimeRegistry::new();
    let runtime = FakeRuntime::new();
    registry.register_arc(runtime.clone());
    let source = ScriptedSource::new(Script::Hang);
    let authorizer = AuthorizationClient::new(source.clone());
    let connector: Arc<dyn RuntimeConnector> = Arc::new(registry);

    let a = Transport::from_parts(config(), connector.clone(), authorizer.clone());
    let b = Transport::from_parts(config(), connector, authorizer.clone());
    a.attach_blob(BlobRef::new(runtime.id.clone(), "a.png", vec![1u8]), None, None)
        .unwrap();
    b.attach_blob(BlobRef::new(runtime.id.clone(), "b.png", vec![2u8]), None, None)
        .unwrap();
    settle().await;

    a.send(None).unwrap();
    b.send(None).unwrap();
    settle().await;
    assert_eq!(authorizer.pending(), 2);

    let requests = source.requests.lock().unwrap().clone();
    assert_ne!(requests[0].token, requests[1].token);

    // resolve b only; a stays parked
    let b_request = requests
        .iter()
        .find(|r| r.object_key == "/b.png")
        .unwrap()
        .clone();
    assert!(authorizer.complete(&b_request.token, Ok(policy_for(&b_request.object_key))));
    settle().await;

    assert_eq!(a.state(), LifecycleState::AwaitingAuthorization);
    assert_eq!(b.state(), LifecycleState::Sending);
    assert_eq!(authorizer.pending(), 1);
    assert_eq!(b.policy().unwrap().object_key, "b.png");
}
