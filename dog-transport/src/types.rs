use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identity of the execution runtime a blob lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeId(pub String);

impl RuntimeId {
    /// Generate a new random runtime ID
    pub fn new() -> Self {
        Self(format!("rt_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RuntimeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static ATTEMPT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(u64);

impl AttemptId {
    pub(crate) fn next() -> Self {
        Self(ATTEMPT_SEQ.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attempt-{}", self.0)
    }
}

static CALLBACK_SEQ: AtomicU64 = AtomicU64::new(1);

/// Correlation token for an authorization request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackToken(String);

impl CallbackToken {
    /// Timestamp-derived token. The sequence suffix keeps tokens unique when
    /// several attempts start within the same millisecond.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = CALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("upload_cb_{}_{}", millis, seq))
    }

    pub fn from_string(token: String) -> Self {
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an in-memory payload and the runtime it must execute in
#[derive(Debug, Clone)]
pub struct BlobRef {
    pub runtime_id: RuntimeId,
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl BlobRef {
    pub fn new<S: Into<String>>(runtime_id: RuntimeId, filename: S, data: impl Into<Bytes>) -> Self {
        Self {
            runtime_id,
            filename: filename.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Why an attempt ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout,
    Backend(String),
}

/// Lifecycle of the current attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    AwaitingAuthorization,
    Sending,
    Succeeded,
    Failed(FailureReason),
    Aborted,
    AuthorizationFailed(String),
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed(_) | Self::Aborted | Self::AuthorizationFailed(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingAuthorization => "awaiting_authorization",
            Self::Sending => "sending",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Aborted => "aborted",
            Self::AuthorizationFailed(_) => "authorization_failed",
        }
    }
}
