//! Authorization handshake.
//!
//! Every attempt asks the policy endpoint for a signed upload policy before
//! anything is sent. Requests are correlated by a [`CallbackToken`] held in a
//! map owned by the [`AuthorizationClient`]; each registration resolves at
//! most once and is removed when it does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{AuthorizationPolicy, CallbackToken, TransportError, TransportResult};

/// Parameters of a single policy request
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub object_key: String,
    pub token: CallbackToken,
}

/// Something that can issue upload policies
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetch a policy for one object. No retries.
    async fn fetch(&self, request: &PolicyRequest) -> TransportResult<AuthorizationPolicy>;
}

/// Policy source backed by an HTTP endpoint.
///
/// Sends `GET {endpoint}?callback=<token>&object=<key>` and accepts either a
/// bare JSON policy or one wrapped in a `token(...)` callback invocation.
#[derive(Clone)]
pub struct HttpPolicySource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPolicySource {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client<S: Into<String>>(client: reqwest::Client, endpoint: S) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(&self, request: &PolicyRequest) -> TransportResult<AuthorizationPolicy> {
        if self.endpoint.is_empty() {
            return Err(TransportError::authorization("no authorization endpoint configured"));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("callback", request.token.as_str()),
                ("object", request.object_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TransportError::authorization(format!("endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::authorization(format!(
                "endpoint answered {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::authorization(format!("unreadable body: {}", e)))?;

        decode_policy_body(&body)
    }
}

/// Decode a policy body, unwrapping a JSONP-style callback if present
pub fn decode_policy_body(body: &str) -> TransportResult<AuthorizationPolicy> {
    let trimmed = body.trim().trim_end_matches(';').trim_end();

    let json = if trimmed.starts_with('{') {
        trimmed
    } else {
        match (trimmed.find('('), trimmed.rfind(')')) {
            (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
            _ => trimmed,
        }
    };

    serde_json::from_str(json)
        .map_err(|e| TransportError::authorization(format!("malformed policy: {}", e)))
}

type Completion = oneshot::Sender<TransportResult<AuthorizationPolicy>>;

/// Issues policy requests and owns their correlation map
#[derive(Clone)]
pub struct AuthorizationClient {
    source: Arc<dyn PolicySource>,
    pending: Arc<Mutex<HashMap<CallbackToken, Completion>>>,
}

impl AuthorizationClient {
    pub fn new<S: PolicySource + 'static>(source: S) -> Self {
        Self::from_arc(Arc::new(source))
    }

    pub fn from_arc(source: Arc<dyn PolicySource>) -> Self {
        Self {
            source,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a fresh token and start fetching a policy for `object_key`
    pub fn begin(&self, object_key: String) -> PendingAuthorization {
        let token = CallbackToken::generate();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token.clone(), tx);

        debug!("Requesting upload policy for {} ({})", object_key, token);

        let request = PolicyRequest {
            object_key,
            token: token.clone(),
        };
        let source = self.source.clone();
        let client = self.clone();
        let task = tokio::spawn(async move {
            let result = source.fetch(&request).await;
            client.complete(&request.token, result);
        });

        PendingAuthorization {
            token,
            receiver: rx,
            task,
        }
    }

    /// Resolve a registration. Returns false when the token is unknown or
    /// was already resolved or cancelled.
    pub fn complete(&self, token: &CallbackToken, result: TransportResult<AuthorizationPolicy>) -> bool {
        let Some(tx) = self.pending.lock().remove(token) else {
            debug!("Dropping policy for unknown callback {}", token);
            return false;
        };

        if tx.send(result).is_err() {
            warn!("Policy for {} arrived after its attempt went away", token);
        }
        true
    }

    /// Deregister a token. Idempotent; an absent token is not an error.
    pub fn cancel(&self, token: &CallbackToken) -> bool {
        self.pending.lock().remove(token).is_some()
    }

    /// Number of registrations still waiting for a policy
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Completion handle for one policy request
pub struct PendingAuthorization {
    token: CallbackToken,
    receiver: oneshot::Receiver<TransportResult<AuthorizationPolicy>>,
    task: JoinHandle<()>,
}

impl PendingAuthorization {
    pub fn token(&self) -> &CallbackToken {
        &self.token
    }

    /// Wait for the policy, giving up after `timeout` when set
    pub async fn wait(&mut self, timeout: Option<Duration>) -> TransportResult<AuthorizationPolicy> {
        let receiver = &mut self.receiver;
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, receiver)
                .await
                .map_err(|_| TransportError::AuthorizationTimeout)?,
            None => receiver.await,
        };

        outcome.map_err(|_| TransportError::authorization("authorization request was cancelled"))?
    }
}

impl Drop for PendingAuthorization {
    fn drop(&mut self) {
        self.task.abort();
    }
}
