//! # dog-transport: Policy-authorized upload transport
//!
//! `dog-transport` drives a single upload attempt of an in-memory blob to an
//! object store that accepts browser-style POST policy uploads. Before any
//! byte is sent the transport asks a policy endpoint for a short-lived signed
//! policy, merges the policy fields into the form, and hands the upload to a
//! pluggable execution runtime.
//!
//! ## Key Features
//!
//! - **One uniform contract**: progress, load and error events regardless of backend
//! - **Authorization handshake**: correlated, one-shot policy requests with their own timeout
//! - **Inactivity watchdog**: aborts an upload that stops reporting progress
//! - **Runtime agnostic**: anything implementing [`ExecutionRuntime`] can move the bytes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_transport::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> TransportResult<()> {
//! let registry = RuntimeRegistry::new();
//! let runtime_id = registry.register(HttpRuntime::new());
//!
//! let config = TransportConfig::new()
//!     .with_authorization_endpoint("https://policy.example.com/post-policy");
//! let transport = Transport::with_http_policy(config, registry);
//!
//! transport.on(EventKind::Load, |_| println!("uploaded"));
//! transport.on(EventKind::Error, |event| println!("failed: {:?}", event));
//!
//! let blob = BlobRef::new(runtime_id, "photo.png", b"...".to_vec())
//!     .with_content_type("image/png");
//! transport.attach_blob(blob, None, None)?;
//! transport.set_fields([("name", "photo.png"), ("type", "image/png")]);
//! transport.send(None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──send──▶ AwaitingAuthorization ──policy──▶ Sending ──load──▶ Succeeded
//!                        │                            ├──error/timeout──▶ Failed
//!                        └──handshake failure──▶ AuthorizationFailed
//!             abort() from any non-terminal state ──▶ Aborted
//! ```

pub mod authorize;
mod config;
mod error;
pub mod events;
mod fields;
mod http_runtime;
mod policy;
mod response;
pub mod runtime;
mod transport;
mod types;
mod watchdog;

pub use authorize::{
    decode_policy_body, AuthorizationClient, HttpPolicySource, PendingAuthorization, PolicyRequest,
    PolicySource,
};
pub use config::{TransportConfig, DEFAULT_AUTHORIZATION_TIMEOUT_MS, DEFAULT_TIMEOUT_MS};
pub use error::{TransportError, TransportResult};
pub use events::{ErrorReason, EventKind, EventListener, ListenerId, TransportEvent};
pub use fields::{FieldMap, FieldValue};
pub use http_runtime::{HttpRuntime, CHUNK_SIZE};
pub use policy::{object_key_for, AuthorizationPolicy, POLICY_FIELDS};
pub use response::{NormalizedResponse, SUCCESS_STATE};
pub use runtime::{
    ExecutionRuntime, RuntimeConnector, RuntimeRegistry, RuntimeSignal, RuntimeSink, SendRequest,
};
pub use transport::Transport;
pub use types::{AttemptId, BlobRef, CallbackToken, FailureReason, LifecycleState, RuntimeId};
pub use watchdog::Watchdog;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobRef, EventKind, ExecutionRuntime, FieldValue, HttpRuntime, LifecycleState,
        RuntimeRegistry, Transport, TransportConfig, TransportError, TransportEvent,
        TransportResult,
    };
}
