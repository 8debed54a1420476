use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    ExecutionRuntime, RuntimeId, RuntimeSink, SendRequest, TransportError, TransportResult,
};

/// Size of each body chunk; one progress signal is reported per chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

/// Execution runtime that posts the blob over HTTP with reqwest
pub struct HttpRuntime {
    id: RuntimeId,
    client: reqwest::Client,
    inflight: Mutex<Option<JoinHandle<()>>>,
    last_status: Arc<AtomicU16>,
}

impl HttpRuntime {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            id: RuntimeId::new(),
            client,
            inflight: Mutex::new(None),
            last_status: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Use a caller-chosen runtime id
    pub fn with_id(mut self, id: RuntimeId) -> Self {
        self.id = id;
        self
    }

    fn build(&self, request: SendRequest, sink: RuntimeSink) -> TransportResult<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::invalid(format!("Invalid HTTP method: {}", request.method)))?;

        if request.allow_credentials {
            debug!("Credential inclusion has no effect for the HTTP runtime");
        }

        let mut builder = self.client.request(method, &request.server);
        for (name, value) in request.headers.to_wire_pairs() {
            builder = builder.header(name, value);
        }

        let content_type = request
            .blob
            .content_type
            .clone()
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        let total = request.blob.size();
        let body = progress_body(request.blob.data.clone(), sink);

        if request.send_as_binary {
            return Ok(builder
                .query(&request.form_fields.to_wire_pairs())
                .header(CONTENT_TYPE, content_type)
                .body(body));
        }

        let mut form = Form::new();
        for (name, value) in request.form_fields.to_wire_pairs() {
            form = form.text(name, value);
        }
        let file = Part::stream_with_length(body, total)
            .file_name(request.filename.clone())
            .mime_str(&content_type)?;
        form = form.part(request.file_field_name.clone(), file);

        Ok(builder.multipart(form))
    }
}

impl Default for HttpRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream the payload in fixed chunks, reporting the sent ratio as each
/// chunk is handed to the connection
fn progress_body(data: Bytes, sink: RuntimeSink) -> reqwest::Body {
    let total = data.len();
    let stream = async_stream::stream! {
        let mut sent = 0usize;
        while sent < total {
            let end = (sent + CHUNK_SIZE).min(total);
            let chunk = data.slice(sent..end);
            sent = end;
            yield Ok::<Bytes, std::io::Error>(chunk);
            sink.progress(sent as f64 / total as f64);
        }
    };
    reqwest::Body::wrap_stream(stream)
}

#[async_trait]
impl ExecutionRuntime for HttpRuntime {
    fn id(&self) -> &RuntimeId {
        &self.id
    }

    async fn init(&self) -> TransportResult<()> {
        self.last_status.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, request: SendRequest, sink: RuntimeSink) -> TransportResult<()> {
        let success_status = request.success_status;
        let server = request.server.clone();
        let builder = self.build(request, sink.clone())?;
        let last_status = self.last_status.clone();

        let handle = tokio::spawn(async move {
            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    last_status.store(status, Ordering::Relaxed);

                    let accepted = match success_status {
                        Some(expected) => status == expected,
                        None => (200..300).contains(&status),
                    };
                    if accepted {
                        debug!("Upload to {} finished with {}", server, status);
                        sink.load();
                    } else {
                        warn!("Upload to {} rejected with {}", server, status);
                        sink.error("http");
                    }
                }
                Err(e) => {
                    warn!("Upload to {} failed: {}", server, e);
                    sink.error("http");
                }
            }
        });

        if let Some(previous) = self.inflight.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn abort(&self) -> TransportResult<()> {
        if let Some(handle) = self.inflight.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    async fn destroy(&self) -> TransportResult<()> {
        self.abort().await?;
        self.last_status.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn status(&self) -> TransportResult<u16> {
        Ok(self.last_status.load(Ordering::Relaxed))
    }
}
