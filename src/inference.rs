//! Client contract for the external embedding worker.
//!
//! The worker is an opaque collaborator: it receives the prepared image
//! buffer and streams an embedding artifact back. The response body is
//! streamed straight into the destination sink so large artifacts are never
//! buffered in memory.

use crate::store::ArtifactSink;
use bytes::Bytes;
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Errors from the external inference call.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Could not build or send the request.
    #[error("inference request failed: {0}")]
    Transport(String),

    /// The call exceeded the configured timeout.
    #[error("inference service timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered with a non-success status; the upstream error
    /// body is carried verbatim.
    #[error("inference service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Writing the response stream into the sink failed.
    #[error("failed to stream artifact: {0}")]
    Sink(String),
}

/// Contract to the external model service.
pub trait InferenceClient: Send + Sync {
    /// Streams `image` to the service and the response body into `sink`.
    /// `filename` is the output-path hint for the worker. Returns the number
    /// of artifact bytes written.
    fn invoke(
        &self,
        image: Bytes,
        filename: &str,
        sink: &mut ArtifactSink,
    ) -> impl Future<Output = Result<u64, InferenceError>> + Send;
}

/// [`InferenceClient`] implementation over HTTP.
pub struct HttpInferenceClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpInferenceClient {
    /// Creates a client for the worker at `url` with the given call timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Transport(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    fn map_request_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout(self.timeout)
        } else {
            InferenceError::Transport(e.to_string())
        }
    }
}

impl InferenceClient for HttpInferenceClient {
    async fn invoke(
        &self,
        image: Bytes,
        filename: &str,
        sink: &mut ArtifactSink,
    ) -> Result<u64, InferenceError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-Output-Filename", filename)
            .body(image)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_request_error(e))?;
            sink.write_all(&chunk)
                .await
                .map_err(|e| InferenceError::Sink(e.to_string()))?;
            written += chunk.len() as u64;
        }
        sink.shutdown()
            .await
            .map_err(|e| InferenceError::Sink(e.to_string()))?;

        debug!(bytes = written, "inference artifact streamed");
        Ok(written)
    }
}
