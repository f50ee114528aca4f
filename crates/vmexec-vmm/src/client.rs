//! The Unix-Socket HTTP Client: a minimal HTTP/1.1 client speaking directly
//! to a Firecracker API socket, with per-request deadlines.
//!
//! Grounded in existing Firecracker SDKs (`rik-org/firepilot`,
//! `kanpov/fctools`), which reach for a `hyper` client over a Unix socket for
//! exactly this purpose.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use vmexec_core::error::ExecutorError;

/// Capability-set abstraction over the Firecracker API socket so the VMM
/// Lifecycle Manager can be driven by an in-memory fake in tests.
#[async_trait]
pub trait FirecrackerApiClient: Send + Sync {
    /// `GET /`, true iff any HTTP response (of any status) came back before
    /// `timeout`. Used for readiness polling — any response at all means the
    /// socket is accepting connections, regardless of status.
    async fn probe_ready(&self, socket_path: &Path, timeout: Duration) -> bool;

    /// `PUT <path>` with a JSON body, returning the response status.
    async fn put_json(
        &self,
        socket_path: &Path,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<StatusCode, ExecutorError>;
}

/// Real client backed by `hyper` + `hyperlocal` over a `UnixStream`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFirecrackerApiClient;

impl RealFirecrackerApiClient {
    fn client(&self) -> Client<hyperlocal::UnixConnector, Full<Bytes>> {
        Client::builder(TokioExecutor::new()).build(hyperlocal::UnixConnector)
    }

    async fn request(
        &self,
        socket_path: &Path,
        method: Method,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<StatusCode, ExecutorError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(socket_path, path).into();
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(body))
            .map_err(|e| ExecutorError::from(anyhow::anyhow!("building request: {e}")))?;

        let client = self.client();
        let result = tokio::time::timeout(timeout, client.request(request)).await;
        match result {
            Ok(Ok(response)) => {
                let status = response.status();
                let _ = response.into_body().collect().await;
                Ok(status)
            }
            Ok(Err(e)) => Err(ExecutorError::from(anyhow::anyhow!("Firecracker API request failed: {e}"))),
            Err(_) => Err(ExecutorError::ApiTimeout {
                task_id: socket_path.display().to_string(),
            }),
        }
    }
}

#[async_trait]
impl FirecrackerApiClient for RealFirecrackerApiClient {
    async fn probe_ready(&self, socket_path: &Path, timeout: Duration) -> bool {
        self.request(socket_path, Method::GET, "/", Bytes::new(), timeout)
            .await
            .is_ok()
    }

    async fn put_json(
        &self,
        socket_path: &Path,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<StatusCode, ExecutorError> {
        let bytes = Bytes::from(serde_json::to_vec(body).expect("serde_json::Value always serializes"));
        self.request(socket_path, Method::PUT, path, bytes, timeout).await
    }
}
