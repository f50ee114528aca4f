//! In-memory fake for [`FirecrackerApiClient`], so the VMM Lifecycle Manager
//! can be exercised without a real Firecracker binary or socket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hyper::StatusCode;
use vmexec_core::error::ExecutorError;

use crate::client::FirecrackerApiClient;

/// Configurable fake: readiness can be delayed by a probe count (to exercise
/// polling) or made to never arrive (to exercise `ApiTimeout`); each `PUT`
/// path can be given a canned status, defaulting to `204 No Content`.
pub struct FakeFirecrackerApiClient {
    probes_until_ready: Option<u32>,
    probe_count: Mutex<u32>,
    put_status: Mutex<HashMap<String, StatusCode>>,
    put_calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeFirecrackerApiClient {
    /// Ready on the very first probe.
    pub fn ready_immediately() -> Self {
        Self::new(Some(0))
    }

    /// Never responds to a probe — used to exercise `ApiTimeout`.
    pub fn never_ready() -> Self {
        Self::new(None)
    }

    /// Ready only once `probe_ready` has been called at least `after`
    /// times — used to exercise the poll loop without a real deadline.
    pub fn ready_after(after: u32) -> Self {
        Self::new(Some(after))
    }

    fn new(probes_until_ready: Option<u32>) -> Self {
        Self {
            probes_until_ready,
            probe_count: Mutex::new(0),
            put_status: Mutex::new(HashMap::new()),
            put_calls: Mutex::new(Vec::new()),
        }
    }

    /// Force a specific `PUT <path>` to return a given status, e.g. a
    /// non-204 to exercise `START_FAILED`.
    pub fn set_put_status(&self, path: &str, status: StatusCode) {
        self.put_status.lock().unwrap().insert(path.to_string(), status);
    }

    pub fn put_calls(&self) -> Vec<(String, serde_json::Value)> {
        self.put_calls.lock().unwrap().clone()
    }

    pub fn was_put(&self, path: &str) -> bool {
        self.put_calls.lock().unwrap().iter().any(|(p, _)| p == path)
    }
}

#[async_trait]
impl FirecrackerApiClient for FakeFirecrackerApiClient {
    async fn probe_ready(&self, _socket_path: &Path, _timeout: Duration) -> bool {
        let mut count = self.probe_count.lock().unwrap();
        *count += 1;
        match self.probes_until_ready {
            Some(needed) => *count > needed,
            None => false,
        }
    }

    async fn put_json(
        &self,
        _socket_path: &Path,
        path: &str,
        body: &serde_json::Value,
        _timeout: Duration,
    ) -> Result<StatusCode, ExecutorError> {
        self.put_calls.lock().unwrap().push((path.to_string(), body.clone()));
        Ok(self
            .put_status
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(StatusCode::NO_CONTENT))
    }
}
