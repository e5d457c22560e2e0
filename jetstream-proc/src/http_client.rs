//! The remote-call collaborator interface (spec §1, §6: "the remote HTTP
//! client used by one procedure flavor" is an out-of-core-scope
//! collaborator). This crate ships the trait only; no implementation — an
//! embedder wires up whatever HTTP client it already depends on.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteCallError;

/// A fully-evaluated remote call, every expression placeholder substituted
/// (spec §4.5 step 2).
#[derive(Debug, Clone)]
pub struct RemoteCallSpec {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct RemoteCallResponse {
    pub status: u16,
    pub body: Value,
}

/// `call({url, method, headers, body}) -> (statusCode, responseBody, err)`
/// (spec §6's HTTP client contract), recast as a fallible async call.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call(&self, req: RemoteCallSpec) -> Result<RemoteCallResponse, RemoteCallError>;
}

/// Test double recording every call it receives, for exercising procedure
/// execution (spec §4.5 step 2/3) without pulling a real HTTP client crate
/// into the dependency tree (SPEC_FULL §5). Gated behind `test-util` rather
/// than `cfg(test)` so integration tests in `tests/` — compiled against the
/// crate as an ordinary dependent, not with `cfg(test)` set — can see it too.
#[cfg(any(test, feature = "test-util"))]
pub struct NoopHttpClient {
    pub calls: std::sync::Mutex<Vec<RemoteCallSpec>>,
    pub response: RemoteCallResponse,
}

#[cfg(any(test, feature = "test-util"))]
impl NoopHttpClient {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            response: RemoteCallResponse { status: 200, body: Value::Null },
        }
    }

    pub fn calls(&self) -> Vec<RemoteCallSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for NoopHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl HttpClient for NoopHttpClient {
    async fn call(&self, req: RemoteCallSpec) -> Result<RemoteCallResponse, RemoteCallError> {
        self.calls.lock().unwrap().push(req);
        Ok(self.response.clone())
    }
}
