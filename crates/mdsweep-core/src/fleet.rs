// ── Fleet session seams ──
//
// The scheduler never names `DeviceSession` directly: workers run against
// `FleetSession`, and sessions are minted through `SessionFactory`. The
// production factory hands every session one shared `reqwest::Client` so
// a sweep of thousands of targets reuses one connection pool. Scripting
// collaborators get the narrower, object-safe `SessionApi` slice.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use mdsweep_api::{Credentials, DeviceSession, Endpoint, Error as ApiError, TransportConfig};

/// Narrow session surface loaned to scripting collaborators.
///
/// Object-safe so a `ScriptSet` can hold the session behind `dyn`; the
/// boxed futures are the price of that.
pub trait SessionApi: Send {
    /// The device address this session talks to.
    fn target(&self) -> &str;

    /// GET against the configuration API.
    fn api_get<'a>(
        &'a mut self,
        cfg_path: &'a str,
        endpoint: &'a str,
        params: Vec<(String, String)>,
    ) -> BoxFuture<'a, Result<Value, ApiError>>;

    /// POST against the configuration API.
    fn api_post<'a>(
        &'a mut self,
        cfg_path: &'a str,
        endpoint: &'a str,
        body: Option<Value>,
    ) -> BoxFuture<'a, Result<Value, ApiError>>;
}

/// Full per-worker session surface.
pub trait FleetSession: SessionApi {
    /// Ensure a live API session, re-authenticating if stale.
    fn dial(&mut self) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Run a show command, returning the normalized output tree.
    fn show(&mut self, command: &str) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// Run a command line through the device's interactive shell.
    fn exec_shell(
        &mut self,
        command_line: &str,
        stdin: Option<&str>,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;

    /// Tear the session down; idempotent.
    fn close(&mut self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Mints one session per target.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: FleetSession + Send + 'static;

    /// Create an unauthenticated session for a target. No I/O.
    fn session(&self, target: &str) -> Result<Self::Session, ApiError>;
}

// ── Production factory ──────────────────────────────────────────────

/// Builds `DeviceSession`s that share one HTTP client.
pub struct ControllerFactory {
    credentials: Credentials,
    endpoint: Endpoint,
    http: reqwest::Client,
    ssh_timeout: Duration,
}

impl ControllerFactory {
    pub fn new(
        credentials: Credentials,
        endpoint: Endpoint,
        transport: &TransportConfig,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            credentials,
            endpoint,
            http: transport.build_client()?,
            ssh_timeout: transport.timeout,
        })
    }
}

impl SessionFactory for ControllerFactory {
    type Session = DeviceSession;

    fn session(&self, target: &str) -> Result<DeviceSession, ApiError> {
        DeviceSession::with_client(
            target,
            self.credentials.clone(),
            &self.endpoint,
            self.http.clone(),
            self.ssh_timeout,
        )
    }
}

// ── Trait impls for the real session ────────────────────────────────

impl SessionApi for DeviceSession {
    fn target(&self) -> &str {
        DeviceSession::target(self)
    }

    fn api_get<'a>(
        &'a mut self,
        cfg_path: &'a str,
        endpoint: &'a str,
        params: Vec<(String, String)>,
    ) -> BoxFuture<'a, Result<Value, ApiError>> {
        Box::pin(async move {
            let borrowed: Vec<(&str, &str)> = params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            self.get(cfg_path, endpoint, &borrowed).await
        })
    }

    fn api_post<'a>(
        &'a mut self,
        cfg_path: &'a str,
        endpoint: &'a str,
        body: Option<Value>,
    ) -> BoxFuture<'a, Result<Value, ApiError>> {
        Box::pin(async move { self.post(cfg_path, endpoint, body.as_ref()).await })
    }
}

impl FleetSession for DeviceSession {
    async fn dial(&mut self) -> Result<(), ApiError> {
        DeviceSession::dial(self).await
    }

    async fn show(&mut self, command: &str) -> Result<Value, ApiError> {
        DeviceSession::show(self, command).await
    }

    async fn exec_shell(
        &mut self,
        command_line: &str,
        stdin: Option<&str>,
    ) -> Result<String, ApiError> {
        DeviceSession::exec_shell(self, command_line, stdin).await
    }

    async fn close(&mut self) -> Result<(), ApiError> {
        DeviceSession::close(self).await
    }
}
