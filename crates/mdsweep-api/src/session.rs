// Device session lifecycle
//
// One `DeviceSession` owns the authenticated relationship to one managed
// device: HTTPS login/logout, show-command and configuration calls, and an
// optional SSH shell channel. Sessions are exclusively owned by their
// worker -- there is no interior locking because there is no sharing.

use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::normalize::normalize_keys;
use crate::shell::ShellConn;
use crate::transport::TransportConfig;

/// A cached API token is refreshed once it has gone unused this long,
/// even if the session cookie has not technically expired yet.
const STALENESS_WINDOW_SECS: i64 = 300;

/// Login credentials, shared by value across all sessions of a sweep.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// Where on a target the management surfaces live.
///
/// Production controllers serve the API on `https://{target}:4343/v1` and
/// the shell on port 22; tests point the API scheme/port at a mock server.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub scheme: &'static str,
    pub api_port: u16,
    pub ssh_port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            scheme: "https",
            api_port: 4343,
            ssh_port: 22,
        }
    }
}

impl Endpoint {
    /// API base URL for a target, e.g. `https://10.0.0.1:4343/v1`.
    pub fn base_url(&self, target: &str) -> Result<Url, Error> {
        Url::parse(&format!("{}://{target}:{}/v1", self.scheme, self.api_port))
            .map_err(Error::InvalidUrl)
    }
}

/// Parsed login envelope. Only the token matters; `status_str` feeds
/// error messages when the token is missing.
#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    #[serde(rename = "_global_result")]
    global_result: LoginResult,
}

#[derive(Debug, Default, Deserialize)]
struct LoginResult {
    #[serde(rename = "UIDARUBA", default)]
    uidaruba: String,
    #[serde(rename = "status_str", default)]
    status_str: String,
}

/// State of one authenticated API session.
#[derive(Debug)]
struct ApiToken {
    token: String,
    /// Expiry reported by the `SESSION` cookie, when the controller sent one.
    expires_at: Option<DateTime<Utc>>,
    last_used: DateTime<Utc>,
}

impl ApiToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if now - self.last_used > TimeDelta::seconds(STALENESS_WINDOW_SECS) {
            return false;
        }
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

/// One authenticated relationship to one managed device.
pub struct DeviceSession {
    target: String,
    credentials: Credentials,
    http: reqwest::Client,
    base_url: Url,
    ssh_addr: (String, u16),
    ssh_timeout: std::time::Duration,
    api: Option<ApiToken>,
    shell: Option<ShellConn>,
}

impl DeviceSession {
    /// Create an unauthenticated session. No I/O happens until
    /// [`dial`](Self::dial) or the first request.
    pub fn new(
        target: impl Into<String>,
        credentials: Credentials,
        endpoint: &Endpoint,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let target = target.into();
        let base_url = endpoint.base_url(&target)?;
        let http = transport.build_client()?;
        Ok(Self {
            ssh_addr: (target.clone(), endpoint.ssh_port),
            ssh_timeout: transport.timeout,
            target,
            credentials,
            http,
            base_url,
            api: None,
            shell: None,
        })
    }

    /// Create a session with a pre-built `reqwest::Client`.
    ///
    /// The scheduler builds one client per sweep and hands it to every
    /// session so connection pools are shared.
    pub fn with_client(
        target: impl Into<String>,
        credentials: Credentials,
        endpoint: &Endpoint,
        http: reqwest::Client,
        ssh_timeout: std::time::Duration,
    ) -> Result<Self, Error> {
        let target = target.into();
        let base_url = endpoint.base_url(&target)?;
        Ok(Self {
            ssh_addr: (target.clone(), endpoint.ssh_port),
            ssh_timeout,
            target,
            credentials,
            http,
            base_url,
            api: None,
            shell: None,
        })
    }

    /// The device address this session talks to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Ensure a live API session.
    ///
    /// A token that is both younger than the staleness window and inside
    /// its cookie expiry is reused as-is. Otherwise the stale token is
    /// logged out (failures are logged, never fatal) and a fresh login is
    /// performed.
    pub async fn dial(&mut self) -> Result<(), Error> {
        let now = Utc::now();
        if self.api.as_ref().is_some_and(|t| t.is_fresh(now)) {
            return Ok(());
        }
        if let Some(stale) = self.api.take() {
            debug!(target = %self.target, "session stale, re-authenticating");
            if let Err(e) = self.logout_token(&stale.token).await {
                warn!(target = %self.target, error = %e, "logout of stale session failed");
            }
        }
        self.login().await
    }

    async fn login(&mut self) -> Result<(), Error> {
        let url = self.endpoint_url("api/login")?;
        debug!(target = %self.target, "logging in");

        let resp = self
            .http
            .post(url)
            .form(&[
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.expose_secret()),
            ])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Authentication {
                message: format!(
                    "login rejected for user {} on {} (HTTP {status})",
                    self.credentials.username, self.target
                ),
            });
        }

        // Capture the cookie expiry before the body consumes the response.
        let expires_at = session_cookie_expiry(resp.headers());

        let body = resp.text().await.map_err(Error::Transport)?;
        let envelope: LoginEnvelope = serde_json::from_str(&body).map_err(|_| {
            Error::Deserialization {
                message: format!(
                    "expected login envelope, got: {}",
                    &body[..body.len().min(200)]
                ),
            }
        })?;

        let result = envelope.global_result;
        if result.uidaruba.is_empty() {
            return Err(Error::Authentication {
                message: format!(
                    "no session token in login response from {} ({})",
                    self.target,
                    if result.status_str.is_empty() {
                        "no status"
                    } else {
                        result.status_str.as_str()
                    }
                ),
            });
        }

        debug!(target = %self.target, "login successful");
        self.api = Some(ApiToken {
            token: result.uidaruba,
            expires_at,
            last_used: Utc::now(),
        });
        Ok(())
    }

    async fn logout_token(&self, token: &str) -> Result<(), Error> {
        let mut url = self.endpoint_url("api/logout")?;
        url.query_pairs_mut().append_pair("UIDARUBA", token);

        let resp = self.http.get(url).send().await.map_err(Error::Transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol {
                status: status.as_u16(),
                message: format!("logout returned HTTP {status}"),
            });
        }
        Ok(())
    }

    /// Run a show command and return its normalized output tree.
    pub async fn show(&mut self, command: &str) -> Result<Value, Error> {
        self.get("/mm", "showcommand", &[("command", command)]).await
    }

    /// Generic GET against the configuration API.
    pub async fn get(
        &mut self,
        cfg_path: &str,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, Error> {
        self.request(reqwest::Method::GET, cfg_path, endpoint, params, None)
            .await
    }

    /// Generic POST against the configuration API.
    pub async fn post(
        &mut self,
        cfg_path: &str,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, Error> {
        self.request(reqwest::Method::POST, cfg_path, endpoint, &[], body)
            .await
    }

    async fn request(
        &mut self,
        method: reqwest::Method,
        cfg_path: &str,
        endpoint: &str,
        params: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, Error> {
        self.dial().await?;
        let token = self
            .api
            .as_ref()
            .map(|t| t.token.clone())
            .unwrap_or_default();

        let endpoint = endpoint.trim_start_matches('/');
        let mut url = self.endpoint_url(&format!("configuration/{endpoint}"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("config_path", cfg_path);
            query.append_pair("json", "1");
            query.append_pair("UIDARUBA", &token);
            for (k, v) in params {
                query.append_pair(k, v);
            }
        }
        debug!(target = %self.target, %method, %url, "api request");

        let mut builder = self
            .http
            .request(method, url)
            .header(reqwest::header::COOKIE, format!("SESSION={token}"))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(Error::Transport)?;
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: format!("session rejected by {} (HTTP 401)", self.target),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Protocol {
                status: status.as_u16(),
                message: body[..body.len().min(200)].to_owned(),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        let decoded: Value =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: format!("{e} (body preview: {:?})", &body[..body.len().min(200)]),
            })?;

        if let Some(token) = self.api.as_mut() {
            token.last_used = Utc::now();
        }
        Ok(normalize_keys(decoded))
    }

    /// Run a command line through the device's interactive shell.
    ///
    /// The shell channel is dialed lazily on first use and re-dialed when
    /// it crosses the staleness window; it is never opened as a side
    /// effect of API-mode execution.
    pub async fn exec_shell(
        &mut self,
        command_line: &str,
        stdin: Option<&str>,
    ) -> Result<String, Error> {
        if self.shell.as_ref().is_some_and(ShellConn::is_stale) {
            if let Some(stale) = self.shell.take() {
                if let Err(e) = stale.close().await {
                    warn!(target = %self.target, error = %e, "closing stale shell failed");
                }
            }
        }
        if self.shell.is_none() {
            let (host, port) = &self.ssh_addr;
            let conn = ShellConn::connect(
                host,
                *port,
                &self.credentials.username,
                &self.credentials.password,
                self.ssh_timeout,
            )
            .await?;
            self.shell = Some(conn);
        }

        let conn = self.shell.as_mut().ok_or_else(|| Error::Shell {
            target: self.target.clone(),
            message: "shell channel unavailable".into(),
        })?;
        conn.exec(command_line, stdin).await
    }

    /// Close the session: API logout and shell teardown, in that order.
    ///
    /// Both are attempted even if the first fails; the first failure is
    /// surfaced. Idempotent -- calling on an already-closed session is a
    /// no-op.
    pub async fn close(&mut self) -> Result<(), Error> {
        let mut first_err = None;

        if let Some(api) = self.api.take() {
            if let Err(e) = self.logout_token(&api.token).await {
                first_err = Some(e);
            }
        }
        if let Some(shell) = self.shell.take() {
            if let Err(e) = shell.close().await {
                first_err = first_err.or(Some(e));
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Build `{base}/{path}` without `Url::join` path-segment surprises.
    fn endpoint_url(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(Error::InvalidUrl)
    }
}

/// Pull the expiry out of a `SESSION` cookie, if the login response set one.
///
/// `Max-Age` wins over `Expires` per RFC 6265; both are optional.
fn session_cookie_expiry(headers: &reqwest::header::HeaderMap) -> Option<DateTime<Utc>> {
    for header in headers.get_all(reqwest::header::SET_COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        let mut parts = raw.split(';').map(str::trim);
        let Some(pair) = parts.next() else { continue };
        if !pair.starts_with("SESSION=") {
            continue;
        }
        let mut max_age = None;
        let mut expires = None;
        for attr in parts {
            if let Some(secs) = attr.strip_prefix("Max-Age=").or_else(|| attr.strip_prefix("max-age=")) {
                max_age = secs.parse::<i64>().ok();
            } else if let Some(date) = attr.strip_prefix("Expires=").or_else(|| attr.strip_prefix("expires=")) {
                expires = DateTime::parse_from_rfc2822(&date.replace("GMT", "+0000"))
                    .ok()
                    .map(|d| d.with_timezone(&Utc));
            }
        }
        if let Some(secs) = max_age {
            return Some(Utc::now() + TimeDelta::seconds(secs));
        }
        if expires.is_some() {
            return expires;
        }
    }
    None
}
