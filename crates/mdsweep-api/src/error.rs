use thiserror::Error;

/// Top-level error type for the `mdsweep-api` crate.
///
/// Covers every failure mode of a device session: authentication,
/// transport, protocol-level rejections, and the SSH shell channel.
/// `mdsweep-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login failed (wrong credentials, missing session token, expired session).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout).
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Protocol ────────────────────────────────────────────────────
    /// The controller answered with a non-success HTTP status.
    #[error("API request failed (HTTP {status}): {message}")]
    Protocol { status: u16, message: String },

    /// JSON decoding of a response body failed.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    // ── Shell channel ───────────────────────────────────────────────
    /// SSH transport failure.
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// The remote shell rejected or aborted a command.
    #[error("Shell command failed on {target}: {message}")]
    Shell { target: String, message: String },
}

impl Error {
    /// Returns `true` if this error means the credentials themselves are
    /// bad -- re-dialing with the same credentials cannot succeed.
    pub fn is_auth_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}
