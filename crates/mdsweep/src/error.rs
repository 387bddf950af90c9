//! CLI error types with miette diagnostics.
//!
//! Maps core errors into user-facing diagnostics with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use mdsweep_core::CoreError;

/// Exit codes for process termination.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("Invalid request: {reason}")]
    #[diagnostic(
        code(mdsweep::usage),
        help(
            "Commands have the form: <command> [| <filter chain>] [> <attr, ...>]\n\
             Separate multiple commands with ';'."
        )
    )]
    Usage { reason: String },

    #[error("Authentication failed on {target}: {message}")]
    #[diagnostic(
        code(mdsweep::auth_failed),
        help("Verify the username and password, and that the account has API access.")
    )]
    AuthFailed { target: String, message: String },

    #[error("Could not reach {target}: {message}")]
    #[diagnostic(
        code(mdsweep::connection_failed),
        help(
            "Check that the manager is running and accessible.\n\
             Self-signed certificates are accepted unless --verify is set."
        )
    )]
    ConnectionFailed { target: String, message: String },

    #[error("Fleet discovery failed")]
    #[diagnostic(
        code(mdsweep::discovery),
        help("The manager must answer 'show switches'; check the -f filter expression.")
    )]
    Discovery {
        #[source]
        source: CoreError,
    },

    #[error("Backup failed")]
    #[diagnostic(code(mdsweep::backup))]
    Backup {
        #[source]
        source: CoreError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(mdsweep::core))]
    Core(CoreError),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage { .. } => exit_code::USAGE,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::FilterCompile { .. }
            | CoreError::TaskParse { .. }
            | CoreError::ShellFilter { .. }
            | CoreError::BackupTarget { .. } => CliError::Usage {
                reason: err.to_string(),
            },
            other => CliError::Core(other),
        }
    }
}
