// ── Core error types ──
//
// Compile-time failures (filter syntax, task text) are separated from
// per-target runtime failures: the former abort a run before any worker
// is scheduled, the latter stay confined to one target's result stream.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Compile-time (before any I/O) ────────────────────────────────
    #[error("invalid filter expression '{expression}': {message}")]
    FilterCompile { expression: String, message: String },

    #[error("invalid task: {message}")]
    TaskParse { message: String },

    #[error("filter has no shell equivalent: {message}")]
    ShellFilter { message: String },

    // ── Per-target runtime ───────────────────────────────────────────
    #[error("filter evaluation failed: {message}")]
    FilterEval { message: String },

    #[error("script execution failed: {message}")]
    Script { message: String },

    #[error("backup to {destination} failed: {message}")]
    Backup {
        destination: String,
        message: String,
    },

    #[error("invalid backup destination: {message}")]
    BackupTarget { message: String },

    /// Session-layer failure (auth, transport, protocol, shell).
    #[error(transparent)]
    Session(#[from] mdsweep_api::Error),

    // ── Internal ─────────────────────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` when retrying with the same credentials cannot
    /// succeed; looping workers end instead of re-dialing.
    pub fn is_auth_fatal(&self) -> bool {
        matches!(self, Self::Session(e) if e.is_auth_fatal())
    }
}
