//! Result output.
//!
//! Projects each device's payload to plain text lines and writes them
//! either to stdout (with a per-device label on stderr, so labels survive
//! output redirection) or to one appendable log file per device.

use std::fs::OpenOptions;
use std::io::Write;

use mdsweep_core::{SweepResult, project};

use crate::error::CliError;

/// Where sweep results go.
pub enum SweepWriter {
    Stdout,
    Files { prefix: String },
}

impl SweepWriter {
    pub fn new(prefix: Option<String>) -> Self {
        match prefix {
            Some(prefix) => Self::Files { prefix },
            None => Self::Stdout,
        }
    }

    /// Write one result. Errors land on stderr; payloads are projected to
    /// lines and written to the chosen sink.
    pub fn write(&self, result: &SweepResult) -> Result<(), CliError> {
        let payload = match &result.outcome {
            Err(e) => {
                eprintln!("**Error: running against {}: {e}", result.target);
                return Ok(());
            }
            Ok(payload) => payload,
        };

        let mut lines = Vec::new();
        for value in payload {
            lines.extend(project(value, None).map_err(CliError::from)?);
        }

        match self {
            Self::Stdout => {
                eprintln!("*** Controller {}", result.target);
                let mut stdout = std::io::stdout().lock();
                for line in &lines {
                    writeln!(stdout, "{line}")?;
                }
            }
            Self::Files { prefix } => {
                let fname = format!("{prefix}{}.log", result.target);
                eprintln!("*** Controller {} [ {fname} ]", result.target);
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&fname)?;
                for line in &lines {
                    writeln!(file, "{line}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn files_mode_appends_per_device_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("sweep-").to_string_lossy().into_owned();
        let writer = SweepWriter::new(Some(prefix.clone()));

        let result = SweepResult {
            target: "10.0.0.1".into(),
            outcome: Ok(vec![json!(["line one", "line two"])]),
        };
        writer.write(&result).expect("write");
        writer.write(&result).expect("append");

        let contents = std::fs::read_to_string(format!("{prefix}10.0.0.1.log")).expect("read");
        assert_eq!(contents, "line one\nline two\nline one\nline two\n");
    }

    #[test]
    fn errors_do_not_create_output_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("sweep-").to_string_lossy().into_owned();
        let writer = SweepWriter::new(Some(prefix.clone()));

        let result = SweepResult {
            target: "10.0.0.9".into(),
            outcome: Err(mdsweep_core::CoreError::Internal("boom".into())),
        };
        writer.write(&result).expect("write");
        assert!(!std::path::Path::new(&format!("{prefix}10.0.0.9.log")).exists());
    }
}
