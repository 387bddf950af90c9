// ── Task model ──
//
// A task is one CLI command plus the optional shaping applied to its
// output. Tasks are built once from the request text before anything is
// scheduled and shared read-only across all workers.

use crate::error::CoreError;
use crate::filter::FilterChain;

/// How a task reaches the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecMode {
    /// Single request against the management API.
    #[default]
    Api,
    /// Command line typed into the interactive shell; filters are
    /// rendered into the command itself.
    Shell,
}

/// One command with optional output shaping.
#[derive(Debug, Clone)]
pub struct Task {
    pub command: String,
    pub filter: Option<FilterChain>,
    pub attrs: Option<Vec<String>>,
    pub mode: ExecMode,
}

impl Task {
    /// Build a task, rejecting combinations that cannot dispatch:
    /// shell mode with a structured-path filter stage is a configuration
    /// error, caught here rather than at a device.
    pub fn new(
        command: impl Into<String>,
        filter: Option<FilterChain>,
        attrs: Option<Vec<String>>,
        mode: ExecMode,
    ) -> Result<Self, CoreError> {
        let command = command.into();
        if command.is_empty() {
            return Err(CoreError::TaskParse {
                message: "empty command".into(),
            });
        }
        if mode == ExecMode::Shell {
            if let Some(chain) = &filter {
                if chain.has_path_stage() {
                    return Err(CoreError::ShellFilter {
                        message: format!(
                            "command '{command}' runs in shell mode but its filter \
                             contains a structured-path stage"
                        ),
                    });
                }
            }
        }
        Ok(Self {
            command,
            filter,
            attrs,
            mode,
        })
    }

    /// Parse a `;`-separated task list.
    ///
    /// Each entry has the form `<command> | <filter chain> > <attr, ...>`,
    /// where both the chain and the attribute list are optional. The first
    /// `|` separates the command from its chain; the chain itself may
    /// contain further `|`-separated stages.
    pub fn parse_list(text: &str, mode: ExecMode) -> Result<Vec<Self>, CoreError> {
        let mut tasks = Vec::new();
        for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (spec, attrs) = match entry.split_once('>') {
                Some((spec, attrs)) => {
                    let attrs: Vec<String> = attrs
                        .split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(ToOwned::to_owned)
                        .collect();
                    (spec, Some(attrs))
                }
                None => (entry, None),
            };
            let (command, filter) = match spec.split_once('|') {
                Some((command, chain)) => (command.trim(), Some(FilterChain::compile(chain)?)),
                None => (spec.trim(), None),
            };
            tasks.push(Self::new(command, filter, attrs, mode)?);
        }
        if tasks.is_empty() {
            return Err(CoreError::TaskParse {
                message: "no commands given".into(),
            });
        }
        Ok(tasks)
    }

    /// The full command line for shell-mode execution, with the filter
    /// chain rendered into the device's own output-filter syntax.
    pub fn shell_command_line(&self) -> Result<String, CoreError> {
        match &self.filter {
            Some(chain) if !chain.is_empty() => {
                Ok(format!("{} | {}", self.command, chain.to_shell()?))
            }
            _ => Ok(self.command.clone()),
        }
    }
}
