// ── Filter chains ──
//
// The query/filter DSL shared by fleet discovery and command execution.
// A chain is a `|`-separated list of stages, each either a structured-path
// expression over the response tree or a line-oriented text filter
// (`include` / `exclude` / `begin`, matching the device CLI's own output
// filters). Chains compile before any network I/O and evaluate as pure
// functions of the input tree.

mod path;
mod project;

use serde_json::Value;

pub use path::PathExpr;
pub use project::project;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Path(PathExpr),
    Include(String),
    Exclude(String),
    Begin(String),
}

/// A compiled chain of filter stages. Immutable once compiled; stateless
/// during evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    stages: Vec<Stage>,
}

impl FilterChain {
    /// Compile a textual chain. An empty chain is legal and evaluates as
    /// the identity.
    pub fn compile(text: &str) -> Result<Self, CoreError> {
        let mut stages = Vec::new();
        for part in text.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            stages.push(compile_stage(part)?);
        }
        Ok(Self { stages })
    }

    /// Whether the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Append all of `other`'s stages after this chain's.
    pub fn extend(&mut self, other: FilterChain) {
        self.stages.extend(other.stages);
    }

    /// Whether any stage is a structured-path expression (and the chain
    /// therefore cannot run in shell mode).
    pub fn has_path_stage(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Path(_)))
    }

    /// Evaluate the chain left to right.
    ///
    /// Before a structured-path stage, a top-level sequence is rewrapped
    /// as `{"_": seq}` so path expressions always address a rooted record
    /// (`$._[...]`). Line stages project the current value to text lines
    /// first and yield a sequence of lines.
    pub fn eval(&self, value: Value) -> Result<Value, CoreError> {
        let mut current = value;
        for stage in &self.stages {
            current = match stage {
                Stage::Path(expr) => expr.eval(&wrap_top_level(current))?,
                Stage::Include(text) => filter_lines(&current, |line| line.contains(text))?,
                Stage::Exclude(text) => filter_lines(&current, |line| !line.contains(text))?,
                Stage::Begin(text) => {
                    let lines = project(&current, None)?;
                    let start = lines.iter().position(|line| line.contains(text));
                    let tail = match start {
                        Some(i) => lines[i..].to_vec(),
                        None => Vec::new(),
                    };
                    lines_value(tail)
                }
            };
        }
        Ok(current)
    }

    /// Render the chain as the device CLI's own output-filter suffix
    /// (`include "x" | begin "y"`). Structured-path stages have no shell
    /// equivalent; chains containing one are rejected here, which callers
    /// check before dispatching any shell-mode work.
    pub fn to_shell(&self) -> Result<String, CoreError> {
        let mut parts = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let part = match stage {
                Stage::Include(text) => format!("include \"{text}\""),
                Stage::Exclude(text) => format!("exclude \"{text}\""),
                Stage::Begin(text) => format!("begin \"{text}\""),
                Stage::Path(expr) => {
                    return Err(CoreError::ShellFilter {
                        message: format!("'{}' is a structured-path stage", expr.source()),
                    });
                }
            };
            parts.push(part);
        }
        Ok(parts.join(" | "))
    }
}

fn compile_stage(part: &str) -> Result<Stage, CoreError> {
    if let Some((keyword, text)) = line_stage(part) {
        return Ok(match keyword {
            LineKeyword::Include => Stage::Include(text),
            LineKeyword::Exclude => Stage::Exclude(text),
            LineKeyword::Begin => Stage::Begin(text),
        });
    }
    // Predicate shorthand: `?(...)` applies to every element of the
    // top-level sequence, which evaluation always wraps under "_".
    let expr = if part.starts_with("?(") {
        format!("$._[{part}]")
    } else {
        part.to_owned()
    };
    PathExpr::compile(&expr).map(Stage::Path)
}

#[derive(Clone, Copy)]
enum LineKeyword {
    Include,
    Exclude,
    Begin,
}

/// Recognize a line-filter stage. The keyword may be abbreviated to any
/// non-empty prefix (`inc "x"`, `ex "y"`), as on the device CLI itself.
fn line_stage(part: &str) -> Option<(LineKeyword, String)> {
    let word = part.split_whitespace().next()?.to_ascii_lowercase();
    let keyword = [
        ("include", LineKeyword::Include),
        ("exclude", LineKeyword::Exclude),
        ("begin", LineKeyword::Begin),
    ]
    .into_iter()
    .find(|(full, _)| full.starts_with(&word))?;
    Some((keyword.1, stage_text(part)))
}

/// Everything after the keyword, with one layer of quotes stripped.
/// No argument at all is legal and means the empty string.
fn stage_text(part: &str) -> String {
    let Some((_, rest)) = part.split_once(char::is_whitespace) else {
        return String::new();
    };
    let text = rest.trim();
    if (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
        || (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2)
    {
        text[1..text.len() - 1].to_owned()
    } else {
        text.to_owned()
    }
}

fn filter_lines(value: &Value, keep: impl Fn(&str) -> bool) -> Result<Value, CoreError> {
    let lines = project(value, None)?;
    Ok(lines_value(
        lines.into_iter().filter(|line| keep(line)).collect(),
    ))
}

fn lines_value(lines: Vec<String>) -> Value {
    Value::Array(lines.into_iter().map(Value::String).collect())
}

/// Rewrap a bare top-level sequence under a single-key record so path
/// expressions can address it as `$._`.
fn wrap_top_level(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut map = serde_json::Map::with_capacity(1);
            map.insert("_".to_owned(), Value::Array(items));
            Value::Object(map)
        }
        other => other,
    }
}
