// Structured-path expressions.
//
// A small JSONPath-flavored query language over `serde_json::Value`:
// rooted at `$`, with dot/bracket child access, numeric indexing
// (negative counts from the end), `[*]`, and `[?(@.Field <op> literal)]`
// element filters. Compilation is strict -- anything the grammar does not
// cover fails before a single request is issued.

use serde_json::Value;

use crate::error::CoreError;

/// One compiled path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    source: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// `.name` or `['name']`
    Child(String),
    /// `[n]`, negative counts from the end
    Index(i64),
    /// `[*]`
    Wildcard,
    /// `[?(@.path <op> literal)]`
    Filter(Predicate),
}

#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    path: Vec<String>,
    op: CmpOp,
    literal: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl PathExpr {
    /// Compile a path expression.
    pub fn compile(text: &str) -> Result<Self, CoreError> {
        let err = |message: &str| CoreError::FilterCompile {
            expression: text.to_owned(),
            message: message.to_owned(),
        };

        let mut rest = text.trim();
        rest = rest
            .strip_prefix('$')
            .ok_or_else(|| err("path must start with '$'"))?;

        let mut segments = Vec::new();
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(after.len());
                if end == 0 {
                    return Err(err("expected field name after '.'"));
                }
                segments.push(Segment::Child(after[..end].to_owned()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let (inner, tail) = split_bracket(after).ok_or_else(|| err("unclosed '['"))?;
                segments.push(parse_bracket(inner.trim()).map_err(|m| err(&m))?);
                rest = tail;
            } else {
                return Err(err("expected '.' or '[' segment"));
            }
        }

        Ok(Self {
            source: text.trim().to_owned(),
            segments,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a tree, producing the selected subtree.
    pub fn eval(&self, root: &Value) -> Result<Value, CoreError> {
        let err = |message: String| CoreError::FilterEval {
            message: format!("{message} (in '{}')", self.source),
        };

        let mut current = root.clone();
        for segment in &self.segments {
            current = match segment {
                Segment::Child(name) => match current {
                    Value::Object(mut map) => map
                        .remove(name)
                        .ok_or_else(|| err(format!("key '{name}' not found")))?,
                    other => {
                        return Err(err(format!(
                            "cannot select field '{name}' of {}",
                            kind(&other)
                        )));
                    }
                },
                Segment::Index(i) => match current {
                    Value::Array(mut items) => {
                        let len = i64::try_from(items.len())
                            .map_err(|_| err("sequence too large".into()))?;
                        let idx = if *i < 0 { len + i } else { *i };
                        let idx = usize::try_from(idx).ok().filter(|&n| n < items.len());
                        match idx {
                            Some(n) => items.swap_remove(n),
                            None => {
                                return Err(err(format!(
                                    "index {i} out of bounds for sequence of {len}"
                                )));
                            }
                        }
                    }
                    other => {
                        return Err(err(format!("cannot index into {}", kind(&other))));
                    }
                },
                Segment::Wildcard => match current {
                    Value::Array(items) => Value::Array(items),
                    other => return Err(err(format!("'[*]' applied to {}", kind(&other)))),
                },
                Segment::Filter(pred) => match current {
                    Value::Array(items) => Value::Array(
                        items.into_iter().filter(|item| pred.matches(item)).collect(),
                    ),
                    other => {
                        return Err(err(format!("'[?(...)]' applied to {}", kind(&other))));
                    }
                },
            };
        }
        Ok(current)
    }
}

/// Split bracket content from the remainder. Handles the `[?(...)]` form,
/// whose predicate closes with `)]`, separately from plain `[...]`.
fn split_bracket(after_open: &str) -> Option<(&str, &str)> {
    if after_open.trim_start().starts_with("?(") {
        let close = after_open.find(")]")?;
        Some((&after_open[..=close], &after_open[close + 2..]))
    } else {
        let close = after_open.find(']')?;
        Some((&after_open[..close], &after_open[close + 1..]))
    }
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(pred) = inner.strip_prefix("?(") {
        let pred = pred
            .strip_suffix(')')
            .ok_or_else(|| "unterminated predicate".to_owned())?;
        return Ok(Segment::Filter(parse_predicate(pred.trim())?));
    }
    if (inner.starts_with('\'') && inner.ends_with('\'') && inner.len() >= 2)
        || (inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2)
    {
        return Ok(Segment::Child(inner[1..inner.len() - 1].to_owned()));
    }
    inner
        .parse::<i64>()
        .map(Segment::Index)
        .map_err(|_| format!("expected index, '*', quoted key, or '?(...)', got '{inner}'"))
}

fn parse_predicate(text: &str) -> Result<Predicate, String> {
    // Two-character operators first so '<=' is not read as '<'.
    const OPS: [(&str, CmpOp); 6] = [
        ("==", CmpOp::Eq),
        ("!=", CmpOp::Ne),
        ("<=", CmpOp::Le),
        (">=", CmpOp::Ge),
        ("<", CmpOp::Lt),
        (">", CmpOp::Gt),
    ];
    let (pos, (token, op)) = OPS
        .iter()
        .filter_map(|candidate| text.find(candidate.0).map(|pos| (pos, *candidate)))
        .min_by_key(|(pos, (token, _))| (*pos, std::cmp::Reverse(token.len())))
        .ok_or_else(|| "predicate needs a comparison operator".to_owned())?;

    let lhs = text[..pos].trim();
    let rhs = text[pos + token.len()..].trim();

    let path = lhs
        .strip_prefix("@.")
        .ok_or_else(|| format!("predicate operand must be '@.field', got '{lhs}'"))?;
    if path.is_empty() {
        return Err("predicate operand must name a field".to_owned());
    }
    let path: Vec<String> = path.split('.').map(ToOwned::to_owned).collect();
    if path.iter().any(String::is_empty) {
        return Err(format!("empty field segment in '@.{}'", path.join(".")));
    }

    Ok(Predicate {
        path,
        op,
        literal: parse_literal(rhs)?,
    })
}

fn parse_literal(text: &str) -> Result<Value, String> {
    if (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2)
        || (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
    {
        return Ok(Value::String(text[1..text.len() - 1].to_owned()));
    }
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    serde_json::from_str::<serde_json::Number>(text)
        .map(Value::Number)
        .map_err(|_| format!("cannot parse literal '{text}'"))
}

impl Predicate {
    fn matches(&self, item: &Value) -> bool {
        let mut current = item;
        for name in &self.path {
            match current.get(name) {
                Some(v) => current = v,
                None => return false,
            }
        }
        compare(current, self.op, &self.literal)
    }
}

/// Elements whose field has a different type than the literal never match,
/// not even `!=` -- a missing or mistyped field is "unknown", not "unequal".
fn compare(actual: &Value, op: CmpOp, literal: &Value) -> bool {
    match (actual, literal) {
        (Value::String(a), Value::String(b)) => ordered(op, a.as_str().cmp(b.as_str())),
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => match op {
                CmpOp::Eq => (a - b).abs() < f64::EPSILON,
                CmpOp::Ne => (a - b).abs() >= f64::EPSILON,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            },
            _ => false,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => false,
        },
        (Value::Null, Value::Null) => matches!(op, CmpOp::Eq),
        _ => false,
    }
}

fn ordered(op: CmpOp, ordering: std::cmp::Ordering) -> bool {
    match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Ne => ordering.is_ne(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "a record",
        Value::Array(_) => "a sequence",
        Value::String(_) => "a string",
        Value::Number(_) => "a number",
        Value::Bool(_) => "a boolean",
        Value::Null => "null",
    }
}
