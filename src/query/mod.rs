//! Named-parameter templates (`?name`) rewritten into positional statements (`$1`).
//!
//! A template is scanned once. Outside quoted regions a `?` that follows a
//! starter character opens a parameter; name characters extend it and a
//! terminator character closes it, at which point the name is replaced by the
//! next positional placeholder. Quoted content passes through untouched.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

const STARTERS: &str = " =,(<>+-*%/";
const TERMINATORS: &str = " ;),<>+-*%/";
const QUOTES: &str = "\"'`";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error("empty query template")]
    Empty,

    #[error("malformed query template, quote at statement boundary: {0}")]
    QuotedStatement(String),

    #[error("Parameters can not be unnamed, hint: ?paramname")]
    UnnamedParameter,

    #[error("missing substitution for: {0}")]
    MissingParameter(String),
}

/// Argument bag for a template: direct parameters first, then the value
/// bags of a batched statement in order.
#[derive(Debug, Clone, Default)]
pub struct NamedArgs {
    pub parameters: HashMap<String, Value>,
    pub values: Vec<HashMap<String, Value>>,
}

impl NamedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.parameters.insert(name.to_string(), value.into());
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.parameters
            .get(name)
            .or_else(|| self.values.iter().find_map(|bag| bag.get(name)))
    }
}

/// A template with its parameters replaced by positional placeholders.
/// Holds no argument values, so it can be cached by template text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTemplate {
    pub sql: String,
    pub names: Vec<String>,
}

impl PreparedTemplate {
    pub fn parse(template: &str) -> Result<Self, RewriteError> {
        let normalized: String = template
            .chars()
            .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
            .collect();
        let mut query = normalized.trim().to_string();
        if query.is_empty() {
            return Err(RewriteError::Empty);
        }
        if !query.ends_with(';') {
            query.push(';');
        }

        let chars: Vec<char> = query.chars().collect();
        if let (Some(first), Some(last)) = (chars.first(), chars.last())
            && (QUOTES.contains(*first) || QUOTES.contains(*last))
        {
            return Err(RewriteError::QuotedStatement(query));
        }

        let mut sql = String::with_capacity(query.len());
        let mut names = Vec::new();
        let (mut in_double, mut in_single, mut in_backtick) = (false, false, false);
        // Byte offset in `sql` of the open parameter's `?`.
        let mut open: Option<usize> = None;
        let mut param = String::new();

        for (i, &c) in chars.iter().enumerate() {
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };
            let escaped = prev == Some('\\');

            if let Some(start) = open {
                if is_name_char(c) {
                    param.push(c);
                    sql.push(c);
                    continue;
                }

                open = None;
                if param.is_empty() {
                    if TERMINATORS.contains(c) {
                        return Err(RewriteError::UnnamedParameter);
                    }
                } else if TERMINATORS.contains(c) {
                    names.push(std::mem::take(&mut param));
                    sql.truncate(start);
                    sql.push_str(&format!("${}", names.len()));
                }
                // Anything else leaves the text as written.
                param.clear();
            }

            match c {
                '"' if !escaped && !in_single && !in_backtick => in_double = !in_double,
                '\'' if !escaped && !in_double && !in_backtick => in_single = !in_single,
                '`' if !escaped && !in_double && !in_single => in_backtick = !in_backtick,
                _ => {}
            }
            if in_double || in_single || in_backtick || QUOTES.contains(c) {
                sql.push(c);
                continue;
            }

            if c == '?' && prev.is_some_and(|p| STARTERS.contains(p)) {
                open = Some(sql.len());
            }
            sql.push(c);
        }

        Ok(Self { sql, names })
    }

    /// Resolve the ordered argument list for this template.
    pub fn bind(&self, args: &NamedArgs) -> Result<Vec<Value>, RewriteError> {
        self.names
            .iter()
            .map(|name| {
                args.lookup(name)
                    .cloned()
                    .ok_or_else(|| RewriteError::MissingParameter(name.clone()))
            })
            .collect()
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Output of [`rewrite`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rewritten {
    pub sql: String,
    pub args: Vec<Value>,
    pub names: Vec<String>,
}

/// Rewrite a named-parameter template into a positional statement plus its
/// ordered arguments.
pub fn rewrite(template: &str, args: &NamedArgs) -> Result<Rewritten, RewriteError> {
    let prepared = PreparedTemplate::parse(template)?;
    let args = prepared.bind(args)?;
    Ok(Rewritten {
        sql: prepared.sql,
        args,
        names: prepared.names,
    })
}
