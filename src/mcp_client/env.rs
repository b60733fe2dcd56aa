//! Environment-variable expansion and `.env` loading.
//!
//! Expands `${VAR}` and `${VAR:-default}` inside strings and, recursively,
//! inside arbitrary JSON configuration values. Expansion never fails: an unset
//! variable becomes its default or the empty string.

use std::path::Path;

use serde_json::Value;

// ─── String expansion ────────────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in `text` using the process environment.
pub fn expand(text: &str) -> String {
    expand_with(text, &process_lookup, &mut Vec::new())
}

/// Like [`expand`], also recording names referenced without a default that
/// were unset.
pub fn expand_reporting(text: &str, unset: &mut Vec<String>) -> String {
    expand_with(text, &process_lookup, unset)
}

fn process_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Expand references in `input`, resolving names through `lookup`.
///
/// Defaults are inserted verbatim and never re-expanded. Malformed references
/// (`${}`, an unterminated `${`) are kept as literal text.
pub fn expand_with(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    unset: &mut Vec<String>,
) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            // Unterminated: keep the remainder as-is
            result.push_str(&rest[start..]);
            return result;
        };

        let expr = &after[..end];
        match resolve_var_expr(expr, lookup, unset) {
            Some(value) => result.push_str(&value),
            None => {
                result.push_str("${");
                result.push_str(expr);
                result.push('}');
            }
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}

/// Resolve `VAR` or `VAR:-default`. Returns `None` for a malformed expression.
fn resolve_var_expr(
    expr: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    unset: &mut Vec<String>,
) -> Option<String> {
    let (name, default) = match expr.find(":-") {
        Some(idx) => (&expr[..idx], Some(&expr[idx + 2..])),
        None => (expr, None),
    };

    if !is_var_name(name) {
        return None;
    }

    if let Some(value) = lookup(name) {
        return Some(value);
    }

    match default {
        Some(default) => Some(default.to_string()),
        None => {
            if !unset.iter().any(|n| n == name) {
                unset.push(name.to_string());
            }
            Some(String::new())
        }
    }
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

// ─── Structured expansion ────────────────────────────────────────────────────

/// Expand every string inside `value`, preserving its shape.
///
/// Mapping keys are left untouched; numbers, booleans, and null pass through.
pub fn expand_config(value: Value) -> Value {
    expand_config_reporting(value, &mut Vec::new())
}

/// Like [`expand_config`], also recording unset variable names.
pub fn expand_config_reporting(value: Value, unset: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => Value::String(expand_reporting(&s, unset)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| expand_config_reporting(item, unset))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, expand_config_reporting(item, unset)))
                .collect(),
        ),
        scalar @ (Value::Null | Value::Bool(_) | Value::Number(_)) => scalar,
    }
}

// ─── .env loading ────────────────────────────────────────────────────────────

/// File name of the project-level env file.
pub const DOTENV_FILE: &str = ".env";

/// Load `<dir>/.env` into the process environment.
///
/// Variables already present in the environment are never overridden.
/// Returns the names that were set. A missing file is not an error.
pub fn load_project_env(dir: &Path) -> Vec<String> {
    load_env_file(&dir.join(DOTENV_FILE))
}

/// Load one env file; see [`load_project_env`].
pub fn load_env_file(path: &Path) -> Vec<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read env file");
            return Vec::new();
        }
    };

    let mut loaded = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let Some(entry) = parse_env_line(line) else {
            continue;
        };
        let (key, value) = match entry {
            Ok(kv) => kv,
            Err(()) => {
                tracing::warn!(path = %path.display(), line = idx + 1, "skipping malformed env line");
                continue;
            }
        };

        if std::env::var_os(&key).is_some() {
            continue;
        }
        std::env::set_var(&key, &value);
        loaded.push(key);
    }

    if !loaded.is_empty() {
        tracing::debug!(path = %path.display(), count = loaded.len(), "loaded env file");
    }
    loaded
}

/// Parse one `.env` line. `None` for blank lines and comments.
fn parse_env_line(line: &str) -> Option<Result<(String, String), ()>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let Some((key, raw_value)) = trimmed.split_once('=') else {
        return Some(Err(()));
    };

    let key = key.trim();
    let valid_key = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_key {
        return Some(Err(()));
    }

    Some(Ok((key.to_string(), parse_env_value(raw_value.trim()))))
}

fn parse_env_value(raw: &str) -> String {
    if raw.len() >= 2 {
        if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
            return inner
                .replace("\\n", "\n")
                .replace("\\\"", "\"")
                .replace("\\\\", "\\");
        }
        if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            return inner.to_string();
        }
    }

    // Unquoted: drop a trailing ` # comment`
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_string(),
        None => raw.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
