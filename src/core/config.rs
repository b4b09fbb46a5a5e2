//! Target configuration input: JSON specs from the command line, the
//! plaintext-secret guard, and partial updates.

use std::io::{IsTerminal, Read};
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store;

/// Keys whose values would be secrets stored in plain text. Credentials are
/// referenced (identity file, agent, keychain entry), never embedded.
const PLAINTEXT_SECRET_KEYS: &[&str] = &["password", "passphrase", "privateKey", "secret"];

/// Read a JSON spec given inline, as `@path`, or as `-` for stdin.
pub fn read_json_spec_to_string(spec: &str) -> Result<String> {
    if spec.trim() == "-" {
        let mut stdin = std::io::stdin();
        if stdin.is_terminal() {
            return Err(Error::validation_invalid_argument(
                "json",
                "Cannot read JSON from stdin when stdin is a TTY",
                None,
                None,
            ));
        }
        let mut buf = String::new();
        stdin
            .read_to_string(&mut buf)
            .map_err(|e| Error::internal_io(e.to_string(), Some("read stdin".to_string())))?;
        return Ok(buf);
    }

    match spec.strip_prefix('@') {
        Some(path) if path.trim().is_empty() => Err(Error::validation_invalid_argument(
            "json",
            "Invalid JSON spec '@' (missing file path)",
            None,
            None,
        )),
        Some(path) => store::read_text(Path::new(path))?.ok_or_else(|| {
            Error::validation_invalid_argument(
                "json",
                format!("JSON spec file not found: {}", path),
                Some(path.to_string()),
                None,
            )
        }),
        None => Ok(spec.to_string()),
    }
}

/// Parse a JSON spec into a document, refusing inline secrets.
pub(crate) fn parse_spec(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::validation_invalid_json(e, Some("parse json".to_string())))?;
    reject_plaintext_secrets(&value)?;
    Ok(value)
}

/// Walk a JSON document and refuse anything that looks like an inline secret.
pub(crate) fn reject_plaintext_secrets(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => map.iter().try_for_each(|(key, child)| {
            if PLAINTEXT_SECRET_KEYS.contains(&key.as_str()) && !child.is_null() {
                return Err(Error::config_plaintext_secret(key.clone()));
            }
            reject_plaintext_secrets(child)
        }),
        Value::Array(items) => items.iter().try_for_each(reject_plaintext_secrets),
        _ => Ok(()),
    }
}

/// Apply a partial update to `existing`. Returns the top-level keys touched.
pub(crate) fn apply_patch<T: Serialize + DeserializeOwned>(
    existing: &mut T,
    patch: Value,
) -> Result<Vec<String>> {
    let touched: Vec<String> = match &patch {
        Value::Object(obj) if !obj.is_empty() => obj.keys().cloned().collect(),
        Value::Object(_) => {
            return Err(Error::validation_invalid_argument(
                "json",
                "Update cannot be empty",
                None,
                None,
            ))
        }
        _ => {
            return Err(Error::validation_invalid_argument(
                "json",
                "Update must be a JSON object",
                None,
                None,
            ))
        }
    };
    reject_plaintext_secrets(&patch)?;

    let mut document = serde_json::to_value(&*existing)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize target".to_string())))?;
    overlay(&mut document, patch);
    *existing = serde_json::from_value(document)
        .map_err(|e| Error::validation_invalid_json(e, Some("apply update".to_string())))?;

    Ok(touched)
}

/// Objects merge key by key and `null` removes a key. Anything else,
/// arrays included, replaces: step lists are ordered.
fn overlay(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(fields), Value::Object(changes)) => {
            for (key, value) in changes {
                if value.is_null() {
                    fields.remove(&key);
                } else {
                    overlay(fields.entry(key).or_insert(Value::Null), value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Up to three known ids close to a mistyped one: ids extending it first,
/// then ids within two edits.
pub(crate) fn similar_ids(wanted: &str, known: &[String]) -> Vec<String> {
    let wanted = wanted.to_lowercase();
    let mut scored: Vec<(usize, &String)> = known
        .iter()
        .filter_map(|id| {
            let lower = id.to_lowercase();
            if lower == wanted {
                None
            } else if lower.starts_with(&wanted) || lower.ends_with(&wanted) {
                Some((0, id))
            } else {
                let distance = edit_distance(&wanted, &lower);
                (distance <= 2).then_some((distance, id))
            }
        })
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, id)| id.clone()).collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = (above + 1).min(row[j] + 1).min(diagonal + usize::from(ca != *cb));
            diagonal = above;
        }
    }
    row[b.len()]
}
