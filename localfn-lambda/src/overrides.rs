//! Best-effort JSON parsing for optional settings
//!
//! Environment overrides and schedule inputs are optional; a malformed value
//! is logged and treated as absent instead of failing the process.

use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Parse `raw` as JSON, logging and returning `None` when it is malformed
pub fn parse_json(raw: &str, what: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(source = %what, error = %e, "Ignoring malformed JSON");
            None
        }
    }
}

/// Parse a JSON object of environment overrides.
///
/// Scalar values are stringified; nested values are skipped. Anything other
/// than an object is ignored.
pub fn parse_env_overrides(raw: &str) -> Option<HashMap<String, String>> {
    if raw.trim().is_empty() {
        return None;
    }

    let Value::Object(map) = parse_json(raw, "environment overrides")? else {
        warn!("Ignoring environment overrides that are not a JSON object");
        return None;
    };

    let overrides = map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Number(n) => Some((key, n.to_string())),
            Value::Bool(b) => Some((key, b.to_string())),
            Value::Null => Some((key, String::new())),
            _ => {
                warn!(key = %key, "Skipping non-scalar environment override");
                None
            }
        })
        .collect();

    Some(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json() {
        assert_eq!(parse_json(r#"{"a":1}"#, "test"), Some(json!({"a": 1})));
        assert_eq!(parse_json("{not json", "test"), None);
        assert_eq!(parse_json("", "test"), None);
    }

    #[test]
    fn test_parse_env_overrides() {
        let overrides =
            parse_env_overrides(r#"{"TABLE":"users","RETRIES":3,"DEBUG":true,"NESTED":{"x":1}}"#)
                .unwrap();

        assert_eq!(overrides.len(), 3);
        assert_eq!(overrides["TABLE"], "users");
        assert_eq!(overrides["RETRIES"], "3");
        assert_eq!(overrides["DEBUG"], "true");
    }

    #[test]
    fn test_malformed_overrides_are_ignored() {
        assert_eq!(parse_env_overrides("{\"TABLE\":"), None);
        assert_eq!(parse_env_overrides("[1, 2]"), None);
        assert_eq!(parse_env_overrides("   "), None);
    }
}
