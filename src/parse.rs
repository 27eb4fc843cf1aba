//! Tolerant parsing of upstream response bodies.
//!
//! Several upstreams return JSONP-wrapped payloads from endpoints that
//! predate their JSON APIs, and one of them serves plain-http URLs inside
//! otherwise-https payloads. Both quirks are normalized here before the
//! body reaches any caller.

use serde_json::Value;

use crate::error::AppError;

/// Parses a response body as JSON, falling back to stripping a JSONP
/// callback wrapper (`callbackName({...})`) when the direct parse fails.
pub fn loose_json(raw: &str) -> Result<Value, AppError> {
    if let Ok(value) = serde_json::from_str(raw) {
        return Ok(value);
    }
    let inner = raw
        .find('(')
        .and_then(|open| raw.rfind(')').map(|close| (open, close)))
        .filter(|(open, close)| open < close)
        .map(|(open, close)| raw[open + 1..close].trim());
    match inner {
        Some(body) => serde_json::from_str(body)
            .map_err(|error| AppError::upstream(format!("malformed upstream response: {error}"))),
        None => Err(AppError::upstream("malformed upstream response".to_string())),
    }
}

/// Same as [`loose_json`], rewriting insecure URLs to https first.
pub fn loose_json_https(raw: &str) -> Result<Value, AppError> {
    loose_json(&raw.replace("http://", "https://"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_parses_directly() {
        assert_eq!(loose_json(r#"{"a":1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn jsonp_wrapper_is_stripped() {
        let value = loose_json(r#"seasonListCallback({"a":1})"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn nested_parentheses_survive_the_strip() {
        let value = loose_json(r#"cb({"title":"(untitled)"})"#).unwrap();
        assert_eq!(value, json!({"title": "(untitled)"}));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let error = loose_json("not json at all").unwrap_err();
        assert_eq!(error.code(), 502);
    }

    #[test]
    fn insecure_urls_are_upgraded() {
        let value = loose_json_https(r#"{"cover":"http://img.example.com/1.png"}"#).unwrap();
        assert_eq!(value["cover"], "https://img.example.com/1.png");
    }
}
