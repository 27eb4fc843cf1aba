//! URL construction for upstream requests.
//!
//! Upstream endpoints are written as path templates (`x/v2/view`,
//! `weapi/v1/artist/{artist_id}`); `build` substitutes `{name}` placeholders
//! from the parameter map and renders the rest as a query string. Parameter
//! keys are kept lexicographically sorted so the query string fed into the
//! signing schemes is deterministic.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::Url;

/// A query/form parameter value reduced to its underlying primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(value) => f.write_str(value),
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Bool(value) => f.write_str(if *value { "true" } else { "false" }),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// An ordered parameter mapping. Null/absent values are never stored, so a
/// `key=` pair can never leak into a URL or a signing string.
#[derive(Debug, Clone, Default)]
pub struct Params {
    entries: BTreeMap<String, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) -> &mut Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    /// Inserts only when the value is present.
    pub fn insert_opt(&mut self, key: &str, value: Option<impl Into<ParamValue>>) -> &mut Self {
        if let Some(value) = value {
            self.insert(key, value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.entries.iter()
    }

    /// Percent-encoded `k=v` pairs joined by `&`, keys ascending.
    pub fn encoded_query(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(&value.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// `k=v` pairs joined by `&` WITHOUT percent-encoding, keys ascending.
    /// Some upstreams validate signatures over the raw concatenation.
    pub fn raw_query(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

}

/// Substitutes `{name}` placeholders in a path template. A placeholder with
/// no matching parameter is a programming error in the endpoint definition.
fn substitute(template: &str, params: &Params) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let end = tail
            .find('}')
            .unwrap_or_else(|| panic!("unterminated placeholder in path template `{template}`"));
        let name = &tail[..end];
        let value = params
            .get(name)
            .unwrap_or_else(|| panic!("missing parameter `{name}` for path template `{template}`"));
        out.push_str(&value.to_string());
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Composes a base host and a path template into a full URL. Every parameter
/// is rendered into the query string, including ones consumed by a path
/// placeholder - the upstreams this gateway talks to expect it that way.
pub fn build(base: &str, template: &str, params: &Params) -> Url {
    let path = substitute(template, params);
    let base_url =
        Url::parse(base).unwrap_or_else(|error| panic!("invalid upstream base `{base}`: {error}"));
    let mut url = base_url
        .join(&path)
        .unwrap_or_else(|error| panic!("invalid endpoint path `{path}`: {error}"));
    if !params.is_empty() {
        url.set_query(Some(&params.encoded_query()));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_params_are_omitted() {
        let mut params = Params::new();
        params.insert("a", 1);
        params.insert_opt("b", None::<i64>);
        let url = build("http://example.com", "path", &params);
        assert_eq!(url.as_str(), "http://example.com/path?a=1");
        assert!(!url.as_str().contains("b="));
    }

    #[test]
    fn placeholders_are_substituted_and_kept_in_query() {
        let mut params = Params::new();
        params.insert("site", "cn");
        params.insert("duration", 3);
        let url = build(
            "https://bangumi.example.com",
            "jsonp/season_rank_list/{site}/{duration}.ver",
            &params,
        );
        assert_eq!(url.path(), "/jsonp/season_rank_list/cn/3.ver");
        assert_eq!(url.query(), Some("duration=3&site=cn"));
    }

    #[test]
    #[should_panic(expected = "missing parameter")]
    fn missing_placeholder_parameter_fails_fast() {
        let params = Params::new();
        build("http://example.com", "user/{id}", &params);
    }

    #[test]
    fn query_keys_are_sorted_regardless_of_insertion_order() {
        let mut forward = Params::new();
        forward.insert("aid", 2);
        forward.insert("build", 507000);
        forward.insert("device", "android");

        let mut reversed = Params::new();
        reversed.insert("device", "android");
        reversed.insert("build", 507000);
        reversed.insert("aid", 2);

        assert_eq!(forward.encoded_query(), reversed.encoded_query());
        assert_eq!(forward.encoded_query(), "aid=2&build=507000&device=android");
    }

    #[test]
    fn raw_query_skips_percent_encoding() {
        let mut params = Params::new();
        params.insert("kw", "hello world");
        assert_eq!(params.raw_query(), "kw=hello world");
        assert_eq!(params.encoded_query(), "kw=hello%20world");
    }

    #[test]
    fn enum_like_values_reduce_to_primitives() {
        let mut params = Params::new();
        params.insert("adult", true);
        params.insert("order", "hot");
        assert_eq!(params.raw_query(), "adult=true&order=hot");
    }
}
