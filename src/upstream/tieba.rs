//! tieba (Baidu forum) client API.
//!
//! Everything is a form-urlencoded POST. The signature is the UPPERCASE
//! MD5 of the sorted `key=value` pairs joined with `&` and then stripped
//! of every `&` byte (value-embedded ones included), followed by a fixed
//! salt; the pairs are deliberately not percent-encoded because the
//! upstream verifies the raw bytes.

use md5::{Digest, Md5};
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::error::AppError;
use crate::net::{ensure_success, read_text, HttpClient, RetryPolicy};
use crate::parse;
use crate::url::{self, Params};

const SALT: &[u8] = b"tiebaclient!!!";
const HOST: &str = "http://c.tieba.baidu.com";
const CLIENT_VERSION: &str = "9.9.8.32";

/// UPPERCASE MD5 hex over the sorted pairs with every `&` byte stripped,
/// including ones inside values, plus the salt.
pub fn signature(params: &Params) -> String {
    let mut hasher = Md5::new();
    hasher.update(params.raw_query().replace('&', "").as_bytes());
    hasher.update(SALT);
    hex::encode_upper(hasher.finalize())
}

/// Renders the signed request body: `&`-joined sorted raw pairs with
/// `sign` appended last.
pub fn sign_body(params: &Params) -> String {
    format!("{}&sign={}", params.raw_query(), signature(params))
}

fn random_client_id<R: Rng>(rng: &mut R) -> String {
    format!(
        "wappc_{:013}_{:03}",
        rng.gen_range(0..10_000_000_000_000_u64),
        rng.gen_range(0..1000_u32)
    )
}

pub struct TiebaClient {
    http: HttpClient,
    retry: RetryPolicy,
}

impl TiebaClient {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
        }
    }

    async fn post_form(&self, path: &str, mut params: Params) -> Result<Value, AppError> {
        params.insert("_client_id", random_client_id(&mut rand::thread_rng()));
        params.insert("_client_type", 2);
        params.insert("_client_version", CLIENT_VERSION);
        let body = sign_body(&params);
        let request = self
            .http
            .client()
            .post(url::build(HOST, path, &Params::new()))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body);
        let response = self.http.send_retrying(request, &self.retry).await?;
        let response = ensure_success(response).await?;
        let text = read_text(response).await?;
        parse::loose_json(&text)
    }

    pub async fn post_list(&self, name: &str, page: i64, size: i64) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("kw", name);
        params.insert("pn", page);
        params.insert("rn", size);
        self.post_form("c/f/frs/page", params).await
    }

    pub async fn post_detail(
        &self,
        tid: i64,
        page: i64,
        size: i64,
        reversed: bool,
    ) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("kz", tid);
        params.insert("pn", page);
        params.insert("rn", size);
        if reversed {
            params.insert("last", 1);
            params.insert("r", 1);
        }
        self.post_form("c/f/pb/page", params).await
    }

    pub async fn user_profile(&self, uid: i64) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("uid", uid);
        params.insert("need_post_count", 1);
        params.insert("has_plist", 1);
        self.post_form("c/u/user/profile", params).await
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn signature_matches_known_digest() {
        let mut params = Params::new();
        params.insert("kw", "rust");
        params.insert("pn", 1);
        params.insert("rn", 50);
        params.insert("_client_id", "wappc_1234567890123_123");
        params.insert("_client_type", 2);
        params.insert("_client_version", CLIENT_VERSION);
        assert_eq!(signature(&params), "A25D5EEB41B5414683652CA91135F582");
    }

    #[test]
    fn ampersands_inside_values_are_stripped_from_the_digest() {
        // md5("kw=abpn=1" + salt); the & in the value vanishes too
        let mut params = Params::new();
        params.insert("kw", "a&b");
        params.insert("pn", 1);
        assert_eq!(signature(&params), "A94BAE1A42237B788A8FA14767ACE5A0");
    }

    #[test]
    fn body_ends_with_sign_and_stays_unencoded() {
        let mut params = Params::new();
        params.insert("kw", "rust language");
        params.insert("pn", 1);
        let body = sign_body(&params);
        assert!(body.starts_with("kw=rust language&pn=1&sign="));
        assert_eq!(body.split("&sign=").nth(1).unwrap().len(), 32);
    }

    #[test]
    fn client_id_has_the_wappc_shape() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let id = random_client_id(&mut rng);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "wappc");
        assert_eq!(parts[1].len(), 13);
        assert_eq!(parts[2].len(), 3);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
    }
}
