//! picacomic ("bika") API.
//!
//! Every call is signed with an HMAC-SHA256 over the lowercased
//! concatenation of path-with-query (no leading slash), timestamp,
//! nonce, HTTP method and a fixed API key, sent as request headers.
//! Authenticated calls additionally carry a session token obtained from
//! `auth/sign-in`; the token is a JWT whose `exp` is checked before
//! reuse, and refresh is serialized behind a mutex so concurrent
//! requests never trigger redundant logins.

use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::AppError;
use crate::net::{ensure_success, read_text, HttpClient, RetryPolicy};
use crate::parse;
use crate::url::{self, Params};

const DIGEST_KEY: &[u8] = b"~d}$Q7$eIni=V)9\\RK/P.RM4;9[7|@/CA}b~OW!3?EV`:<>M7pddUBL5n|0/*Cn";
const API_KEY: &str = "C69BAF41DA5ABD1FFEDC6D2FEA56B";
const API_HOST: &str = "https://picaapi.picacomic.com/";

/// Fixed client identity headers the upstream expects on every request.
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("API-Key", HeaderValue::from_static(API_KEY));
    headers.insert("App-Channel", HeaderValue::from_static("2"));
    headers.insert("App-Version", HeaderValue::from_static("2.2.1.2.3.3"));
    headers.insert("App-Build-Version", HeaderValue::from_static("44"));
    headers.insert("App-UUID", HeaderValue::from_static("defaultUuid"));
    headers.insert(
        "Accept",
        HeaderValue::from_static("application/vnd.picacomic.com.v1+json"),
    );
    headers.insert("App-Platform", HeaderValue::from_static("android"));
    headers.insert("User-Agent", HeaderValue::from_static("okhttp/3.8.1"));
    headers.insert(
        "Content-Type",
        HeaderValue::from_static("application/json; charset=UTF-8"),
    );
    headers
}

/// HMAC-SHA256 hex over the lowercased signing string.
pub fn signature(path_and_query: &str, time: &str, nonce: &str, method: &str) -> String {
    let message = format!(
        "{}{time}{nonce}{method}{API_KEY}",
        path_and_query.trim_start_matches('/')
    )
    .to_lowercase();
    let mut mac =
        Hmac::<Sha256>::new_from_slice(DIGEST_KEY).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn token_expired(token: &str) -> bool {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    match jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data.claims.exp <= Utc::now().timestamp(),
        Err(_) => true,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ResultSort {
    #[serde(rename = "dd")]
    DateDescending,
    #[serde(rename = "da")]
    DateAscending,
    #[serde(rename = "ld")]
    LikeDescending,
    #[serde(rename = "vd")]
    ViewsDescending,
}

impl ResultSort {
    fn as_str(self) -> &'static str {
        match self {
            ResultSort::DateDescending => "dd",
            ResultSort::DateAscending => "da",
            ResultSort::LikeDescending => "ld",
            ResultSort::ViewsDescending => "vd",
        }
    }
}

pub struct BikaClient {
    http: HttpClient,
    retry: RetryPolicy,
    account: Option<(String, String)>,
    token: Mutex<Option<String>>,
}

impl BikaClient {
    pub fn new(http: HttpClient, email: Option<String>, password: Option<String>) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
            account: email.zip(password),
            token: Mutex::new(None),
        }
    }

    async fn request(
        &self,
        path: &str,
        params: &Params,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Result<Value, AppError> {
        let url = url::build(API_HOST, path, params);
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let time = Utc::now().timestamp().to_string();
        let nonce = hex::encode(Md5::digest(time.as_bytes()));
        let method = if body.is_some() { "POST" } else { "GET" };
        let sign = signature(&path_and_query, &time, &nonce, method);

        let mut request = match &body {
            Some(_) => self.http.client().post(url),
            None => self.http.client().get(url),
        };
        request = request
            .header("Authorization", token.unwrap_or(""))
            .header("Time", &time)
            .header("Nonce", &nonce)
            .header("Image-Quality", "medium")
            .header("Signature", &sign);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = self.http.send_retrying(request, &self.retry).await?;
        let response = ensure_success(response).await?;
        let text = read_text(response).await?;
        parse::loose_json(&text)
    }

    /// Returns a token with a still-valid `exp`, logging in when there
    /// is none. Held behind the mutex for the whole check-or-refresh.
    async fn session_token(&self) -> Result<String, AppError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_deref() {
            if !token_expired(token) {
                return Ok(token.to_string());
            }
        }
        let (email, password) = self.account.as_ref().ok_or_else(|| {
            AppError::client_side(401, "bika account credentials are not configured")
        })?;
        info!("signing in to bika");
        let result = self
            .request(
                "auth/sign-in",
                &Params::new(),
                Some(json!({"email": email, "password": password})),
                None,
            )
            .await?;
        let token = result
            .get("data")
            .and_then(|data| data.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AppError::upstream("bika sign-in response carried no token".to_string())
            })?
            .to_string();
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn authed(&self, path: &str, params: Params, body: Option<Value>) -> Result<Value, AppError> {
        let token = self.session_token().await?;
        self.request(path, &params, body, Some(&token)).await
    }

    pub async fn collections(&self) -> Result<Value, AppError> {
        self.authed("collections", Params::new(), None).await
    }

    pub async fn categories(&self) -> Result<Value, AppError> {
        self.authed("categories", Params::new(), None).await
    }

    pub async fn keywords(&self) -> Result<Value, AppError> {
        self.authed("keywords", Params::new(), None).await
    }

    pub async fn advanced_search(
        &self,
        keyword: &str,
        page: i64,
        sort: ResultSort,
    ) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("page", page);
        params.insert("s", sort.as_str());
        let body = json!({"keyword": keyword, "sort": sort.as_str()});
        self.authed("comics/advanced-search", params, Some(body)).await
    }
}

#[cfg(test)]
mod tests {
    use base64::prelude::*;

    use super::*;

    #[test]
    fn signature_matches_known_digest() {
        assert_eq!(
            signature("comics/leaderboard", "1640995200", "abc123", "GET"),
            "acecae466eed361c87bbca655e8cca033353839cfdd2f0adc6ade11345edc07a"
        );
    }

    #[test]
    fn signature_covers_the_query_and_ignores_the_leading_slash() {
        let sign = signature("/comics?page=1", "1640995200", "abc123", "GET");
        assert_eq!(
            sign,
            "eb60fdbaa28ebf033eaa48a2c146ed1bfa68b34b445f6e609a0a662dc5ac86dc"
        );
        assert_eq!(sign, signature("comics?page=1", "1640995200", "abc123", "get"));
    }

    fn fake_jwt(exp: i64) -> String {
        let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = BASE64_URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&serde_json::json!({"exp": exp})).unwrap());
        format!("{header}.{claims}.c2ln")
    }

    #[test]
    fn fresh_tokens_are_reused_and_stale_ones_dropped() {
        let now = Utc::now().timestamp();
        assert!(!token_expired(&fake_jwt(now + 3600)));
        assert!(token_expired(&fake_jwt(now - 1)));
        assert!(token_expired("not-a-jwt"));
    }

    #[test]
    fn sort_values_use_the_wire_abbreviations() {
        let sort: ResultSort = serde_json::from_str("\"dd\"").unwrap();
        assert_eq!(sort.as_str(), "dd");
        assert_eq!(
            serde_json::to_string(&ResultSort::ViewsDescending).unwrap(),
            "\"vd\""
        );
    }
}
