//! bilibili mobile API.
//!
//! Signed requests carry the fixed android app identity plus a `sign`
//! parameter: the lowercase MD5 of the sorted, URL-encoded query
//! concatenated with the app secret. Plain digest over concatenation,
//! not an HMAC; that is what the upstream verifies.

use chrono::Utc;
use md5::{Digest, Md5};
use serde_json::Value;

use crate::error::AppError;
use crate::net::{ensure_success, read_text, HttpClient, RetryPolicy};
use crate::parse;
use crate::url::{self, Params};

const APP_KEY: &str = "1d8b6e7d45233436";
const APP_SECRET: &str = "560c52ccd288fed045859ed18bffd973";
const ACCESS_KEY: &str = "5271b2f0eb92f5f89af4dc39197d8e41";

const APP_HOST: &str = "https://app.bilibili.com";
const MAIN_HOST: &str = "https://www.bilibili.com";
const BANGUMI_HOST: &str = "https://bangumi.bilibili.com";

/// Lowercase MD5 hex over `query + secret`.
pub fn signature(encoded_query: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(encoded_query.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Merges the fixed app identity into `params` and appends `sign`.
pub fn sign_params(params: &mut Params, ts: i64) {
    params.insert("access_key", ACCESS_KEY);
    params.insert("appkey", APP_KEY);
    params.insert("build", 507000);
    params.insert("device", "android");
    params.insert("mobi_app", "android");
    params.insert("platform", "android");
    params.insert("ts", ts);
    let sign = signature(&params.encoded_query(), APP_SECRET);
    params.insert("sign", sign);
}

pub struct BilibiliClient {
    http: HttpClient,
    retry: RetryPolicy,
}

impl BilibiliClient {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
        }
    }

    /// Responses occasionally come back as JSONP and with `http://` asset
    /// URLs; both are normalized away here.
    async fn get_json(&self, url: reqwest::Url) -> Result<Value, AppError> {
        let request = self.http.client().get(url);
        let response = self.http.send_retrying(request, &self.retry).await?;
        let response = ensure_success(response).await?;
        let text = read_text(response).await?;
        parse::loose_json_https(&text)
    }

    pub async fn view(&self, aid: i64) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("aid", aid);
        sign_params(&mut params, Utc::now().timestamp());
        self.get_json(url::build(APP_HOST, "x/v2/view", &params))
            .await
    }

    pub async fn search(&self, keyword: &str, page: i64) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("keyword", keyword);
        params.insert("pn", page);
        sign_params(&mut params, Utc::now().timestamp());
        self.get_json(url::build(APP_HOST, "x/v2/search", &params))
            .await
    }

    /// Unsigned; the ranking board lives on the www host as a static-ish
    /// JSON document addressed by path.
    pub async fn rank_list(
        &self,
        content: i64,
        duration: i64,
        new_post: bool,
    ) -> Result<Value, AppError> {
        let path = format!(
            "index/rank/all-{}{duration}-{content}.json",
            if new_post { "rookie-" } else { "" }
        );
        self.get_json(url::build(MAIN_HOST, &path, &Params::new()))
            .await
    }

    pub async fn season_info(&self, season_id: i64) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("season_id", season_id);
        self.get_json(url::build(BANGUMI_HOST, "view/web_api/season_info", &params))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_digest() {
        // md5("aid=2&build=507000&device=android&ts=1640995200" + "S")
        let mut params = Params::new();
        params.insert("ts", 1640995200_i64);
        params.insert("aid", 2);
        params.insert("device", "android");
        params.insert("build", 507000);
        assert_eq!(
            signature(&params.encoded_query(), "S"),
            "7d838eac82ef8637e28576ed953d2b0f"
        );
    }

    #[test]
    fn signature_is_insertion_order_invariant() {
        let mut a = Params::new();
        a.insert("aid", 2).insert("ts", 1640995200_i64);
        let mut b = Params::new();
        b.insert("ts", 1640995200_i64).insert("aid", 2);
        assert_eq!(
            signature(&a.encoded_query(), APP_SECRET),
            signature(&b.encoded_query(), APP_SECRET)
        );
    }

    #[test]
    fn sign_params_appends_sign_over_everything_else() {
        let mut params = Params::new();
        params.insert("aid", 2);
        sign_params(&mut params, 1640995200);
        for key in ["access_key", "appkey", "build", "device", "mobi_app", "platform", "ts"] {
            assert!(params.contains(key), "missing {key}");
        }
        let sign = params.get("sign").unwrap().to_string();
        let mut unsigned = Params::new();
        for (key, value) in params.iter() {
            if key != "sign" {
                unsigned.insert(key, value.clone());
            }
        }
        assert_eq!(sign, signature(&unsigned.encoded_query(), APP_SECRET));
    }
}
