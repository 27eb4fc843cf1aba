//! pixiv app API.
//!
//! Calls ride the official iOS app identity and a Bearer access token.
//! Access tokens come from a refresh-token OAuth grant whose request is
//! authenticated with `X-Client-Time` plus `X-Client-Hash`, the MD5 of
//! the timestamp concatenated with a fixed hash secret. Tokens are
//! cached until shortly before expiry; configured refresh tokens are
//! rotated round-robin and refresh runs behind a mutex.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::AppError;
use crate::net::{ensure_success, read_text, HttpClient, RetryPolicy};
use crate::parse;
use crate::url::{self, Params};

const CLIENT_ID: &str = "MOBrBDS8blbauoSck0ZfDbtuzpyT";
const CLIENT_SECRET: &str = "lsACyCD94FhDUtGTXi3QzcFE2uU1hqtDaKeqrdwj";
const HASH_SECRET: &[u8] = b"28c1fdd170a5204386cb1313c7077b34f83e4aaf4aa829ce78c231e05b0bae2c";
const APP_HOST: &str = "https://app-api.pixiv.net";
const AUTH_HOST: &str = "https://oauth.secure.pixiv.net";

/// iOS app identity sent with every request.
pub fn default_headers(language: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("App-OS", HeaderValue::from_static("ios"));
    headers.insert("App-OS-Version", HeaderValue::from_static("14.6"));
    headers.insert(
        "User-Agent",
        HeaderValue::from_static("PixivIOSApp/7.13.3 (iOS 14.6; iPhone13,2)"),
    );
    if let Ok(value) = HeaderValue::from_str(language) {
        headers.insert(ACCEPT_LANGUAGE, value);
    }
    headers
}

/// `md5(time + hash_secret)`; the OAuth host rejects requests without it.
pub fn client_hash(time: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(time.as_bytes());
    hasher.update(HASH_SECRET);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMode {
    Day,
    Week,
    Month,
    DayMale,
    DayFemale,
    WeekOriginal,
    WeekRookie,
    DayManga,
}

impl RankingMode {
    fn as_str(self) -> &'static str {
        match self {
            RankingMode::Day => "day",
            RankingMode::Week => "week",
            RankingMode::Month => "month",
            RankingMode::DayMale => "day_male",
            RankingMode::DayFemale => "day_female",
            RankingMode::WeekOriginal => "week_original",
            RankingMode::WeekRookie => "week_rookie",
            RankingMode::DayManga => "day_manga",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    expires_in: i64,
}

struct Session {
    access_token: String,
    expires_at: chrono::DateTime<Utc>,
}

struct TokenState {
    /// Round-robin cursor into the configured refresh tokens.
    next: usize,
    session: Option<Session>,
}

pub struct PixivClient {
    http: HttpClient,
    retry: RetryPolicy,
    refresh_tokens: Vec<String>,
    state: Mutex<TokenState>,
}

impl PixivClient {
    pub fn new(http: HttpClient, refresh_tokens: Vec<String>) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
            refresh_tokens,
            state: Mutex::new(TokenState {
                next: 0,
                session: None,
            }),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AppError> {
        let time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let time = time.replace('Z', "+00:00");
        let request = self
            .http
            .client()
            .post(url::build(AUTH_HOST, "auth/token", &Params::new()))
            .header("X-Client-Time", &time)
            .header("X-Client-Hash", client_hash(&time))
            .form(&[
                ("get_secure_url", "1"),
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ]);
        let response = self.http.send_retrying(request, &self.retry).await?;
        let response = ensure_success(response).await?;
        let auth: AuthResponse = response.json().await.map_err(|e| {
            AppError::upstream(format!("malformed pixiv auth response: {e}"))
        })?;
        info!(expires_in = auth.expires_in, "pixiv access token refreshed");
        // refresh a minute early rather than racing the expiry
        let expires_at = Utc::now() + ChronoDuration::seconds((auth.expires_in - 60).max(0));
        Ok(Session {
            access_token: auth.access_token,
            expires_at,
        })
    }

    async fn access_token(&self) -> Result<String, AppError> {
        let mut state = self.state.lock().await;
        if let Some(session) = &state.session {
            if session.expires_at > Utc::now() {
                return Ok(session.access_token.clone());
            }
        }
        if self.refresh_tokens.is_empty() {
            return Err(AppError::client_side(
                401,
                "no pixiv refresh tokens are configured",
            ));
        }
        let token = &self.refresh_tokens[state.next % self.refresh_tokens.len()];
        state.next = state.next.wrapping_add(1);
        let session = self.refresh(token).await?;
        let access_token = session.access_token.clone();
        state.session = Some(session);
        Ok(access_token)
    }

    async fn get_json(&self, template: &str, params: &Params) -> Result<Value, AppError> {
        let token = self.access_token().await?;
        let request = self
            .http
            .client()
            .get(url::build(APP_HOST, template, params))
            .header(AUTHORIZATION, format!("Bearer {token}"));
        let response = self.http.send_retrying(request, &self.retry).await?;
        let response = ensure_success(response).await?;
        let text = read_text(response).await?;
        parse::loose_json(&text)
    }

    pub async fn illust(&self, id: i64) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("illust_id", id);
        self.get_json("v1/illust/detail", &params).await
    }

    pub async fn rank(
        &self,
        mode: RankingMode,
        date: Option<&str>,
        page: i64,
        size: i64,
    ) -> Result<Value, AppError> {
        let date = match date {
            Some(date) => date.to_string(),
            None => (Utc::now() - ChronoDuration::days(1))
                .format("%Y-%m-%d")
                .to_string(),
        };
        let mut params = Params::new();
        params.insert("mode", mode.as_str());
        params.insert("date", date);
        params.insert("offset", (page - 1) * size);
        self.get_json("v1/illust/ranking", &params).await
    }

    pub async fn search(&self, word: &str, page: i64, size: i64) -> Result<Value, AppError> {
        let mut params = Params::new();
        params.insert("word", word);
        params.insert("search_target", "partial_match_for_tags");
        params.insert("sort", "date_desc");
        params.insert("offset", (page - 1) * size);
        self.get_json("v1/search/illust", &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hash_matches_known_digest() {
        let time = "2022-01-01T00:00:00+00:00";
        assert_eq!(client_hash(time), "ac25f04747defa28e4e2988c243d7a69");
        assert_ne!(client_hash(time), client_hash("2022-01-01T00:00:01+00:00"));
    }

    #[test]
    fn ranking_modes_serialize_snake_case() {
        let mode: RankingMode = serde_json::from_str("\"day_female\"").unwrap();
        assert_eq!(mode.as_str(), "day_female");
    }

    #[test]
    fn default_headers_carry_the_app_identity() {
        let headers = default_headers("zh-CN");
        assert_eq!(headers.get("App-OS").unwrap(), "ios");
        assert_eq!(headers.get(ACCEPT_LANGUAGE).unwrap(), "zh-CN");
    }
}
