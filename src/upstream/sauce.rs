//! saucenao reverse image search.
//!
//! The only POST-accepting surface of the gateway: a search runs either
//! from a caller-supplied URL (fetched here, with a size cap) or from an
//! uploaded file, submitted as multipart to `search.php`. API keys are
//! rotated randomly across the configured list. Results are not cached;
//! every lookup hits the upstream.

use std::time::Duration;

use rand::seq::SliceRandom;
use reqwest::multipart;
use serde_json::Value;

use crate::error::AppError;
use crate::net::{ensure_success, read_text, HttpClient, RetryPolicy};
use crate::parse;
use crate::url::{self, Params};

const HOST: &str = "https://saucenao.com";

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub size: i64,
    /// 0 none, 1 by identifier, 2 all implemented methods.
    pub deduplicate: i64,
    pub database: Option<i64>,
    pub enabled_mask: Option<i64>,
    pub disabled_mask: Option<i64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            size: 30,
            deduplicate: 2,
            database: None,
            enabled_mask: None,
            disabled_mask: None,
        }
    }
}

fn search_params(options: &SearchOptions, api_key: &str) -> Params {
    let mut params = Params::new();
    params.insert_opt("dbmask", options.enabled_mask);
    params.insert_opt("dbmaski", options.disabled_mask);
    params.insert_opt("db", options.database);
    params.insert("numres", options.size);
    params.insert("dedupe", options.deduplicate);
    params.insert("output_type", 2);
    params.insert("api_key", api_key);
    params
}

pub struct SauceClient {
    http: HttpClient,
    retry: RetryPolicy,
    api_keys: Vec<String>,
    image_max_size: usize,
    image_timeout: Duration,
}

impl SauceClient {
    pub fn new(
        http: HttpClient,
        api_keys: Vec<String>,
        image_max_size: usize,
        image_timeout: Duration,
    ) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
            api_keys,
            image_max_size,
            image_timeout,
        }
    }

    /// Pulls the source image down before handing it to the upstream. An
    /// unreachable source is the caller's problem (422), as is one that
    /// blows the size cap (413).
    async fn fetch_image(&self, source: &str) -> Result<Vec<u8>, AppError> {
        let request = self.http.client().get(source).timeout(self.image_timeout);
        let response = self.http.send(request).await;
        let response = match response {
            Ok(response) => ensure_success(response).await,
            Err(error) => Err(error),
        }
        .map_err(|_| AppError::client_side(422, "given image is not available to fetch"))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|_| AppError::client_side(422, "given image is not available to fetch"))?;
        if bytes.len() > self.image_max_size {
            return Err(AppError::client_side(
                413,
                format!(
                    "given image exceeds the maximum size of {} bytes",
                    self.image_max_size
                ),
            ));
        }
        Ok(bytes.to_vec())
    }

    async fn request(&self, image: Vec<u8>, options: &SearchOptions) -> Result<Value, AppError> {
        let api_key = self
            .api_keys
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| AppError::client_side(401, "no saucenao api keys are configured"))?;
        let params = search_params(options, api_key);
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(image).file_name("image"));
        let request = self
            .http
            .client()
            .post(url::build(HOST, "search.php", &params))
            .multipart(form);
        // multipart bodies are not replayable, so this is one attempt
        let response = self.http.send_retrying(request, &self.retry).await?;
        if response.status().is_server_error() {
            let detail = read_text(response).await?;
            return Err(AppError::upstream(detail));
        }
        // 4xx bodies are JSON the upstream wants the caller to see
        let text = read_text(response).await?;
        parse::loose_json(&text)
    }

    pub async fn search_url(
        &self,
        source: &str,
        options: &SearchOptions,
    ) -> Result<Value, AppError> {
        let image = self.fetch_image(source).await?;
        self.request(image, options).await
    }

    pub async fn search_file(
        &self,
        image: Vec<u8>,
        options: &SearchOptions,
    ) -> Result<Value, AppError> {
        self.request(image, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_masks_are_omitted_from_the_query() {
        let params = search_params(&SearchOptions::default(), "k");
        assert!(!params.contains("dbmask"));
        assert!(!params.contains("dbmaski"));
        assert!(!params.contains("db"));
        assert_eq!(params.get("numres").unwrap().to_string(), "30");
        assert_eq!(params.get("dedupe").unwrap().to_string(), "2");
        assert_eq!(params.get("output_type").unwrap().to_string(), "2");
    }

    #[test]
    fn database_selection_flows_through() {
        let options = SearchOptions {
            database: Some(5),
            enabled_mask: Some(32),
            ..SearchOptions::default()
        };
        let params = search_params(&options, "k");
        assert_eq!(params.get("db").unwrap().to_string(), "5");
        assert_eq!(params.get("dbmask").unwrap().to_string(), "32");
    }

    #[tokio::test]
    async fn missing_api_keys_fail_before_any_network_call() {
        let http = HttpClient::new(
            Default::default(),
            None,
            Duration::from_secs(1),
            crate::metrics::Metrics::new().unwrap(),
        )
        .unwrap();
        let client = SauceClient::new(http, Vec::new(), 1024, Duration::from_secs(1));
        let error = client
            .search_file(vec![0u8; 4], &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error.code(), 401);
    }
}
