//! adesk wallpaper API. Unsigned; categories are addressed by opaque
//! upstream ids behind a friendly name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::net::{ensure_success, read_text, HttpClient, RetryPolicy};
use crate::parse;
use crate::url::{self, Params};

const HOST: &str = "http://service.aibizhi.adesk.com";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Girl,
    Animal,
    Landscape,
    Anime,
    Drawn,
    Mechanics,
    Boy,
    Game,
    Text,
}

impl Category {
    fn id(self) -> &'static str {
        match self {
            Category::Girl => "4e4d610cdf714d2966000000",
            Category::Animal => "4e4d610cdf714d2966000001",
            Category::Landscape => "4e4d610cdf714d2966000002",
            Category::Anime => "4e4d610cdf714d2966000003",
            Category::Drawn => "4e4d610cdf714d2966000004",
            Category::Mechanics => "4e4d610cdf714d2966000005",
            Category::Boy => "4e4d610cdf714d2966000006",
            Category::Game => "4e4d610cdf714d2966000007",
            Category::Text => "5109e04e48d5b9364ae9ac45",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Hot,
    New,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Order::Hot => "hot",
            Order::New => "new",
        }
    }
}

pub struct WallpaperClient {
    http: HttpClient,
    retry: RetryPolicy,
}

impl WallpaperClient {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
        }
    }

    async fn get_json(&self, template: &str, params: &Params) -> Result<Value, AppError> {
        let request = self.http.client().get(url::build(HOST, template, params));
        let response = self.http.send_retrying(request, &self.retry).await?;
        let response = ensure_success(response).await?;
        let text = read_text(response).await?;
        parse::loose_json(&text)
    }

    fn category_params(
        category: Category,
        limit: i64,
        skip: i64,
        adult: bool,
        order: Order,
    ) -> Params {
        let mut params = Params::new();
        params.insert("category", category.id());
        params.insert("limit", limit);
        params.insert("skip", skip);
        params.insert("adult", adult);
        params.insert("order", order.as_str());
        params.insert("first", 0);
        params
    }

    pub async fn wallpaper(
        &self,
        category: Category,
        limit: i64,
        skip: i64,
        adult: bool,
        order: Order,
    ) -> Result<Value, AppError> {
        let params = Self::category_params(category, limit, skip, adult, order);
        self.get_json("v1/wallpaper/category/{category}/wallpaper", &params)
            .await
    }

    pub async fn vertical(
        &self,
        category: Category,
        limit: i64,
        skip: i64,
        adult: bool,
        order: Order,
    ) -> Result<Value, AppError> {
        let params = Self::category_params(category, limit, skip, adult, order);
        self.get_json("v1/vertical/category/{category}/vertical", &params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_deserialize_lowercase() {
        let category: Category = serde_json::from_str("\"anime\"").unwrap();
        assert_eq!(category.id(), "4e4d610cdf714d2966000003");
        assert!(serde_json::from_str::<Category>("\"Anime\"").is_err());
    }

    #[test]
    fn category_params_substitute_into_the_path() {
        let params =
            WallpaperClient::category_params(Category::Text, 20, 0, true, Order::Hot);
        let url = url::build(HOST, "v1/wallpaper/category/{category}/wallpaper", &params);
        assert!(url
            .path()
            .contains("/category/5109e04e48d5b9364ae9ac45/wallpaper"));
        assert!(url.query().unwrap().contains("order=hot"));
    }
}
