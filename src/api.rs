//! Inbound HTTP surface.
//!
//! One router per upstream, nested under `/<upstream>` when that
//! integration is enabled, each exposing one GET route per operation
//! plus a legacy `/?type=<op>` dispatch route kept for callers of the
//! original API. Handlers validate the query, run the operation through
//! the cache and pass the upstream JSON back untouched.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, Request, State};
use axum::extract::Query;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Uri};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Cache, CacheOutcome, CachePolicy, CacheTtl};
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::upstream::bika::{BikaClient, ResultSort};
use crate::upstream::bilibili::BilibiliClient;
use crate::upstream::netease::NeteaseClient;
use crate::upstream::pixiv::{PixivClient, RankingMode};
use crate::upstream::sauce::{SauceClient, SearchOptions};
use crate::upstream::tieba::TiebaClient;
use crate::upstream::wallpaper::{Category, Order, WallpaperClient};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub metrics: Metrics,
    pub bilibili: Option<Arc<BilibiliClient>>,
    pub netease: Option<Arc<NeteaseClient>>,
    pub tieba: Option<Arc<TiebaClient>>,
    pub bika: Option<Arc<BikaClient>>,
    pub pixiv: Option<Arc<PixivClient>>,
    pub sauce: Option<Arc<SauceClient>>,
    pub wallpaper: Option<Arc<WallpaperClient>>,
}

fn required<T>(client: &Option<Arc<T>>) -> Result<Arc<T>, AppError> {
    client
        .clone()
        .ok_or_else(|| AppError::client_side(404, "this upstream integration is disabled"))
}

/// Query extraction that renders failures as a 422 envelope instead of
/// axum's bare-text rejection.
fn parse_query<T: DeserializeOwned>(uri: &Uri) -> Result<T, AppError> {
    Query::<T>::try_from_uri(uri)
        .map(|Query(query)| query)
        .map_err(|error| AppError::validation(error.to_string()))
}

/// The original surface dispatched on `?type=<op>` (alias `get`).
#[derive(Debug, Deserialize)]
struct DispatchQuery {
    #[serde(rename = "type", alias = "get")]
    op: String,
}

fn unknown_op(op: &str) -> AppError {
    AppError::bad_request(format!("unknown operation type `{op}`"))
}

pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "omniapi",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state.metrics.export()
}

/// Logs every request and stamps `X-Process-Time`.
pub async fn request_logger(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let started = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = started.elapsed();
    state.metrics.record_request(elapsed.as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-process-time"), value);
    }
    tracing::info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        user_agent,
        "request handled"
    );
    response
}

fn default_page() -> i64 {
    1
}

// ---------------------------------------------------------------- bilibili

#[derive(Debug, Serialize, Deserialize)]
struct BilibiliViewQuery {
    aid: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BilibiliSearchQuery {
    keyword: String,
    #[serde(default = "default_page")]
    page: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BilibiliRankQuery {
    #[serde(default)]
    content: i64,
    #[serde(default = "default_rank_duration")]
    duration: i64,
    #[serde(default)]
    new_post: bool,
}

fn default_rank_duration() -> i64 {
    3
}

#[derive(Debug, Serialize, Deserialize)]
struct BilibiliSeasonQuery {
    season_id: i64,
}

pub fn bilibili_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(bilibili_dispatch))
        .route("/view", get(bilibili_view))
        .route("/search", get(bilibili_search))
        .route("/rank", get(bilibili_rank))
        .route("/season_info", get(bilibili_season_info))
}

async fn bilibili_dispatch(
    state: State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let DispatchQuery { op } = parse_query(&uri)?;
    match op.as_str() {
        "view" => bilibili_view(state, headers, uri).await,
        "search" => bilibili_search(state, headers, uri).await,
        "rank" => bilibili_rank(state, headers, uri).await,
        "season_info" => bilibili_season_info(state, headers, uri).await,
        other => Err(unknown_op(other)),
    }
}

async fn bilibili_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: BilibiliViewQuery = parse_query(&uri)?;
    let client = required(&state.bilibili)?;
    let policy = CachePolicy::from_headers(&headers);
    let aid = query.aid;
    state
        .cache
        .cached("bilibili:view", CacheTtl::Default, policy, &query, move || async move {
            client.view(aid).await
        })
        .await
}

async fn bilibili_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: BilibiliSearchQuery = parse_query(&uri)?;
    let client = required(&state.bilibili)?;
    let policy = CachePolicy::from_headers(&headers);
    let keyword = query.keyword.clone();
    let page = query.page;
    state
        .cache
        .cached("bilibili:search", CacheTtl::Default, policy, &query, move || async move {
            client.search(&keyword, page).await
        })
        .await
}

async fn bilibili_rank(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: BilibiliRankQuery = parse_query(&uri)?;
    let client = required(&state.bilibili)?;
    let policy = CachePolicy::from_headers(&headers);
    let (content, duration, new_post) = (query.content, query.duration, query.new_post);
    state
        .cache
        .cached("bilibili:rank", CacheTtl::Default, policy, &query, move || async move {
            client.rank_list(content, duration, new_post).await
        })
        .await
}

async fn bilibili_season_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: BilibiliSeasonQuery = parse_query(&uri)?;
    let client = required(&state.bilibili)?;
    let policy = CachePolicy::from_headers(&headers);
    let season_id = query.season_id;
    state
        .cache
        .cached("bilibili:season_info", CacheTtl::Default, policy, &query, move || async move {
            client.season_info(season_id).await
        })
        .await
}

// ----------------------------------------------------------------- netease

fn parse_id_list(raw: &str) -> Result<Vec<i64>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map_err(|_| AppError::validation(format!("`{part}` is not a numeric id")))
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct NeteaseSearchQuery {
    s: String,
    #[serde(default = "default_search_type")]
    search_type: i64,
    #[serde(default = "default_search_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_search_type() -> i64 {
    1
}

fn default_search_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
struct NeteaseIdListQuery {
    /// Comma-separated numeric ids.
    id: String,
    #[serde(default = "default_bitrate")]
    br: i64,
}

fn default_bitrate() -> i64 {
    198000
}

#[derive(Debug, Serialize, Deserialize)]
struct NeteaseIdQuery {
    id: i64,
}

pub fn netease_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(netease_dispatch))
        .route("/search", get(netease_search))
        .route("/detail", get(netease_detail))
        .route("/song", get(netease_song))
        .route("/playlist", get(netease_playlist))
        .route("/lyric", get(netease_lyric))
}

async fn netease_dispatch(
    state: State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, AppError> {
    let DispatchQuery { op } = parse_query(&uri)?;
    match op.as_str() {
        "search" => netease_search(state, uri).await,
        "detail" => netease_detail(state, uri).await,
        "song" => netease_song(state, uri).await,
        "playlist" => netease_playlist(state, uri).await,
        "lyric" => netease_lyric(state, uri).await,
        other => Err(unknown_op(other)),
    }
}

// netease results are never cached; the upstream replies depend on the
// spoofed source address and session cookies.

async fn netease_search(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, AppError> {
    let query: NeteaseSearchQuery = parse_query(&uri)?;
    let client = required(&state.netease)?;
    let value = client
        .search(&query.s, query.search_type, query.limit, query.offset)
        .await?;
    Ok(Json(value))
}

async fn netease_detail(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, AppError> {
    let query: NeteaseIdListQuery = parse_query(&uri)?;
    let client = required(&state.netease)?;
    let ids = parse_id_list(&query.id)?;
    Ok(Json(client.detail(&ids).await?))
}

async fn netease_song(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, AppError> {
    let query: NeteaseIdListQuery = parse_query(&uri)?;
    let client = required(&state.netease)?;
    let ids = parse_id_list(&query.id)?;
    Ok(Json(client.song(&ids, query.br).await?))
}

async fn netease_playlist(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, AppError> {
    let query: NeteaseIdQuery = parse_query(&uri)?;
    let client = required(&state.netease)?;
    Ok(Json(client.playlist(query.id).await?))
}

async fn netease_lyric(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, AppError> {
    let query: NeteaseIdQuery = parse_query(&uri)?;
    let client = required(&state.netease)?;
    Ok(Json(client.lyric(query.id).await?))
}

// ------------------------------------------------------------------- tieba

#[derive(Debug, Serialize, Deserialize)]
struct TiebaPostListQuery {
    name: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_tieba_size")]
    size: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TiebaPostDetailQuery {
    tid: i64,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_tieba_size")]
    size: i64,
    #[serde(default)]
    reversed: bool,
}

fn default_tieba_size() -> i64 {
    50
}

#[derive(Debug, Serialize, Deserialize)]
struct TiebaUserQuery {
    uid: i64,
}

pub fn tieba_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(tieba_dispatch))
        .route("/post_list", get(tieba_post_list))
        .route("/post_detail", get(tieba_post_detail))
        .route("/user_profile", get(tieba_user_profile))
}

async fn tieba_dispatch(
    state: State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let DispatchQuery { op } = parse_query(&uri)?;
    match op.as_str() {
        "post_list" => tieba_post_list(state, headers, uri).await,
        "post_detail" => tieba_post_detail(state, headers, uri).await,
        "user_profile" => tieba_user_profile(state, headers, uri).await,
        other => Err(unknown_op(other)),
    }
}

async fn tieba_post_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: TiebaPostListQuery = parse_query(&uri)?;
    let client = required(&state.tieba)?;
    let policy = CachePolicy::from_headers(&headers);
    let name = query.name.clone();
    let (page, size) = (query.page, query.size);
    state
        .cache
        .cached("tieba:post_list", CacheTtl::Default, policy, &query, move || async move {
            client.post_list(&name, page, size).await
        })
        .await
}

async fn tieba_post_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: TiebaPostDetailQuery = parse_query(&uri)?;
    let client = required(&state.tieba)?;
    let policy = CachePolicy::from_headers(&headers);
    let (tid, page, size, reversed) = (query.tid, query.page, query.size, query.reversed);
    state
        .cache
        .cached("tieba:post_detail", CacheTtl::Default, policy, &query, move || async move {
            client.post_detail(tid, page, size, reversed).await
        })
        .await
}

async fn tieba_user_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: TiebaUserQuery = parse_query(&uri)?;
    let client = required(&state.tieba)?;
    let policy = CachePolicy::from_headers(&headers);
    let uid = query.uid;
    state
        .cache
        .cached("tieba:user_profile", CacheTtl::Default, policy, &query, move || async move {
            client.user_profile(uid).await
        })
        .await
}

// -------------------------------------------------------------------- bika

#[derive(Debug, Serialize, Deserialize)]
struct BikaSearchQuery {
    keyword: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_bika_sort")]
    sort: ResultSort,
}

fn default_bika_sort() -> ResultSort {
    ResultSort::DateDescending
}

const DAY_SECONDS: u64 = 24 * 60 * 60;

pub fn bika_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(bika_dispatch))
        .route("/collections", get(bika_collections))
        .route("/categories", get(bika_categories))
        .route("/keywords", get(bika_keywords))
        .route("/advanced_search", get(bika_advanced_search))
}

async fn bika_dispatch(
    state: State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let DispatchQuery { op } = parse_query(&uri)?;
    match op.as_str() {
        "collections" => bika_collections(state, headers).await,
        "categories" => bika_categories(state, headers).await,
        "keywords" => bika_keywords(state, headers).await,
        "advanced_search" => bika_advanced_search(state, headers, uri).await,
        other => Err(unknown_op(other)),
    }
}

async fn bika_collections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<CacheOutcome, AppError> {
    let client = required(&state.bika)?;
    let policy = CachePolicy::from_headers(&headers);
    state
        .cache
        .cached(
            "bika:collections",
            CacheTtl::Seconds(DAY_SECONDS),
            policy,
            &(),
            move || async move { client.collections().await },
        )
        .await
}

async fn bika_categories(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<CacheOutcome, AppError> {
    let client = required(&state.bika)?;
    let policy = CachePolicy::from_headers(&headers);
    state
        .cache
        .cached(
            "bika:categories",
            CacheTtl::Seconds(3 * DAY_SECONDS),
            policy,
            &(),
            move || async move { client.categories().await },
        )
        .await
}

async fn bika_keywords(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<CacheOutcome, AppError> {
    let client = required(&state.bika)?;
    let policy = CachePolicy::from_headers(&headers);
    state
        .cache
        .cached(
            "bika:keywords",
            CacheTtl::Seconds(3 * DAY_SECONDS),
            policy,
            &(),
            move || async move { client.keywords().await },
        )
        .await
}

async fn bika_advanced_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: BikaSearchQuery = parse_query(&uri)?;
    let client = required(&state.bika)?;
    let policy = CachePolicy::from_headers(&headers);
    let keyword = query.keyword.clone();
    let (page, sort) = (query.page, query.sort);
    state
        .cache
        .cached("bika:advanced_search", CacheTtl::Default, policy, &query, move || async move {
            client.advanced_search(&keyword, page, sort).await
        })
        .await
}

// ------------------------------------------------------------------- pixiv

#[derive(Debug, Serialize, Deserialize)]
struct PixivIllustQuery {
    id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PixivRankQuery {
    #[serde(default = "default_ranking_mode")]
    mode: RankingMode,
    date: Option<String>,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_pixiv_size")]
    size: i64,
}

fn default_ranking_mode() -> RankingMode {
    RankingMode::Week
}

fn default_pixiv_size() -> i64 {
    30
}

#[derive(Debug, Serialize, Deserialize)]
struct PixivSearchQuery {
    word: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_pixiv_size")]
    size: i64,
}

pub fn pixiv_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(pixiv_dispatch))
        .route("/illust", get(pixiv_illust))
        .route("/rank", get(pixiv_rank))
        .route("/search", get(pixiv_search))
}

async fn pixiv_dispatch(
    state: State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let DispatchQuery { op } = parse_query(&uri)?;
    match op.as_str() {
        "illust" => pixiv_illust(state, headers, uri).await,
        "rank" => pixiv_rank(state, headers, uri).await,
        "search" => pixiv_search(state, headers, uri).await,
        other => Err(unknown_op(other)),
    }
}

async fn pixiv_illust(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: PixivIllustQuery = parse_query(&uri)?;
    let client = required(&state.pixiv)?;
    let policy = CachePolicy::from_headers(&headers);
    let id = query.id;
    state
        .cache
        .cached("pixiv:illust", CacheTtl::Default, policy, &query, move || async move {
            client.illust(id).await
        })
        .await
}

async fn pixiv_rank(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: PixivRankQuery = parse_query(&uri)?;
    let client = required(&state.pixiv)?;
    let policy = CachePolicy::from_headers(&headers);
    let (mode, page, size) = (query.mode, query.page, query.size);
    let date = query.date.clone();
    state
        .cache
        .cached(
            "pixiv:rank",
            CacheTtl::Seconds(3 * DAY_SECONDS),
            policy,
            &query,
            move || async move { client.rank(mode, date.as_deref(), page, size).await },
        )
        .await
}

async fn pixiv_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: PixivSearchQuery = parse_query(&uri)?;
    let client = required(&state.pixiv)?;
    let policy = CachePolicy::from_headers(&headers);
    let word = query.word.clone();
    let (page, size) = (query.page, query.size);
    state
        .cache
        .cached("pixiv:search", CacheTtl::Default, policy, &query, move || async move {
            client.search(&word, page, size).await
        })
        .await
}

// ------------------------------------------------------------------- sauce

#[derive(Debug, Deserialize)]
struct SauceSearchQuery {
    url: Option<String>,
    #[serde(default = "default_pixiv_size")]
    size: i64,
    #[serde(default = "default_dedupe")]
    deduplicate: i64,
    database: Option<i64>,
    enabled_mask: Option<i64>,
    disabled_mask: Option<i64>,
}

fn default_dedupe() -> i64 {
    2
}

impl SauceSearchQuery {
    fn options(&self) -> SearchOptions {
        SearchOptions {
            size: self.size,
            deduplicate: self.deduplicate,
            database: self.database,
            enabled_mask: self.enabled_mask,
            disabled_mask: self.disabled_mask,
        }
    }
}

pub fn sauce_routes() -> Router<AppState> {
    Router::new().route("/", get(sauce_search_url).post(sauce_search_file))
}

// every lookup hits the upstream; saucenao results are rate limited per
// key and never cached here

async fn sauce_search_url(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, AppError> {
    let query: SauceSearchQuery = parse_query(&uri)?;
    let client = required(&state.sauce)?;
    let source = query
        .url
        .as_deref()
        .ok_or_else(|| AppError::validation("query parameter `url` is required"))?;
    let value = client.search_url(source, &query.options()).await?;
    Ok(Json(value))
}

async fn sauce_search_file(
    State(state): State<AppState>,
    uri: Uri,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let query: SauceSearchQuery = parse_query(&uri)?;
    let client = required(&state.sauce)?;
    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| AppError::bad_request(error.to_string()))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|error| AppError::bad_request(error.to_string()))?;
            image = Some(bytes.to_vec());
        }
    }
    let image =
        image.ok_or_else(|| AppError::validation("multipart field `file` is required"))?;
    let value = client.search_file(image, &query.options()).await?;
    Ok(Json(value))
}

// --------------------------------------------------------------- wallpaper

#[derive(Debug, Serialize, Deserialize)]
struct WallpaperQuery {
    category: Category,
    #[serde(default = "default_wallpaper_limit")]
    limit: i64,
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_adult")]
    adult: bool,
    #[serde(default = "default_order")]
    order: Order,
}

fn default_wallpaper_limit() -> i64 {
    20
}

fn default_adult() -> bool {
    true
}

fn default_order() -> Order {
    Order::Hot
}

const WALLPAPER_TTL: u64 = 2 * 60 * 60;

pub fn wallpaper_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(wallpaper_dispatch))
        .route("/wallpaper", get(wallpaper_horizontal))
        .route("/vertical", get(wallpaper_vertical))
}

async fn wallpaper_dispatch(
    state: State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let DispatchQuery { op } = parse_query(&uri)?;
    match op.as_str() {
        "wallpaper" => wallpaper_horizontal(state, headers, uri).await,
        "vertical" => wallpaper_vertical(state, headers, uri).await,
        other => Err(unknown_op(other)),
    }
}

// the upstream embeds short-lived anti-hotlink tokens, so the ttl stays low

async fn wallpaper_horizontal(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: WallpaperQuery = parse_query(&uri)?;
    let client = required(&state.wallpaper)?;
    let policy = CachePolicy::from_headers(&headers);
    let (category, limit, skip, adult, order) =
        (query.category, query.limit, query.skip, query.adult, query.order);
    state
        .cache
        .cached(
            "wallpaper:wallpaper",
            CacheTtl::Seconds(WALLPAPER_TTL),
            policy,
            &query,
            move || async move { client.wallpaper(category, limit, skip, adult, order).await },
        )
        .await
}

async fn wallpaper_vertical(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<CacheOutcome, AppError> {
    let query: WallpaperQuery = parse_query(&uri)?;
    let client = required(&state.wallpaper)?;
    let policy = CachePolicy::from_headers(&headers);
    let (category, limit, skip, adult, order) =
        (query.category, query.limit, query.skip, query.adult, query.order);
    state
        .cache
        .cached(
            "wallpaper:vertical",
            CacheTtl::Seconds(WALLPAPER_TTL),
            policy,
            &query,
            move || async move { client.vertical(category, limit, skip, adult, order).await },
        )
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::cache::MemoryBackend;

    use super::*;

    fn test_state() -> AppState {
        let metrics = Metrics::new().unwrap();
        AppState {
            cache: Arc::new(Cache::new(
                Arc::new(MemoryBackend::new()),
                true,
                Duration::from_secs(60),
                metrics.clone(),
            )),
            metrics,
            bilibili: None,
            netease: None,
            tieba: None,
            bika: None,
            pixiv: None,
            sauce: None,
            wallpaper: None,
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_operations() {
        let uri: Uri = "/?type=nope".parse().unwrap();
        let error = bilibili_dispatch(State(test_state()), HeaderMap::new(), uri)
            .await
            .unwrap_err();
        assert_eq!(error.code(), 400);
    }

    #[tokio::test]
    async fn dispatch_accepts_the_get_alias() {
        // resolves to the view op, which then 404s on the disabled client
        let uri: Uri = "/?get=view&aid=2".parse().unwrap();
        let error = bilibili_dispatch(State(test_state()), HeaderMap::new(), uri)
            .await
            .unwrap_err();
        assert_eq!(error.code(), 404);
    }

    #[tokio::test]
    async fn missing_required_parameters_become_422() {
        let uri: Uri = "/view".parse().unwrap();
        let error = bilibili_view(State(test_state()), HeaderMap::new(), uri)
            .await
            .unwrap_err();
        assert_eq!(error.code(), 422);
    }

    #[tokio::test]
    async fn validation_runs_before_the_client_check() {
        // malformed query against an unconfigured integration: the 422
        // from validation wins over the 404 for the missing client
        let uri: Uri = "/view?aid=abc".parse().unwrap();
        let error = bilibili_view(State(test_state()), HeaderMap::new(), uri)
            .await
            .unwrap_err();
        assert_eq!(error.code(), 422);
    }

    #[tokio::test]
    async fn disabled_upstreams_answer_404() {
        let uri: Uri = "/post_list?name=rust".parse().unwrap();
        let error = tieba_post_list(State(test_state()), HeaderMap::new(), uri)
            .await
            .unwrap_err();
        assert_eq!(error.code(), 404);
    }

    #[test]
    fn id_lists_split_on_commas() {
        assert_eq!(parse_id_list("1,2, 3").unwrap(), vec![1, 2, 3]);
        assert!(parse_id_list("1,x").is_err());
    }

    #[test]
    fn sauce_query_defaults_mirror_the_upstream() {
        let uri: Uri = "/?url=https://example.com/a.png".parse().unwrap();
        let query: SauceSearchQuery = parse_query(&uri).unwrap();
        let options = query.options();
        assert_eq!(options.size, 30);
        assert_eq!(options.deduplicate, 2);
        assert!(options.database.is_none());
    }
}
