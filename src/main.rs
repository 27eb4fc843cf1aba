mod api;
mod cache;
mod config;
mod error;
mod metrics;
mod net;
mod parse;
mod upstream;
mod url;

use std::sync::Arc;

use anyhow::{bail, Context};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use api::AppState;
use cache::{Cache, CacheBackend, MemoryBackend, RedisBackend};
use config::AppConfig;
use metrics::Metrics;
use net::HttpClient;
use upstream::bika::BikaClient;
use upstream::bilibili::BilibiliClient;
use upstream::netease::NeteaseClient;
use upstream::pixiv::PixivClient;
use upstream::sauce::SauceClient;
use upstream::tieba::TiebaClient;
use upstream::wallpaper::WallpaperClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = AppConfig::from_env()?;
    let metrics = Metrics::new().map_err(|e| anyhow::anyhow!("{e}"))?;

    let backend = cache_backend(&cfg)?;
    let cache = Arc::new(Cache::new(
        backend,
        cfg.cache.enabled,
        cfg.cache.default_ttl,
        metrics.clone(),
    ));

    let trace_dir = cfg.data_dir.join("traces");
    std::fs::create_dir_all(&trace_dir)
        .with_context(|| format!("creating trace directory {}", trace_dir.display()))?;

    let state = build_state(&cfg, cache, metrics)?;

    let mut app = Router::new()
        .route("/healthz", get(api::health))
        .route("/metrics", get(api::metrics));

    if cfg.bilibili.enabled {
        app = app.nest("/bilibili", api::bilibili_routes());
    }
    if cfg.netease.enabled {
        app = app.nest("/netease", api::netease_routes());
    }
    if cfg.tieba.enabled {
        app = app.nest("/tieba", api::tieba_routes());
    }
    if cfg.bika.enabled {
        app = app.nest("/bika", api::bika_routes());
    }
    if cfg.pixiv.enabled {
        app = app.nest("/pixiv", api::pixiv_routes());
    }
    if cfg.sauce.enabled {
        app = app.nest("/sauce", api::sauce_routes());
    }
    if cfg.wallpaper.enabled {
        app = app.nest("/wallpaper", api::wallpaper_routes());
    }

    let app = app
        .layer(middleware::from_fn_with_state(state.clone(), api::request_logger))
        .layer(middleware::from_fn_with_state(trace_dir, error::error_envelope))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listen_addr = cfg.listen_addr;
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    tracing::info!(%listen_addr, "starting omniapi gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("omniapi exited cleanly");

    Ok(())
}

fn cache_backend(cfg: &AppConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
    let uri = cfg.cache.uri.as_str();
    if uri.starts_with("memory://") {
        Ok(Arc::new(MemoryBackend::new()))
    } else if uri.starts_with("redis://") || uri.starts_with("rediss://") {
        Ok(Arc::new(
            RedisBackend::connect(uri).map_err(|e| anyhow::anyhow!("{e}"))?,
        ))
    } else {
        bail!("unsupported cache uri `{uri}`; expected memory:// or redis://");
    }
}

fn build_state(cfg: &AppConfig, cache: Arc<Cache>, metrics: Metrics) -> anyhow::Result<AppState> {
    let http = |headers: HeaderMap| {
        HttpClient::new(
            headers,
            cfg.proxy.as_deref(),
            cfg.request_timeout,
            metrics.clone(),
        )
    };

    let bilibili = if cfg.bilibili.enabled {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&cfg.bilibili.user_agent)?,
        );
        if let Some(cookie) = &cfg.bilibili.cookie {
            headers.insert(header::COOKIE, HeaderValue::from_str(cookie)?);
        }
        Some(Arc::new(BilibiliClient::new(http(headers)?)))
    } else {
        None
    };

    let netease = if cfg.netease.enabled {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&cfg.netease.user_agent)?,
        );
        headers.insert(header::REFERER, HeaderValue::from_static("http://music.163.com"));
        if let Some(cookie) = &cfg.netease.cookie {
            headers.insert(header::COOKIE, HeaderValue::from_str(cookie)?);
        }
        Some(Arc::new(NeteaseClient::new(
            http(headers)?,
            &cfg.netease.source_segment,
        )?))
    } else {
        None
    };

    let tieba = if cfg.tieba.enabled {
        Some(Arc::new(TiebaClient::new(http(HeaderMap::new())?)))
    } else {
        None
    };

    let bika = if cfg.bika.enabled {
        Some(Arc::new(BikaClient::new(
            http(upstream::bika::default_headers())?,
            cfg.bika.email.clone(),
            cfg.bika.password.clone(),
        )))
    } else {
        None
    };

    let pixiv = if cfg.pixiv.enabled {
        Some(Arc::new(PixivClient::new(
            http(upstream::pixiv::default_headers(&cfg.pixiv.language))?,
            cfg.pixiv.refresh_tokens.clone(),
        )))
    } else {
        None
    };

    let sauce = if cfg.sauce.enabled {
        Some(Arc::new(SauceClient::new(
            http(HeaderMap::new())?,
            cfg.sauce.api_keys.clone(),
            cfg.sauce.image_max_size,
            cfg.sauce.image_timeout,
        )))
    } else {
        None
    };

    let wallpaper = if cfg.wallpaper.enabled {
        Some(Arc::new(WallpaperClient::new(http(HeaderMap::new())?)))
    } else {
        None
    };

    Ok(AppState {
        cache,
        metrics,
        bilibili,
        netease,
        tieba,
        bika,
        pixiv,
        sauce,
        wallpaper,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term_signal) => term_signal.recv().await,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                None
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
