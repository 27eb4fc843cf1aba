use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Process-wide configuration, read once at startup from the environment
/// (plus `.env` via dotenvy). Upstream app keys and signing secrets are
/// compiled-in constants in the respective `upstream::*` modules; this layer
/// only carries the deployment-specific parts.
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub proxy: Option<String>,
    pub cache: CacheSettings,
    pub bilibili: BilibiliSettings,
    pub netease: NeteaseSettings,
    pub tieba: TiebaSettings,
    pub bika: BikaSettings,
    pub pixiv: PixivSettings,
    pub sauce: SauceSettings,
    pub wallpaper: WallpaperSettings,
}

pub struct CacheSettings {
    pub enabled: bool,
    /// `memory://` or a redis connection string.
    pub uri: String,
    pub default_ttl: Duration,
}

pub struct BilibiliSettings {
    pub enabled: bool,
    pub cookie: Option<String>,
    pub user_agent: String,
}

pub struct NeteaseSettings {
    pub enabled: bool,
    pub cookie: Option<String>,
    pub user_agent: String,
    /// IPv4 segment the spoofed `X-Real-IP` header is drawn from.
    pub source_segment: String,
}

pub struct TiebaSettings {
    pub enabled: bool,
}

pub struct BikaSettings {
    pub enabled: bool,
    pub email: Option<String>,
    pub password: Option<String>,
}

pub struct PixivSettings {
    pub enabled: bool,
    pub refresh_tokens: Vec<String>,
    pub language: String,
}

pub struct SauceSettings {
    pub enabled: bool,
    pub api_keys: Vec<String>,
    /// Maximum size of a fetched source image, in bytes.
    pub image_max_size: usize,
    pub image_timeout: Duration,
}

pub struct WallpaperSettings {
    pub enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("OMNIAPI_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid OMNIAPI_ADDR")?;

        let data_dir =
            PathBuf::from(env::var("OMNIAPI_DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        Ok(Self {
            listen_addr,
            data_dir,
            request_timeout: parse_duration("OMNIAPI_TIMEOUT_SECONDS", 20)?,
            proxy: optional("OMNIAPI_PROXY"),
            cache: CacheSettings {
                enabled: parse_bool("OMNIAPI_CACHE_ENABLED", true)?,
                uri: env::var("OMNIAPI_CACHE_URI").unwrap_or_else(|_| "memory://".to_string()),
                default_ttl: parse_duration("OMNIAPI_CACHE_TTL_SECONDS", 3600)?,
            },
            bilibili: BilibiliSettings {
                enabled: parse_bool("OMNIAPI_BILIBILI_ENABLED", true)?,
                cookie: optional("OMNIAPI_BILIBILI_COOKIE"),
                user_agent: env::var("OMNIAPI_BILIBILI_USER_AGENT")
                    .unwrap_or_else(|_| "Mozilla/5.0 BiliDroid/6.73.1".to_string()),
            },
            netease: NeteaseSettings {
                enabled: parse_bool("OMNIAPI_NETEASE_ENABLED", true)?,
                cookie: optional("OMNIAPI_NETEASE_COOKIE"),
                user_agent: env::var("OMNIAPI_NETEASE_USER_AGENT")
                    .unwrap_or_else(|_| "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string()),
                source_segment: env::var("OMNIAPI_NETEASE_SOURCE")
                    .unwrap_or_else(|_| "118.88.88.0/24".to_string()),
            },
            tieba: TiebaSettings {
                enabled: parse_bool("OMNIAPI_TIEBA_ENABLED", true)?,
            },
            bika: BikaSettings {
                enabled: parse_bool("OMNIAPI_BIKA_ENABLED", true)?,
                email: optional("OMNIAPI_BIKA_EMAIL"),
                password: optional("OMNIAPI_BIKA_PASSWORD"),
            },
            pixiv: PixivSettings {
                enabled: parse_bool("OMNIAPI_PIXIV_ENABLED", true)?,
                refresh_tokens: parse_list("OMNIAPI_PIXIV_TOKENS"),
                language: env::var("OMNIAPI_PIXIV_LANGUAGE")
                    .unwrap_or_else(|_| "zh-CN".to_string()),
            },
            sauce: SauceSettings {
                enabled: parse_bool("OMNIAPI_SAUCE_ENABLED", true)?,
                api_keys: parse_list("OMNIAPI_SAUCE_KEYS"),
                image_max_size: parse_usize("OMNIAPI_SAUCE_MAX_KB", 4096)? * 1024,
                image_timeout: parse_duration("OMNIAPI_SAUCE_TIMEOUT_SECONDS", 10)?,
            },
            wallpaper: WallpaperSettings {
                enabled: parse_bool("OMNIAPI_WALLPAPER_ENABLED", true)?,
            },
        })
    }
}

fn optional(env_key: &str) -> Option<String> {
    env::var(env_key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_list(env_key: &str) -> Vec<String> {
    env::var(env_key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(env_key: &str, default: bool) -> Result<bool> {
    let raw = env::var(env_key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{env_key} must be true or false"))
}

fn parse_usize(env_key: &str, default: usize) -> Result<usize> {
    let raw = env::var(env_key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{env_key} must be an integer"))
}

fn parse_duration(env_key: &str, default_secs: u64) -> Result<Duration> {
    let raw = env::var(env_key).unwrap_or_else(|_| default_secs.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{env_key} must be an integer number of seconds"))?;
    Ok(Duration::from_secs(secs))
}
