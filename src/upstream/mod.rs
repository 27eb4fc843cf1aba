//! Per-upstream integrations: signing scheme, default headers and a thin
//! client exposing the wrapped operations. Each client owns its
//! [`crate::net::HttpClient`] and returns upstream JSON as
//! `serde_json::Value` without interpreting it.

pub mod bika;
pub mod bilibili;
pub mod netease;
pub mod pixiv;
pub mod sauce;
pub mod tieba;
pub mod wallpaper;
