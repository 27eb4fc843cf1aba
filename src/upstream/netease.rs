//! netease cloud music `weapi` scheme.
//!
//! The request payload is JSON-encoded, AES-128-CBC encrypted with a
//! fixed key, base64'd, then encrypted again with a fresh random 16-byte
//! secret. The secret itself travels as `encSecKey`: the hex of a raw
//! modular exponentiation of the byte-reversed secret against the
//! upstream's public RSA parameters, zero-padded to 256 hex chars.
//! The upstream pads with PKCS7 only when the plaintext is not already
//! a block multiple, so the usual padded-encrypt helpers do not apply.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use anyhow::Context;
use base64::prelude::*;
use num_bigint::BigUint;
use rand::Rng;
use serde_json::{json, Map, Value};

use crate::error::AppError;
use crate::net::{ensure_success, read_text, HttpClient, RetryPolicy};
use crate::parse;
use crate::url::{self, Params};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const AES_KEY: &[u8] = b"0CoJUm6Qyw8W8jud";
const AES_IV: &[u8] = b"0102030405060708";
const RSA_EXPONENT: u32 = 0x10001;
const RSA_MODULUS_HEX: &str = "00e0b509f6259df8642dbc3566290147\
7df22677ec152b5ff68ace615bb7b725\
152b3ab17a876aea8a5aa76d2e417629\
ec4ee341f56135fccf695280104e0312\
ecbda92557c93870114af6c9d05c4f7f\
0c3685b7a46bee255932575cce10b424\
d813cfe4875d3e82047b97ddef52741d\
546b8e289dc6935b3ece0462db0a22b8e7";

const HOST: &str = "http://music.163.com";

fn rsa_modulus() -> &'static BigUint {
    static MODULUS: OnceLock<BigUint> = OnceLock::new();
    MODULUS.get_or_init(|| {
        BigUint::parse_bytes(RSA_MODULUS_HEX.as_bytes(), 16).expect("hex constant")
    })
}

/// AES-128-CBC, PKCS7-padded only when the input is not a block
/// multiple, rendered as standard base64.
fn aes_base64(data: &[u8], key: &[u8]) -> Result<String, AppError> {
    let mut buf = data.to_vec();
    let rem = buf.len() % 16;
    if rem != 0 {
        let pad = 16 - rem;
        buf.extend(std::iter::repeat(pad as u8).take(pad));
    }
    let cipher = Aes128CbcEnc::new_from_slices(key, AES_IV)
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("bad AES key length: {e}")))?;
    let encrypted = cipher.encrypt_padded_vec_mut::<NoPadding>(&buf);
    Ok(BASE64_STANDARD.encode(encrypted))
}

/// Raw `pow(base, e, n)` over the input bytes, zero-padded to 256 hex
/// chars. No OAEP, no PKCS1; the upstream really does textbook RSA.
fn rsa_hex(data: &[u8]) -> String {
    let base = BigUint::from_bytes_be(data);
    let result = base.modpow(&BigUint::from(RSA_EXPONENT), rsa_modulus());
    format!("{:0>256}", result.to_str_radix(16))
}

/// The two form fields a `weapi` POST carries.
pub struct WeapiForm {
    pub params: String,
    pub enc_sec_key: String,
}

pub fn encrypt(payload: &Value, secret: &[u8; 16]) -> Result<WeapiForm, AppError> {
    let plain = serde_json::to_string(payload)
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("unserializable weapi payload: {e}")))?;
    let inner = aes_base64(plain.as_bytes(), AES_KEY)?;
    let outer = aes_base64(inner.as_bytes(), secret)?;
    let reversed: Vec<u8> = secret.iter().rev().copied().collect();
    Ok(WeapiForm {
        params: outer,
        enc_sec_key: rsa_hex(&reversed),
    })
}

/// 16 url-safe characters, matching the shape of the secrets the web
/// player generates.
fn random_secret<R: Rng>(rng: &mut R) -> [u8; 16] {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut secret = [0u8; 16];
    for byte in &mut secret {
        *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
    }
    secret
}

/// Mirrors the payload into the query string; non-scalar values are
/// carried as their JSON text.
fn query_from_payload(payload: &Map<String, Value>) -> Params {
    let mut params = Params::new();
    for (key, value) in payload {
        match value {
            Value::String(s) => params.insert(key, s.as_str()),
            Value::Bool(b) => params.insert(key, *b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => params.insert(key, i),
                None => params.insert(key, n.to_string()),
            },
            other => params.insert(key, other.to_string()),
        };
    }
    params
}

pub struct NeteaseClient {
    http: HttpClient,
    retry: RetryPolicy,
    /// Spoofed-source network, as (network address, host bit count).
    source: (u32, u32),
}

impl NeteaseClient {
    pub fn new(http: HttpClient, source_segment: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = source_segment
            .split_once('/')
            .with_context(|| format!("`{source_segment}` is not CIDR notation"))?;
        let base: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("bad network address in `{source_segment}`"))?;
        let prefix: u32 = prefix
            .parse()
            .with_context(|| format!("bad prefix length in `{source_segment}`"))?;
        anyhow::ensure!(prefix <= 32, "prefix length in `{source_segment}` exceeds 32");
        let host_bits = 32 - prefix;
        let network = if host_bits == 32 {
            0
        } else {
            (u32::from(base) >> host_bits) << host_bits
        };
        Ok(Self {
            http,
            retry: RetryPolicy::default(),
            source: (network, host_bits),
        })
    }

    fn random_source_ip<R: Rng>(&self, rng: &mut R) -> Ipv4Addr {
        let (network, host_bits) = self.source;
        let offset = if host_bits == 0 {
            0
        } else {
            rng.gen_range(0..(1u64 << host_bits)) as u32
        };
        Ipv4Addr::from(network | offset)
    }

    async fn request(
        &self,
        path: &str,
        mut payload: Map<String, Value>,
    ) -> Result<Value, AppError> {
        payload.insert("csrf_token".to_string(), json!(""));
        let query = query_from_payload(&payload);
        let url = url::build(HOST, path, &query);

        let body = Value::Object(payload);
        let secret = random_secret(&mut rand::thread_rng());
        let form = tokio::task::spawn_blocking(move || encrypt(&body, &secret))
            .await
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("crypto task failed: {e}")))??;

        let source_ip = self.random_source_ip(&mut rand::thread_rng());
        let request = self
            .http
            .client()
            .post(url)
            .header("x-real-ip", source_ip.to_string())
            .form(&[("params", form.params), ("encSecKey", form.enc_sec_key)]);
        let response = self.http.send_retrying(request, &self.retry).await?;
        let response = ensure_success(response).await?;
        let text = read_text(response).await?;
        // A blank 200 is this upstream's way of rejecting a request.
        if text.trim().is_empty() {
            return Err(AppError::upstream(format!(
                "upstream endpoint {path} returned blank content"
            )));
        }
        parse::loose_json(&text)
    }

    pub async fn search(
        &self,
        s: &str,
        search_type: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Value, AppError> {
        let mut payload = Map::new();
        payload.insert("s".into(), json!(s));
        payload.insert("type".into(), json!(search_type));
        payload.insert("limit".into(), json!(limit));
        payload.insert("offset".into(), json!(offset));
        payload.insert("total".into(), json!(true));
        self.request("weapi/cloudsearch/get/web", payload).await
    }

    pub async fn detail(&self, ids: &[i64]) -> Result<Value, AppError> {
        let c: Vec<Value> = ids.iter().map(|id| json!({"id": id.to_string()})).collect();
        let c = serde_json::to_string(&c)
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("unserializable id list: {e}")))?;
        let mut payload = Map::new();
        payload.insert("c".into(), json!(c));
        self.request("weapi/v3/song/detail", payload).await
    }

    pub async fn song(&self, ids: &[i64], bitrate: i64) -> Result<Value, AppError> {
        let mut payload = Map::new();
        payload.insert("ids".into(), json!(ids));
        payload.insert("br".into(), json!(bitrate));
        self.request("weapi/song/enhance/player/url", payload).await
    }

    pub async fn playlist(&self, id: i64) -> Result<Value, AppError> {
        let mut payload = Map::new();
        payload.insert("id".into(), json!(id));
        payload.insert("total".into(), json!(true));
        payload.insert("offset".into(), json!(0));
        payload.insert("limit".into(), json!(1000));
        payload.insert("n".into(), json!(1000));
        self.request("weapi/v6/playlist/detail", payload).await
    }

    pub async fn lyric(&self, id: i64) -> Result<Value, AppError> {
        let mut payload = Map::new();
        payload.insert("id".into(), json!(id));
        payload.insert("os".into(), json!("pc"));
        payload.insert("lv".into(), json!(-1));
        payload.insert("kv".into(), json!(-1));
        payload.insert("tv".into(), json!(-1));
        self.request("weapi/song/lyric", payload).await
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    const SECRET: &[u8; 16] = b"0123456789abcdef";

    #[test]
    fn aes_pads_only_partial_blocks() {
        // exactly one block, no padding applied
        assert_eq!(
            aes_base64(b"0123456789abcdef", AES_KEY).unwrap(),
            "+s1cweq9MeCjimX+ZgluyQ=="
        );
        assert_eq!(
            aes_base64(br#"{"csrf_token":""}"#, AES_KEY).unwrap(),
            "eHhjXckqrtZkqcwCalCMx0QuU6Lj9L7Wxouw1iMCnB4="
        );
    }

    #[test]
    fn double_encryption_matches_known_vector() {
        let inner = aes_base64(br#"{"csrf_token":""}"#, AES_KEY).unwrap();
        assert_eq!(
            aes_base64(inner.as_bytes(), SECRET).unwrap(),
            "echuH06dDs7OxMA2egejtvWuTbLs/0W4Iar5ZYYlrHZMs++29jrOmUM2kZbJQK22"
        );
    }

    #[test]
    fn enc_sec_key_matches_known_vector() {
        let reversed: Vec<u8> = SECRET.iter().rev().copied().collect();
        let expected = "35701388baf89fed412e11269b9c76625d095ecaf17f03fa018abe19ea2d38b9\
49debf242ee39a71ca1f6cda71b1b86a45aa909ee27f7e78e267d34e732f0de9\
48206c3340a788d0003372183e2f753c1f78b66ac23d134ac1fc9b993156520e\
a826b8aa89a962d4491b4b8d7e08738e1da9b07aa39bf4a7ef0b1c210728cd52";
        assert_eq!(rsa_hex(&reversed), expected);
    }

    #[test]
    fn encrypt_produces_the_full_form() {
        let form = encrypt(&json!({"csrf_token": ""}), SECRET).unwrap();
        assert_eq!(
            form.params,
            "echuH06dDs7OxMA2egejtvWuTbLs/0W4Iar5ZYYlrHZMs++29jrOmUM2kZbJQK22"
        );
        assert_eq!(form.enc_sec_key.len(), 256);
    }

    #[test]
    fn random_secret_stays_in_the_urlsafe_alphabet() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let secret = random_secret(&mut rng);
        assert!(secret
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_'));
    }

    #[test]
    fn query_carries_lists_as_json_text() {
        let mut payload = Map::new();
        payload.insert("ids".into(), json!([1, 2]));
        payload.insert("br".into(), json!(320000));
        let params = query_from_payload(&payload);
        assert_eq!(params.get("ids").unwrap().to_string(), "[1,2]");
        assert_eq!(params.get("br").unwrap().to_string(), "320000");
    }

    #[tokio::test]
    async fn source_ip_stays_inside_the_segment() {
        let http = HttpClient::new(
            Default::default(),
            None,
            std::time::Duration::from_secs(1),
            crate::metrics::Metrics::new().unwrap(),
        )
        .unwrap();
        let client = NeteaseClient::new(http, "118.88.88.0/24").unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        for _ in 0..32 {
            let ip = client.random_source_ip(&mut rng);
            assert_eq!(ip.octets()[..3], [118, 88, 88]);
        }
    }

    #[test]
    fn bad_segments_fail_at_startup() {
        assert!(NeteaseClient::new(test_http(), "885.0.0.0/24").is_err());
        assert!(NeteaseClient::new(test_http(), "10.0.0.0").is_err());
        assert!(NeteaseClient::new(test_http(), "10.0.0.0/40").is_err());
    }

    fn test_http() -> HttpClient {
        HttpClient::new(
            Default::default(),
            None,
            std::time::Duration::from_secs(1),
            crate::metrics::Metrics::new().unwrap(),
        )
        .unwrap()
    }
}
