//! Mini-app authentication hook.
//!
//! The mini-app façade itself lives outside this service; the core only
//! exposes the signature check for the `X-Telegram-Init-Data` header so a
//! façade can authenticate requests without re-implementing the scheme.
//!
//! Scheme: `secret = HMAC_SHA256(key = "WebAppData", msg = bot_token)`,
//! then `hash = HMAC_SHA256(key = secret, msg = data_check_string)` where
//! the data-check string is every field except `hash`, sorted by key and
//! joined as `k=v` lines. The digest compare is constant-time.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WebAppUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

/// Validate `initData` and extract the authenticated user.
/// Returns `None` on any parse or signature failure.
pub fn validate_init_data(bot_token: &str, init_data: &str) -> Option<WebAppUser> {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut provided_hash: Option<String> = None;

    for pair in init_data.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key)?;
        let value = percent_decode(value)?;
        if key == "hash" {
            provided_hash = Some(value);
        } else {
            fields.push((key, value));
        }
    }

    let provided_hash = decode_hex(&provided_hash?)?;
    fields.sort();

    let data_check: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let data_check = data_check.join("\n");

    let mut secret = HmacSha256::new_from_slice(b"WebAppData").ok()?;
    secret.update(bot_token.as_bytes());
    let secret = secret.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&secret).ok()?;
    mac.update(data_check.as_bytes());
    mac.verify_slice(&provided_hash).ok()?;

    let user_json = fields
        .iter()
        .find(|(k, _)| k == "user")
        .map(|(_, v)| v.as_str())?;
    serde_json::from_str(user_json).ok()
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_digit(*bytes.get(i + 1)?)?;
                let lo = hex_digit(*bytes.get(i + 2)?)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    input
        .as_bytes()
        .chunks(2)
        .map(|pair| Some((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
