//! Session cookie wire format.
//!
//! The cookie carries `session_id|issued_at|signature`, where the signature
//! binds the cookie to the client address and user agent. The plaintext is
//! run through a keyed XOR stream, prefixed with a length counter and base64
//! encoded. This is obfuscation only; it does not authenticate the value.

use std::time::Duration;

use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use url::form_urlencoded;
use uuid::Uuid;

use crate::http::ClientInfo;
use crate::util::http_date;

use super::SessionConfig;

/// First byte of every obfuscated payload and the XOR seed.
const XOR_SEED: u8 = 65;

/// Age past which a cookie is reported as stale in the diagnostics.
pub const STALE_COOKIE_AGE: Duration = Duration::from_secs(31 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    #[error("session cookie key must not be empty")]
    EmptyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed session cookie: {0}")]
    MalformedValue(&'static str),
    #[error("session cookie signature does not match client `{session_id}`")]
    InvalidSignature { session_id: String },
    #[error("session cookie for `{session_id}` was issued in the future")]
    FutureTimestamp { session_id: String },
}

impl DecodeError {
    /// The session id recovered before validation failed, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            DecodeError::MalformedValue(_) => None,
            DecodeError::InvalidSignature { session_id }
            | DecodeError::FutureTimestamp { session_id } => Some(session_id),
        }
    }
}

/// A fresh random session id: 32 lowercase hex characters.
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether `id` has the shape of an id from [`new_session_id`]. Stores that
/// map ids onto the filesystem refuse anything else.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Client binding: `ip/user_agent`, or empty when the peer address is unknown.
///
/// `ip` is the whole `X-Forwarded-For` header when present.
pub fn signature(client: &ClientInfo) -> String {
    let Some(remote) = client.remote_addr else {
        return String::new();
    };
    let ip = match client.forwarded_for.as_deref() {
        Some(forwarded) if !forwarded.is_empty() => forwarded.to_string(),
        _ => remote.ip().to_string(),
    };
    format!("{ip}/{}", client.user_agent)
}

pub fn encode_cookie_value(
    key: &[u8],
    session_id: &str,
    client: &ClientInfo,
) -> Result<String, CookieError> {
    encode_at(
        key,
        session_id,
        client,
        OffsetDateTime::now_utc().unix_timestamp(),
    )
}

fn encode_at(
    key: &[u8],
    session_id: &str,
    client: &ClientInfo,
    issued_at: i64,
) -> Result<String, CookieError> {
    let plaintext = format!("{session_id}|{issued_at}|{}", signature(client));
    xor_encrypt(key, plaintext.as_bytes())
}

/// Recover the session id from a cookie value issued to `client`.
pub fn decode_cookie_value(
    key: &[u8],
    max_lifetime: Duration,
    cookie: &str,
    client: &ClientInfo,
) -> Result<String, DecodeError> {
    decode_at(
        key,
        max_lifetime,
        cookie,
        client,
        OffsetDateTime::now_utc().unix_timestamp(),
    )
}

fn decode_at(
    key: &[u8],
    max_lifetime: Duration,
    cookie: &str,
    client: &ClientInfo,
    now: i64,
) -> Result<String, DecodeError> {
    if cookie.is_empty() {
        return Err(DecodeError::MalformedValue("empty value"));
    }

    let plaintext = xor_decrypt(key, cookie)?;
    let text =
        String::from_utf8(plaintext).map_err(|_| DecodeError::MalformedValue("not utf-8"))?;
    let parts: Vec<&str> = text.split('|').collect();
    let [id, issued_at, presented] = parts.as_slice() else {
        return Err(DecodeError::MalformedValue("expected three fields"));
    };

    let session_id = id.trim_matches('\0').to_string();

    if *presented != signature(client) {
        return Err(DecodeError::InvalidSignature { session_id });
    }

    let issued_at: i64 = issued_at
        .parse()
        .map_err(|_| DecodeError::MalformedValue("timestamp"))?;
    if issued_at > now {
        return Err(DecodeError::FutureTimestamp { session_id });
    }

    let age = u64::try_from(now - issued_at).unwrap_or(u64::MAX);
    if age > STALE_COOKIE_AGE.as_secs() {
        debug!(
            target = "gantry::session::cookie",
            session_id = %session_id,
            age_secs = age,
            max_lifetime_secs = max_lifetime.as_secs(),
            "accepting session cookie older than 31 days"
        );
    }

    Ok(session_id)
}

fn xor_encrypt(key: &[u8], plaintext: &[u8]) -> Result<String, CookieError> {
    if key.is_empty() {
        return Err(CookieError::EmptyKey);
    }

    let mut value = Vec::with_capacity(plaintext.len() + 1);
    value.push(b'0');
    value.extend_from_slice(plaintext);

    let key_len = key.len();
    let count = value.len() + usize::from(XOR_SEED) % key_len;

    let mut out = format!("{}=", value.len() + key_len).into_bytes();
    out.reserve(count);
    out.push(XOR_SEED);
    for i in 1..count {
        out.push(value[i % value.len()] ^ key[i % key_len] ^ XOR_SEED);
    }

    Ok(STANDARD.encode(out))
}

fn xor_decrypt(key: &[u8], encoded: &str) -> Result<Vec<u8>, DecodeError> {
    if key.is_empty() {
        return Err(DecodeError::MalformedValue("empty key"));
    }

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| DecodeError::MalformedValue("invalid base64"))?;
    let separator = decoded
        .iter()
        .position(|&b| b == b'=')
        .ok_or(DecodeError::MalformedValue("missing counter"))?;
    let counter: usize = std::str::from_utf8(&decoded[..separator])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or(DecodeError::MalformedValue("invalid counter"))?;

    let data = &decoded[separator + 1..];
    let &seed = data
        .first()
        .ok_or(DecodeError::MalformedValue("empty payload"))?;
    let key_len = key.len();
    let value_len = data
        .len()
        .checked_sub(usize::from(seed) % key_len)
        .filter(|len| *len >= 1)
        .ok_or(DecodeError::MalformedValue("truncated payload"))?;

    let plaintext: Vec<u8> = (1..value_len)
        .map(|i| data[i] ^ seed ^ key[i % key_len])
        .collect();

    if counter != plaintext.len() + 1 + key_len {
        return Err(DecodeError::MalformedValue("counter mismatch"));
    }
    Ok(plaintext)
}

/// Value of the cookie called `name`, query-unescaped.
pub fn session_id_from_cookies(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(cookie_name, value)| *cookie_name == name && !value.is_empty())
        .and_then(|(_, value)| query_unescape(value))
        .filter(|value| !value.is_empty())
}

fn query_unescape(value: &str) -> Option<String> {
    // Shield the pair delimiters so the whole value parses as a single name.
    let shielded = value.replace('&', "%26").replace('=', "%3D");
    form_urlencoded::parse(shielded.as_bytes())
        .next()
        .map(|(decoded, _)| decoded.into_owned())
}

/// `Set-Cookie` header value for a freshly issued session cookie.
pub fn format_set_cookie(config: &SessionConfig, encoded: &str, now: OffsetDateTime) -> String {
    let escaped: String = form_urlencoded::byte_serialize(encoded.as_bytes()).collect();
    let mut cookie = format!("{}={escaped}; Path=/", config.name);

    if !config.domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(&config.domain);
    }
    if config.max_lifetime > 0 {
        let expires = now.saturating_add(time::Duration::seconds(
            i64::try_from(config.max_lifetime).unwrap_or(i64::MAX),
        ));
        cookie.push_str(&format!(
            "; Max-Age={}; Expires={}",
            config.max_lifetime,
            http_date::format(expires)
        ));
    }
    if config.http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use time::macros::datetime;

    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    fn client(ip: &str, agent: &str) -> ClientInfo {
        ClientInfo {
            remote_addr: Some(format!("{ip}:52000").parse().expect("addr")),
            forwarded_for: None,
            user_agent: agent.to_string(),
        }
    }

    #[test]
    fn xor_stream_matches_reference_bytes() {
        // "4=" counter, seed 'A', then 'a'^'k'^'A' = 'K' and 'b'^'k'^'A' = 'H'.
        assert_eq!(xor_encrypt(b"k", b"ab").expect("encrypt"), "ND1BS0g=");
        assert_eq!(xor_decrypt(b"k", "ND1BS0g=").expect("decrypt"), b"ab");
    }

    #[test]
    fn xor_round_trips_with_key_longer_than_value() {
        let key = b"a-rather-long-secret-key-for-short-values";
        let encoded = xor_encrypt(key, b"x").expect("encrypt");
        assert_eq!(xor_decrypt(key, &encoded).expect("decrypt"), b"x");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(xor_encrypt(b"", b"x"), Err(CookieError::EmptyKey));
        assert!(matches!(
            decode_cookie_value(b"", Duration::ZERO, "ND1BS0g=", &ClientInfo::default()),
            Err(DecodeError::MalformedValue(_))
        ));
    }

    #[test]
    fn cookie_round_trip_recovers_session_id() {
        let client = client("192.0.2.10", "Mozilla/5.0");
        let id = new_session_id();
        let cookie = encode_cookie_value(KEY, &id, &client).expect("encode");

        let decoded = decode_cookie_value(KEY, Duration::from_secs(3600), &cookie, &client);
        assert_eq!(decoded, Ok(id));
    }

    #[test]
    fn signature_binds_ip_and_user_agent() {
        let original = client("192.0.2.10", "Mozilla/5.0");
        let id = new_session_id();
        let cookie = encode_cookie_value(KEY, &id, &original).expect("encode");

        for other in [client("192.0.2.11", "Mozilla/5.0"), client("192.0.2.10", "curl/8")] {
            let err = decode_cookie_value(KEY, Duration::ZERO, &cookie, &other)
                .expect_err("foreign client");
            assert_eq!(
                err,
                DecodeError::InvalidSignature {
                    session_id: id.clone()
                }
            );
            assert_eq!(err.session_id(), Some(id.as_str()));
        }
    }

    #[test]
    fn forwarded_header_replaces_peer_ip_in_signature() {
        let mut proxied = client("10.0.0.1", "ua");
        proxied.forwarded_for = Some("203.0.113.5, 10.0.0.1".to_string());
        assert_eq!(signature(&proxied), "203.0.113.5, 10.0.0.1/ua");
        assert_eq!(signature(&client("10.0.0.1", "ua")), "10.0.0.1/ua");
        assert_eq!(signature(&ClientInfo::default()), "");
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let client = client("192.0.2.10", "ua");
        let id = new_session_id();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let cookie = encode_at(KEY, &id, &client, now + 600).expect("encode");

        let err = decode_at(KEY, Duration::ZERO, &cookie, &client, now).expect_err("future");
        assert_eq!(err, DecodeError::FutureTimestamp { session_id: id });
    }

    #[test]
    fn stale_cookie_is_still_accepted() {
        let client = client("192.0.2.10", "ua");
        let id = new_session_id();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let issued = now - i64::try_from(STALE_COOKIE_AGE.as_secs()).expect("fits") - 60;
        let cookie = encode_at(KEY, &id, &client, issued).expect("encode");

        assert_eq!(decode_at(KEY, Duration::ZERO, &cookie, &client, now), Ok(id));
    }

    #[test]
    fn garbage_is_malformed() {
        let client = ClientInfo::default();
        for cookie in ["", "***", "bm8tY291bnRlcg==", "MTA9", "eD1BQkM="] {
            assert!(
                matches!(
                    decode_cookie_value(KEY, Duration::ZERO, cookie, &client),
                    Err(DecodeError::MalformedValue(_))
                ),
                "{cookie:?} should be malformed"
            );
        }
    }

    #[test]
    fn any_session_id_round_trips() {
        let client = client("192.0.2.10", "ua");
        for id in ["session-ABC_42", "../../etc/passwd", "\u{e9}t\u{e9}"] {
            let cookie = encode_cookie_value(KEY, id, &client).expect("encode");
            assert_eq!(
                decode_cookie_value(KEY, Duration::ZERO, &cookie, &client),
                Ok(id.to_string())
            );
        }
    }

    #[test]
    fn wrong_key_does_not_recover_the_id() {
        let client = client("192.0.2.10", "ua");
        let cookie = encode_cookie_value(KEY, &new_session_id(), &client).expect("encode");
        assert!(decode_cookie_value(b"another key!!!!!", Duration::ZERO, &cookie, &client).is_err());
    }

    #[test]
    fn new_ids_are_hex_and_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 32);
        assert!(is_valid_session_id(&a));
        assert_ne!(a, b);
        assert!(!is_valid_session_id("ABCDEF"));
        assert!(!is_valid_session_id(""));
    }

    #[test]
    fn cookie_lookup_unescapes_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; gantry=ab%2Bcd%3D%3D; other=1"),
        );
        assert_eq!(
            session_id_from_cookies(&headers, "gantry").as_deref(),
            Some("ab+cd==")
        );
        assert!(session_id_from_cookies(&headers, "missing").is_none());
    }

    #[test]
    fn cookie_lookup_keeps_unescaped_padding() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("gantry=ND1BS0g="));
        assert_eq!(
            session_id_from_cookies(&headers, "gantry").as_deref(),
            Some("ND1BS0g=")
        );
    }

    #[test]
    fn set_cookie_carries_configured_attributes() {
        let config = SessionConfig {
            name: "gantry".into(),
            domain: "example.com".into(),
            max_lifetime: 3600,
            http_only: true,
            ..SessionConfig::default()
        };
        let now = datetime!(2024-01-01 00:00:00 UTC);

        let cookie = format_set_cookie(&config, "ab+cd==", now);
        assert_eq!(
            cookie,
            "gantry=ab%2Bcd%3D%3D; Path=/; Domain=example.com; Max-Age=3600; \
             Expires=Mon, 01 Jan 2024 01:00:00 GMT; HttpOnly"
        );
    }

    #[test]
    fn set_cookie_without_lifetime_is_a_browser_session_cookie() {
        let config = SessionConfig {
            name: "sid".into(),
            domain: String::new(),
            max_lifetime: 0,
            http_only: false,
            ..SessionConfig::default()
        };
        let cookie = format_set_cookie(&config, "v", OffsetDateTime::now_utc());
        assert_eq!(cookie, "sid=v; Path=/");
    }
}
