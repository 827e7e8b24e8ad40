//! Derives absolute cache expiry from HTTP headers, reference type, and a
//! fallback TTL (`spec.md` §4.4).

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use tracing::warn;

/// Default fallback TTL for SHA references when none is configured.
pub const DEFAULT_SHA_FALLBACK: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// Default fallback TTL for non-SHA references (branch, tag, other) when none
/// is configured.
pub const DEFAULT_REF_FALLBACK: StdDuration = StdDuration::from_secs(2 * 60);

/// The maximum fallback TTL ever applied to a non-SHA reference, regardless
/// of a larger configured `fallback_ttl`.
pub const NON_SHA_FALLBACK_CAP: StdDuration = StdDuration::from_secs(2 * 60);

/// Returns true if `reference` is a 40-character lowercase-hex commit SHA.
#[must_use]
pub fn is_sha_reference(reference: &str) -> bool {
    reference.len() == 40 && reference.bytes().all(|byte| byte.is_ascii_hexdigit() && !byte.is_ascii_uppercase())
}

fn find_header_case_insensitive<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.as_str().eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.to_str().ok())
}

fn parse_expires_header(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = find_header_case_insensitive(headers, "expires")?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn parse_max_age(headers: &HeaderMap) -> Option<i64> {
    let raw = find_header_case_insensitive(headers, "cache-control")?;
    raw.split(',').find_map(|directive| {
        let directive = directive.trim();
        let value = directive.strip_prefix("max-age=")?;
        let seconds: i64 = value.trim().parse().ok()?;
        if seconds < 0 { None } else { Some(seconds) }
    })
}

/// Computes the absolute expiry for a cached resource.
///
/// Order of precedence, per `spec.md` §4.4:
/// 1. An `Expires` header (RFC 1123), if present and parseable.
/// 2. A `Cache-Control: max-age=<seconds>` directive (negative values
///    rejected).
/// 3. A fallback based on whether `reference` is a SHA: `fallback_ttl` (or
///    24h) for SHAs, `min(fallback_ttl, 2m)` (or 2m) for everything else.
#[must_use]
pub fn compute_expiry(
    headers: &HeaderMap,
    reference: &str,
    fallback_ttl: Option<StdDuration>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if let Some(expires) = parse_expires_header(headers) {
        return expires;
    }

    if let Some(max_age) = parse_max_age(headers) {
        return now + chrono::Duration::seconds(max_age);
    }

    let ttl = if is_sha_reference(reference) {
        fallback_ttl.unwrap_or(DEFAULT_SHA_FALLBACK)
    } else {
        fallback_ttl.map_or(DEFAULT_REF_FALLBACK, |configured| {
            configured.min(NON_SHA_FALLBACK_CAP)
        })
    };

    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|error| {
        warn!(%error, "fallback TTL overflowed chrono::Duration, using zero");
        chrono::Duration::zero()
    });

    now + ttl
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use http::HeaderValue;

    use super::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn forty_char_lowercase_hex_is_a_sha_reference() {
        assert!(is_sha_reference(SHA));
        assert!(!is_sha_reference("main"));
        assert!(!is_sha_reference("0123456789ABCDEF0123456789abcdef01234567"));
    }

    #[test]
    fn sha_reference_without_headers_uses_24h_default() {
        let expiry = compute_expiry(&HeaderMap::new(), SHA, None, now());
        assert_eq!(expiry, now() + chrono::Duration::hours(24));
    }

    #[test]
    fn branch_reference_without_headers_uses_2m_default() {
        let expiry = compute_expiry(&HeaderMap::new(), "main", None, now());
        assert_eq!(expiry, now() + chrono::Duration::minutes(2));
    }

    #[test]
    fn branch_reference_clamps_configured_fallback_to_2m() {
        let expiry = compute_expiry(
            &HeaderMap::new(),
            "main",
            Some(StdDuration::from_secs(3600)),
            now(),
        );
        assert_eq!(expiry, now() + chrono::Duration::minutes(2));
    }

    #[test]
    fn sha_reference_honours_a_larger_configured_fallback() {
        let expiry = compute_expiry(
            &HeaderMap::new(),
            SHA,
            Some(StdDuration::from_secs(3600)),
            now(),
        );
        assert_eq!(expiry, now() + chrono::Duration::hours(1));
    }

    #[test]
    fn expires_header_wins_over_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Expires",
            HeaderValue::from_static("Thu, 01 Jan 2026 00:05:00 GMT"),
        );
        let expiry = compute_expiry(&headers, SHA, None, now());
        assert_eq!(expiry, Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn expires_header_is_matched_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "expires",
            HeaderValue::from_static("Thu, 01 Jan 2026 00:05:00 GMT"),
        );
        let expiry = compute_expiry(&headers, SHA, None, now());
        assert_eq!(expiry, Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn max_age_directive_is_used_when_expires_is_absent() {
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", HeaderValue::from_static("max-age=120"));
        let expiry = compute_expiry(&headers, "main", None, now());
        assert_eq!(expiry, now() + chrono::Duration::seconds(120));
    }

    #[test]
    fn negative_max_age_is_rejected_and_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", HeaderValue::from_static("max-age=-5"));
        let expiry = compute_expiry(&headers, "main", None, now());
        assert_eq!(expiry, now() + chrono::Duration::minutes(2));
    }

    #[test]
    fn malformed_expires_header_falls_through_to_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert("Expires", HeaderValue::from_static("not-a-date"));
        headers.insert("Cache-Control", HeaderValue::from_static("max-age=30"));
        let expiry = compute_expiry(&headers, "main", None, now());
        assert_eq!(expiry, now() + chrono::Duration::seconds(30));
    }
}
