//! Rate-limit header parsing shared by the adapters.
//!
//! Providers use slightly different conventions:
//! - `retry-after`: seconds to wait (HTTP-date form is ignored)
//! - `retry-after-ms`: milliseconds to wait (OpenAI, Azure)
//! - `x-ratelimit-limit-requests` / `x-ratelimit-limit-tokens`: window limits
//! - `x-ratelimit-remaining-requests` / `x-ratelimit-remaining-tokens`: remaining in window
//! - `x-ratelimit-reset-requests` / `x-ratelimit-reset-tokens`: duration strings (`6m0s`, `20ms`)
//! - `x-ratelimit-limit` / `x-ratelimit-remaining` / `x-ratelimit-reset`: generic single-window form

use ratekeeper_core::{ErrorClass, RateLimitInfo};
use ratekeeper_error::ProviderError;
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Build a [`ProviderError`] from an HTTP response's parts.
///
/// Executors built on `reqwest` can call this with `response.status()`,
/// `response.headers()` and the body text. A JSON body's `error.code` (or
/// `error.type`) and `error.message` are lifted into the error when present.
pub fn provider_error_from_response(status: u16, headers: &HeaderMap, body: &str) -> ProviderError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let error_obj = parsed.as_ref().and_then(|v| v.get("error"));
    let message = error_obj
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(|m| m.as_str())
        .unwrap_or(body)
        .to_string();
    let code = error_obj
        .and_then(|e| e.get("code").or_else(|| e.get("type")))
        .and_then(|c| c.as_str())
        .map(str::to_string);

    let mut err = ProviderError::new(message).with_status(status);
    if let Some(code) = code {
        err = err.with_code(code);
    }
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            err = err.with_header(name.as_str(), value);
        }
    }
    err
}

/// Parse a reset duration such as `1s`, `20ms`, `6m0s`, `1h2m3.5s` or a bare
/// number of seconds.
pub fn parse_reset_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let mut total = 0.0_f64;
    let mut number = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let amount: f64 = number.parse().ok()?;
        number.clear();
        let unit_secs = match c {
            'h' => 3600.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += amount * unit_secs;
    }
    if !number.is_empty() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

/// `retry-after-ms` wins over `retry-after`.
pub(crate) fn retry_after(error: &ProviderError) -> Option<Duration> {
    if let Some(ms) = error
        .header("retry-after-ms")
        .and_then(|v| v.trim().parse::<f64>().ok())
    {
        return Duration::try_from_secs_f64(ms / 1000.0).ok();
    }
    error
        .header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn header_u64(error: &ProviderError, name: &str) -> Option<u64> {
    error.header(name)?.trim().parse().ok()
}

/// OpenAI-style split request/token headers.
pub(crate) fn split_window_info(error: &ProviderError) -> RateLimitInfo {
    RateLimitInfo {
        retry_after: retry_after(error),
        limit_requests: header_u64(error, "x-ratelimit-limit-requests"),
        remaining_requests: header_u64(error, "x-ratelimit-remaining-requests"),
        limit_tokens: header_u64(error, "x-ratelimit-limit-tokens"),
        remaining_tokens: header_u64(error, "x-ratelimit-remaining-tokens"),
        reset_requests: error
            .header("x-ratelimit-reset-requests")
            .and_then(parse_reset_duration),
        reset_tokens: error
            .header("x-ratelimit-reset-tokens")
            .and_then(parse_reset_duration),
    }
}

/// Generic single-window headers, counted as requests.
pub(crate) fn single_window_info(error: &ProviderError) -> RateLimitInfo {
    RateLimitInfo {
        retry_after: retry_after(error),
        limit_requests: header_u64(error, "x-ratelimit-limit"),
        remaining_requests: header_u64(error, "x-ratelimit-remaining"),
        reset_requests: error
            .header("x-ratelimit-reset")
            .and_then(parse_reset_duration),
        ..RateLimitInfo::default()
    }
}

/// Baseline classification by HTTP status.
///
/// A missing status means the request never got a response (connection
/// reset, timeout) and is treated as transient.
pub(crate) fn classify_status(status: Option<u16>) -> ErrorClass {
    match status {
        None => ErrorClass::Transient,
        Some(429) => ErrorClass::Throttle,
        Some(408 | 409 | 425) => ErrorClass::Transient,
        Some(500..=599) => ErrorClass::Transient,
        Some(_) => ErrorClass::Fatal,
    }
}
