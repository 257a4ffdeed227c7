// src/cache/policy.rs
// =============================================================================
// HTTP/1.1 caching rules.
//
// Pure functions over headers and timestamps, so they can be tested without a
// store or a network:
// - freshness(): may a stored response be served as-is?
// - is_storable(): may a response be stored at all?
// - can_serve_stale_on_error(): stale-if-error handling
//
// The Dummy policy skips all of this: everything storable, everything fresh.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, CACHE_CONTROL, DATE, EXPIRES};
use reqwest::StatusCode;

use crate::config::CachePolicy;

// Statuses a shared HTTP/1.1 cache may keep
const STORABLE_STATUSES: [u16; 11] = [200, 203, 204, 300, 301, 304, 404, 405, 410, 414, 501];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve the stored response without contacting the origin
    Fresh,
    /// Revalidate with the origin when a validator is available
    Stale,
    /// The request asked to bypass the stored copy entirely
    Transparent,
}

/// Parsed Cache-Control directives. A bare directive maps to an empty value.
#[derive(Debug, Default)]
pub struct CacheControl(HashMap<String, String>);

impl CacheControl {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut directives = HashMap::new();

        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',') {
                let directive = directive.trim();
                if directive.is_empty() {
                    continue;
                }
                match directive.split_once('=') {
                    Some((name, arg)) => directives.insert(
                        name.trim().to_ascii_lowercase(),
                        arg.trim().trim_matches('"').to_string(),
                    ),
                    None => directives.insert(directive.to_ascii_lowercase(), String::new()),
                };
            }
        }

        Self(directives)
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    // Directive value as seconds. Missing or malformed values give None.
    pub fn seconds(&self, name: &str) -> Option<Duration> {
        self.value(name)?.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn header_date(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

// Age of a stored response: now minus its Date header, or minus the time it
// was stored when the origin sent no Date.
fn current_age(res_headers: &HeaderMap, stored_at: SystemTime, now: SystemTime) -> Duration {
    let date = header_date(res_headers, DATE).unwrap_or(stored_at);
    now.duration_since(date).unwrap_or_default()
}

pub fn freshness(
    policy: CachePolicy,
    req_headers: &HeaderMap,
    res_headers: &HeaderMap,
    stored_at: SystemTime,
    now: SystemTime,
) -> Freshness {
    if policy == CachePolicy::Dummy {
        return Freshness::Fresh;
    }

    let req_cc = CacheControl::parse(req_headers);
    let res_cc = CacheControl::parse(res_headers);

    if req_cc.has("no-cache") {
        return Freshness::Transparent;
    }
    if res_cc.has("no-cache") {
        return Freshness::Stale;
    }
    if req_cc.has("only-if-cached") {
        return Freshness::Fresh;
    }

    let mut age = current_age(res_headers, stored_at, now);

    let mut lifetime = match res_cc.seconds("max-age") {
        Some(max_age) => max_age,
        None => {
            let date = header_date(res_headers, DATE).unwrap_or(stored_at);
            header_date(res_headers, EXPIRES)
                .and_then(|expires| expires.duration_since(date).ok())
                .unwrap_or_default()
        }
    };

    if let Some(max_age) = req_cc.seconds("max-age") {
        lifetime = max_age;
    }
    if let Some(min_fresh) = req_cc.seconds("min-fresh") {
        age += min_fresh;
    }
    if let Some(max_stale) = req_cc.value("max-stale") {
        if max_stale.is_empty() {
            return Freshness::Fresh;
        }
        if let Ok(secs) = max_stale.parse::<u64>() {
            age = age.saturating_sub(Duration::from_secs(secs));
        }
    }

    if lifetime > age {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}

pub fn is_storable(
    policy: CachePolicy,
    req_headers: &HeaderMap,
    status: StatusCode,
    res_headers: &HeaderMap,
) -> bool {
    if policy == CachePolicy::Dummy {
        return true;
    }

    if CacheControl::parse(req_headers).has("no-store")
        || CacheControl::parse(res_headers).has("no-store")
    {
        return false;
    }

    STORABLE_STATUSES.contains(&status.as_u16())
}

// stale-if-error on either side allows the stored copy to stand in for a
// failed fetch. A bare directive allows it forever, a valued one only while
// the stored copy is younger than that.
pub fn can_serve_stale_on_error(
    req_headers: &HeaderMap,
    res_headers: &HeaderMap,
    stored_at: SystemTime,
    now: SystemTime,
) -> bool {
    let age = current_age(res_headers, stored_at, now);

    for cc in [CacheControl::parse(res_headers), CacheControl::parse(req_headers)] {
        match cc.value("stale-if-error") {
            Some("") => return true,
            Some(limit) => {
                if let Ok(secs) = limit.parse::<u64>() {
                    if Duration::from_secs(secs) > age {
                        return true;
                    }
                }
            }
            None => {}
        }
    }

    false
}
