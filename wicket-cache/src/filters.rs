// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RFC 7234 evaluation: storability, freshness lifetime, age, revalidation.

use http::header;
use httpdate::parse_http_date;
use log::warn;
use std::time::{Duration, SystemTime};

use crate::cache_control::CacheControl;
use wicket_http::{Request, Status};

/// The freshness lifetime assumed when the response carries no explicit
/// expiry signal: one day.
pub const HEURISTIC_FRESH_SEC: u64 = 86_400;

/// The storability verdict for a `(request, response)` pair.
///
/// The reason and the expiry time feed the activity log (`NOTE not cacheable
/// because ...` / `NOTE cached, expires at ...`).
#[derive(Debug, PartialEq, Eq)]
pub enum Storability {
    Store {
        /// When the stored response will turn stale. `None` when the
        /// response carries an expiry signal that cannot be evaluated.
        expires_at: Option<SystemTime>,
    },
    NoStore { reason: &'static str },
}

/// Decide if the response may be written to the shared cache
/// ([RFC 7234 section 3](https://datatracker.ietf.org/doc/html/rfc7234#section-3)).
///
/// The caller has already checked the `(GET, 200)` gate; this evaluates the
/// header-driven rules.
pub fn response_storability(req: &Request, resp: &Status) -> Storability {
    if req.headers().contains_key(header::AUTHORIZATION) {
        return Storability::NoStore {
            reason: "found Authorization in header fields of the request",
        };
    }
    if let Some(cc) = CacheControl::from_req(req) {
        if cc.no_store() {
            return Storability::NoStore {
                reason: "no-store found in Cache-Control of the request",
            };
        }
    }
    if let Some(cc) = CacheControl::from_resp(resp) {
        if cc.no_store() {
            return Storability::NoStore {
                reason: "no-store found in Cache-Control of the response",
            };
        }
        if cc.private() {
            return Storability::NoStore {
                reason: "private found in Cache-Control of the response",
            };
        }
    }
    // Explicit freshness (Expires / max-age / s-maxage) makes the response
    // storable; in their absence the heuristic lifetime applies, so the
    // verdict is Store either way.
    let expires_at = freshness_lifetime(resp).map(|life| SystemTime::now() + life);
    Storability::Store { expires_at }
}

/// Freshness lifetime of a response
/// ([RFC 7234 section 4.2.1](https://datatracker.ietf.org/doc/html/rfc7234#section-4.2.1)).
///
/// Precedence: `s-maxage` > `max-age` > (`Expires` − `Date`) > the one-day
/// heuristic. `None` means the lifetime is undefined (a present but broken
/// `Expires`/`Date` pair) and the response must be treated as stale.
pub fn freshness_lifetime(resp: &Status) -> Option<Duration> {
    if let Some(cc) = CacheControl::from_resp(resp) {
        if let Some(secs) = cc.fresh_sec() {
            return Some(Duration::from_secs(secs.into()));
        }
    }

    let mut expires_iter = resp.headers().get_all(header::EXPIRES).iter();
    if let Some(expires) = expires_iter.next() {
        if expires_iter.next().is_some() {
            // multiple Expires headers are invalid
            return None;
        }
        let expires = parse_imf_date(expires.as_bytes())?;
        let date = resp.headers().get(header::DATE)?;
        let date = parse_imf_date(date.as_bytes())?;
        return expires.duration_since(date).ok();
    }

    Some(Duration::from_secs(HEURISTIC_FRESH_SEC))
}

/// Current age of a response
/// ([RFC 7234 section 4.2.3](https://datatracker.ietf.org/doc/html/rfc7234#section-4.2.3),
/// simplified).
///
/// `now − Date` when the response carries a usable `Date`, otherwise
/// `now − arrival` where `arrival` is when the response landed in the cache.
/// `None` means the age cannot be established (a date in the future) and the
/// response must be treated as stale.
pub fn response_age(resp: &Status, arrival: SystemTime, now: SystemTime) -> Option<Duration> {
    match resp.headers().get(header::DATE).and_then(|d| parse_imf_date(d.as_bytes())) {
        Some(date) => now.duration_since(date).ok(),
        None => now.duration_since(arrival).ok(),
    }
}

/// Whether a stored response is still fresh: both the lifetime and the age
/// are defined, and the lifetime strictly exceeds the age
/// ([RFC 7234 section 4.2](https://datatracker.ietf.org/doc/html/rfc7234#section-4.2)).
pub fn is_fresh(resp: &Status, arrival: SystemTime, now: SystemTime) -> bool {
    let lifetime = freshness_lifetime(resp);
    let age = response_age(resp, arrival, now);
    log::debug!("freshness lifetime {lifetime:?}, age {age:?}");
    match (lifetime, age) {
        (Some(lifetime), Some(age)) => lifetime > age,
        _ => false,
    }
}

/// Build the conditional request for revalidating `cached`
/// ([RFC 7232 section 3](https://datatracker.ietf.org/doc/html/rfc7232#section-3)):
/// a copy of the original request with `If-None-Match` from the cached
/// `ETag` and `If-Modified-Since` from the cached `Last-Modified`.
pub fn build_validation_request(req: &Request, cached: &Status) -> Request {
    let mut validation = req.clone();
    // rfc7232: "SHOULD send both validators in cache validation"; origins
    // have been seen with a matching ETag but no Last-Modified
    if let Some(etag) = cached.headers().get(header::ETAG) {
        // the value is already a valid header value, this cannot fail
        validation
            .append_header(header::IF_NONE_MATCH, etag.clone())
            .unwrap();
    }
    if let Some(since) = cached.headers().get(header::LAST_MODIFIED) {
        validation
            .append_header(header::IF_MODIFIED_SINCE, since.clone())
            .unwrap();
    }
    validation
}

// RFC 7231 IMF-fixdate (and the obsolete forms httpdate knows), in UTC.
fn parse_imf_date(value: &[u8]) -> Option<SystemTime> {
    let value = std::str::from_utf8(value).ok()?;
    parse_http_date(value)
        .map_err(|e| warn!("invalid HTTP date {value:?}: {e}"))
        .ok()
}
