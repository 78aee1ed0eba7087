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

//! The thread-safe response cache of the proxy.
//!
//! A [ProxyCache] pairs each stored request with its response as two sibling
//! blobs, `request_<id>` and `response_<id>`, under the `__cache__`
//! directory. Writers are serialized by a dedicated lock so the
//! look-up-then-write-two-files sequence stays atomic with respect to other
//! savers; readers run lock-free and treat a request blob whose response
//! sibling is missing as a miss.
//!
//! Transaction ids come from an ordered pool refilled in batches. Ids only
//! ever grow, except when the id space is exhausted, in which case the whole
//! cache is wiped and ids restart from zero.

#![warn(clippy::all)]

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use wicket_error::{Error, ErrorKind::*, Result};
use wicket_http::{Method, Request, RequestParser, Status, StatusCode, StatusParser};

pub mod cache_control;
pub mod filters;
pub mod store;

pub use filters::Storability;
pub use store::{FileStore, Storage};

/// How many fresh ids a pool refill adds.
const REFILL_BATCH: u64 = 100;

const REQ_PREFIX: &str = "request_";
const STA_PREFIX: &str = "response_";

static CACHE_INITD: AtomicBool = AtomicBool::new(false);

/// What [ProxyCache::construct_response] decided for a request.
#[derive(Debug)]
pub enum CacheDecision {
    /// Nothing usable in cache; go to the origin.
    Miss,
    /// A fresh cached response, ready for the client.
    Serve { id: String, resp: Status },
    /// A cached response that needs revalidation first: send `request` to
    /// the origin; on `304` reply with `cached`, on `200` cache and reply
    /// with the new response.
    Revalidate {
        id: String,
        cached: Status,
        request: Request,
    },
}

/// What [ProxyCache::save] did with a `(request, response)` pair.
#[derive(Debug)]
pub enum SaveOutcome {
    /// Not a `(GET, 200)` exchange; nothing written, no id assigned.
    NotEligible,
    /// Both sibling blobs were persisted under `id`.
    Saved {
        id: String,
        /// When the entry turns stale, for the activity log. `None` when
        /// the expiry signal is present but cannot be evaluated.
        expires_at: Option<SystemTime>,
    },
    /// The pair is not storable; `id` is still assigned for logging.
    Skipped { id: String, reason: &'static str },
}

// the pool of currently-free transaction ids
#[derive(Debug, Default)]
struct IdPool {
    free: BTreeSet<u64>,
    // high-water mark: every id at or below this has been pooled before,
    // whether or not it ever reached the disk
    floor: u64,
}

impl IdPool {
    // Scan the directory for the max live id and add REFILL_BATCH ids above
    // it (and above everything pooled before, so ids drawn but never saved
    // are not reissued). On id-space exhaustion the cache is wiped and ids
    // restart at 0.
    fn refill(&mut self, store: &dyn Storage) -> Result<()> {
        let mut max_id: u64 = self.floor;
        for name in store.entry_names()? {
            let Some((_, id)) = name.split_once('_') else {
                continue;
            };
            if let Ok(n) = id.parse::<u64>() {
                max_id = max_id.max(n);
            }
        }
        for i in 1..=REFILL_BATCH {
            match max_id.checked_add(i) {
                Some(n) => {
                    self.free.insert(n);
                }
                None => {
                    // running out of ids, possibly hostile traffic: start over
                    warn!("id space exhausted, wiping cache");
                    store.remove_all()?;
                    self.free.clear();
                    for j in 0..REFILL_BATCH {
                        self.free.insert(j);
                    }
                    self.floor = REFILL_BATCH - 1;
                    return Ok(());
                }
            }
        }
        self.floor = max_id + REFILL_BATCH;
        Ok(())
    }

    fn draw(&mut self, store: &dyn Storage) -> Result<String> {
        if self.free.is_empty() {
            self.refill(store)?;
        }
        let id = match self.free.iter().next() {
            Some(id) => *id,
            None => return Error::e_explain(InternalError, "id pool empty after refill"),
        };
        self.free.remove(&id);
        if self.free.is_empty() {
            self.refill(store)?;
        }
        Ok(id.to_string())
    }
}

struct FoundEntry {
    id: String,
    status: Status,
    arrival: SystemTime,
}

/// The process-wide response cache.
///
/// Singleton-typed: constructing a second instance in the same process is an
/// error. The one instance is shared behind an `Arc` by every connection
/// worker.
pub struct ProxyCache {
    store: FileStore,
    id_pool: Mutex<IdPool>,
    write_lock: Mutex<()>,
}

impl ProxyCache {
    /// Open the cache under `workdir`, restoring the id pool from whatever
    /// entries already exist on disk.
    pub fn new(workdir: &Path) -> Result<Self> {
        if CACHE_INITD.swap(true, Ordering::SeqCst) {
            return Error::e_explain(
                InternalError,
                "ProxyCache can only be constructed once per process",
            );
        }
        Self::open(workdir)
    }

    // construction without the singleton guard, for tests
    fn open(workdir: &Path) -> Result<Self> {
        let store = FileStore::new(workdir)?;
        let mut pool = IdPool::default();
        pool.refill(&store)?;
        Ok(ProxyCache {
            store,
            id_pool: Mutex::new(pool),
            write_lock: Mutex::new(()),
        })
    }

    fn req_name(id: &str) -> String {
        format!("{REQ_PREFIX}{id}")
    }

    fn sta_name(id: &str) -> String {
        format!("{STA_PREFIX}{id}")
    }

    /// Assign a transaction id for external usage.
    pub fn offer_id(&self) -> Result<String> {
        let mut pool = self.id_pool.lock();
        pool.draw(&self.store)
    }

    /// Store a `(request, response)` pair.
    ///
    /// Only `(GET, 200)` exchanges are eligible. An existing entry with the
    /// same request line is updated in place under its id; otherwise
    /// `prev_id` (the id the handler already drew for this transaction) is
    /// used, and the pool is tapped only when neither applies. Whether the
    /// pair was actually persisted is reported in the outcome along with
    /// the storability verdict.
    pub fn save(&self, req: &Request, sta: &Status, prev_id: Option<&str>) -> Result<SaveOutcome> {
        if req.method() != &Method::GET || sta.code() != StatusCode::OK {
            return Ok(SaveOutcome::NotEligible);
        }

        let _write_guard = self.write_lock.lock();

        let id = match self.find_id_by_request_line(req) {
            Some(id) => {
                if prev_id.is_some() && prev_id != Some(id.as_str()) {
                    debug!("save() updating entry {id}, ignoring caller id {prev_id:?}");
                }
                id
            }
            None => match prev_id {
                Some(p) => p.to_string(),
                None => {
                    let mut pool = self.id_pool.lock();
                    pool.draw(&self.store)?
                }
            },
        };

        match filters::response_storability(req, sta) {
            Storability::Store { expires_at } => {
                // request first, response second: a reader that sees the
                // request blob without its sibling treats it as a miss
                self.store.save(&Self::req_name(&id), &req.to_wire())?;
                self.store.save(&Self::sta_name(&id), &sta.to_wire())?;
                Ok(SaveOutcome::Saved { id, expires_at })
            }
            Storability::NoStore { reason } => Ok(SaveOutcome::Skipped { id, reason }),
        }
    }

    /// The serving decision for a request
    /// ([RFC 7234 section 4](https://datatracker.ietf.org/doc/html/rfc7234#section-4)).
    ///
    /// Total over all parsed requests; any cache-side failure degrades to
    /// [CacheDecision::Miss].
    pub fn construct_response(&self, req: &Request) -> CacheDecision {
        // rule 1: a stored request with the same request line
        let Some(entry) = self.lookup(req) else {
            return CacheDecision::Miss;
        };

        // rule 2: the method must be GET
        if req.method() != &Method::GET {
            return CacheDecision::Miss;
        }

        // rules 3 and 4: no-cache on either message forces revalidation
        let req_no_cache = cache_control::CacheControl::from_req(req)
            .map_or(false, |cc| cc.no_cache());
        let resp_no_cache = cache_control::CacheControl::from_resp(&entry.status)
            .map_or(false, |cc| cc.no_cache());
        if req_no_cache || resp_no_cache {
            debug!("revalidation forced by no-cache");
            let request = filters::build_validation_request(req, &entry.status);
            return CacheDecision::Revalidate {
                id: entry.id,
                cached: entry.status,
                request,
            };
        }

        // rule 5: fresh responses are served as they are
        if filters::is_fresh(&entry.status, entry.arrival, SystemTime::now()) {
            return CacheDecision::Serve {
                id: entry.id,
                resp: entry.status,
            };
        }

        // stale, and serving stale is never allowed here
        let request = filters::build_validation_request(req, &entry.status);
        CacheDecision::Revalidate {
            id: entry.id,
            cached: entry.status,
            request,
        }
    }

    // The id of the entry whose stored request line matches, sibling or not.
    fn find_id_by_request_line(&self, req: &Request) -> Option<String> {
        let names = self.store.entry_names().ok()?;
        for name in names {
            let Some(id) = name.strip_prefix(REQ_PREFIX) else {
                continue;
            };
            if self.stored_request_matches(&name, req) {
                return Some(id.to_string());
            }
        }
        None
    }

    // Full lookup: matching request blob plus its parsed response sibling
    // and arrival time. Unreadable or orphaned entries degrade to None.
    fn lookup(&self, req: &Request) -> Option<FoundEntry> {
        let names = self.store.entry_names().ok()?;
        for name in names {
            let Some(id) = name.strip_prefix(REQ_PREFIX) else {
                continue;
            };
            if !self.stored_request_matches(&name, req) {
                continue;
            }
            let sta_name = Self::sta_name(id);
            let Ok(sta_bytes) = self.store.get_msg_by_id(&sta_name) else {
                // the response sibling is not there (yet): a miss
                debug!("request blob {name} has no response sibling");
                return None;
            };
            let mut parser = StatusParser::new();
            parser.set_buffer(&sta_bytes);
            // stored blobs are complete serializations
            parser.mark_closed();
            let Ok(status) = parser.build() else {
                warn!("stored response {sta_name} does not parse, treating as miss");
                return None;
            };
            let Ok(arrival) = self.store.modified(&sta_name) else {
                return None;
            };
            return Some(FoundEntry {
                id: id.to_string(),
                status,
                arrival,
            });
        }
        None
    }

    fn stored_request_matches(&self, name: &str, req: &Request) -> bool {
        let Ok(bytes) = self.store.get_msg_by_id(name) else {
            return false;
        };
        let mut parser = RequestParser::new();
        parser.set_buffer(&bytes);
        match parser.build() {
            Ok(stored) => stored.start_line_eq(req),
            Err(_) => {
                // not ours or externally modified, skip it
                debug!("stored request {name} does not parse");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wicket_http::Version;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn open_cache() -> (tempfile::TempDir, ProxyCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProxyCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    fn get_request(target: &str) -> Request {
        let mut req = Request::new(Method::GET, target.as_bytes().to_vec(), Version::HTTP_11);
        req.append_header("Host", "h").unwrap();
        req
    }

    fn ok_response(cc: Option<&str>, body: &str) -> Status {
        let mut sta = Status::new(Version::HTTP_11, StatusCode::OK, "OK");
        sta.append_header("Content-Length", body.len()).unwrap();
        if let Some(cc) = cc {
            sta.append_header("Cache-Control", cc).unwrap();
        }
        sta.set_body(Bytes::copy_from_slice(body.as_bytes()));
        sta
    }

    #[test]
    fn test_singleton() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProxyCache::new(dir.path());
        let second = ProxyCache::new(dir.path());
        // exactly one of the two construction orders can win the flag, and
        // whichever came second must fail
        assert!(first.is_ok());
        assert!(second.is_err());
    }

    #[test]
    fn test_offer_id_monotonic() {
        init_log();
        let (_dir, cache) = open_cache();
        let a: u64 = cache.offer_id().unwrap().parse().unwrap();
        let b: u64 = cache.offer_id().unwrap().parse().unwrap();
        assert!(!cache.offer_id().unwrap().is_empty());
        assert!(b > a);
        assert!(a >= 1);
    }

    #[test]
    fn test_pool_refill_over_batch() {
        let (_dir, cache) = open_cache();
        let mut last = 0u64;
        for _ in 0..(REFILL_BATCH * 2 + 5) {
            let id: u64 = cache.offer_id().unwrap().parse().unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_pool_restores_above_disk_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ProxyCache::open(dir.path()).unwrap();
            let req = get_request("http://h/persisted");
            let sta = ok_response(Some("max-age=60"), "abc");
            cache.save(&req, &sta, Some("42")).unwrap();
        }
        // a new instance scans the directory and allocates above it
        let cache = ProxyCache::open(dir.path()).unwrap();
        let id: u64 = cache.offer_id().unwrap().parse().unwrap();
        assert!(id >= 43);
    }

    #[test]
    fn test_save_writes_sibling_blobs() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        let sta = ok_response(Some("max-age=60"), "abc");
        let outcome = cache.save(&req, &sta, None).unwrap();
        let SaveOutcome::Saved { id, expires_at } = outcome else {
            panic!("expected Saved, got {outcome:?}");
        };
        assert!(expires_at.is_some());
        assert_eq!(
            cache.store.get_msg_by_id(&ProxyCache::req_name(&id)).unwrap(),
            req.to_wire()
        );
        assert_eq!(
            cache.store.get_msg_by_id(&ProxyCache::sta_name(&id)).unwrap(),
            sta.to_wire()
        );
    }

    #[test]
    fn test_save_reuses_id_on_update() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        let outcome = cache.save(&req, &ok_response(Some("max-age=60"), "old"), None).unwrap();
        let SaveOutcome::Saved { id: first, .. } = outcome else {
            panic!("expected Saved");
        };

        let new_sta = ok_response(Some("max-age=60"), "new");
        let outcome = cache.save(&req, &new_sta, None).unwrap();
        let SaveOutcome::Saved { id: second, .. } = outcome else {
            panic!("expected Saved");
        };
        assert_eq!(first, second);
        assert_eq!(
            cache.store.get_msg_by_id(&ProxyCache::sta_name(&second)).unwrap(),
            new_sta.to_wire()
        );
    }

    #[test]
    fn test_save_uses_caller_id() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        let id = cache.offer_id().unwrap();
        let outcome = cache.save(&req, &ok_response(Some("max-age=60"), "abc"), Some(&id)).unwrap();
        let SaveOutcome::Saved { id: saved, .. } = outcome else {
            panic!("expected Saved");
        };
        assert_eq!(saved, id);
    }

    #[test]
    fn test_save_not_eligible() {
        let (_dir, cache) = open_cache();
        let post = Request::new(Method::POST, &b"http://h/x"[..], Version::HTTP_11);
        let outcome = cache.save(&post, &ok_response(None, "abc"), None).unwrap();
        assert!(matches!(outcome, SaveOutcome::NotEligible));

        let req = get_request("http://h/x");
        let teapot = Status::new(Version::HTTP_11, StatusCode::IM_A_TEAPOT, "Teapot");
        let outcome = cache.save(&req, &teapot, None).unwrap();
        assert!(matches!(outcome, SaveOutcome::NotEligible));
        // nothing on disk either way
        assert!(cache.store.entry_names().unwrap().is_empty());
    }

    #[test]
    fn test_save_skips_uncacheable_but_assigns_id() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        let sta = ok_response(Some("no-store"), "abc");
        let outcome = cache.save(&req, &sta, None).unwrap();
        let SaveOutcome::Skipped { id, reason } = outcome else {
            panic!("expected Skipped");
        };
        assert!(!id.is_empty());
        assert!(reason.contains("no-store"));
        assert!(cache.store.entry_names().unwrap().is_empty());
    }

    #[test]
    fn test_id_overflow_wipes_cache() {
        init_log();
        let (_dir, cache) = open_cache();
        // an entry at the top of the id space poisons the next refill
        cache
            .store
            .save(&ProxyCache::req_name(&u64::MAX.to_string()), b"x")
            .unwrap();

        let mut previous = cache.offer_id().unwrap().parse::<u64>().unwrap();
        let mut wiped = false;
        // draining the pool forces a rescan, which overflows and wipes
        for _ in 0..(REFILL_BATCH * 3) {
            let id: u64 = cache.offer_id().unwrap().parse().unwrap();
            if id < previous {
                wiped = true;
                // ids restarted from the bottom of the space
                assert!(id < REFILL_BATCH);
                break;
            }
            previous = id;
        }
        assert!(wiped, "pool never hit the overflow path");
        assert!(
            cache.store.entry_names().unwrap().is_empty(),
            "cache not wiped on id overflow"
        );
    }

    #[test]
    fn test_concurrent_savers_single_entry() {
        let (_dir, cache) = open_cache();
        let cache = std::sync::Arc::new(cache);
        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                let req = get_request("http://h/contended");
                let sta = ok_response(Some("max-age=60"), &format!("body{i}"));
                cache.save(&req, &sta, None).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // all savers landed on the same id; exactly one sibling pair exists
        let names = cache.store.entry_names().unwrap();
        assert_eq!(names.len(), 2, "entries: {names:?}");
        // and the pair is consistent: the stored response parses
        let req = get_request("http://h/contended");
        assert!(matches!(
            cache.construct_response(&req),
            CacheDecision::Serve { .. }
        ));
    }

    #[test]
    fn test_construct_response_miss() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/never-seen");
        assert!(matches!(cache.construct_response(&req), CacheDecision::Miss));
    }

    #[test]
    fn test_construct_response_serve_fresh() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        let sta = ok_response(Some("max-age=60"), "abc");
        cache.save(&req, &sta, None).unwrap();

        match cache.construct_response(&req) {
            CacheDecision::Serve { resp, .. } => assert_eq!(resp, sta),
            other => panic!("expected Serve, got {other:?}"),
        }
    }

    #[test]
    fn test_construct_response_header_variation_ignored() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        cache.save(&req, &ok_response(Some("max-age=60"), "abc"), None).unwrap();

        // same request line, different headers: still a hit
        let mut other = Request::new(Method::GET, req.raw_target().to_vec(), req.version());
        other.append_header("Host", "elsewhere").unwrap();
        other.append_header("Accept", "*/*").unwrap();
        assert!(matches!(
            cache.construct_response(&other),
            CacheDecision::Serve { .. }
        ));
    }

    #[test]
    fn test_construct_response_stale_revalidates() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        // max-age=0 makes the entry immediately stale
        let mut stale = ok_response(Some("max-age=0"), "abc");
        stale.append_header("ETag", "\"v1\"").unwrap();
        cache.save(&req, &stale, None).unwrap();

        match cache.construct_response(&req) {
            CacheDecision::Revalidate { cached, request, .. } => {
                assert_eq!(cached.body(), &Bytes::from_static(b"abc"));
                assert_eq!(request.headers().get("if-none-match").unwrap(), "\"v1\"");
            }
            other => panic!("expected Revalidate, got {other:?}"),
        }
    }

    #[test]
    fn test_construct_response_no_cache_revalidates() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        cache.save(&req, &ok_response(Some("max-age=60"), "abc"), None).unwrap();

        let mut no_cache_req = get_request("http://h/x");
        no_cache_req.append_header("Cache-Control", "no-cache").unwrap();
        assert!(matches!(
            cache.construct_response(&no_cache_req),
            CacheDecision::Revalidate { .. }
        ));

        // no-cache on the stored response forces it too
        let req2 = get_request("http://h/y");
        cache
            .save(&req2, &ok_response(Some("no-cache, max-age=60"), "abc"), None)
            .unwrap();
        assert!(matches!(
            cache.construct_response(&req2),
            CacheDecision::Revalidate { .. }
        ));
    }

    #[test]
    fn test_orphan_request_blob_is_a_miss() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        // a request blob with no response sibling, as in the narrow window
        // between the two writes of save()
        cache
            .store
            .save(&ProxyCache::req_name("9"), &req.to_wire())
            .unwrap();
        assert!(matches!(cache.construct_response(&req), CacheDecision::Miss));
    }

    #[test]
    fn test_stale_by_age_heuristic() {
        let (_dir, cache) = open_cache();
        let req = get_request("http://h/x");
        // Date far in the past makes the age exceed any explicit lifetime
        let mut sta = ok_response(Some("max-age=60"), "abc");
        sta.append_header("Date", "Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        cache.save(&req, &sta, None).unwrap();
        assert!(matches!(
            cache.construct_response(&req),
            CacheDecision::Revalidate { .. }
        ));
    }
}
