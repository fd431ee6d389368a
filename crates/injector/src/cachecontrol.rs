//! Cache-Control Engine (C4): the stored-vs-fresh decision tree, freshness/
//! staleness rules, and cacheability policy. Pure functions operate on
//! header maps and timestamps; [`fetch`] drives the abstract
//! [`crate::store::CacheInjector`] collaborator through the decision tree.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::error::ServeError;
use crate::headers::HOP_BY_HOP;
use crate::store::CacheInjector;

/// `max_cached_age` policy. `-1` (Unbounded) disables the age ceiling
/// entirely; `0` (never-cache-on-read) makes every stored entry stale.
#[derive(Clone, Copy, Debug)]
pub enum MaxCachedAge {
	Unbounded,
	Seconds(u64),
}

impl MaxCachedAge {
	pub fn from_cli_value(secs: i64) -> Self {
		if secs < 0 {
			MaxCachedAge::Unbounded
		} else {
			MaxCachedAge::Seconds(secs as u64)
		}
	}
}

#[derive(Clone, Copy, Debug)]
pub struct CacheControlConfig {
	pub max_cached_age: MaxCachedAge,
}

impl Default for CacheControlConfig {
	fn default() -> Self {
		Self {
			// One week.
			max_cached_age: MaxCachedAge::Seconds(7 * 24 * 60 * 60),
		}
	}
}

/// Drives the stored-vs-fresh decision tree:
///
/// ```text
/// 1. Only GET is cache-eligible.
/// 2. Request forbids caching -> fetch_fresh, do not store.
/// 3. fetch_stored hit, not stale, not too old -> return stored response.
/// 4. fetch_fresh, try_to_cache.
/// 5. Return the fresh response.
/// ```
pub async fn fetch<C: CacheInjector>(
	collab: &mut C,
	cfg: &CacheControlConfig,
	endpoints: &[SocketAddr],
	req: http::Request<Bytes>,
) -> Result<http::Response<Bytes>, ServeError> {
	if req.method() != Method::GET {
		return collab.fetch_fresh(req, endpoints).await;
	}
	if forbids_caching(req.headers()) {
		return collab.fetch_fresh(req, endpoints).await;
	}

	if let Some(entry) = collab.fetch_stored(&req).await {
		let stale = is_stale(entry.stored_at, entry.response.headers())
			|| is_older_than_max_cache_age(entry.stored_at, cfg.max_cached_age);
		if !stale {
			return Ok(entry.response);
		}
	}

	let fresh = collab.fetch_fresh(req.clone_without_body(), endpoints).await?;
	collab.store(req, fresh).await
}

/// `http::Request` doesn't implement `Clone` when the body doesn't; callers
/// need both the original request (for `store`) and a copy to hand to
/// `fetch_fresh`. Bodies are never present on cache-eligible (GET) requests,
/// so a body-less clone is exact, not an approximation.
trait CloneWithoutBody {
	fn clone_without_body(&self) -> Self;
}

impl CloneWithoutBody for http::Request<Bytes> {
	fn clone_without_body(&self) -> Self {
		let mut builder = http::Request::builder()
			.method(self.method().clone())
			.uri(self.uri().clone())
			.version(self.version());
		*builder.headers_mut().unwrap() = self.headers().clone();
		builder.body(self.body().clone()).expect("headers already validated")
	}
}

/// True when the request carries `Cache-Control: no-store`, `no-cache`, or
/// `Pragma: no-cache`.
pub fn forbids_caching(headers: &HeaderMap) -> bool {
	cache_control_contains(headers, "no-store")
		|| cache_control_contains(headers, "no-cache")
		|| header_eq(headers, "pragma", "no-cache")
}

fn cache_control_contains(headers: &HeaderMap, directive: &str) -> bool {
	headers
		.get_all(http::header::CACHE_CONTROL)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.any(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case(directive)))
}

fn header_eq(headers: &HeaderMap, name: &str, value: &str) -> bool {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case(value))
		.unwrap_or(false)
}

fn max_age(headers: &HeaderMap) -> Option<u64> {
	headers.get_all(http::header::CACHE_CONTROL).iter().find_map(|v| {
		let v = v.to_str().ok()?;
		v.split(',').find_map(|tok| {
			let tok = tok.trim();
			let rest = tok.strip_prefix("max-age=")?;
			rest.parse::<u64>().ok()
		})
	})
}

fn expires_at(headers: &HeaderMap) -> Option<SystemTime> {
	let raw = headers.get(http::header::EXPIRES)?.to_str().ok()?;
	httpdate::parse_http_date(raw).ok()
}

fn last_modified_at(headers: &HeaderMap) -> Option<SystemTime> {
	let raw = headers.get(http::header::LAST_MODIFIED)?.to_str().ok()?;
	httpdate::parse_http_date(raw).ok()
}

/// True when a stored entry at age `now - t` must be treated as stale. When both `max-age` and `Expires` are
/// present, `max-age` wins.
/// Indeterminate freshness is treated as stale.
pub fn is_stale(stored_at: SystemTime, resp_headers: &HeaderMap) -> bool {
	if cache_control_contains(resp_headers, "no-cache") {
		return true;
	}
	let now = SystemTime::now();
	if let Some(n) = max_age(resp_headers) {
		return age_of(now, stored_at) > Duration::from_secs(n);
	}
	if let Some(expires) = expires_at(resp_headers) {
		return now > expires;
	}
	match last_modified_at(resp_headers) {
		Some(last_modified) => {
			let since_modified = age_of(stored_at, last_modified);
			let heuristic = std::cmp::min(since_modified / 10, Duration::from_secs(24 * 60 * 60));
			age_of(now, stored_at) > heuristic
		},
		// No explicit freshness information and no heuristic basis: treat as
		// indeterminate, hence stale.
		None => true,
	}
}

fn age_of(later: SystemTime, earlier: SystemTime) -> Duration {
	later.duration_since(earlier).unwrap_or(Duration::ZERO)
}

/// True when a stored entry is older than the configured cache-age ceiling.
pub fn is_older_than_max_cache_age(stored_at: SystemTime, max: MaxCachedAge) -> bool {
	match max {
		MaxCachedAge::Unbounded => false,
		MaxCachedAge::Seconds(secs) => age_of(SystemTime::now(), stored_at) > Duration::from_secs(secs),
	}
}

/// Decides whether a response is cacheable at all; returns the outcome
/// plus a machine-readable reason string for logging.
pub fn ok_to_cache(req_hdr: &HeaderMap, resp_hdr: &HeaderMap, status: http::StatusCode, method: &Method) -> (&'static str, bool) {
	if *method != Method::GET {
		return ("method not GET", false);
	}
	if !matches!(
		status.as_u16(),
		200 | 203 | 204 | 300 | 301 | 404 | 410
	) {
		return ("status not cacheable", false);
	}
	if cache_control_contains(req_hdr, "no-store") || cache_control_contains(resp_hdr, "no-store") {
		return ("no-store", false);
	}
	if req_hdr.contains_key(http::header::AUTHORIZATION) && !cache_control_contains(resp_hdr, "public") {
		return ("authorization without explicit public", false);
	}
	if max_age(resp_hdr).is_none() && !resp_hdr.contains_key(http::header::EXPIRES) && !resp_hdr.contains_key(http::header::LAST_MODIFIED) {
		return ("no freshness information", false);
	}
	("ok", true)
}

/// Strips hop-by-hop headers and the control headers before a response hits
/// the store. The injection-id header
/// is preserved: the descriptor references it.
pub fn filter_before_store(headers: &mut HeaderMap) {
	for name in HOP_BY_HOP {
		headers.remove(name);
	}
	crate::headers::strip_control_headers(headers);
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	use crate::store::{CacheEntry, FakeCacheInjector};

	fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut h = HeaderMap::new();
		for (k, v) in pairs {
			h.insert(http::HeaderName::try_from(*k).unwrap(), v.parse().unwrap());
		}
		h
	}

	fn get_request(uri: &str) -> http::Request<Bytes> {
		http::Request::builder()
			.method(Method::GET)
			.uri(uri)
			.body(Bytes::new())
			.unwrap()
	}

	fn response_with(pairs: &[(&str, &str)]) -> http::Response<Bytes> {
		let mut builder = http::Response::builder().status(http::StatusCode::OK);
		for (k, v) in pairs {
			builder = builder.header(*k, *v);
		}
		builder.body(Bytes::from_static(b"stored body")).unwrap()
	}

	#[tokio::test]
	async fn fresh_stored_entry_is_returned_without_calling_fetch_fresh() {
		let mut collab = FakeCacheInjector::new(|_req| panic!("fetch_fresh must not run on a cache hit"));
		collab.entries.insert(
			"http://example.test/a".to_string(),
			CacheEntry {
				response: response_with(&[("cache-control", "max-age=60")]),
				stored_at: SystemTime::now(),
			},
		);

		let req = get_request("http://example.test/a");
		let resp = fetch(&mut collab, &CacheControlConfig::default(), &[], req).await.unwrap();

		assert_eq!(resp.body(), &Bytes::from_static(b"stored body"));
		assert!(collab.stores.is_empty(), "a fresh hit must not re-store");
	}

	#[tokio::test]
	async fn stale_stored_entry_falls_through_to_fetch_fresh_and_is_re_stored() {
		let mut collab = FakeCacheInjector::new(|_req| {
			Ok(response_with(&[("cache-control", "max-age=60")])
				.map(|_| Bytes::from_static(b"fresh body")))
		});
		collab.entries.insert(
			"http://example.test/a".to_string(),
			CacheEntry {
				response: response_with(&[("cache-control", "max-age=1")]),
				stored_at: SystemTime::now() - Duration::from_secs(30),
			},
		);

		let req = get_request("http://example.test/a");
		let resp = fetch(&mut collab, &CacheControlConfig::default(), &[], req).await.unwrap();

		assert_eq!(resp.body(), &Bytes::from_static(b"fresh body"));
		assert_eq!(collab.stores.len(), 1, "a stale hit must re-fetch and re-store");
	}

	#[tokio::test]
	async fn too_old_stored_entry_is_treated_as_stale_even_if_still_fresh_by_max_age() {
		let mut collab = FakeCacheInjector::new(|_req| {
			Ok(response_with(&[("cache-control", "max-age=600")])
				.map(|_| Bytes::from_static(b"fresh body")))
		});
		collab.entries.insert(
			"http://example.test/a".to_string(),
			CacheEntry {
				// Fresh by max-age alone, but older than a 10-second ceiling.
				response: response_with(&[("cache-control", "max-age=600")]),
				stored_at: SystemTime::now() - Duration::from_secs(20),
			},
		);

		let cfg = CacheControlConfig {
			max_cached_age: MaxCachedAge::Seconds(10),
		};
		let req = get_request("http://example.test/a");
		let resp = fetch(&mut collab, &cfg, &[], req).await.unwrap();

		assert_eq!(resp.body(), &Bytes::from_static(b"fresh body"));
	}

	#[test]
	fn forbids_caching_on_no_store_no_cache_and_pragma() {
		assert!(forbids_caching(&headers_with(&[("cache-control", "no-store")])));
		assert!(forbids_caching(&headers_with(&[("cache-control", "no-cache")])));
		assert!(forbids_caching(&headers_with(&[("pragma", "no-cache")])));
		assert!(!forbids_caching(&headers_with(&[("cache-control", "max-age=60")])));
	}

	#[test]
	fn is_stale_true_on_response_no_cache() {
		assert!(is_stale(SystemTime::now(), &headers_with(&[("cache-control", "no-cache")])));
	}

	#[test]
	fn is_stale_respects_max_age() {
		let stored_at = SystemTime::now() - Duration::from_secs(30);
		assert!(!is_stale(stored_at, &headers_with(&[("cache-control", "max-age=60")])));
		assert!(is_stale(stored_at, &headers_with(&[("cache-control", "max-age=10")])));
	}

	#[test]
	fn is_stale_true_when_indeterminate() {
		assert!(is_stale(SystemTime::now(), &HeaderMap::new()));
	}

	#[test]
	fn max_age_wins_tie_break_over_expires() {
		let stored_at = SystemTime::now() - Duration::from_secs(30);
		let future_expires = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(600));
		let headers = headers_with(&[("cache-control", "max-age=10"), ("expires", &future_expires)]);
		// max-age=10 has already elapsed (30s old) even though Expires is in
		// the future: max-age wins the tie-break.
		assert!(is_stale(stored_at, &headers));
	}

	#[test]
	fn max_cached_age_zero_means_always_stale() {
		assert!(is_older_than_max_cache_age(
			SystemTime::now() - Duration::from_millis(1),
			MaxCachedAge::Seconds(0)
		));
	}

	#[test]
	fn max_cached_age_unbounded_is_never_too_old() {
		assert!(!is_older_than_max_cache_age(
			SystemTime::now() - Duration::from_secs(10_000_000),
			MaxCachedAge::Unbounded
		));
	}

	#[test]
	fn ok_to_cache_requires_get_and_cacheable_status_and_freshness_info() {
		let req = HeaderMap::new();
		let resp = headers_with(&[("cache-control", "max-age=60")]);
		let (_, ok) = ok_to_cache(&req, &resp, http::StatusCode::OK, &Method::GET);
		assert!(ok);

		let (_, ok) = ok_to_cache(&req, &HeaderMap::new(), http::StatusCode::OK, &Method::GET);
		assert!(!ok, "no freshness information should block caching");

		let (_, ok) = ok_to_cache(&req, &resp, http::StatusCode::OK, &Method::POST);
		assert!(!ok, "non-GET should block caching");
	}

	#[test]
	fn ok_to_cache_blocks_authorization_unless_response_is_public() {
		let req = headers_with(&[("authorization", "Basic xyz")]);
		let resp = headers_with(&[("cache-control", "max-age=60")]);
		let (_, ok) = ok_to_cache(&req, &resp, http::StatusCode::OK, &Method::GET);
		assert!(!ok);

		let resp_public = headers_with(&[("cache-control", "max-age=60, public")]);
		let (_, ok) = ok_to_cache(&req, &resp_public, http::StatusCode::OK, &Method::GET);
		assert!(ok);
	}

	#[test]
	fn filter_before_store_strips_hop_by_hop_and_control_headers_but_keeps_injection_id() {
		let mut headers = headers_with(&[
			("connection", "close"),
			("x-ouinet-sync", "true"),
			("x-ouinet-version", "1"),
			("x-ouinet-injection-id", "abc"),
			("content-type", "text/plain"),
		]);
		filter_before_store(&mut headers);
		assert!(!headers.contains_key("connection"));
		assert!(!headers.contains_key("x-ouinet-sync"));
		assert!(!headers.contains_key("x-ouinet-version"));
		assert!(headers.contains_key("x-ouinet-injection-id"));
		assert!(headers.contains_key("content-type"));
	}
}
