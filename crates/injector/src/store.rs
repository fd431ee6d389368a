//! The abstract `fetch_stored` / `fetch_fresh` / `store` collaborator (§9
//! design note) plus the external content-store primitive it wraps.
//!
//! `ContentStore` models "the underlying distributed cache store itself"
//! (an out-of-scope external collaborator): it only knows how to
//! look up and persist opaque (request, response) pairs by key and hand back
//! a serialized descriptor. `CacheInjector` is the richer, in-process
//! abstraction the cache-control engine (C4) actually talks to; its
//! production implementation, [`Injector`], layers the injection pipeline
//! (C5: hop-by-hop stripping, injection-id tagging, sync/async scheduling)
//! on top of an [`OriginConnector`] and a `ContentStore`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::ServeError;
use crate::headers::{
	X_OUINET_DESCRIPTOR, X_OUINET_INJECTION_ID, X_OUINET_SYNC, is_sync_requested, strip_hop_by_hop,
};
use crate::origin::OriginConnector;
use injector_core::ShutdownRx;

pub type Request = http::Request<Bytes>;
pub type Response = http::Response<Bytes>;

/// ⟨stored_response, stored_timestamp⟩, as returned by the external store.
#[derive(Clone)]
pub struct CacheEntry {
	pub response: Response,
	pub stored_at: SystemTime,
}

/// The external, out-of-scope distributed cache store primitive. Keyed by
/// an opaque string (the request URI, for GET-only caching); `insert`
/// returns the serialized descriptor bytes on success.
#[async_trait]
pub trait ContentStore: Send + Sync {
	async fn get(&self, key: &str) -> Option<CacheEntry>;
	async fn insert(&self, key: &str, req: &Request, resp: &Response) -> anyhow::Result<Bytes>;
}

/// The abstract three-method collaborator the cache-control engine (C4)
/// drives. Mocked directly in tests ([`FakeCacheInjector`]); wired to real
/// collaborators in production via [`Injector`].
#[async_trait]
pub trait CacheInjector: Send {
	async fn fetch_stored(&mut self, req: &Request) -> Option<CacheEntry>;
	async fn fetch_fresh(
		&mut self,
		req: Request,
		endpoints: &[SocketAddr],
	) -> Result<Response, ServeError>;
	async fn store(&mut self, req: Request, resp: Response) -> Result<Response, ServeError>;
}

pub fn cache_key(req: &Request) -> String {
	req.uri().to_string()
}

/// Zlib-compresses and base64-encodes a descriptor for the
/// `X-Ouinet-Descriptor` response header.
pub fn encode_descriptor(descriptor: &[u8]) -> String {
	use std::io::Write;

	use base64::Engine;
	let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
	// In-memory `Vec` writes never fail.
	encoder.write_all(descriptor).expect("in-memory write");
	let compressed = encoder.finish().expect("in-memory write");
	base64::engine::general_purpose::STANDARD.encode(compressed)
}

/// Inverse of [`encode_descriptor`], used by round-trip tests.
pub fn decode_descriptor(encoded: &str) -> anyhow::Result<Vec<u8>> {
	use std::io::Read;

	use base64::Engine;
	let compressed = base64::engine::general_purpose::STANDARD.decode(encoded)?;
	let mut decoder = flate2::read::ZlibDecoder::new(&compressed[..]);
	let mut out = Vec::new();
	decoder.read_to_end(&mut out)?;
	Ok(out)
}

/// The production `CacheInjector`: origin fetches go through an
/// [`OriginConnector`] (C3), persistence goes through a `ContentStore`. The
/// store is held as an `Arc` so the async-injection path (§4.5 step 5) can
/// spawn a detached task that outlives this borrow.
pub struct Injector<'a> {
	pub origin: &'a mut OriginConnector,
	pub content_store: Arc<dyn ContentStore>,
	pub shutdown: &'a mut ShutdownRx,
}

#[async_trait]
impl CacheInjector for Injector<'_> {
	async fn fetch_stored(&mut self, req: &Request) -> Option<CacheEntry> {
		self.content_store.get(&cache_key(req)).await
	}

	async fn fetch_fresh(
		&mut self,
		mut req: Request,
		endpoints: &[SocketAddr],
	) -> Result<Response, ServeError> {
		strip_hop_by_hop(req.headers_mut());
		req.headers_mut().insert(
			http::header::CONNECTION,
			http::HeaderValue::from_static("keep-alive"),
		);
		let host = req
			.uri()
			.host()
			.map(str::to_string)
			.or_else(|| {
				req
					.headers()
					.get(http::header::HOST)
					.and_then(|h| h.to_str().ok())
					.map(str::to_string)
			})
			.unwrap_or_default();

		let mut resp = self.origin.fetch(&host, endpoints, req, self.shutdown).await?;
		let injection_id = Uuid::new_v4().to_string();
		crate::headers::set_header(resp.headers_mut(), X_OUINET_INJECTION_ID, injection_id);
		Ok(resp)
	}

	async fn store(&mut self, mut req: Request, mut resp: Response) -> Result<Response, ServeError> {
		let sync = is_sync_requested(req.headers());
		req.headers_mut().remove(X_OUINET_SYNC);

		let injection_id = resp
			.headers()
			.get(X_OUINET_INJECTION_ID)
			.expect("fetch_fresh always tags the injection id before store is called")
			.to_str()
			.unwrap_or_default()
			.to_string();

		let (reason, cacheable) =
			crate::cachecontrol::ok_to_cache(req.headers(), resp.headers(), resp.status(), req.method());
		if !cacheable {
			tracing::debug!(injection_id, reason, "not caching response");
			return Ok(resp);
		}

		let mut stored_resp = resp.clone();
		crate::cachecontrol::filter_before_store(stored_resp.headers_mut());
		let key = cache_key(&req);

		if sync {
			match self.content_store.insert(&key, &req, &stored_resp).await {
				Ok(descriptor) => {
					let encoded = encode_descriptor(&descriptor);
					crate::headers::set_header(resp.headers_mut(), X_OUINET_DESCRIPTOR, encoded);
				},
				Err(e) => {
					tracing::warn!(injection_id, error = %e, "sync injection failed");
				},
			}
		} else {
			let store = self.content_store.clone();
			tokio::spawn(async move {
				match store.insert(&key, &req, &stored_resp).await {
					Ok(_) => tracing::debug!(injection_id, "async injection committed"),
					Err(e) => tracing::warn!(injection_id, error = %e, "async injection failed"),
				}
			});
		}
		Ok(resp)
	}
}

/// In-memory `ContentStore` (and, correspondingly, the default non-
/// distributed backend the binary runs against until a real store is wired
/// up), modeled on `rapina`'s `InMemoryCache` (`DashMap`-backed get/set) but
/// simplified to the plain, mutex-guarded `HashMap` shape the design note
/// asks for.
#[derive(Default)]
pub struct InMemoryContentStore {
	entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryContentStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
	async fn get(&self, key: &str) -> Option<CacheEntry> {
		self.entries.lock().unwrap().get(key).cloned()
	}

	async fn insert(&self, key: &str, _req: &Request, resp: &Response) -> anyhow::Result<Bytes> {
		let descriptor = Bytes::from(format!("descriptor:{key}"));
		self.entries.lock().unwrap().insert(
			key.to_string(),
			CacheEntry {
				response: resp.clone(),
				stored_at: SystemTime::now(),
			},
		);
		Ok(descriptor)
	}
}

/// A `CacheInjector` test double that skips the origin connector entirely:
/// `fetch_fresh` is supplied by a caller-provided closure, `fetch_stored`/
/// `store` hit an in-memory map. Used to unit-test the cache-control
/// decision tree (C4) in isolation from real network I/O.
#[cfg(test)]
pub(crate) struct FakeCacheInjector<F> {
	pub entries: HashMap<String, CacheEntry>,
	pub fresh: F,
	pub stores: Vec<(Request, Response)>,
}

#[cfg(test)]
impl<F> FakeCacheInjector<F>
where
	F: FnMut(&Request) -> Result<Response, ServeError> + Send,
{
	pub fn new(fresh: F) -> Self {
		Self {
			entries: HashMap::new(),
			fresh,
			stores: Vec::new(),
		}
	}
}

#[cfg(test)]
#[async_trait]
impl<F> CacheInjector for FakeCacheInjector<F>
where
	F: FnMut(&Request) -> Result<Response, ServeError> + Send,
{
	async fn fetch_stored(&mut self, req: &Request) -> Option<CacheEntry> {
		self.entries.get(&cache_key(req)).cloned()
	}

	async fn fetch_fresh(
		&mut self,
		req: Request,
		_endpoints: &[SocketAddr],
	) -> Result<Response, ServeError> {
		let mut resp = (self.fresh)(&req)?;
		crate::headers::set_header(
			resp.headers_mut(),
			X_OUINET_INJECTION_ID,
			Uuid::new_v4().to_string(),
		);
		Ok(resp)
	}

	async fn store(&mut self, req: Request, resp: Response) -> Result<Response, ServeError> {
		self.entries.insert(
			cache_key(&req),
			CacheEntry {
				response: resp.clone(),
				stored_at: SystemTime::now(),
			},
		);
		self.stores.push((req, resp.clone()));
		Ok(resp)
	}
}
