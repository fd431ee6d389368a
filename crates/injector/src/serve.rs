//! Request Server Loop (C7): the per-connection state machine from
//! the injector.
//!
//! ```text
//!   IDLE ── read_request ──► AUTH
//!   AUTH ── ok ──► CLASSIFY        AUTH ── fail ──► respond 407, IDLE
//!   CLASSIFY ── CONNECT ──► TUNNEL(terminal)
//!   CLASSIFY ── injector-mode ──► CACHE_CONTROL
//!   CLASSIFY ── proxy-mode   ──► FRESH_ONLY
//!   CACHE_CONTROL / FRESH_ONLY ── ok ──► WRITE_BACK
//!   WRITE_BACK ── keep-alive on both sides ──► IDLE
//!   WRITE_BACK ── otherwise ──► CLOSED(terminal)
//!   any state ── read/write error ──► CLOSED(terminal)
//!   any state ── shutdown signal ──► CLOSED(terminal)
//! ```
//!
//! Built as a `hyper::service::service_fn` driven by
//! `hyper::server::conn::http1`: hyper's own connection loop provides the
//! IDLE→read→...→WRITE_BACK→IDLE cycling (no pipelining — requests and
//! responses are strictly serialized per connection), and this module
//! supplies AUTH/CLASSIFY/dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderValue, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::ServeConfig;
use crate::error::ServeError;
use crate::origin::OriginConnector;
use crate::resolver::Resolver;
use crate::{auth, cachecontrol, connect, headers, store};
use injector_core::ShutdownRx;

struct ConnState {
	config: Arc<ServeConfig>,
	resolver: Arc<Resolver>,
	origin: OriginConnector,
	shutdown: ShutdownRx,
}

/// Drives one accepted connection to completion. Owns its own
/// `OriginConnector` (the host-connection table is never shared across
/// tasks) and terminates either when hyper's connection loop ends or when
/// `shutdown` fires, whichever comes first.
pub async fn serve_connection(
	stream: TcpStream,
	peer: SocketAddr,
	config: Arc<ServeConfig>,
	resolver: Arc<Resolver>,
	mut shutdown: ShutdownRx,
) {
	let io = TokioIo::new(stream);
	let origin = OriginConnector::new(config.origin);
	let state = Arc::new(Mutex::new(ConnState {
		origin,
		config,
		resolver,
		shutdown: shutdown.clone(),
	}));

	let service = service_fn(move |req| {
		let state = state.clone();
		async move { handle_request(state, req).await }
	});

	let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service).with_upgrades();
	tokio::pin!(conn);

	tokio::select! {
		res = conn.as_mut() => {
			if let Err(e) = res {
				tracing::debug!(peer = %peer, error = %e, "connection closed");
			}
		}
		_ = shutdown.signalled() => {
			conn.as_mut().graceful_shutdown();
			if let Err(e) = conn.await {
				tracing::debug!(peer = %peer, error = %e, "connection closed during shutdown");
			}
		}
	}
}

async fn handle_request(
	state: Arc<Mutex<ConnState>>,
	req: http::Request<Incoming>,
) -> Result<http::Response<Full<Bytes>>, std::io::Error> {
	let config = state.lock().await.config.clone();

	// AUTH
	if let Some(creds) = &config.credentials
		&& let Err(e) = creds.check(req.headers())
	{
		tracing::info!(error = %ServeError::AuthRequired, detail = %e, "authentication failed");
		return Ok(auth_challenge_response(creds.realm(), e));
	}

	// CLASSIFY: CONNECT is terminal-on-success (spliced in a spawned task)
	// and never touches the cache-control/origin body-collecting path.
	if req.method() == http::Method::CONNECT {
		return handle_connect(state, config, req).await;
	}

	let (parts, body) = req.into_parts();
	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			return Ok(error_response(
				StatusCode::BAD_REQUEST,
				format!("failed to read request body: {e}"),
			));
		},
	};
	let req = http::Request::from_parts(parts, body_bytes);

	let result = match &config.cache {
		Some(cache_cfg) if headers::is_injector_mode(req.headers()) => {
			dispatch_injector(&state, *cache_cfg, req).await
		},
		_ => dispatch_plain_proxy(&state, req).await,
	};

	match result {
		Ok(resp) => Ok(resp.map(Full::new)),
		Err(ServeError::Cancelled) => Err(std::io::Error::other("connection shutting down")),
		Err(e) => {
			let (status, body) = e
				.status_and_body()
				.unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()));
			Ok(error_response(status, body))
		},
	}
}

/// Injector-mode dispatch: strips `X-Ouinet-Version` from the request copy
/// handed to the cache-control engine (it must never reach origin or the
/// store), resolves the target, and runs the C4 decision tree with a
/// production [`store::Injector`] collaborator.
async fn dispatch_injector(
	state: &Mutex<ConnState>,
	cache_cfg: cachecontrol::CacheControlConfig,
	mut req: http::Request<Bytes>,
) -> Result<http::Response<Bytes>, ServeError> {
	req.headers_mut().remove(headers::X_OUINET_VERSION);

	let mut guard = state.lock().await;
	let ConnState {
		resolver,
		origin,
		shutdown,
		config,
		..
	} = &mut *guard;
	let (_, endpoints) = resolver.resolve(&req, shutdown).await?;
	let mut collab = store::Injector {
		origin,
		content_store: config.content_store.clone(),
		shutdown,
	};
	cachecontrol::fetch(&mut collab, &cache_cfg, &endpoints, req).await
}

/// Proxy-mode dispatch: no cache interaction; origin fetch only, with
/// hop-by-hop stripping on the forward path and the response streamed back
/// verbatim.
async fn dispatch_plain_proxy(
	state: &Mutex<ConnState>,
	mut req: http::Request<Bytes>,
) -> Result<http::Response<Bytes>, ServeError> {
	let mut guard = state.lock().await;
	let ConnState {
		resolver,
		origin,
		shutdown,
		..
	} = &mut *guard;
	let (host, endpoints) = resolver.resolve(&req, shutdown).await?;
	headers::strip_hop_by_hop(req.headers_mut());
	origin.fetch(&host, &endpoints, req, shutdown).await
}

async fn handle_connect(
	state: Arc<Mutex<ConnState>>,
	config: Arc<ServeConfig>,
	req: http::Request<Incoming>,
) -> Result<http::Response<Full<Bytes>>, std::io::Error> {
	if !config.connect.enabled {
		return Ok(error_response(
			StatusCode::METHOD_NOT_ALLOWED,
			"CONNECT requests are disabled".to_string(),
		));
	}

	let Some(authority) = req.uri().authority().cloned() else {
		return Ok(error_response(
			StatusCode::BAD_REQUEST,
			"Missing CONNECT authority".to_string(),
		));
	};

	let (resolver, mut shutdown) = {
		let guard = state.lock().await;
		(guard.resolver.clone(), guard.shutdown.clone())
	};

	let origin_stream = match connect::validate_and_dial(&config.connect, &resolver, &authority, &mut shutdown).await {
		Ok(stream) => stream,
		Err(e) => {
			let (status, body) = e
				.status_and_body()
				.unwrap_or((StatusCode::BAD_REQUEST, e.to_string()));
			return Ok(error_response(status, body));
		},
	};

	let splice_shutdown = shutdown.clone();
	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => connect::splice(upgraded, origin_stream, splice_shutdown).await,
			Err(e) => tracing::debug!(error = %e, "CONNECT upgrade failed"),
		}
	});

	Ok(connect::ok_response())
}

fn error_response(status: StatusCode, body: String) -> http::Response<Full<Bytes>> {
	http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(Full::new(Bytes::from(body)))
		.expect("status/body are always valid")
}

fn auth_challenge_response(realm: &str, err: auth::Error) -> http::Response<Full<Bytes>> {
	let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
		.unwrap_or_else(|_| HeaderValue::from_static("Basic"));
	http::Response::builder()
		.status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
		.header(header::PROXY_AUTHENTICATE, challenge)
		.body(Full::new(Bytes::from(err.to_string())))
		.expect("status/body are always valid")
}
