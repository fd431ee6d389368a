//! Origin Connector (C3): maintains at most one live origin connection per
//! host, owned exclusively by the serving task that created it (no entry is
//! ever shared across tasks).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::ServeError;
use injector_core::ShutdownRx;

#[derive(Clone, Copy, Debug)]
pub struct OriginConfig {
	pub connect_timeout: Duration,
	pub request_timeout: Duration,
}

impl Default for OriginConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(10),
			request_timeout: Duration::from_secs(60),
		}
	}
}

struct Connection {
	sender: hyper::client::conn::http1::SendRequest<Full<Bytes>>,
	driver: tokio::task::JoinHandle<()>,
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.driver.abort();
	}
}

/// The per-task host-connection table. Never `Clone`, never shared: each
/// serving task (see `serve::serve_connection`) owns exactly one.
pub struct OriginConnector {
	config: OriginConfig,
	connections: HashMap<String, Connection>,
}

impl OriginConnector {
	pub fn new(config: OriginConfig) -> Self {
		Self {
			config,
			connections: HashMap::new(),
		}
	}

	/// Fetches `req` from `host`, dialing a fresh connection to the first of
	/// `endpoints` if none exists yet. Hop-by-hop headers must already be
	/// stripped by the caller (the cache-control/injection layer and the
	/// plain-proxy path both do this before calling `fetch`).
	pub async fn fetch(
		&mut self,
		host: &str,
		endpoints: &[SocketAddr],
		req: http::Request<Bytes>,
		shutdown: &mut ShutdownRx,
	) -> Result<http::Response<Bytes>, ServeError> {
		let keep_alive_requested = !wants_close(req.headers());

		if !self.connections.contains_key(host) {
			let ep = *endpoints
				.first()
				.ok_or_else(|| ServeError::Unreachable(format!("no endpoints for {host}")))?;
			let conn = tokio::select! {
				res = tokio::time::timeout(self.config.connect_timeout, Self::dial(ep)) => {
					match res {
						Ok(Ok(conn)) => conn,
						Ok(Err(e)) => return Err(ServeError::Unreachable(e.to_string())),
						Err(_) => return Err(ServeError::Unreachable(format!("connect to {ep} timed out"))),
					}
				}
				_ = shutdown.signalled() => return Err(ServeError::Cancelled),
			};
			self.connections.insert(host.to_string(), conn);
		}

		let mut req = req;
		ensure_origin_form(&mut req, host);
		let (parts, body) = req.into_parts();
		let body = Full::new(body);
		let req = http::Request::from_parts(parts, body);

		let send = {
			let entry = self.connections.get_mut(host).expect("just inserted");
			entry.sender.send_request(req)
		};

		let resp = tokio::select! {
			res = tokio::time::timeout(self.config.request_timeout, send) => {
				match res {
					Ok(Ok(resp)) => resp,
					Ok(Err(e)) => {
						self.connections.remove(host);
						return Err(ServeError::OriginProtocolError(e.to_string()));
					}
					Err(_) => {
						self.connections.remove(host);
						return Err(ServeError::OriginProtocolError(format!("request to {host} timed out")));
					}
				}
			}
			_ = shutdown.signalled() => {
				self.connections.remove(host);
				return Err(ServeError::Cancelled);
			}
		};

		let should_close = !keep_alive_requested || wants_close(resp.headers());
		let (parts, body) = resp.into_parts();
		let collected = body
			.collect()
			.await
			.map_err(|e| ServeError::OriginProtocolError(e.to_string()))?
			.to_bytes();

		if should_close {
			self.connections.remove(host);
		}
		Ok(http::Response::from_parts(parts, collected))
	}

	async fn dial(ep: SocketAddr) -> std::io::Result<Connection> {
		let stream = TcpStream::connect(ep).await?;
		let io = TokioIo::new(stream);
		let (sender, conn) = hyper::client::conn::http1::handshake(io)
			.await
			.map_err(std::io::Error::other)?;
		let driver = tokio::spawn(async move {
			if let Err(e) = conn.await {
				tracing::debug!(error = %e, "origin connection driver exited");
			}
		});
		Ok(Connection { sender, driver })
	}
}

/// Rewrites a proxied request's absolute-form target (`GET http://host/path
/// HTTP/1.1`) down to origin-form (`GET /path HTTP/1.1`) before it goes out
/// over the per-host connection, and makes sure a `Host` header is present —
/// an origin server, unlike a proxy, expects the request line to carry only
/// the path and query.
fn ensure_origin_form(req: &mut http::Request<Bytes>, host: &str) {
	if req.headers().get(http::header::HOST).is_none() {
		if let Ok(value) = http::HeaderValue::from_str(host) {
			req.headers_mut().insert(http::header::HOST, value);
		}
	}
	if req.uri().authority().is_some() {
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str())
			.unwrap_or("/");
		if let Ok(origin_form) = http::Uri::try_from(path_and_query) {
			*req.uri_mut() = origin_form;
		}
	}
}

fn wants_close(headers: &http::HeaderMap) -> bool {
	headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("close"))
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	async fn echo_server() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = vec![0u8; 4096];
			let n = sock.read(&mut buf).await.unwrap();
			let _ = &buf[..n];
			let body = b"hi";
			let resp = format!(
				"HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
				body.len(),
				std::str::from_utf8(body).unwrap()
			);
			sock.write_all(resp.as_bytes()).await.unwrap();
		});
		addr
	}

	#[tokio::test]
	async fn fetches_and_reuses_connection_by_host() {
		let addr = echo_server().await;
		let mut connector = OriginConnector::new(OriginConfig::default());
		let mut shutdown = injector_core::Shutdown::new().subscribe();

		let req = http::Request::builder()
			.method("GET")
			.uri("/a")
			.header(http::header::HOST, "example.test")
			.body(Bytes::new())
			.unwrap();
		let resp = connector
			.fetch("example.test", &[addr], req, &mut shutdown)
			.await
			.unwrap();
		assert_eq!(resp.status(), 200);
		assert_eq!(resp.body(), &Bytes::from_static(b"hi"));
		assert!(
			connector.connections.contains_key("example.test"),
			"a keep-alive reply with no Connection header must leave the entry in place"
		);
	}

	async fn echo_server_with_connection_close() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = vec![0u8; 4096];
			let _ = sock.read(&mut buf).await.unwrap();
			sock
				.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi")
				.await
				.unwrap();
		});
		addr
	}

	#[tokio::test]
	async fn reused_connection_is_destroyed_after_connection_close() {
		let addr = echo_server_with_connection_close().await;
		let mut connector = OriginConnector::new(OriginConfig::default());
		let mut shutdown = injector_core::Shutdown::new().subscribe();

		let req = http::Request::builder()
			.method("GET")
			.uri("/a")
			.header(http::header::HOST, "example.test")
			.body(Bytes::new())
			.unwrap();
		let resp = connector
			.fetch("example.test", &[addr], req, &mut shutdown)
			.await
			.unwrap();

		assert_eq!(resp.status(), 200);
		assert!(
			!connector.connections.contains_key("example.test"),
			"a Connection: close reply must remove the host entry from the table"
		);
	}

	#[tokio::test]
	async fn rewrites_absolute_uri_to_origin_form_before_forwarding() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let captured = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = vec![0u8; 4096];
			let n = sock.read(&mut buf).await.unwrap();
			sock
				.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
				.await
				.unwrap();
			String::from_utf8_lossy(&buf[..n]).to_string()
		});

		let mut connector = OriginConnector::new(OriginConfig::default());
		let mut shutdown = injector_core::Shutdown::new().subscribe();
		let req = http::Request::builder()
			.method("GET")
			.uri(format!("http://{addr}/a?x=1"))
			.header(http::header::HOST, "example.test")
			.body(Bytes::new())
			.unwrap();
		connector.fetch("example.test", &[addr], req, &mut shutdown).await.unwrap();

		let request_line = captured.await.unwrap();
		assert!(
			request_line.starts_with("GET /a?x=1 HTTP/1.1"),
			"expected origin-form request line, got: {request_line:?}"
		);
	}

	#[tokio::test]
	async fn unreachable_endpoint_fails_within_timeout() {
		let mut connector = OriginConnector::new(OriginConfig {
			connect_timeout: Duration::from_millis(200),
			request_timeout: Duration::from_secs(5),
		});
		let mut shutdown = injector_core::Shutdown::new().subscribe();
		// Port 0 on loopback never accepts; this should fail fast via a
		// connection-refused error rather than the timeout, but either way
		// it must surface as Unreachable.
		let req = http::Request::builder()
			.body(Bytes::new())
			.unwrap();
		let err = connector
			.fetch("nobody.test", &["127.0.0.1:1".parse().unwrap()], req, &mut shutdown)
			.await
			.unwrap_err();
		assert!(matches!(err, ServeError::Unreachable(_)));
	}
}
