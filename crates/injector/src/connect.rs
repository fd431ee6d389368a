//! CONNECT Tunnel (C6): validates the target port against an allow-list,
//! dials the origin, and once the client connection is upgraded, splices
//! bytes full-duplex until either side closes. No payload inspection ever
//! happens: a CONNECT-tunneled byte stream is
//! never observed, parsed, or cached).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::ServeError;
use crate::resolver::Resolver;
use injector_core::ShutdownRx;

/// Default CONNECT port allow-list (arbitrary,
/// kept configurable with this default).
pub const DEFAULT_ALLOWED_PORTS: &[u16] = &[80, 443, 8080, 8443];

#[derive(Clone)]
pub struct ConnectConfig {
	pub enabled: bool,
	pub allowed_ports: Vec<u16>,
	pub connect_timeout: Duration,
}

impl Default for ConnectConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			allowed_ports: DEFAULT_ALLOWED_PORTS.to_vec(),
			connect_timeout: Duration::from_secs(10),
		}
	}
}

/// Validates the CONNECT target and, if allowed, dials the origin. Returns
/// the dialed socket; the caller is responsible for replying `200 OK` and
/// then splicing once the client side has been upgraded (the socket must be
/// held across that gap, which is why dialing happens before the reply).
pub async fn validate_and_dial(
	cfg: &ConnectConfig,
	resolver: &Resolver,
	authority: &http::uri::Authority,
	shutdown: &mut ShutdownRx,
) -> Result<TcpStream, ServeError> {
	let host = authority.host().to_string();
	let port = authority.port_u16().unwrap_or(443);
	let target = format!("{host}:{port}");

	if !cfg.enabled {
		return Err(ServeError::IllegalConnectTarget(format!(
			"{target} (CONNECT disabled)"
		)));
	}
	if !cfg.allowed_ports.contains(&port) {
		return Err(ServeError::IllegalConnectTarget(target));
	}

	// Target resolution/safety filtering (C2) runs before any socket opens,
	// satisfying invariant 7: a disallowed port never opens an origin
	// socket, and neither does a local target on an allowed port.
	let (_, endpoints) = resolver
		.resolve_host_port(host, port, shutdown)
		.await
		.map_err(|e| match e {
			ServeError::IllegalTarget(h) => ServeError::IllegalConnectTarget(h),
			other => other,
		})?;
	let ep: SocketAddr = *endpoints
		.first()
		.ok_or_else(|| ServeError::Unreachable(format!("no endpoints for {target}")))?;

	tokio::select! {
		res = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(ep)) => {
			match res {
				Ok(Ok(stream)) => Ok(stream),
				Ok(Err(e)) => Err(ServeError::Unreachable(e.to_string())),
				Err(_) => Err(ServeError::Unreachable(format!("connect to {ep} timed out"))),
			}
		}
		_ = shutdown.signalled() => Err(ServeError::Cancelled),
	}
}

/// Splices an upgraded client connection with the dialed origin socket,
/// observing `shutdown` at the splice boundary. Spawned as a detached task
/// by the caller once the `200 OK` reply has been written.
pub async fn splice(upgraded: Upgraded, origin: TcpStream, mut shutdown: ShutdownRx) {
	let client = TokioIo::new(upgraded);
	tokio::select! {
		res = injector_core::copy::splice(client, origin) => {
			if let Err(e) = res {
				tracing::debug!(error = %e, "CONNECT tunnel closed");
			}
		}
		_ = shutdown.signalled() => {
			tracing::debug!("CONNECT tunnel aborted by shutdown");
		}
	}
}

/// The `200 Connection Established` reply: empty body, no `Content-Length`,
/// no `Transfer-Encoding`.
pub fn ok_response() -> http::Response<Full<Bytes>> {
	http::Response::builder()
		.status(http::StatusCode::OK)
		.body(Full::new(Bytes::new()))
		.expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn disallowed_port_never_dials() {
		let cfg = ConnectConfig {
			enabled: true,
			allowed_ports: vec![80, 443],
			connect_timeout: Duration::from_secs(1),
		};
		let resolver = Resolver::new();
		let mut shutdown = injector_core::Shutdown::new().subscribe();
		let authority: http::uri::Authority = "example.test:22".parse().unwrap();
		let err = validate_and_dial(&cfg, &resolver, &authority, &mut shutdown)
			.await
			.unwrap_err();
		assert!(matches!(err, ServeError::IllegalConnectTarget(_)));
	}

	#[tokio::test]
	async fn disabled_connect_is_illegal_target() {
		let cfg = ConnectConfig {
			enabled: false,
			..ConnectConfig::default()
		};
		let resolver = Resolver::new();
		let mut shutdown = injector_core::Shutdown::new().subscribe();
		let authority: http::uri::Authority = "example.test:443".parse().unwrap();
		let err = validate_and_dial(&cfg, &resolver, &authority, &mut shutdown)
			.await
			.unwrap_err();
		assert!(matches!(err, ServeError::IllegalConnectTarget(_)));
	}

	#[tokio::test]
	async fn loopback_target_on_allowed_port_is_rejected() {
		let cfg = ConnectConfig {
			enabled: true,
			..ConnectConfig::default()
		};
		let resolver = Resolver::new();
		let mut shutdown = injector_core::Shutdown::new().subscribe();
		let authority: http::uri::Authority = "127.0.0.1:443".parse().unwrap();
		let err = validate_and_dial(&cfg, &resolver, &authority, &mut shutdown)
			.await
			.unwrap_err();
		assert!(matches!(err, ServeError::IllegalConnectTarget(_)));
	}
}
