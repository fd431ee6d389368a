//! Target resolution and safety filtering (C2). Extracts a `(host, port)`
//! pair from a request's absolute-URI or `Host` header, then resolves it to
//! an ordered set of endpoints, rejecting anything that resolves to a
//! loopback, unspecified, or otherwise local address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;

use crate::error::ServeError;
use injector_core::ShutdownRx;

/// Extracts `(host, port)` from a request's target. An absolute-form URI
/// (as used in proxy requests) wins over the `Host` header when both are
/// present.
pub fn extract_host_port(req: &http::Request<Bytes>) -> Result<(String, u16), ServeError> {
	if let Some(authority) = req.uri().authority() {
		let port = authority
			.port_u16()
			.unwrap_or(default_port_for(req.uri().scheme_str()));
		return Ok((authority.host().to_string(), port));
	}

	let host_header = req
		.headers()
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| ServeError::IllegalTarget("missing Host header".to_string()))?;
	split_host_port(host_header)
}

fn default_port_for(scheme: Option<&str>) -> u16 {
	match scheme {
		Some("https") => 443,
		_ => 80,
	}
}

/// Splits a `host[:port]` string, tolerating IPv6 literals in brackets.
fn split_host_port(s: &str) -> Result<(String, u16), ServeError> {
	if let Some(rest) = s.strip_prefix('[') {
		let (host, rest) = rest
			.split_once(']')
			.ok_or_else(|| ServeError::IllegalTarget(s.to_string()))?;
		let port = match rest.strip_prefix(':') {
			Some(p) => p
				.parse()
				.map_err(|_| ServeError::IllegalTarget(s.to_string()))?,
			None => 80,
		};
		return Ok((host.to_string(), port));
	}
	match s.rsplit_once(':') {
		Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
			let port: u16 = port
				.parse()
				.map_err(|_| ServeError::IllegalTarget(s.to_string()))?;
			Ok((host.to_string(), port))
		},
		_ => Ok((s.to_string(), 80)),
	}
}

/// True for `"localhost"` and any textual IP literal that resolves to a
/// local address.
pub fn is_local_host_string(host: &str) -> bool {
	if host.eq_ignore_ascii_case("localhost") {
		return true;
	}
	host.parse::<IpAddr>().map(is_local_ip).unwrap_or(false)
}

pub fn is_local_ip(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => v4.octets()[0] == 127 || v4 == Ipv4Addr::UNSPECIFIED,
		IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST || v6 == Ipv6Addr::UNSPECIFIED,
	}
}

/// Cancel-aware asynchronous resolver.
pub struct Resolver {
	inner: TokioResolver,
}

impl Resolver {
	pub fn new() -> Self {
		Self::with_config(ResolverConfig::default(), ResolverOpts::default())
	}

	pub fn with_config(cfg: ResolverConfig, opts: ResolverOpts) -> Self {
		let inner = TokioResolver::builder_with_config(cfg, TokioConnectionProvider::default())
			.with_options(opts)
			.build();
		Self { inner }
	}

	/// Resolves a request's target to a non-empty, ordered set of endpoints.
	/// Cancellable via `shutdown`; fails with `IllegalTarget` if the host
	/// string or any resolved address is local.
	pub async fn resolve(
		&self,
		req: &http::Request<Bytes>,
		shutdown: &mut ShutdownRx,
	) -> Result<(String, Vec<SocketAddr>), ServeError> {
		let (host, port) = extract_host_port(req)?;
		self.resolve_host_port(host, port, shutdown).await
	}

	pub async fn resolve_host_port(
		&self,
		host: String,
		port: u16,
		shutdown: &mut ShutdownRx,
	) -> Result<(String, Vec<SocketAddr>), ServeError> {
		if is_local_host_string(&host) {
			return Err(ServeError::IllegalTarget(host));
		}

		if let Ok(ip) = host.parse::<IpAddr>() {
			if is_local_ip(ip) {
				return Err(ServeError::IllegalTarget(host));
			}
			return Ok((host, vec![SocketAddr::new(ip, port)]));
		}

		let addrs = tokio::select! {
			res = self.inner.lookup_ip(host.clone()) => {
				res.map_err(|e| ServeError::ResolutionFailed {
					host: host.clone(),
					source: std::io::Error::other(e),
				})?
			}
			_ = shutdown.signalled() => return Err(ServeError::Cancelled),
		};

		let endpoints: Vec<SocketAddr> = addrs.iter().map(|ip| SocketAddr::new(ip, port)).collect();
		if endpoints.is_empty() {
			return Err(ServeError::ResolutionFailed {
				host,
				source: std::io::Error::other("no addresses returned"),
			});
		}
		if endpoints.iter().any(|ep| is_local_ip(ep.ip())) {
			return Err(ServeError::IllegalTarget(host));
		}
		Ok((host, endpoints))
	}
}

impl Default for Resolver {
	fn default() -> Self {
		Self::new()
	}
}
