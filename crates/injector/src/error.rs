//! Design-level error kinds from the request-handling core. Each variant
//! maps to a client-facing status and continuation policy; see
//! [`ServeError::status_and_body`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServeError {
	#[error("illegal target host: {0}")]
	IllegalTarget(String),

	#[error("illegal CONNECT target: {0}")]
	IllegalConnectTarget(String),

	#[error("DNS resolution failed for {host}: {source}")]
	ResolutionFailed {
		host: String,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to connect to origin: {0}")]
	Unreachable(String),

	#[error("origin protocol error: {0}")]
	OriginProtocolError(String),

	#[error("authentication required")]
	AuthRequired,

	#[error("cache store error: {0}")]
	StoreError(#[source] anyhow::Error),

	#[error("connection shutting down")]
	Cancelled,
}

impl ServeError {
	/// The status code and body text written to the client for errors that
	/// are recoverable on the connection (everything except `Cancelled`,
	/// which closes without a response).
	pub fn status_and_body(&self) -> Option<(http::StatusCode, String)> {
		use http::StatusCode;
		match self {
			ServeError::IllegalTarget(host) => Some((
				StatusCode::BAD_REQUEST,
				format!("Illegal target host: {host}"),
			)),
			ServeError::IllegalConnectTarget(ep) => Some((
				StatusCode::BAD_REQUEST,
				format!("Illegal CONNECT target: {ep}"),
			)),
			ServeError::ResolutionFailed { host, source } => Some((
				StatusCode::BAD_REQUEST,
				format!("Failed to resolve {host}: {source}"),
			)),
			ServeError::Unreachable(reason) => Some((
				StatusCode::BAD_REQUEST,
				format!("Failed to connect to origin: {reason}"),
			)),
			ServeError::OriginProtocolError(reason) => Some((
				StatusCode::BAD_REQUEST,
				format!("Upstream protocol error: {reason}"),
			)),
			ServeError::AuthRequired => None, // handled specially: 407 + Proxy-Authenticate
			ServeError::StoreError(_) => None, // never surfaced to the client
			ServeError::Cancelled => None,
		}
	}
}
