//! Header name constants and the hop-by-hop stripping routine shared by the
//! origin connector, the cache-control engine, and the injection pipeline.

use http::{HeaderMap, HeaderName, HeaderValue};

/// Headers defined by HTTP/1.1 to apply to a single transport hop only; they
/// are never forwarded to the origin and never persisted in the store.
pub const HOP_BY_HOP: &[HeaderName] = &[
	HeaderName::from_static("connection"),
	HeaderName::from_static("keep-alive"),
	HeaderName::from_static("public"),
	HeaderName::from_static("proxy-authenticate"),
	HeaderName::from_static("transfer-encoding"),
	HeaderName::from_static("upgrade"),
];

pub const X_OUINET_VERSION: HeaderName = HeaderName::from_static("x-ouinet-version");
pub const X_OUINET_SYNC: HeaderName = HeaderName::from_static("x-ouinet-sync");
pub const X_OUINET_INJECTION_ID: HeaderName = HeaderName::from_static("x-ouinet-injection-id");
pub const X_OUINET_DESCRIPTOR: HeaderName = HeaderName::from_static("x-ouinet-descriptor");

/// Removes every hop-by-hop header, plus whatever `Connection` names as
/// additional hop-by-hop headers for this message.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	let mut extra: Vec<HeaderName> = Vec::new();
	if let Some(connection) = headers.get(http::header::CONNECTION) {
		if let Ok(value) = connection.to_str() {
			for tok in value.split(',') {
				let tok = tok.trim();
				if !tok.is_empty()
					&& let Ok(name) = HeaderName::try_from(tok)
				{
					extra.push(name);
				}
			}
		}
	}
	for name in HOP_BY_HOP {
		headers.remove(name);
	}
	for name in extra {
		headers.remove(name);
	}
}

/// Strips the control headers this system understands out of a message
/// before it is handed to the external store. The injection-id header is
/// preserved: the descriptor references it.
pub fn strip_control_headers(headers: &mut HeaderMap) {
	headers.remove(X_OUINET_SYNC);
	headers.remove(X_OUINET_VERSION);
}

pub fn is_sync_requested(headers: &HeaderMap) -> bool {
	headers
		.get(X_OUINET_SYNC)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("true"))
		.unwrap_or(false)
}

pub fn is_injector_mode(headers: &HeaderMap) -> bool {
	headers.contains_key(X_OUINET_VERSION)
}

pub fn set_header(headers: &mut HeaderMap, name: HeaderName, value: impl Into<String>) {
	if let Ok(v) = HeaderValue::from_str(&value.into()) {
		headers.insert(name, v);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_hop_by_hop_and_connection_named_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, "X-Custom-Hop".parse().unwrap());
		headers.insert("x-custom-hop", "1".parse().unwrap());
		headers.insert(http::header::TRANSFER_ENCODING, "chunked".parse().unwrap());
		headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());

		strip_hop_by_hop(&mut headers);

		assert!(!headers.contains_key(http::header::CONNECTION));
		assert!(!headers.contains_key(http::header::TRANSFER_ENCODING));
		assert!(!headers.contains_key("x-custom-hop"));
		assert!(headers.contains_key(http::header::CONTENT_TYPE));
	}

	#[test]
	fn strips_control_headers_but_keeps_injection_id() {
		let mut headers = HeaderMap::new();
		headers.insert(X_OUINET_SYNC, "true".parse().unwrap());
		headers.insert(X_OUINET_VERSION, "1".parse().unwrap());
		headers.insert(X_OUINET_INJECTION_ID, "abc".parse().unwrap());

		strip_control_headers(&mut headers);

		assert!(!headers.contains_key(X_OUINET_SYNC));
		assert!(!headers.contains_key(X_OUINET_VERSION));
		assert!(headers.contains_key(X_OUINET_INJECTION_ID));
	}

	#[test]
	fn sync_requested_only_on_exact_true() {
		let mut headers = HeaderMap::new();
		assert!(!is_sync_requested(&headers));
		headers.insert(X_OUINET_SYNC, "true".parse().unwrap());
		assert!(is_sync_requested(&headers));
		headers.insert(X_OUINET_SYNC, "false".parse().unwrap());
		assert!(!is_sync_requested(&headers));
	}
}
