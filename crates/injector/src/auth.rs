//! HTTP Basic authentication against a single configured `<user>:<password>`
//! pair. No user database or htpasswd file: a direct, constant-time
//! username/password compare against the one configured credential, with
//! typed-header extraction via `headers`/`axum_extra` and a `thiserror`
//! error shape.

use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("no basic authentication credentials found")]
	Missing { realm: String },

	#[error("invalid credentials")]
	InvalidCredentials { realm: String },
}

/// A single configured credential pair. `None` (no `--injector-credentials`
/// flag) means authentication is disabled and every request is allowed.
pub struct BasicAuth {
	username: String,
	password: String,
	realm: String,
}

impl BasicAuth {
	pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			password: password.into(),
			realm: "Restricted".to_string(),
		}
	}

	/// Parses the `--injector-credentials <user>:<pass>` CLI value.
	pub fn parse(spec: &str) -> Result<Self, String> {
		let (user, pass) = spec
			.split_once(':')
			.ok_or_else(|| format!("expected <user>:<password>, got {spec:?}"))?;
		Ok(Self::new(user, pass))
	}

	pub fn realm(&self) -> &str {
		&self.realm
	}

	/// Validates the `Authorization` header against the configured pair.
	/// `Ok(())` on success; `Err` distinguishes a missing header from a
	/// credential mismatch so the caller can still log the attempt.
	pub fn check(&self, headers: &http::HeaderMap) -> Result<(), Error> {
		let Some(Authorization(basic)) = headers.typed_get::<Authorization<Basic>>() else {
			return Err(Error::Missing {
				realm: self.realm.clone(),
			});
		};
		let ok = constant_time_eq(basic.username().as_bytes(), self.username.as_bytes())
			& constant_time_eq(basic.password().as_bytes(), self.password.as_bytes());
		if ok {
			Ok(())
		} else {
			Err(Error::InvalidCredentials {
				realm: self.realm.clone(),
			})
		}
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b) {
		diff |= x ^ y;
	}
	diff == 0
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
