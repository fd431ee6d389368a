//! Runtime configuration for the request-handling core, assembled by
//! `injector-app` from CLI flags and threaded through the
//! listener (C8) into every per-connection serve task (C7).

use std::sync::Arc;

use crate::auth::BasicAuth;
use crate::cachecontrol::CacheControlConfig;
use crate::connect::ConnectConfig;
use crate::origin::OriginConfig;
use crate::store::ContentStore;

pub struct ServeConfig {
	/// `None` when no `--injector-credentials` was given: auth is disabled.
	pub credentials: Option<BasicAuth>,
	/// `None` when `--disable-cache` was given: every request is plain-proxied.
	pub cache: Option<CacheControlConfig>,
	pub connect: ConnectConfig,
	pub origin: OriginConfig,
	pub content_store: Arc<dyn ContentStore>,
}

impl ServeConfig {
	pub fn cache_disabled(credentials: Option<BasicAuth>, connect: ConnectConfig, content_store: Arc<dyn ContentStore>) -> Self {
		Self {
			credentials,
			cache: None,
			connect,
			origin: OriginConfig::default(),
			content_store,
		}
	}
}
