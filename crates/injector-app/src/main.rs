mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fs_err as fs;
use fs_err::tokio as afs;
use thiserror::Error;

use injector::auth::BasicAuth;
use injector::cachecontrol::{CacheControlConfig, MaxCachedAge};
use injector::connect::ConnectConfig;
use injector::nodeid::NodeID;
use injector::origin::OriginConfig;
use injector::store::InMemoryContentStore;
use injector::{Listener, Resolver, ServeConfig};
use injector_core::Shutdown;

use crate::args::Args;

/// Startup-time configuration failures, each mapped to the CLI's `exit 1`
/// convention in [`main`].
#[derive(Error, Debug)]
enum ConfigError {
	#[error("repo directory {0:?} does not exist or is not writable")]
	RepoNotFound(std::path::PathBuf),

	#[error("another instance is already running (pid file {0:?} exists)")]
	DuplicateInstance(std::path::PathBuf),

	#[error("invalid --injector-credentials: {0}")]
	InvalidCredentials(String),

	#[error("invalid --bittorrent-public-key: {0}")]
	InvalidPublicKey(String),
}

#[tokio::main]
async fn main() -> ExitCode {
	injector_core::logging::init();

	let args = Args::parse();
	match run(args).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!(error = %e, "fatal startup error");
			ExitCode::FAILURE
		},
	}
}

async fn run(args: Args) -> anyhow::Result<()> {
	if !args.repo.is_dir() {
		return Err(ConfigError::RepoNotFound(args.repo).into());
	}

	// DuplicateInstance: a stale PID file left by a crash must be removed
	// externally before the injector will start again.
	let pid_path = args.repo.join("pid");
	if pid_path.exists() {
		return Err(ConfigError::DuplicateInstance(pid_path).into());
	}
	fs::write(&pid_path, std::process::id().to_string()).context("writing pid file")?;
	let _pid_guard = PidFileGuard { path: pid_path };

	if let Some(limit) = args.open_file_limit {
		raise_open_file_limit(limit)?;
	}

	let credentials = args
		.injector_credentials
		.as_deref()
		.map(BasicAuth::parse)
		.transpose()
		.map_err(|e| ConfigError::InvalidCredentials(e.to_string()))?;

	if let Some(key) = &args.bittorrent_public_key {
		validate_hex_public_key(key).map_err(ConfigError::InvalidPublicKey)?;
		tracing::info!(public_key = %key, "BEP-44 announcements configured (store backend is out of scope)");
	}

	let node_id = NodeID::generate(args.listen_on_tcp.ip());
	tracing::info!(node_id = %node_id, "derived BEP-42 node ID");
	afs::write(args.repo.join("cache-ipns"), node_id.to_hex()).await?;

	if args.listen_on_i2p {
		tracing::warn!("--listen-on-i2p requested but the I2P acceptor is not implemented; skipping");
	}
	tracing::info!(backend = ?args.default_db, "store backend selected (served by the in-memory ContentStore)");

	let connect = ConnectConfig {
		enabled: args.enable_http_connect_requests,
		..ConnectConfig::default()
	};
	let content_store = Arc::new(InMemoryContentStore::new());
	let config = Arc::new(if args.disable_cache {
		ServeConfig::cache_disabled(credentials, connect, content_store)
	} else {
		ServeConfig {
			credentials,
			cache: Some(CacheControlConfig {
				max_cached_age: MaxCachedAge::from_cli_value(args.max_cached_age),
			}),
			connect,
			origin: OriginConfig::default(),
			content_store,
		}
	});

	let tcp_listener = tokio::net::TcpListener::bind(args.listen_on_tcp).await?;
	let bound_addr = tcp_listener.local_addr()?;
	afs::write(args.repo.join("endpoint-tcp"), bound_addr.to_string()).await?;
	afs::write(args.repo.join("endpoint-i2p"), "").await?;
	tracing::info!(addr = %bound_addr, "listening");

	let resolver = Arc::new(Resolver::new());
	let shutdown = Shutdown::new();
	let listener = Listener::new(tcp_listener, config, resolver, shutdown.clone());

	let run_handle = tokio::spawn(listener.run(shutdown.subscribe()));
	wait_for_shutdown_signal().await;
	shutdown.trigger();

	tokio::select! {
		res = run_handle => { res?; }
		_ = wait_for_shutdown_signal() => {
			tracing::warn!("second shutdown signal received, forcing exit");
			std::process::exit(1);
		}
	}

	Ok(())
}

/// Raises `RLIMIT_NOFILE` to at least `limit`, per `--open-file-limit`.
fn raise_open_file_limit(limit: u64) -> anyhow::Result<()> {
	let mut rl = libc::rlimit {
		rlim_cur: 0,
		rlim_max: 0,
	};
	// SAFETY: `rl` is a valid, exclusively-owned `rlimit` for the duration
	// of this FFI call.
	if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } != 0 {
		return Err(std::io::Error::last_os_error().into());
	}
	let target = limit.max(rl.rlim_cur);
	rl.rlim_cur = target.min(rl.rlim_max);
	// SAFETY: same as above; `rl` was just populated by `getrlimit`.
	if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) } != 0 {
		return Err(std::io::Error::last_os_error().into());
	}
	Ok(())
}

fn validate_hex_public_key(key: &str) -> Result<(), String> {
	if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
		return Err(format!("expected 64 hex characters, got {:?}", key));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_64_hex_chars() {
		let key = "a".repeat(64);
		assert!(validate_hex_public_key(&key).is_ok());
	}

	#[test]
	fn rejects_wrong_length() {
		assert!(validate_hex_public_key("abcd").is_err());
	}

	#[test]
	fn rejects_non_hex_chars() {
		let key = "z".repeat(64);
		assert!(validate_hex_public_key(&key).is_err());
	}
}

async fn wait_for_shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
		let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
		tokio::select! {
			_ = sigint.recv() => {}
			_ = sigterm.recv() => {}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

/// Removes the PID file on a clean exit. `Drop` is a best-effort substitute
/// for the exit-handler behavior a crash would otherwise skip (an actual
/// crash/abort cannot run destructors, so a stale PID file after a hard
/// crash must be removed externally).
struct PidFileGuard {
	path: std::path::PathBuf,
}

impl Drop for PidFileGuard {
	fn drop(&mut self) {
		let _ = fs::remove_file(&self.path);
	}
}
