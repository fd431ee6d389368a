//! Listener / Scheduler (C8): accepts TCP connections and spawns a serving
//! task per connection, tracked in a `JoinSet` so shutdown can
//! wait for every in-flight connection to drain before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::config::ServeConfig;
use crate::resolver::Resolver;
use crate::serve::serve_connection;
use injector_core::{Shutdown, ShutdownRx};

/// Backoff after a transient `accept` error (e.g. the process is out of file
/// descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
	listener: TcpListener,
	config: Arc<ServeConfig>,
	resolver: Arc<Resolver>,
	shutdown: Shutdown,
}

impl Listener {
	pub fn new(listener: TcpListener, config: Arc<ServeConfig>, resolver: Arc<Resolver>, shutdown: Shutdown) -> Self {
		Self {
			listener,
			config,
			resolver,
			shutdown,
		}
	}

	pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
		self.listener.local_addr()
	}

	/// Runs the accept loop until `shutdown_rx` fires, then waits for every
	/// spawned connection task to finish before returning.
	pub async fn run(self, mut shutdown_rx: ShutdownRx) {
		let mut tasks = JoinSet::new();

		loop {
			tokio::select! {
				accepted = self.listener.accept() => {
					match accepted {
						Ok((stream, peer)) => {
							let config = self.config.clone();
							let resolver = self.resolver.clone();
							let conn_shutdown = self.shutdown.subscribe();
							tasks.spawn(async move {
								serve_connection(stream, peer, config, resolver, conn_shutdown).await;
							});
						}
						Err(e) => {
							tracing::warn!(error = %e, "accept failed, backing off");
							tokio::select! {
								_ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
								_ = shutdown_rx.signalled() => break,
							}
						}
					}
				}
				_ = shutdown_rx.signalled() => break,
			}
		}

		tracing::info!(pending = tasks.len(), "listener stopped accepting, draining connections");
		while tasks.join_next().await.is_some() {}
	}
}
