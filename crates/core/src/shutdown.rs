use tokio::sync::watch;

/// Broadcasts a single graceful-shutdown signal to every task that holds a
/// [`ShutdownRx`]. Cloning a `Shutdown` does not create independent signals;
/// all clones and all derived receivers observe the same trigger.
#[derive(Clone)]
pub struct Shutdown {
	tx: watch::Sender<bool>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(false);
		Self { tx }
	}

	pub fn subscribe(&self) -> ShutdownRx {
		ShutdownRx {
			rx: self.tx.subscribe(),
		}
	}

	/// Trigger shutdown. Idempotent: calling this more than once is a no-op
	/// after the first call.
	pub fn trigger(&self) {
		let _ = self.tx.send(true);
	}

	pub fn is_triggered(&self) -> bool {
		*self.tx.borrow()
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone)]
pub struct ShutdownRx {
	rx: watch::Receiver<bool>,
}

impl ShutdownRx {
	/// Resolves once shutdown has been triggered. Safe to await from a
	/// `tokio::select!` alongside other branches.
	pub async fn signalled(&mut self) {
		if *self.rx.borrow() {
			return;
		}
		// The sender is held by the owning `Shutdown` for the lifetime of the
		// process, so `changed()` only returns `Err` after that `Shutdown` is
		// dropped, which we treat the same as an immediate signal.
		let _ = self.rx.changed().await;
	}

	pub fn is_triggered(&self) -> bool {
		*self.rx.borrow()
	}
}
