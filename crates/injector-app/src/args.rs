use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Store backend selector (`--default-db`). Both variants currently run
/// against the same in-memory `ContentStore`: the BitTorrent-backed BEP-44
/// store is the out-of-scope external collaborator `store.rs` models, not
/// something this binary implements.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DbBackend {
	Btree,
	Bep44,
}

#[derive(Parser, Debug)]
#[clap(name = "injector", version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
	/// State directory; must exist and be writable.
	#[clap(long)]
	pub repo: PathBuf,

	/// Primary TCP acceptor address.
	#[clap(long)]
	pub listen_on_tcp: SocketAddr,

	/// Additionally expose the service over the I2P overlay transport.
	#[clap(long, default_value_t = false)]
	pub listen_on_i2p: bool,

	/// `<user>:<password>`; enables HTTP Basic auth when present.
	#[clap(long)]
	pub injector_credentials: Option<String>,

	/// Raise `RLIMIT_NOFILE` to at least this value before binding.
	#[clap(long)]
	pub open_file_limit: Option<u64>,

	/// Maximum age of a stored entry still eligible to be served without a
	/// fresh fetch. `-1` disables the ceiling; `0` disables read-caching.
	#[clap(long, default_value_t = 7 * 24 * 60 * 60)]
	pub max_cached_age: i64,

	/// Without this flag, `CONNECT` requests are refused with `405`.
	#[clap(long, default_value_t = false)]
	pub enable_http_connect_requests: bool,

	#[clap(long, value_enum, default_value_t = DbBackend::Btree)]
	pub default_db: DbBackend,

	/// Bypasses the cache-control engine and injection pipeline entirely;
	/// every request is a pure proxy fetch.
	#[clap(long, default_value_t = false)]
	pub disable_cache: bool,

	/// Ed25519 public key (hex) for BEP-44 announcements.
	#[clap(long)]
	pub bittorrent_public_key: Option<String>,
}
