//! Ambient utilities shared by the injector library and binary: graceful
//! shutdown signalling, the CONNECT-tunnel splice helper, and logging setup.

pub mod copy;
pub mod logging;
pub mod shutdown;

pub use shutdown::{Shutdown, ShutdownRx};
