//! pulse-core — liveness primitives shared by the Pulse daemon.
//! No async runtime here: the registry runs on its own clock thread.

pub mod addr;
pub mod config;
pub mod netstring;
pub mod registry;

pub use netstring::FrameError;
pub use registry::{ClockMode, ExpiryMode, Registry, RegistryError, RemovalCause, Update};
