//! pulsed — peer liveness daemon built on the pulse registry and a bounded
//! TCP/UDP dispatcher.

pub mod daemon;
pub mod dispatch;
pub mod heartbeat;
pub mod transport;
