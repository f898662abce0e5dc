//! Utility modules shared by the client and the runner

pub mod net;
pub mod throttle;

pub use net::{bind_udp_socket, default_source_ip};
pub use throttle::LogThrottler;
