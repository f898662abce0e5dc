//! kvm-live777 - Live777 WebRTC streaming for IP-KVM appliances
//!
//! This crate provides the browser-side stream controller that keeps a
//! receive-only WebRTC session alive against the appliance's Live777 plugin,
//! together with the appliance-side runner that probes the NAT and supervises
//! the Live777 server process.

pub mod config;
pub mod error;
pub mod live777;
pub mod signaling;
pub mod stream;
pub mod utils;

pub use error::{AppError, Result};
