//! Live777 server side: NAT probing and process supervision

pub mod runner;
pub mod stun;

pub use runner::{build_cmd, render_cmd, Live777Runner};
pub use stun::{Stun, StunInfo, StunNatType};
