//! Configuration for the stream client and the Live777 runner

mod schema;
mod store;

pub use schema::{AppConfig, RunnerConfig, StreamerConfig, StunConfig};
pub use store::ConfigStore;
