//! Live777 stream client
//!
//! # Components
//!
//! - `Live777Streamer` - reconnecting stream controller
//! - `surface` - status, feature and video surface collaborators
//! - `media` - tracks and the stream attached to a surface
//! - `headless` - logging surface for running without a UI

pub mod controller;
pub mod headless;
pub mod media;
pub mod state;
pub mod surface;

pub use controller::{Live777Streamer, StreamerContext};
pub use headless::{HeadlessSurface, WsUrlBuilder};
pub use media::{MediaStream, MediaTrack, TrackKind};
pub use state::StreamState;
pub use surface::{
    Feature, FeatureToggle, Resolution, SourceState, StatusSink, UrlBuilder, VideoSurface,
};
