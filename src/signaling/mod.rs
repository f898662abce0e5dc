//! Signaling with the appliance's streaming gateway
//!
//! - `library` - backend traits the stream controller drives
//! - `message` - Live777 plugin requests and results
//! - `loader` - loads a backend once per process
//! - `janus` - WebSocket backend
//! - `peer` - receive-only WebRTC peer used by the WebSocket backend

pub mod janus;
pub mod library;
pub mod loader;
pub mod message;
pub mod peer;

pub use janus::JanusLibrary;
pub use library::{
    EventSink, HandleStats, IceServerProvider, PeerState, PluginHandle, SessionOptions,
    SignalingEvent, SignalingLibrary, SignalingSession,
};
pub use loader::SignalingLoader;
pub use message::{
    AnswerRequest, Features, IceServer, Jsep, JsepKind, PluginMessage, PluginRequest,
    TrackRequest, WatchParams,
};
