//! Signaling library interface
//!
//! The stream controller drives any backend through these traits. Calls that
//! need a reply are async, fire-and-forget calls (`send`, `detach`, ...) are
//! plain methods that queue work in order. Everything the backend observes on
//! its own (plugin events, remote tracks, peer state) is pushed into the
//! [`EventSink`] it was given.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::message::{AnswerRequest, IceServer, Jsep, PluginRequest};
use crate::error::Result;
use crate::stream::media::MediaTrack;

/// Returns the ICE servers to use when a peer connection is built
pub type IceServerProvider = Arc<dyn Fn() -> Vec<IceServer> + Send + Sync>;

/// Options for opening a signaling session
#[derive(Clone)]
pub struct SessionOptions {
    /// Signaling endpoint URL
    pub server: String,
    /// Consulted lazily, so values learned after the session opened still apply
    pub ice_servers: IceServerProvider,
}

/// Peer connection state reported by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Something the backend observed
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The session's transport died after it was opened
    SessionLost(String),
    /// Plugin message, optionally with a session description
    Message { body: Value, jsep: Option<Jsep> },
    /// The plugin says the media path is up (or down)
    WebRtcState(bool),
    PeerState(PeerState),
    TrackAdded(MediaTrack),
    TrackRemoved(MediaTrack),
    /// The peer connection was torn down
    Cleanup,
    /// The plugin detached the handle on its side
    Detached,
}

/// Destination for backend events
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<dyn Fn(SignalingEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(SignalingEvent) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub fn emit(&self, event: SignalingEvent) {
        (self.inner)(event)
    }
}

/// Handle statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandleStats {
    /// Human readable receive bitrate, e.g. `"812 kbits/sec"`
    pub bitrate: String,
    /// Total video frames received, when the backend counts them
    pub frames_decoded: Option<u64>,
}

#[async_trait]
pub trait SignalingLibrary: Send + Sync {
    /// Whether this platform can create peer connections at all
    fn is_webrtc_available(&self) -> bool;

    async fn create_session(
        &self,
        options: SessionOptions,
        events: EventSink,
    ) -> Result<Arc<dyn SignalingSession>>;
}

#[async_trait]
pub trait SignalingSession: Send + Sync {
    fn id(&self) -> u64;

    async fn attach(&self, plugin: &str, events: EventSink) -> Result<Arc<dyn PluginHandle>>;

    /// Close the session and every handle on it
    fn destroy(&self);
}

#[async_trait]
pub trait PluginHandle: Send + Sync {
    fn id(&self) -> u64;

    fn plugin(&self) -> &str;

    /// Queue a plugin message; messages are delivered in call order
    fn send(&self, request: PluginRequest, jsep: Option<Jsep>) -> Result<()>;

    async fn create_answer(&self, offer: Jsep, request: AnswerRequest) -> Result<Jsep>;

    async fn stats(&self) -> Result<HandleStats>;

    /// Close the peer connection but keep the handle
    fn hangup(&self);

    /// Close the peer connection and release the handle
    fn detach(&self);
}
