//! Headless stream surface
//!
//! Logs status changes instead of drawing them. Used by the `watch` command
//! and handy for checking an appliance's stream from a shell.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use super::media::{MediaStream, TrackKind};
use super::surface::{Feature, FeatureToggle, StatusSink, UrlBuilder, VideoSurface};

#[derive(Debug, Default, Clone)]
struct SurfaceState {
    active: bool,
    info: String,
    features: HashMap<Feature, bool>,
    stream: Option<MediaStream>,
}

/// Status, feature and video surface that only logs
#[derive(Default)]
pub struct HeadlessSurface {
    state: RwLock<SurfaceState>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    pub fn info(&self) -> String {
        self.state.read().info.clone()
    }

    pub fn feature(&self, feature: Feature) -> Option<bool> {
        self.state.read().features.get(&feature).copied()
    }

    pub fn track_count(&self) -> usize {
        self.state
            .read()
            .stream
            .as_ref()
            .map(MediaStream::len)
            .unwrap_or(0)
    }
}

impl StatusSink for HeadlessSurface {
    fn set_active(&self) {
        let mut state = self.state.write();
        if !state.active {
            info!("Stream is active");
        }
        state.active = true;
    }

    fn set_inactive(&self) {
        let mut state = self.state.write();
        if state.active {
            info!("Stream is inactive");
        }
        state.active = false;
    }

    fn set_info(&self, attached: bool, online: bool, message: &str) {
        let mut state = self.state.write();
        if state.info != message {
            if attached {
                info!(
                    "[{}] {}",
                    if online { "online" } else { "no signal" },
                    message
                );
            } else if !message.is_empty() {
                info!("{}", message);
            }
        }
        state.info = message.to_string();
    }
}

impl FeatureToggle for HeadlessSurface {
    fn set_enabled(&self, feature: Feature, enabled: bool) {
        info!("Feature {}: {}", feature, if enabled { "enabled" } else { "disabled" });
        self.state.write().features.insert(feature, enabled);
    }
}

impl VideoSurface for HeadlessSurface {
    fn video_size(&self) -> (u32, u32) {
        (0, 0)
    }

    fn offset_size(&self) -> (u32, u32) {
        (0, 0)
    }

    fn set_stream(&self, stream: Option<MediaStream>) {
        match stream {
            Some(ref s) => debug!(
                "Surface stream: video={} audio={}",
                s.track_of_kind(TrackKind::Video).is_some(),
                s.track_of_kind(TrackKind::Audio).is_some()
            ),
            None => debug!("Surface stream cleared"),
        }
        self.state.write().stream = stream;
    }
}

/// Builds WebSocket URLs below an appliance base URL
pub struct WsUrlBuilder {
    base: String,
}

impl WsUrlBuilder {
    /// `base` may be `http(s)://`, `ws(s)://` or a bare `host[:port]`
    pub fn new(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            format!("wss://{}", base)
        };
        Self { base }
    }
}

impl UrlBuilder for WsUrlBuilder {
    fn make_url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}
