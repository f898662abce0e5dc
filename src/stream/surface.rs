//! Collaborators the stream controller reports to
//!
//! These are the narrow seams between the controller and whatever shows the
//! stream: a browser page, a native window or the headless logger in
//! [`super::headless`].

use serde::Serialize;

use super::media::MediaStream;

/// Stream status line
pub trait StatusSink: Send + Sync {
    fn set_active(&self);
    fn set_inactive(&self);
    /// `attached` is true while a handle reports statistics
    fn set_info(&self, attached: bool, online: bool, message: &str);
}

/// Optional UI features toggled from the appliance's `features` answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Audio,
    Mic,
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feature::Audio => write!(f, "stream-audio"),
            Feature::Mic => write!(f, "stream-mic"),
        }
    }
}

pub trait FeatureToggle: Send + Sync {
    fn set_enabled(&self, feature: Feature, enabled: bool);
}

/// The element that renders the stream
pub trait VideoSurface: Send + Sync {
    /// Intrinsic size of the decoded video, `(0, 0)` when unknown
    fn video_size(&self) -> (u32, u32);
    /// Size of the element on screen
    fn offset_size(&self) -> (u32, u32);
    /// Total frames decoded by the element, when the platform exposes it
    fn decoded_frames(&self) -> Option<u64> {
        None
    }
    fn set_stream(&self, stream: Option<MediaStream>);
}

/// Builds signaling endpoint URLs
pub trait UrlBuilder: Send + Sync {
    fn make_url(&self, path: &str) -> String;
}

/// Snapshot of the appliance's video source state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceState {
    pub online: bool,
}

/// Stream resolution as seen by the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub real_width: u32,
    pub real_height: u32,
    pub view_width: u32,
    pub view_height: u32,
}

impl Resolution {
    /// Real size falls back to the on-screen size until video is decoded
    pub fn of(surface: &dyn VideoSurface) -> Self {
        let (video_width, video_height) = surface.video_size();
        let (view_width, view_height) = surface.offset_size();
        Self {
            real_width: if video_width > 0 { video_width } else { view_width },
            real_height: if video_height > 0 { video_height } else { view_height },
            view_width,
            view_height,
        }
    }
}
