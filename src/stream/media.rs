//! Media tracks and the stream shown by a video surface

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Remote media track
///
/// Clones share the same stop signal: stopping any clone tells the producer
/// (the signaling backend's track reader) to release the track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    stop: CancellationToken,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            stop: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the track has been stopped
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

/// Set of tracks attached to a video surface
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track; a track with the same id is only kept once
    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, id: &str) -> Option<MediaTrack> {
        let pos = self.tracks.iter().position(|t| t.id == id)?;
        Some(self.tracks.remove(pos))
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn track_of_kind(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let mut stream = MediaStream::new();
        stream.add_track(MediaTrack::new("v0", TrackKind::Video));
        stream.add_track(MediaTrack::new("v0", TrackKind::Video));
        stream.add_track(MediaTrack::new("a0", TrackKind::Audio));
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.track_of_kind(TrackKind::Audio).unwrap().id(), "a0");

        assert!(stream.remove_track("v0").is_some());
        assert!(stream.remove_track("v0").is_none());
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_stop_is_shared() {
        let track = MediaTrack::new("v0", TrackKind::Video);
        let clone = track.clone();
        assert!(!clone.is_stopped());
        track.stop();
        assert!(clone.is_stopped());
    }
}
