//! Receive-only WebRTC peer used by the WebSocket backend
//!
//! The appliance always sends the offer; this side answers, reads the remote
//! tracks and counts what arrives so the controller can show a bitrate and a
//! frame rate.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::library::{EventSink, HandleStats, PeerState, SignalingEvent};
use super::message::{AnswerRequest, IceServer};
use crate::error::{AppError, Result};
use crate::stream::media::{MediaTrack, TrackKind};

/// Byte and frame counters shared with the track readers
#[derive(Default)]
struct RecvCounters {
    bytes: AtomicU64,
    frames: AtomicU64,
}

/// Bitrate sampling point
struct Sample {
    at: Instant,
    bytes: u64,
}

pub struct AnswerPeer {
    pc: Arc<RTCPeerConnection>,
    counters: Arc<RecvCounters>,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
    last: Mutex<Sample>,
    events: EventSink,
}

impl AnswerPeer {
    pub async fn new(ice_servers: Vec<IceServer>, events: EventSink) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .into_iter()
                .map(|server| RTCIceServer {
                    urls: server.urls,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = Self {
            pc: Arc::new(pc),
            counters: Arc::new(RecvCounters::default()),
            tracks: Arc::new(Mutex::new(Vec::new())),
            last: Mutex::new(Sample {
                at: Instant::now(),
                bytes: 0,
            }),
            events,
        };
        peer.setup_event_handlers(peer.events.clone());
        Ok(peer)
    }

    fn setup_event_handlers(&self, events: EventSink) {
        let state_events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New => Some(PeerState::New),
                    RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
                    RTCPeerConnectionState::Connected => Some(PeerState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(PeerState::Failed),
                    RTCPeerConnectionState::Closed => Some(PeerState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    state_events.emit(SignalingEvent::PeerState(state));
                }
                Box::pin(async {})
            }));

        let counters = self.counters.clone();
        let tracks = self.tracks.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(kind) = track_kind(track.kind()) {
                    let media = MediaTrack::new(track.id(), kind);
                    tracks.lock().push(media.clone());
                    events.emit(SignalingEvent::TrackAdded(media.clone()));

                    tokio::spawn(read_track(
                        track,
                        media,
                        counters.clone(),
                        tracks.clone(),
                        events.clone(),
                    ));
                }
                Box::pin(async {})
            },
        ));
    }

    /// Apply the remote offer and return the local answer SDP
    ///
    /// Waits for ICE gathering so the answer carries every candidate.
    pub async fn answer(&self, offer_sdp: String, request: &AnswerRequest) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP offer: {}", e)))?;
        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })?;

        for transceiver in self.pc.get_transceivers().await {
            let Some(kind) = track_kind(transceiver.kind()) else {
                continue;
            };
            let direction = if request.receives(kind) {
                RTCRtpTransceiverDirection::Recvonly
            } else {
                RTCRtpTransceiverDirection::Inactive
            };
            transceiver.set_direction(direction).await;
        }

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set local description: {}", e))
        })?;
        let _ = gather_complete.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("No local description".to_string()))?;
        debug!(
            "Answer ready with {} ICE candidates",
            local.sdp.matches("a=candidate:").count()
        );
        Ok(local.sdp)
    }

    /// Receive bitrate since the previous call and the total frame count
    pub fn stats(&self) -> HandleStats {
        let bytes = self.counters.bytes.load(Ordering::Relaxed);
        let frames = self.counters.frames.load(Ordering::Relaxed);

        let mut last = self.last.lock();
        let now = Instant::now();
        let kbits = bitrate_kbits(bytes.saturating_sub(last.bytes), now - last.at);
        *last = Sample { at: now, bytes };

        HandleStats {
            bitrate: format!("{} kbits/sec", kbits),
            frames_decoded: Some(frames),
        }
    }

    /// Stop the track readers, report their tracks gone and close the
    /// connection
    pub async fn close(&self) {
        let tracks: Vec<MediaTrack> = self.tracks.lock().drain(..).collect();
        for track in tracks {
            if track.is_stopped() {
                continue;
            }
            track.stop();
            self.events.emit(SignalingEvent::TrackRemoved(track));
        }
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

async fn read_track(
    track: Arc<TrackRemote>,
    media: MediaTrack,
    counters: Arc<RecvCounters>,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
    events: EventSink,
) {
    let is_video = media.kind() == TrackKind::Video;
    info!(
        "Reading remote {} track {} ({})",
        media.kind(),
        media.id(),
        track.codec().capability.mime_type
    );

    loop {
        tokio::select! {
            _ = media.stopped() => break,
            packet = track.read_rtp() => match packet {
                Ok((packet, _)) => {
                    counters
                        .bytes
                        .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                    // The marker bit closes an access unit
                    if is_video && packet.header.marker {
                        counters.frames.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    debug!("Track {} read ended: {}", media.id(), e);
                    break;
                }
            }
        }
    }

    tracks.lock().retain(|t| t != &media);
    // A stopped track was released by its owner or already reported by close()
    if !media.is_stopped() {
        events.emit(SignalingEvent::TrackRemoved(media));
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Audio => Some(TrackKind::Audio),
        _ => None,
    }
}

fn bitrate_kbits(bytes: u64, elapsed: std::time::Duration) -> u64 {
    let millis = elapsed.as_millis() as u64;
    if millis == 0 {
        return 0;
    }
    bytes * 8 / millis
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bitrate_kbits() {
        assert_eq!(bitrate_kbits(125_000, Duration::from_secs(1)), 1000);
        assert_eq!(bitrate_kbits(50_000, Duration::from_millis(500)), 800);
        assert_eq!(bitrate_kbits(1000, Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn test_fresh_peer_stats() {
        let peer = AnswerPeer::new(vec![], EventSink::new(|_| {})).await.unwrap();
        let stats = peer.stats();
        assert_eq!(stats.bitrate, "0 kbits/sec");
        assert_eq!(stats.frames_decoded, Some(0));
        peer.close().await;
    }

    #[tokio::test]
    async fn test_close_reports_live_tracks() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = AnswerPeer::new(
            vec![],
            EventSink::new(move |event| {
                let _ = tx.send(event);
            }),
        )
        .await
        .unwrap();

        let audio = MediaTrack::new("a0", TrackKind::Audio);
        let stopped = MediaTrack::new("v0", TrackKind::Video);
        stopped.stop();
        peer.tracks.lock().extend([audio.clone(), stopped]);

        peer.close().await;
        assert!(audio.is_stopped());

        let mut removed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SignalingEvent::TrackRemoved(track) = event {
                removed.push(track.id().to_string());
            }
        }
        assert_eq!(removed, vec!["a0".to_string()]);
    }
}
