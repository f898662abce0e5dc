//! Live777 stream controller
//!
//! One task owns the whole stream lifecycle: opening the signaling session,
//! attaching the plugin handle, negotiating, attaching tracks to the video
//! surface, polling statistics and recovering from failures.
//!
//! ```text
//!            ensure_stream                handle attached
//!   Idle ─────────────────▶ Ensuring ─────────────────────▶ Attached
//!                             ▲   │ failure                     │ failure
//!                             │   ▼                             │
//!                             └── retry timer ◀─────────────────┘
//!
//!   any state ── stop_stream ──▶ Stopped ── ensure_stream ──▶ Ensuring
//! ```
//!
//! The public [`Live777Streamer`] only posts commands. Backend callbacks,
//! completions of spawned calls and timers all come back to the same task as
//! [`Event`]s, tagged with the epoch of the session attempt that caused them.
//! Anything tagged with an older epoch is dropped, so a reply that lands after
//! a stop or a restart cannot touch the current session.

use futures::future::pending;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn, Instrument};

use super::media::{MediaStream, MediaTrack, TrackKind};
use super::state::StreamState;
use super::surface::{
    Feature, FeatureToggle, Resolution, SourceState, StatusSink, UrlBuilder, VideoSurface,
};
use crate::config::StreamerConfig;
use crate::error::Result;
use crate::signaling::library::{
    EventSink, HandleStats, IceServerProvider, PeerState, PluginHandle, SessionOptions,
    SignalingEvent, SignalingLibrary, SignalingSession,
};
use crate::signaling::message::{
    AnswerRequest, IceServer, Jsep, JsepKind, PluginMessage, PluginRequest, WatchParams,
};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Collaborators a stream reports to
#[derive(Clone)]
pub struct StreamerContext {
    pub status: Arc<dyn StatusSink>,
    pub features: Arc<dyn FeatureToggle>,
    pub video: Arc<dyn VideoSurface>,
    pub urls: Arc<dyn UrlBuilder>,
}

/// Handle to a running stream controller
///
/// Dropping it stops the stream and ends the controller task.
pub struct Live777Streamer {
    config: StreamerConfig,
    video: Arc<dyn VideoSurface>,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<StreamState>,
}

impl Live777Streamer {
    /// Spawn a controller on the current tokio runtime
    pub fn new(
        config: StreamerConfig,
        library: Arc<dyn SignalingLibrary>,
        ctx: StreamerContext,
    ) -> Self {
        let config = config.normalized();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let video = ctx.video.clone();

        let task = StreamerTask::new(config.clone(), library, ctx, tx.clone(), state_tx);
        tokio::spawn(
            task.run(rx)
                .instrument(tracing::info_span!("stream", component = "Live777")),
        );

        Self {
            config,
            video,
            events: tx,
            state: state_rx,
        }
    }

    /// Whether `library` can stream on this platform at all
    pub fn is_webrtc_available(library: &dyn SignalingLibrary) -> bool {
        library.is_webrtc_available()
    }

    /// Make sure a stream is running or being set up
    ///
    /// Records `state` for the status line either way. Re-arms a stopped
    /// controller.
    pub fn ensure_stream(&self, state: SourceState) {
        let _ = self.events.send(Event::Ensure(state));
    }

    /// Stop streaming and suppress automatic retries until the next
    /// [`ensure_stream`](Self::ensure_stream)
    pub fn stop_stream(&self) {
        let _ = self.events.send(Event::Stop);
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn orientation(&self) -> u16 {
        self.config.orientation
    }

    pub fn is_audio_allowed(&self) -> bool {
        self.config.audio
    }

    pub fn is_mic_allowed(&self) -> bool {
        self.config.mic
    }

    pub fn name(&self) -> String {
        let mut name = "WebRTC H.264".to_string();
        if self.config.audio {
            name.push_str(" + Audio");
            if self.config.mic {
                name.push_str(" + Mic");
            }
        }
        name
    }

    pub fn mode(&self) -> &'static str {
        "live777"
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::of(self.video.as_ref())
    }
}

impl Drop for Live777Streamer {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

/// Controller input
enum Event {
    Ensure(SourceState),
    Stop,
    Shutdown,
    SessionOpened {
        epoch: u64,
        result: Result<Arc<dyn SignalingSession>>,
    },
    HandleAttached {
        epoch: u64,
        result: Result<Arc<dyn PluginHandle>>,
    },
    AnswerCreated {
        epoch: u64,
        result: Result<Jsep>,
    },
    StatsReady {
        epoch: u64,
        result: Result<HandleStats>,
    },
    Signal {
        epoch: u64,
        event: SignalingEvent,
    },
}

/// Timer expiry picked by the run loop
enum Step {
    Event(Option<Event>),
    RetryEnsure,
    RetryError,
    StatsTick,
}

enum SessionSlot {
    Empty,
    Opening,
    Open(Arc<dyn SignalingSession>),
}

impl SessionSlot {
    fn is_empty(&self) -> bool {
        matches!(self, SessionSlot::Empty)
    }
}

struct StreamerTask {
    config: StreamerConfig,
    library: Arc<dyn SignalingLibrary>,
    ctx: StreamerContext,
    tx: mpsc::UnboundedSender<Event>,
    state_tx: watch::Sender<StreamState>,

    /// Bumped whenever a session attempt starts or ends
    epoch: u64,
    stop: bool,
    ensuring: bool,
    source: SourceState,
    session: SessionSlot,
    handle: Option<Arc<dyn PluginHandle>>,
    ice_url: Arc<RwLock<Option<String>>>,
    stream: Option<MediaStream>,
    frames: u64,

    retry_ensure: Option<Pin<Box<Sleep>>>,
    retry_error: Option<Pin<Box<Sleep>>>,
    stats: Option<Interval>,
    stats_pending: bool,
    throttler: LogThrottler,
}

impl StreamerTask {
    fn new(
        config: StreamerConfig,
        library: Arc<dyn SignalingLibrary>,
        ctx: StreamerContext,
        tx: mpsc::UnboundedSender<Event>,
        state_tx: watch::Sender<StreamState>,
    ) -> Self {
        Self {
            config,
            library,
            ctx,
            tx,
            state_tx,
            epoch: 0,
            stop: false,
            ensuring: false,
            source: SourceState::default(),
            session: SessionSlot::Empty,
            handle: None,
            ice_url: Arc::new(RwLock::new(None)),
            stream: None,
            frames: 0,
            retry_ensure: None,
            retry_error: None,
            stats: None,
            stats_pending: false,
            throttler: LogThrottler::with_secs(10),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        loop {
            let step = tokio::select! {
                event = rx.recv() => Step::Event(event),
                _ = fire(&mut self.retry_ensure) => Step::RetryEnsure,
                _ = fire(&mut self.retry_error) => Step::RetryError,
                _ = tick(&mut self.stats) => Step::StatsTick,
            };

            match step {
                Step::Event(None) | Step::Event(Some(Event::Shutdown)) => {
                    self.stop = true;
                    self.destroy();
                    debug!("Stream controller finished");
                    break;
                }
                Step::Event(Some(event)) => self.handle_event(event),
                Step::RetryEnsure => {
                    self.retry_ensure = None;
                    self.ensure(true);
                }
                Step::RetryError => {
                    self.retry_error = None;
                    if !self.stop {
                        self.send_stop();
                        self.send_watch();
                    }
                }
                Step::StatsTick => self.request_stats(),
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Ensure(source) => {
                self.source = source;
                self.stop = false;
                self.ensure(false);
            }
            Event::Stop => {
                self.stop = true;
                self.destroy();
            }
            Event::Shutdown => {}
            Event::SessionOpened { epoch, result } => self.on_session_opened(epoch, result),
            Event::HandleAttached { epoch, result } => self.on_handle_attached(epoch, result),
            Event::AnswerCreated { epoch, result } => self.on_answer_created(epoch, result),
            Event::StatsReady { epoch, result } => self.on_stats(epoch, result),
            Event::Signal { epoch, event } => {
                if epoch == self.epoch {
                    self.on_signal(event);
                } else {
                    debug!("Dropping stale signaling event: {:?}", event);
                }
            }
        }
    }

    fn set_state(&self, state: StreamState) {
        self.state_tx.send_replace(state);
    }

    fn sink(&self) -> EventSink {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        EventSink::new(move |event| {
            let _ = tx.send(Event::Signal { epoch, event });
        })
    }

    fn ice_provider(&self) -> IceServerProvider {
        let ice_url = self.ice_url.clone();
        Arc::new(move || match ice_url.read().as_ref() {
            Some(url) => vec![IceServer {
                urls: vec![url.clone()],
            }],
            None => vec![],
        })
    }

    // ===== Session lifecycle

    /// Open a session unless one exists; `internal` lets the retry timer
    /// through while an earlier attempt is still counted as ensuring
    fn ensure(&mut self, internal: bool) {
        if !self.session.is_empty() || self.stop || (self.ensuring && !internal) {
            return;
        }

        self.ensuring = true;
        self.ctx.status.set_inactive();
        self.ctx.status.set_info(false, false, "");
        info!("Starting signaling session ...");

        self.epoch += 1;
        self.session = SessionSlot::Opening;
        self.set_state(StreamState::Ensuring);

        let options = SessionOptions {
            server: self.ctx.urls.make_url(&self.config.endpoint),
            ice_servers: self.ice_provider(),
        };
        let events = self.sink();
        let library = self.library.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = library.create_session(options, events).await;
            let _ = tx.send(Event::SessionOpened { epoch, result });
        });
    }

    fn on_session_opened(&mut self, epoch: u64, result: Result<Arc<dyn SignalingSession>>) {
        if epoch != self.epoch {
            if let Ok(session) = result {
                debug!("Destroying stale session {}", session.id());
                session.destroy();
            }
            return;
        }

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                error!("Can't open signaling session: {}", e);
                self.ctx.status.set_info(false, false, &e.status_text());
                self.finish();
                return;
            }
        };

        info!("Signaling session {} opened", session.id());
        self.session = SessionSlot::Open(session.clone());

        let plugin = self.config.plugin.clone();
        let events = self.sink();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = session.attach(&plugin, events).await;
            let _ = tx.send(Event::HandleAttached { epoch, result });
        });
    }

    fn on_handle_attached(&mut self, epoch: u64, result: Result<Arc<dyn PluginHandle>>) {
        if epoch != self.epoch {
            if let Ok(handle) = result {
                debug!("Detaching stale handle {}", handle.id());
                handle.detach();
            }
            return;
        }

        match result {
            Ok(handle) => {
                info!("Plugin attached: {} {}", handle.plugin(), handle.id());
                self.handle = Some(handle);
                self.set_state(StreamState::Attached);
                self.send(PluginRequest::Features, None);
            }
            Err(e) => {
                error!("Can't attach plugin: {}", e);
                self.ctx.status.set_info(false, false, &e.status_text());
                self.destroy();
            }
        }
    }

    /// Release the session and handle, arming a retry unless stopped
    fn finish(&mut self) {
        if self.stop {
            self.retry_ensure = None;
            self.ensuring = false;
        } else if self.retry_ensure.is_none() {
            self.retry_ensure = Some(Box::pin(tokio::time::sleep(
                self.config.retry_ensure_delay(),
            )));
        }
        self.retry_error = None;
        self.stop_stats();
        self.stats_pending = false;
        self.frames = 0;

        if let Some(handle) = self.handle.take() {
            info!("Detaching plugin: {} {}", handle.plugin(), handle.id());
            handle.detach();
        }
        self.session = SessionSlot::Empty;
        self.epoch += 1;

        self.ctx.status.set_inactive();
        if self.stop {
            self.ctx.status.set_info(false, false, "");
            self.set_state(StreamState::Stopped);
        } else {
            self.set_state(StreamState::Ensuring);
        }
    }

    /// Destroy the session, then finish and drop every attached track
    fn destroy(&mut self) {
        if let SessionSlot::Open(ref session) = self.session {
            session.destroy();
        }
        self.finish();

        let tracks: Vec<MediaTrack> = self
            .stream
            .as_ref()
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default();
        for track in tracks {
            self.remove_track(&track);
        }
    }

    // ===== Signaling

    fn on_signal(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::SessionLost(reason) => {
                error!("Signaling session lost: {}", reason);
                self.ctx.status.set_info(false, false, &reason);
                self.destroy();
            }
            SignalingEvent::Message { body, jsep } => self.on_message(body, jsep),
            SignalingEvent::WebRtcState(up) => {
                info!(
                    "Plugin says our peer connection is {} now",
                    if up { "up" } else { "down" }
                );
                if up {
                    self.send(PluginRequest::KeyRequired, None);
                }
            }
            SignalingEvent::PeerState(state) => {
                info!("Peer connection state changed to {}", state);
                if state == PeerState::Failed {
                    self.destroy();
                }
            }
            SignalingEvent::TrackAdded(track) => {
                info!("Got remote {} track {}", track.kind(), track.id());
                let is_video = track.kind() == TrackKind::Video;
                self.add_track(track);
                if is_video {
                    self.send(PluginRequest::KeyRequired, None);
                    self.start_stats();
                }
            }
            SignalingEvent::TrackRemoved(track) => {
                info!("Remote {} track {} ended", track.kind(), track.id());
                self.remove_track(&track);
            }
            SignalingEvent::Cleanup => {
                info!("Got a cleanup notification");
                self.stop_stats();
            }
            SignalingEvent::Detached => {
                warn!("Plugin detached our handle");
                self.destroy();
            }
        }
    }

    fn on_message(&mut self, body: serde_json::Value, jsep: Option<Jsep>) {
        match PluginMessage::from_value(body) {
            PluginMessage::Error { code, message } => {
                error!("Got plugin error message: {:?} - {}", code, message);
                self.ctx.status.set_info(false, false, &message);
                if self.retry_error.is_none() {
                    self.retry_error = Some(Box::pin(tokio::time::sleep(
                        self.config.retry_error_delay(),
                    )));
                }
                return;
            }
            PluginMessage::Started => {
                self.retry_error = None;
                info!("Got plugin result: started");
                self.ctx.status.set_active();
                self.ctx.status.set_info(false, false, "");
            }
            PluginMessage::Stopped => {
                self.retry_error = None;
                info!("Got plugin result: stopped");
                self.ctx.status.set_inactive();
                self.ctx.status.set_info(false, false, "");
            }
            PluginMessage::Features(features) => {
                self.retry_error = None;
                info!("Got plugin features: {:?}", features);
                self.ctx.features.set_enabled(Feature::Audio, features.audio);
                self.ctx.features.set_enabled(Feature::Mic, features.mic);
                *self.ice_url.write() = features.ice_url();
                self.send_watch();
            }
            PluginMessage::Status(status) => {
                self.retry_error = None;
                info!("Got plugin result: {}", status);
            }
            PluginMessage::Unknown(value) => {
                self.retry_error = None;
                info!("Got unknown plugin message: {}", value);
            }
        }

        if let Some(jsep) = jsep {
            self.on_jsep(jsep);
        }
    }

    fn on_jsep(&mut self, jsep: Jsep) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        if jsep.kind != JsepKind::Offer {
            warn!("Ignoring {:?} session description", jsep.kind);
            return;
        }

        info!("Handling remote offer");
        let request = AnswerRequest::for_stream(self.config.audio, self.config.mic);
        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = handle.create_answer(jsep, request).await;
            let _ = tx.send(Event::AnswerCreated { epoch, result });
        });
    }

    fn on_answer_created(&mut self, epoch: u64, result: Result<Jsep>) {
        if epoch != self.epoch {
            return;
        }
        match result {
            Ok(answer) => {
                info!("Got local answer");
                self.send(PluginRequest::Start, Some(answer));
            }
            Err(e) => {
                error!("Error on SDP handling: {}", e);
                self.ctx.status.set_info(false, false, &e.status_text());
                self.destroy();
            }
        }
    }

    fn send(&self, request: PluginRequest, jsep: Option<Jsep>) {
        let Some(ref handle) = self.handle else {
            return;
        };
        info!("Sending {} ...", request.name());
        if let Err(e) = handle.send(request, jsep) {
            warn!("Can't send plugin message: {}", e);
        }
    }

    fn send_watch(&self) {
        let params = WatchParams {
            orientation: self.config.orientation,
            audio: self.config.audio,
            mic: self.config.mic,
        };
        debug!("Watch params: {:?}", params);
        self.send(PluginRequest::Watch { params }, None);
    }

    fn send_stop(&mut self) {
        self.stop_stats();
        self.send(PluginRequest::Stop, None);
    }

    // ===== Tracks

    fn add_track(&mut self, track: MediaTrack) {
        let replaced: Vec<MediaTrack> = self
            .stream
            .as_ref()
            .map(|s| {
                s.tracks()
                    .iter()
                    .filter(|t| t.kind() == track.kind() && t.id() != track.id())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for old in replaced {
            self.remove_track(&old);
        }

        self.stream
            .get_or_insert_with(MediaStream::new)
            .add_track(track);
        self.ctx.video.set_stream(self.stream.clone());
    }

    fn remove_track(&mut self, track: &MediaTrack) {
        let Some(ref mut stream) = self.stream else {
            return;
        };
        track.stop();
        stream.remove_track(track.id());
        if stream.is_empty() {
            self.stream = None;
        }
        self.ctx.video.set_stream(self.stream.clone());
    }

    // ===== Statistics

    fn start_stats(&mut self) {
        self.stop_stats();
        self.ctx.status.set_active();
        self.request_stats();

        let period = self.config.stats_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.stats = Some(interval);
    }

    fn stop_stats(&mut self) {
        self.stats = None;
    }

    fn request_stats(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        if self.stats_pending {
            return;
        }
        self.stats_pending = true;

        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = handle.stats().await;
            let _ = tx.send(Event::StatsReady { epoch, result });
        });
    }

    fn on_stats(&mut self, epoch: u64, result: Result<HandleStats>) {
        if epoch != self.epoch {
            return;
        }
        self.stats_pending = false;
        if self.handle.is_none() {
            return;
        }

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                warn_throttled!(self.throttler, "stats", "Can't read handle stats: {}", e);
                return;
            }
        };

        let mut info = stats.bitrate.replace("kbits/sec", "kbps");
        let frames = self.ctx.video.decoded_frames().or(stats.frames_decoded);
        if let Some(frames) = frames {
            info.push_str(&format!(" / {} fps", frames.saturating_sub(self.frames)));
            self.frames = frames;
        }
        self.ctx.status.set_info(true, self.source.online, &info);
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::stream::headless::{HeadlessSurface, WsUrlBuilder};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sessions: AtomicUsize,
        attaches: AtomicUsize,
        live_sessions: AtomicUsize,
        live_handles: AtomicUsize,
        max_live_handles: AtomicUsize,
        stats_calls: AtomicUsize,
        frames: AtomicU64,
        fail_sessions: AtomicUsize,
        fail_attach: AtomicBool,
        session_delay_ms: AtomicU64,
        servers: Mutex<Vec<String>>,
        sent: Mutex<Vec<(PluginRequest, Option<Jsep>)>>,
        answers: Mutex<Vec<AnswerRequest>>,
        handle_sinks: Mutex<Vec<EventSink>>,
        ice: Mutex<Option<IceServerProvider>>,
    }

    impl Recorder {
        fn requests(&self) -> Vec<PluginRequest> {
            self.sent.lock().iter().map(|(r, _)| r.clone()).collect()
        }

        fn count(&self, request: &PluginRequest) -> usize {
            self.requests().iter().filter(|r| *r == request).count()
        }

        fn emit(&self, event: SignalingEvent) {
            let sink = self.handle_sinks.lock().last().cloned().expect("no handle");
            sink.emit(event);
        }
    }

    struct MockLibrary(Arc<Recorder>);

    #[async_trait]
    impl SignalingLibrary for MockLibrary {
        fn is_webrtc_available(&self) -> bool {
            true
        }

        async fn create_session(
            &self,
            options: SessionOptions,
            _events: EventSink,
        ) -> Result<Arc<dyn SignalingSession>> {
            let rec = self.0.clone();
            let n = rec.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            rec.servers.lock().push(options.server.clone());
            *rec.ice.lock() = Some(options.ice_servers.clone());

            let delay = rec.session_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            if rec
                .fail_sessions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::Signaling("Connection refused".to_string()));
            }
            rec.live_sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockSession {
                rec,
                id: n as u64,
                destroyed: AtomicBool::new(false),
            }))
        }
    }

    struct MockSession {
        rec: Arc<Recorder>,
        id: u64,
        destroyed: AtomicBool,
    }

    #[async_trait]
    impl SignalingSession for MockSession {
        fn id(&self) -> u64 {
            self.id
        }

        async fn attach(&self, _plugin: &str, events: EventSink) -> Result<Arc<dyn PluginHandle>> {
            let rec = self.rec.clone();
            let n = rec.attaches.fetch_add(1, Ordering::SeqCst) + 1;
            if rec.fail_attach.load(Ordering::SeqCst) {
                return Err(AppError::Plugin {
                    plugin: "janus.plugin.live777".to_string(),
                    reason: "No such plugin".to_string(),
                });
            }
            let live = rec.live_handles.fetch_add(1, Ordering::SeqCst) + 1;
            rec.max_live_handles.fetch_max(live, Ordering::SeqCst);
            rec.handle_sinks.lock().push(events);
            Ok(Arc::new(MockHandle {
                rec,
                id: n as u64,
                detached: AtomicBool::new(false),
            }))
        }

        fn destroy(&self) {
            if !self.destroyed.swap(true, Ordering::SeqCst) {
                self.rec.live_sessions.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    struct MockHandle {
        rec: Arc<Recorder>,
        id: u64,
        detached: AtomicBool,
    }

    #[async_trait]
    impl PluginHandle for MockHandle {
        fn id(&self) -> u64 {
            self.id
        }

        fn plugin(&self) -> &str {
            "janus.plugin.live777"
        }

        fn send(&self, request: PluginRequest, jsep: Option<Jsep>) -> Result<()> {
            if self.detached.load(Ordering::SeqCst) {
                return Err(AppError::HandleGone);
            }
            self.rec.sent.lock().push((request, jsep));
            Ok(())
        }

        async fn create_answer(&self, offer: Jsep, request: AnswerRequest) -> Result<Jsep> {
            self.rec.answers.lock().push(request);
            Ok(Jsep::answer(format!("answer to {}", offer.sdp)))
        }

        async fn stats(&self) -> Result<HandleStats> {
            self.rec.stats_calls.fetch_add(1, Ordering::SeqCst);
            let frames = self.rec.frames.fetch_add(30, Ordering::SeqCst) + 30;
            Ok(HandleStats {
                bitrate: "812 kbits/sec".to_string(),
                frames_decoded: Some(frames),
            })
        }

        fn hangup(&self) {}

        fn detach(&self) {
            if !self.detached.swap(true, Ordering::SeqCst) {
                self.rec.live_handles.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    struct Harness {
        rec: Arc<Recorder>,
        surface: Arc<HeadlessSurface>,
        streamer: Live777Streamer,
    }

    fn harness(config: StreamerConfig) -> Harness {
        let rec = Arc::new(Recorder::default());
        let surface = Arc::new(HeadlessSurface::new());
        let ctx = StreamerContext {
            status: surface.clone(),
            features: surface.clone(),
            video: surface.clone(),
            urls: Arc::new(WsUrlBuilder::new("https://kvm.local")),
        };
        let streamer = Live777Streamer::new(config, Arc::new(MockLibrary(rec.clone())), ctx);
        Harness {
            rec,
            surface,
            streamer,
        }
    }

    /// Let every ready task run; the paused clock only moves once all are idle
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn online() -> SourceState {
        SourceState { online: true }
    }

    fn message(body: serde_json::Value, jsep: Option<Jsep>) -> SignalingEvent {
        SignalingEvent::Message { body, jsep }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_is_idempotent() {
        let h = harness(StreamerConfig::default());
        assert_eq!(h.streamer.state(), StreamState::Idle);

        h.streamer.ensure_stream(online());
        h.streamer.ensure_stream(online());
        settle().await;
        h.streamer.ensure_stream(online());
        settle().await;

        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(h.rec.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(h.streamer.state(), StreamState::Attached);
        assert_eq!(h.rec.requests(), vec![PluginRequest::Features]);
        assert_eq!(h.rec.servers.lock()[0], "wss://kvm.local/janus/ws");
    }

    #[tokio::test(start_paused = true)]
    async fn test_features_toggle_ui_and_send_watch() {
        let h = harness(StreamerConfig::new(90, true, true));
        h.streamer.ensure_stream(online());
        settle().await;

        h.rec.emit(message(
            json!({"result": {"status": "features", "features": {
                "audio": true, "mic": false, "ice": {"url": "stun:stun.kvm.local:3478"}
            }}}),
            None,
        ));
        settle().await;

        assert_eq!(h.surface.feature(Feature::Audio), Some(true));
        assert_eq!(h.surface.feature(Feature::Mic), Some(false));
        assert_eq!(
            h.rec.requests().last(),
            Some(&PluginRequest::Watch {
                params: WatchParams {
                    orientation: 90,
                    audio: true,
                    mic: true,
                }
            })
        );

        let provider = h.rec.ice.lock().clone().unwrap();
        assert_eq!(
            provider(),
            vec![IceServer {
                urls: vec!["stun:stun.kvm.local:3478".to_string()]
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_servers_empty_without_features() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;
        let provider = h.rec.ice.lock().clone().unwrap();
        assert!(provider().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_is_answered_and_started() {
        let h = harness(StreamerConfig::new(0, true, false));
        h.streamer.ensure_stream(online());
        settle().await;

        h.rec.emit(message(json!({"result": {"status": "ok"}}), Some(Jsep::offer("v=0"))));
        settle().await;

        let answers = h.rec.answers.lock().clone();
        assert_eq!(answers.len(), 1);
        assert!(answers[0].receives(TrackKind::Video));
        assert!(answers[0].receives(TrackKind::Audio));
        assert!(!answers[0].captures_audio());

        let sent = h.rec.sent.lock().clone();
        let (request, jsep) = sent.last().unwrap();
        assert_eq!(*request, PluginRequest::Start);
        assert_eq!(jsep.as_ref().unwrap(), &Jsep::answer("answer to v=0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mic_without_audio_never_captures() {
        let mut config = StreamerConfig::default();
        config.audio = false;
        config.mic = true;
        let h = harness(config);
        assert!(!h.streamer.is_mic_allowed());

        h.streamer.ensure_stream(online());
        settle().await;
        h.rec.emit(message(json!({}), Some(Jsep::offer("v=0"))));
        settle().await;

        let answers = h.rec.answers.lock().clone();
        assert_eq!(answers.len(), 1);
        assert!(!answers[0].captures_audio());
        assert!(!answers[0].receives(TrackKind::Audio));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_message_resends_stop_and_watch_once() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;

        h.rec.emit(message(json!({"error_code": 503, "error": "No signal"}), None));
        settle().await;
        assert_eq!(h.surface.info(), "No signal");

        wait(1000).await;
        // A second error inside the window does not restart it
        h.rec.emit(message(json!({"error_code": 503, "error": "No signal"}), None));
        wait(990).await;
        assert_eq!(h.rec.count(&PluginRequest::Stop), 0);

        wait(20).await;
        assert_eq!(h.rec.count(&PluginRequest::Stop), 1);
        let requests = h.rec.requests();
        let n = requests.len();
        assert_eq!(requests[n - 2], PluginRequest::Stop);
        assert!(matches!(requests[n - 1], PluginRequest::Watch { .. }));

        wait(10_000).await;
        assert_eq!(h.rec.count(&PluginRequest::Stop), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_cancels_pending_resend() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;

        h.rec.emit(message(json!({"error_code": 500, "error": "Busy"}), None));
        settle().await;
        h.rec.emit(message(json!({"result": {"status": "started"}}), None));
        settle().await;
        assert!(h.surface.is_active());

        wait(5000).await;
        assert_eq!(h.rec.count(&PluginRequest::Stop), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_with_odd_fields_still_resends() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;

        h.rec.emit(message(json!({"error_code": "503", "error": {"reason": "x"}}), None));
        settle().await;
        h.rec.emit(message(
            json!({"error_code": 503, "error": "No signal", "result": {"status": "started"}}),
            None,
        ));
        settle().await;
        assert!(!h.surface.is_active());
        assert_eq!(h.surface.info(), "No signal");

        wait(2000).await;
        assert_eq!(h.rec.count(&PluginRequest::Stop), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_odd_features_still_send_watch() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;

        h.rec.emit(message(
            json!({"result": {"status": "features", "features": {"audio": 1, "mic": "no"}}}),
            None,
        ));
        settle().await;

        assert_eq!(h.surface.feature(Feature::Audio), Some(true));
        assert_eq!(h.surface.feature(Feature::Mic), Some(false));
        assert!(matches!(
            h.rec.requests().last(),
            Some(PluginRequest::Watch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_retries_after_delay() {
        let h = harness(StreamerConfig::default());
        h.rec.fail_sessions.store(1, Ordering::SeqCst);

        h.streamer.ensure_stream(online());
        settle().await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(h.streamer.state(), StreamState::Ensuring);
        assert_eq!(h.surface.info(), "Connection refused");
        assert!(!h.surface.is_active());

        // External ensure calls while a retry is pending change nothing
        h.streamer.ensure_stream(online());
        wait(4900).await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 1);

        wait(200).await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 2);
        assert_eq!(h.streamer.state(), StreamState::Attached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_failure_tears_down_and_retries() {
        let h = harness(StreamerConfig::default());
        h.rec.fail_attach.store(true, Ordering::SeqCst);

        h.streamer.ensure_stream(online());
        settle().await;
        assert_eq!(h.rec.live_sessions.load(Ordering::SeqCst), 0);
        assert_eq!(h.surface.info(), "No such plugin");

        h.rec.fail_attach.store(false, Ordering::SeqCst);
        wait(5001).await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 2);
        assert_eq!(h.rec.live_handles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_retry_delay() {
        let mut config = StreamerConfig::default();
        config.retry_ensure_ms = 500;
        let h = harness(config);
        h.rec.fail_sessions.store(2, Ordering::SeqCst);

        h.streamer.ensure_stream(online());
        wait(1100).await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 3);
        assert_eq!(h.streamer.state(), StreamState::Attached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_tracks_and_suppresses_retry() {
        let h = harness(StreamerConfig::new(0, true, false));
        h.streamer.ensure_stream(online());
        settle().await;

        let video = MediaTrack::new("v0", TrackKind::Video);
        let audio = MediaTrack::new("a0", TrackKind::Audio);
        h.rec.emit(SignalingEvent::TrackAdded(video.clone()));
        h.rec.emit(SignalingEvent::TrackAdded(audio.clone()));
        settle().await;
        assert_eq!(h.surface.track_count(), 2);

        h.streamer.stop_stream();
        settle().await;

        assert_eq!(h.streamer.state(), StreamState::Stopped);
        assert_eq!(h.surface.track_count(), 0);
        assert!(video.is_stopped());
        assert!(audio.is_stopped());
        assert_eq!(h.rec.live_handles.load(Ordering::SeqCst), 0);
        assert_eq!(h.rec.live_sessions.load(Ordering::SeqCst), 0);
        assert!(!h.surface.is_active());

        wait(20_000).await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 1);
        let stats_calls = h.rec.stats_calls.load(Ordering::SeqCst);
        wait(3000).await;
        assert_eq!(h.rec.stats_calls.load(Ordering::SeqCst), stats_calls);

        // ensure re-arms a stopped controller
        h.streamer.ensure_stream(online());
        settle().await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 2);
        assert_eq!(h.streamer.state(), StreamState::Attached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_failed_attempt_cancels_retry() {
        let h = harness(StreamerConfig::default());
        h.rec.fail_sessions.store(1, Ordering::SeqCst);
        h.streamer.ensure_stream(online());
        settle().await;

        h.streamer.stop_stream();
        wait(10_000).await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(h.streamer.state(), StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_track_starts_stats() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;
        assert_eq!(h.rec.stats_calls.load(Ordering::SeqCst), 0);

        h.rec.emit(SignalingEvent::TrackAdded(MediaTrack::new("v0", TrackKind::Video)));
        settle().await;
        assert!(h.surface.is_active());
        assert_eq!(h.rec.stats_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.rec.count(&PluginRequest::KeyRequired), 1);
        assert_eq!(h.surface.info(), "812 kbps / 30 fps");

        wait(1000).await;
        assert_eq!(h.rec.stats_calls.load(Ordering::SeqCst), 2);
        wait(1000).await;
        assert_eq!(h.rec.stats_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.surface.info(), "812 kbps / 30 fps");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fps_restarts_after_reconnect() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;
        h.rec.frames.store(9000, Ordering::SeqCst);
        h.rec.emit(SignalingEvent::TrackAdded(MediaTrack::new("v0", TrackKind::Video)));
        settle().await;
        assert_eq!(h.surface.info(), "812 kbps / 9030 fps");

        h.rec.emit(SignalingEvent::PeerState(PeerState::Failed));
        settle().await;
        // The next peer counts from zero
        h.rec.frames.store(0, Ordering::SeqCst);
        wait(5000).await;
        assert_eq!(h.streamer.state(), StreamState::Attached);

        h.rec.emit(SignalingEvent::TrackAdded(MediaTrack::new("v1", TrackKind::Video)));
        settle().await;
        assert_eq!(h.surface.info(), "812 kbps / 30 fps");
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_track_does_not_start_stats() {
        let h = harness(StreamerConfig::new(0, true, false));
        h.streamer.ensure_stream(online());
        settle().await;

        h.rec.emit(SignalingEvent::TrackAdded(MediaTrack::new("a0", TrackKind::Audio)));
        wait(3000).await;
        assert_eq!(h.rec.stats_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.surface.track_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_last_track_clears_stream() {
        let h = harness(StreamerConfig::new(0, true, false));
        h.streamer.ensure_stream(online());
        settle().await;

        let video = MediaTrack::new("v0", TrackKind::Video);
        let audio = MediaTrack::new("a0", TrackKind::Audio);
        h.rec.emit(SignalingEvent::TrackAdded(video.clone()));
        h.rec.emit(SignalingEvent::TrackAdded(audio.clone()));
        settle().await;

        h.rec.emit(SignalingEvent::TrackRemoved(audio.clone()));
        settle().await;
        assert_eq!(h.surface.track_count(), 1);
        assert!(audio.is_stopped());

        h.rec.emit(SignalingEvent::TrackRemoved(video));
        settle().await;
        assert_eq!(h.surface.track_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_of_same_kind_is_replaced() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;

        let first = MediaTrack::new("v0", TrackKind::Video);
        h.rec.emit(SignalingEvent::TrackAdded(first.clone()));
        h.rec.emit(SignalingEvent::TrackAdded(MediaTrack::new("v1", TrackKind::Video)));
        settle().await;

        assert_eq!(h.surface.track_count(), 1);
        assert!(first.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_failure_tears_down_and_retries() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;
        h.rec.emit(SignalingEvent::TrackAdded(MediaTrack::new("v0", TrackKind::Video)));
        settle().await;

        h.rec.emit(SignalingEvent::PeerState(PeerState::Failed));
        settle().await;
        assert_eq!(h.streamer.state(), StreamState::Ensuring);
        assert_eq!(h.rec.live_handles.load(Ordering::SeqCst), 0);
        assert_eq!(h.surface.track_count(), 0);

        wait(5000).await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 2);
        assert_eq!(h.rec.live_handles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_events_are_ignored() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;
        let old_sink = h.rec.handle_sinks.lock()[0].clone();

        h.streamer.stop_stream();
        h.streamer.ensure_stream(online());
        settle().await;
        assert_eq!(h.rec.sessions.load(Ordering::SeqCst), 2);

        old_sink.emit(SignalingEvent::TrackAdded(MediaTrack::new("v0", TrackKind::Video)));
        old_sink.emit(SignalingEvent::PeerState(PeerState::Failed));
        settle().await;
        assert_eq!(h.surface.track_count(), 0);
        assert_eq!(h.streamer.state(), StreamState::Attached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_churn_keeps_one_handle() {
        let h = harness(StreamerConfig::default());
        h.rec.session_delay_ms.store(30, Ordering::SeqCst);

        for i in 0..20u64 {
            h.streamer.ensure_stream(online());
            wait(7 * (i % 5)).await;
            if i % 3 != 0 {
                h.streamer.stop_stream();
            }
            wait(11).await;
        }
        wait(200).await;
        assert!(h.rec.max_live_handles.load(Ordering::SeqCst) <= 1);

        h.streamer.stop_stream();
        wait(200).await;
        assert_eq!(h.rec.live_handles.load(Ordering::SeqCst), 0);
        assert_eq!(h.rec.live_sessions.load(Ordering::SeqCst), 0);
        assert_eq!(h.streamer.state(), StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_session() {
        let h = harness(StreamerConfig::default());
        h.streamer.ensure_stream(online());
        settle().await;
        assert_eq!(h.rec.live_handles.load(Ordering::SeqCst), 1);

        let rec = h.rec.clone();
        drop(h);
        settle().await;
        assert_eq!(rec.live_handles.load(Ordering::SeqCst), 0);
        assert_eq!(rec.live_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_descriptors() {
        let h = harness(StreamerConfig::new(270, true, true));
        assert_eq!(h.streamer.name(), "WebRTC H.264 + Audio + Mic");
        assert_eq!(h.streamer.mode(), "live777");
        assert_eq!(h.streamer.orientation(), 270);
        assert!(h.streamer.is_audio_allowed());
        assert!(h.streamer.is_mic_allowed());
        assert!(Live777Streamer::is_webrtc_available(&MockLibrary(h.rec.clone())));

        let h = harness(StreamerConfig::new(0, false, true));
        assert_eq!(h.streamer.name(), "WebRTC H.264");
        let resolution = h.streamer.resolution();
        assert_eq!(resolution.real_width, 0);
        assert_eq!(resolution.view_height, 0);
    }
}
