//! Janus-style WebSocket signaling backend
//!
//! Speaks the `janus-protocol` WebSocket subprotocol the appliance's gateway
//! exposes. Requests that need a reply (`create`, `attach`) wait for the
//! matching transaction. Plugin messages, hangups and detaches are queued in
//! order and their results come back as asynchronous events routed by handle.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::library::{
    EventSink, HandleStats, IceServerProvider, PluginHandle, SessionOptions, SignalingEvent,
    SignalingLibrary, SignalingSession,
};
use super::message::{AnswerRequest, Jsep, PluginRequest};
use super::peer::AnswerPeer;
use crate::error::{AppError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBPROTOCOL: &str = "janus-protocol";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket signaling library
pub struct JanusLibrary {
    keepalive: Duration,
    timeout: Duration,
}

impl Default for JanusLibrary {
    fn default() -> Self {
        Self {
            keepalive: KEEPALIVE_INTERVAL,
            timeout: REQUEST_TIMEOUT,
        }
    }
}

impl JanusLibrary {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingLibrary for JanusLibrary {
    fn is_webrtc_available(&self) -> bool {
        true
    }

    async fn create_session(
        &self,
        options: SessionOptions,
        events: EventSink,
    ) -> Result<Arc<dyn SignalingSession>> {
        info!("Connecting to signaling server {} ...", options.server);
        let mut request = options.server.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport {
            out: tx,
            pending: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
            opened: AtomicBool::new(false),
            timeout: self.timeout,
        });
        tokio::spawn(write_loop(write, rx));
        tokio::spawn(read_loop(read, transport.clone(), events));

        let id = match transport.create().await {
            Ok(id) => id,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        transport.opened.store(true, Ordering::SeqCst);
        tokio::spawn(keepalive_loop(transport.clone(), id, self.keepalive));

        Ok(Arc::new(JanusSession {
            id,
            transport,
            ice_servers: options.ice_servers,
        }))
    }
}

/// Parsed gateway frame
#[derive(Debug, PartialEq)]
enum Incoming {
    /// `success` or `error` for a transaction
    Reply { transaction: String, frame: Value },
    Ack,
    Event {
        sender: u64,
        body: Value,
        jsep: Option<Jsep>,
    },
    WebRtcUp { sender: u64 },
    Hangup { sender: u64, reason: String },
    Detached { sender: u64 },
    Timeout,
    Other(String),
}

fn parse_incoming(frame: Value) -> Incoming {
    let kind = frame["janus"].as_str().unwrap_or_default().to_string();
    let sender = frame["sender"].as_u64().unwrap_or_default();

    match kind.as_str() {
        "success" | "error" => match frame["transaction"].as_str() {
            Some(transaction) => Incoming::Reply {
                transaction: transaction.to_string(),
                frame,
            },
            None => Incoming::Other(kind),
        },
        "ack" => Incoming::Ack,
        "event" => Incoming::Event {
            sender,
            body: frame["plugindata"]["data"].clone(),
            jsep: frame
                .get("jsep")
                .and_then(|jsep| serde_json::from_value(jsep.clone()).ok()),
        },
        "webrtcup" => Incoming::WebRtcUp { sender },
        "hangup" => Incoming::Hangup {
            sender,
            reason: frame["reason"].as_str().unwrap_or_default().to_string(),
        },
        "detached" => Incoming::Detached { sender },
        "timeout" => Incoming::Timeout,
        _ => Incoming::Other(kind),
    }
}

/// Data of a `success` reply, or the reason of an `error` one
fn reply_data(frame: Value) -> Result<Value> {
    if frame["janus"] == "success" {
        return Ok(frame["data"].clone());
    }
    let reason = frame["error"]["reason"]
        .as_str()
        .unwrap_or("Unknown signaling error")
        .to_string();
    Err(AppError::Signaling(reason))
}

fn new_transaction() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Connection state shared by the session, its handles and the I/O tasks
struct Transport {
    out: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    handles: Mutex<HashMap<u64, Arc<JanusHandle>>>,
    closed: CancellationToken,
    /// Set once `create` succeeded; a drop before that is a failed open
    opened: AtomicBool,
    timeout: Duration,
}

impl Transport {
    fn post(&self, frame: Value) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(AppError::Signaling("Signaling connection closed".to_string()));
        }
        self.out
            .send(Message::Text(frame.to_string()))
            .map_err(|_| AppError::Signaling("Signaling connection closed".to_string()))
    }

    async fn request(&self, transaction: String, frame: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction.clone(), tx);
        if let Err(e) = self.post(frame) {
            self.pending.lock().remove(&transaction);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply_data(reply),
            Ok(Err(_)) => Err(AppError::Signaling(
                "Signaling connection closed".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&transaction);
                Err(AppError::Signaling("Signaling request timed out".to_string()))
            }
        }
    }

    async fn create(&self) -> Result<u64> {
        let transaction = new_transaction();
        let frame = json!({"janus": "create", "transaction": transaction});
        let data = self.request(transaction, frame).await?;
        data["id"]
            .as_u64()
            .ok_or_else(|| AppError::Signaling("Session reply without an id".to_string()))
    }

    fn handle(&self, id: u64) -> Option<Arc<JanusHandle>> {
        self.handles.lock().get(&id).cloned()
    }

    fn dispatch(&self, incoming: Incoming, events: &EventSink) {
        match incoming {
            Incoming::Reply { transaction, frame } => {
                match self.pending.lock().remove(&transaction) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => {
                        if let Err(e) = reply_data(frame) {
                            warn!("Signaling request failed: {}", e);
                        }
                    }
                }
            }
            Incoming::Ack => {}
            Incoming::Event { sender, body, jsep } => match self.handle(sender) {
                Some(handle) => handle.events.emit(SignalingEvent::Message { body, jsep }),
                None => debug!("Event for unknown handle {}", sender),
            },
            Incoming::WebRtcUp { sender } => {
                if let Some(handle) = self.handle(sender) {
                    handle.events.emit(SignalingEvent::WebRtcState(true));
                }
            }
            Incoming::Hangup { sender, reason } => {
                if let Some(handle) = self.handle(sender) {
                    info!("Handle {} hung up: {}", sender, reason);
                    handle.events.emit(SignalingEvent::WebRtcState(false));
                    handle.close_peer();
                }
            }
            Incoming::Detached { sender } => {
                let handle = self.handles.lock().remove(&sender);
                if let Some(handle) = handle {
                    handle.detached.store(true, Ordering::SeqCst);
                    handle.close_peer();
                    handle.events.emit(SignalingEvent::Detached);
                }
            }
            Incoming::Timeout => {
                self.close();
                events.emit(SignalingEvent::SessionLost(
                    "Signaling session timed out".to_string(),
                ));
            }
            Incoming::Other(kind) => debug!("Ignoring signaling frame: {}", kind),
        }
    }

    /// Stop the I/O tasks and fail every pending request
    fn close(&self) {
        self.closed.cancel();
        let _ = self.out.send(Message::Close(None));
        self.pending.lock().clear();
        let handles: Vec<Arc<JanusHandle>> =
            self.handles.lock().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.detached.store(true, Ordering::SeqCst);
            handle.close_peer();
        }
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            debug!("Signaling write failed: {}", e);
            break;
        }
        if close {
            break;
        }
    }
    debug!("Signaling writer finished");
}

async fn read_loop(mut read: SplitStream<WsStream>, transport: Arc<Transport>, events: EventSink) {
    let reason = loop {
        tokio::select! {
            _ = transport.closed.cancelled() => return,
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(frame) => transport.dispatch(parse_incoming(frame), &events),
                    Err(e) => warn!("Invalid signaling frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "Signaling connection closed".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "Signaling connection closed".to_string(),
            }
        }
    };

    let opened = transport.opened.load(Ordering::SeqCst);
    transport.close();
    if opened {
        events.emit(SignalingEvent::SessionLost(reason));
    }
}

async fn keepalive_loop(transport: Arc<Transport>, session_id: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = transport.closed.cancelled() => break,
            _ = ticker.tick() => {
                let frame = json!({
                    "janus": "keepalive",
                    "session_id": session_id,
                    "transaction": new_transaction(),
                });
                if transport.post(frame).is_err() {
                    break;
                }
            }
        }
    }
}

pub struct JanusSession {
    id: u64,
    transport: Arc<Transport>,
    ice_servers: IceServerProvider,
}

#[async_trait]
impl SignalingSession for JanusSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn attach(&self, plugin: &str, events: EventSink) -> Result<Arc<dyn PluginHandle>> {
        let transaction = new_transaction();
        let frame = json!({
            "janus": "attach",
            "session_id": self.id,
            "plugin": plugin,
            "transaction": transaction,
        });
        let data = self
            .transport
            .request(transaction, frame)
            .await
            .map_err(|e| AppError::Plugin {
                plugin: plugin.to_string(),
                reason: e.status_text(),
            })?;
        let id = data["id"].as_u64().ok_or_else(|| AppError::Plugin {
            plugin: plugin.to_string(),
            reason: "Attach reply without a handle id".to_string(),
        })?;

        let handle = Arc::new(JanusHandle {
            id,
            session_id: self.id,
            plugin: plugin.to_string(),
            transport: Arc::downgrade(&self.transport),
            events,
            ice_servers: self.ice_servers.clone(),
            peer: Mutex::new(None),
            detached: AtomicBool::new(false),
        });
        self.transport.handles.lock().insert(id, handle.clone());
        Ok(handle)
    }

    fn destroy(&self) {
        if self.transport.closed.is_cancelled() {
            return;
        }
        info!("Destroying signaling session {}", self.id);
        let _ = self.transport.post(json!({
            "janus": "destroy",
            "session_id": self.id,
            "transaction": new_transaction(),
        }));
        self.transport.close();
    }
}

pub struct JanusHandle {
    id: u64,
    session_id: u64,
    plugin: String,
    /// Weak so the transport's handle table does not keep itself alive
    transport: std::sync::Weak<Transport>,
    events: EventSink,
    ice_servers: IceServerProvider,
    peer: Mutex<Option<Arc<AnswerPeer>>>,
    detached: AtomicBool,
}

impl JanusHandle {
    fn frame(&self, janus: &str) -> Value {
        json!({
            "janus": janus,
            "session_id": self.session_id,
            "handle_id": self.id,
            "transaction": new_transaction(),
        })
    }

    fn post(&self, janus: &str) -> Result<()> {
        let transport = self.transport.upgrade().ok_or(AppError::HandleGone)?;
        transport.post(self.frame(janus))
    }

    /// Close the peer connection in the background, then report a cleanup
    fn close_peer(&self) {
        let Some(peer) = self.peer.lock().take() else {
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            peer.close().await;
            events.emit(SignalingEvent::Cleanup);
        });
    }
}

#[async_trait]
impl PluginHandle for JanusHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn plugin(&self) -> &str {
        &self.plugin
    }

    fn send(&self, request: PluginRequest, jsep: Option<Jsep>) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(AppError::HandleGone);
        }
        let mut body = serde_json::Map::new();
        body.insert("body".to_string(), serde_json::to_value(&request)?);
        if let Some(jsep) = jsep {
            body.insert("jsep".to_string(), serde_json::to_value(&jsep)?);
        }

        let transport = self.transport.upgrade().ok_or(AppError::HandleGone)?;
        let mut frame = self.frame("message");
        if let Some(obj) = frame.as_object_mut() {
            obj.extend(body);
        }
        transport.post(frame)
    }

    async fn create_answer(&self, offer: Jsep, request: AnswerRequest) -> Result<Jsep> {
        if request.captures_audio() {
            warn!("Microphone capture is not available here, answering receive-only");
        }

        let peer = Arc::new(AnswerPeer::new((self.ice_servers)(), self.events.clone()).await?);
        let previous = self.peer.lock().replace(peer.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }

        let sdp = peer.answer(offer.sdp, &request).await?;
        Ok(Jsep::answer(sdp))
    }

    async fn stats(&self) -> Result<HandleStats> {
        let peer = self.peer.lock().clone();
        match peer {
            Some(peer) => Ok(peer.stats()),
            None => Err(AppError::WebRtcError("No peer connection".to_string())),
        }
    }

    fn hangup(&self) {
        if let Err(e) = self.post("hangup") {
            debug!("Can't send hangup: {}", e);
        }
        self.close_peer();
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.handles.lock().remove(&self.id);
        }
        if let Err(e) = self.post("detach") {
            debug!("Can't send detach: {}", e);
        }
        self.close_peer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::IceServer;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    #[test]
    fn test_parse_replies() {
        let incoming = parse_incoming(json!({
            "janus": "success", "transaction": "abc", "data": {"id": 42}
        }));
        let Incoming::Reply { transaction, frame } = incoming else {
            panic!("not a reply");
        };
        assert_eq!(transaction, "abc");
        assert_eq!(reply_data(frame).unwrap()["id"], 42);

        let Incoming::Reply { frame, .. } = parse_incoming(json!({
            "janus": "error", "transaction": "t", "error": {"code": 460, "reason": "No such session"}
        })) else {
            panic!("not a reply");
        };
        assert_eq!(reply_data(frame).unwrap_err().status_text(), "No such session");

        assert_eq!(parse_incoming(json!({"janus": "ack", "transaction": "t"})), Incoming::Ack);
    }

    #[test]
    fn test_parse_events() {
        let incoming = parse_incoming(json!({
            "janus": "event",
            "session_id": 1,
            "sender": 7,
            "plugindata": {"plugin": "janus.plugin.live777", "data": {"result": {"status": "started"}}},
            "jsep": {"type": "offer", "sdp": "v=0"}
        }));
        assert_eq!(
            incoming,
            Incoming::Event {
                sender: 7,
                body: json!({"result": {"status": "started"}}),
                jsep: Some(Jsep::offer("v=0")),
            }
        );

        assert_eq!(
            parse_incoming(json!({"janus": "webrtcup", "sender": 7})),
            Incoming::WebRtcUp { sender: 7 }
        );
        assert_eq!(
            parse_incoming(json!({"janus": "hangup", "sender": 7, "reason": "DTLS alert"})),
            Incoming::Hangup {
                sender: 7,
                reason: "DTLS alert".to_string()
            }
        );
        assert_eq!(
            parse_incoming(json!({"janus": "detached", "sender": 7})),
            Incoming::Detached { sender: 7 }
        );
        assert_eq!(
            parse_incoming(json!({"janus": "timeout", "session_id": 1})),
            Incoming::Timeout
        );
        assert_eq!(
            parse_incoming(json!({"janus": "media", "sender": 7})),
            Incoming::Other("media".to_string())
        );
    }

    #[test]
    fn test_transaction_ids() {
        let a = new_transaction();
        let b = new_transaction();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    /// Minimal gateway: creates session 1, attaches handle 2 and answers
    /// every plugin message with a features event
    async fn spawn_gateway() -> (String, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/janus/ws", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_hdr_async(
                stream,
                |_req: &Request, mut resp: Response| {
                    resp.headers_mut()
                        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
                    Ok(resp)
                },
            )
            .await
            .unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else {
                    continue;
                };
                let frame: Value = serde_json::from_str(&text).unwrap();
                let _ = seen_tx.send(frame.clone());
                let transaction = frame["transaction"].clone();
                let replies = match frame["janus"].as_str().unwrap_or_default() {
                    "create" => vec![json!({
                        "janus": "success", "transaction": transaction, "data": {"id": 1}
                    })],
                    "attach" => vec![json!({
                        "janus": "success", "session_id": 1, "transaction": transaction,
                        "data": {"id": 2}
                    })],
                    "message" => vec![
                        json!({"janus": "ack", "session_id": 1, "transaction": transaction}),
                        json!({
                            "janus": "event", "session_id": 1, "sender": 2,
                            "transaction": transaction,
                            "plugindata": {
                                "plugin": "janus.plugin.live777",
                                "data": {"result": {"status": "features", "features": {"audio": true}}}
                            }
                        }),
                    ],
                    _ => vec![],
                };
                for reply in replies {
                    ws.send(Message::Text(reply.to_string())).await.unwrap();
                }
            }
        });

        (url, seen_rx)
    }

    #[tokio::test]
    async fn test_session_roundtrip_with_gateway() {
        let (url, mut seen) = spawn_gateway().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(move |ev| {
            let _ = events_tx.send(ev);
        });

        let library = JanusLibrary::new();
        let options = SessionOptions {
            server: url,
            ice_servers: Arc::new(Vec::<IceServer>::new),
        };
        let session = library.create_session(options, sink.clone()).await.unwrap();
        assert_eq!(session.id(), 1);

        let handle = session.attach("janus.plugin.live777", sink).await.unwrap();
        assert_eq!(handle.id(), 2);
        assert_eq!(handle.plugin(), "janus.plugin.live777");

        handle.send(PluginRequest::Features, None).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let SignalingEvent::Message { body, jsep } = event else {
            panic!("unexpected event");
        };
        assert!(jsep.is_none());
        assert_eq!(body["result"]["features"]["audio"], true);

        assert!(handle.stats().await.is_err());
        session.destroy();
        assert!(matches!(
            handle.send(PluginRequest::Stop, None),
            Err(AppError::HandleGone)
        ));

        let mut kinds = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(500), seen.recv()).await
        {
            kinds.push(frame["janus"].as_str().unwrap().to_string());
            if frame["janus"] == "message" {
                assert_eq!(frame["body"], json!({"request": "features"}));
                assert_eq!(frame["handle_id"], 2);
            }
        }
        assert_eq!(kinds, vec!["create", "attach", "message", "destroy"]);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = SessionOptions {
            server: format!("ws://{}/janus/ws", addr),
            ice_servers: Arc::new(Vec::<IceServer>::new),
        };
        let result = JanusLibrary::new()
            .create_session(options, EventSink::new(|_| {}))
            .await;
        assert!(matches!(result, Err(AppError::Signaling(_))));
    }
}
