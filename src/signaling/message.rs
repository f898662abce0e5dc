//! Live777 plugin messages
//!
//! Requests are sent as the `body` of a plugin message, results and errors
//! arrive as the plugin data of an event. Session descriptions travel next to
//! the body as a JSEP object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::media::TrackKind;

/// Request sent to the plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum PluginRequest {
    /// Ask which features the appliance supports
    Features,
    /// Ask the appliance to prepare a stream and send an offer
    Watch { params: WatchParams },
    /// Start streaming (carries the answer JSEP)
    Start,
    /// Stop streaming
    Stop,
    /// Ask the encoder for a key frame
    KeyRequired,
}

impl PluginRequest {
    pub fn name(&self) -> &'static str {
        match self {
            PluginRequest::Features => "FEATURES",
            PluginRequest::Watch { .. } => "WATCH",
            PluginRequest::Start => "START",
            PluginRequest::Stop => "STOP",
            PluginRequest::KeyRequired => "KEY_REQUIRED",
        }
    }
}

/// Parameters of a `watch` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchParams {
    pub orientation: u16,
    pub audio: bool,
    pub mic: bool,
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepKind {
    Offer,
    Answer,
}

/// Session description exchanged with the plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepKind,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE server handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
}

/// Features advertised by the appliance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub mic: bool,
    #[serde(default)]
    pub ice: Option<IceInfo>,
}

impl Features {
    /// Custom ICE server URL, if the appliance advertised a non-empty one
    pub fn ice_url(&self) -> Option<String> {
        self.ice
            .as_ref()
            .and_then(|ice| ice.url.clone())
            .filter(|url| !url.is_empty())
    }

    /// Read advertised features, defaulting any field of an unexpected type
    fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let ice = value.get("ice").filter(|ice| !ice.is_null()).map(|ice| IceInfo {
            url: ice.get("url").and_then(Value::as_str).map(str::to_string),
        });
        Self {
            audio: flag(value.get("audio")),
            mic: flag(value.get("mic")),
            ice,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceInfo {
    #[serde(default)]
    pub url: Option<String>,
}

/// `true`/`false`, or a number where non-zero is on
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(on)) => *on,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

/// Error text as sent, or the JSON form of anything that is not a string
fn error_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn error_code(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|code| code.trim().parse().ok()))
}

/// Message received from the plugin
#[derive(Debug, Clone, PartialEq)]
pub enum PluginMessage {
    Started,
    Stopped,
    Features(Features),
    /// Result with a status this client does not act on
    Status(String),
    Error { code: Option<i64>, message: String },
    Unknown(Value),
}

impl PluginMessage {
    /// Classify a plugin event body
    ///
    /// An `error_code` wins over anything else in the body.
    pub fn from_value(value: Value) -> Self {
        if let Some(code) = value.get("error_code") {
            return PluginMessage::Error {
                code: error_code(code),
                message: error_text(value.get("error")),
            };
        }

        if let Some(result) = value.get("result") {
            let status = result
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return match status {
                "started" => PluginMessage::Started,
                "stopped" => PluginMessage::Stopped,
                "features" => PluginMessage::Features(Features::from_value(result.get("features"))),
                _ => PluginMessage::Status(status.to_string()),
            };
        }

        if value.get("error").is_some_and(|error| !error.is_null()) {
            return PluginMessage::Error {
                code: None,
                message: error_text(value.get("error")),
            };
        }

        PluginMessage::Unknown(value)
    }
}

/// One media line of the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRequest {
    #[serde(rename = "type")]
    pub kind: TrackKind,
    /// Send local media on this line
    pub capture: bool,
    /// Receive remote media on this line
    pub recv: bool,
}

/// What the local side wants from the negotiated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub tracks: Vec<TrackRequest>,
}

impl AnswerRequest {
    /// Video is always received. Audio is received when allowed and the
    /// microphone is captured only when audio is allowed too.
    pub fn for_stream(audio: bool, mic: bool) -> Self {
        let mut tracks = vec![TrackRequest {
            kind: TrackKind::Video,
            capture: false,
            recv: true,
        }];
        if audio {
            tracks.push(TrackRequest {
                kind: TrackKind::Audio,
                capture: mic,
                recv: true,
            });
        }
        Self { tracks }
    }

    pub fn captures_audio(&self) -> bool {
        self.tracks
            .iter()
            .any(|t| t.kind == TrackKind::Audio && t.capture)
    }

    pub fn receives(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind && t.recv)
    }
}
