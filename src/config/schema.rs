use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Stream client settings
    pub stream: StreamerConfig,
    /// Live777 runner settings
    pub runner: RunnerConfig,
}

/// Live777 stream client configuration
///
/// Construct through [`StreamerConfig::new`] or normalize a deserialized value
/// with [`StreamerConfig::normalized`]: the microphone can never be requested
/// without audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Video orientation passed to the `watch` request (0, 90, 180, 270)
    pub orientation: u16,
    /// Receive audio from the appliance
    pub audio: bool,
    /// Send microphone audio to the appliance (requires `audio`)
    pub mic: bool,
    /// Signaling plugin name
    pub plugin: String,
    /// Signaling endpoint path, relative to the appliance base URL
    pub endpoint: String,
    /// Delay before a failed session is opened again (milliseconds)
    pub retry_ensure_ms: u64,
    /// Delay before `stop` + `watch` are resent after an error message (milliseconds)
    pub retry_error_ms: u64,
    /// Statistics polling interval while a video track is attached (milliseconds)
    pub stats_interval_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            orientation: 0,
            audio: false,
            mic: false,
            plugin: "janus.plugin.live777".to_string(),
            endpoint: "janus/ws".to_string(),
            retry_ensure_ms: 5000,
            retry_error_ms: 2000,
            stats_interval_ms: 1000,
        }
    }
}

impl StreamerConfig {
    pub fn new(orientation: u16, audio: bool, mic: bool) -> Self {
        Self {
            orientation,
            audio,
            mic,
            ..Default::default()
        }
        .normalized()
    }

    /// Fold the microphone flag into the audio flag
    pub fn normalized(mut self) -> Self {
        self.mic = self.mic && self.audio;
        self
    }

    pub fn retry_ensure_delay(&self) -> Duration {
        Duration::from_millis(self.retry_ensure_ms)
    }

    pub fn retry_error_delay(&self) -> Duration {
        Duration::from_millis(self.retry_error_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

/// Live777 runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// STUN probe settings
    pub stun: StunConfig,
    /// Seconds between network checks
    pub check_interval_secs: u64,
    /// Probe attempts per check once the first netcfg is known
    pub check_retries: u32,
    /// Delay between probe attempts (milliseconds)
    pub check_retries_delay_ms: u64,
    /// Base Live777 command line, may contain `{placeholders}`
    pub cmd: Vec<String>,
    /// Arguments removed from `cmd`
    pub cmd_remove: Vec<String>,
    /// Arguments appended to `cmd`
    pub cmd_append: Vec<String>,
    /// Video source exported as `LIVE777_VIDEO_SOURCE`
    pub video_source: String,
    /// Audio source exported as `LIVE777_AUDIO_SOURCE`
    pub audio_source: String,
    /// Extra environment for the Live777 process
    pub env: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stun: StunConfig::default(),
            check_interval_secs: 60,
            check_retries: 5,
            check_retries_delay_ms: 5000,
            cmd: vec![
                "/usr/bin/live777".to_string(),
                "--bind={src_ip}:7777".to_string(),
                "{o_stun_server}".to_string(),
            ],
            cmd_remove: vec![],
            cmd_append: vec![],
            video_source: "kvmd::ustreamer::h264".to_string(),
            audio_source: "hw:tc358743,0".to_string(),
            env: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn check_retries_delay(&self) -> Duration {
        Duration::from_millis(self.check_retries_delay_ms)
    }
}

/// STUN probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    pub host: String,
    pub port: u16,
    /// Per-request receive timeout (milliseconds)
    pub timeout_ms: u64,
    /// Attempts for DNS resolution and each request
    pub retries: u32,
    /// Delay between attempts (milliseconds)
    pub retries_delay_ms: u64,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            host: "stun.l.google.com".to_string(),
            port: 19302,
            timeout_ms: 5000,
            retries: 5,
            retries_delay_ms: 5000,
        }
    }
}

impl StunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retries_delay(&self) -> Duration {
        Duration::from_millis(self.retries_delay_ms)
    }
}
