use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvm_live777::config::ConfigStore;
use kvm_live777::live777::{Live777Runner, Stun};
use kvm_live777::signaling::{JanusLibrary, SignalingLibrary, SignalingLoader};
use kvm_live777::stream::{
    HeadlessSurface, Live777Streamer, SourceState, StreamState, StreamerContext, WsUrlBuilder,
};
use kvm_live777::utils::default_source_ip;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// kvm-live777 command line arguments
#[derive(Parser, Debug)]
#[command(name = "kvm-live777")]
#[command(version, about = "Live777 WebRTC streaming for IP-KVM appliances", long_about = None)]
struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the Live777 server, restarting it on network changes
    Runner,

    /// Probe the NAT type once and print the result as JSON
    Stun {
        /// Source address (default: address of the default route)
        #[arg(long, value_name = "IP")]
        src_ip: Option<IpAddr>,

        /// STUN server host (overrides config)
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// STUN server port (overrides config)
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Watch an appliance's WebRTC stream until Ctrl-C
    Watch {
        /// Appliance base URL, e.g. https://pikvm.local
        #[arg(long, value_name = "URL")]
        url: String,

        /// Video orientation in degrees (overrides config)
        #[arg(long, value_name = "DEG")]
        orientation: Option<u16>,

        /// Request audio
        #[arg(long)]
        audio: bool,

        /// Request the microphone (needs --audio)
        #[arg(long)]
        mic: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    // Install default crypto provider (required by rustls 0.23+ for wss://)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting kvm-live777 v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::open(args.config.as_deref()).await?;

    match args.command {
        Command::Runner => run_runner(&config_store).await,
        Command::Stun { src_ip, host, port } => {
            config_store.update(|config| {
                if let Some(host) = host {
                    config.runner.stun.host = host;
                }
                if let Some(port) = port {
                    config.runner.stun.port = port;
                }
            });
            run_stun(&config_store, src_ip).await
        }
        Command::Watch {
            url,
            orientation,
            audio,
            mic,
        } => {
            config_store.update(|config| {
                if let Some(orientation) = orientation {
                    config.stream.orientation = orientation;
                }
                config.stream.audio |= audio;
                config.stream.mic |= mic;
            });
            run_watch(&config_store, &url).await
        }
    }
}

async fn run_runner(config_store: &ConfigStore) -> anyhow::Result<()> {
    let config = config_store.get();
    tracing::info!("Starting Live777 Runner ...");

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(Live777Runner::new(config.runner.clone()).run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
    runner.await?;
    Ok(())
}

async fn run_stun(config_store: &ConfigStore, src_ip: Option<IpAddr>) -> anyhow::Result<()> {
    let config = config_store.get();
    let src_ip = src_ip
        .or_else(default_source_ip)
        .ok_or_else(|| anyhow::anyhow!("No usable source address"))?;

    let mut stun = Stun::new(config.runner.stun.clone());
    let info = stun.get_info(src_ip, 0).await;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn run_watch(config_store: &ConfigStore, url: &str) -> anyhow::Result<()> {
    let config = config_store.get();

    let loader = SignalingLoader::new();
    let library = loader
        .ensure(|| async { Ok(Arc::new(JanusLibrary::new()) as Arc<dyn SignalingLibrary>) })
        .await?;
    if !Live777Streamer::is_webrtc_available(library.as_ref()) {
        anyhow::bail!("WebRTC is not available on this platform");
    }

    let surface = Arc::new(HeadlessSurface::new());
    let ctx = StreamerContext {
        status: surface.clone(),
        features: surface.clone(),
        video: surface.clone(),
        urls: Arc::new(WsUrlBuilder::new(url)),
    };
    let streamer = Live777Streamer::new(config.stream.clone(), library, ctx);
    tracing::info!("Stream: {} [{}]", streamer.name(), streamer.mode());

    streamer.ensure_stream(SourceState { online: true });

    let mut state = streamer.state_watch();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutdown signal received");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow();
                tracing::info!("Stream state: {}", current);
            }
        }
    }

    streamer.stop_stream();
    let stopped = tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == StreamState::Stopped),
    )
    .await;
    if stopped.is_err() {
        tracing::warn!("Stream did not stop in time");
    }
    Ok(())
}

/// Initialize logging with the given log level
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "kvm_live777=error,webrtc=error",
        LogLevel::Warn => "kvm_live777=warn,webrtc=warn",
        LogLevel::Info => "kvm_live777=info,webrtc=warn",
        LogLevel::Verbose => "kvm_live777=debug,webrtc=warn",
        LogLevel::Debug => "kvm_live777=debug,webrtc=info",
        LogLevel::Trace => "kvm_live777=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
