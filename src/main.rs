use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use av_uplink::config::ConfigStore;
use av_uplink::events::EventBus;
use av_uplink::pipeline::{
    ElementCaps, EncoderPipeline, EncoderPipelineConfig, MediaPipeline,
};
use av_uplink::state::{spawn_fault_supervisor, AppState};
use av_uplink::upstream::UpstreamController;
use av_uplink::web;

/// Log level for the daemon
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// av-uplink command line arguments
#[derive(Parser, Debug)]
#[command(name = "av-uplink")]
#[command(version, about = "Flow-controlled AV streaming daemon", long_about = None)]
struct CliArgs {
    /// Control API listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Control API port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory path (default: /etc/av-uplink)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting av-uplink v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config_store = Arc::new(ConfigStore::new(&data_dir.join("config.toml")).await?);
    let config = config_store.get();

    let events = Arc::new(EventBus::new());
    let (fault_tx, fault_rx) = mpsc::unbounded_channel();

    let pipeline: Arc<dyn MediaPipeline> = Arc::new(EncoderPipeline::new(
        EncoderPipelineConfig {
            audio_device: config.source.audio_device.clone().map(PathBuf::from),
            video_device: config.source.video_device.clone().map(PathBuf::from),
            audio_bitrate: config.source.audio_bitrate,
            video_bitrate: config.source.video_bitrate,
            caps: ElementCaps::new(
                config.source.width,
                config.source.height,
                config.source.framerate,
            ),
            input_mode: config.source.input_mode.parse().unwrap_or_default(),
            block_size: config.upstream.block_size,
            queue_max: std::time::Duration::from_secs(config.upstream.queue_max_secs),
        },
        events.clone(),
        fault_tx.clone(),
    ));
    pipeline.set_ready().await?;

    let upstream = UpstreamController::new(
        pipeline.clone(),
        events.clone(),
        fault_tx,
        config.upstream.auto_bitrate,
    );
    upstream.properties().refresh();

    let state = AppState {
        config: config_store,
        events,
        pipeline: pipeline.clone(),
        upstream: upstream.clone(),
    };

    let shutdown = CancellationToken::new();
    spawn_fault_supervisor(state.clone(), fault_rx, shutdown.clone());

    let app = web::create_router(Arc::new(state));

    let bind_address = args
        .address
        .unwrap_or_else(|| config.control.bind_address.clone());
    let bind_port = args.port.unwrap_or(config.control.port);
    let addr: SocketAddr = format!("{bind_address}:{bind_port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control API listening on http://{addr}");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested by the data path");
        }
    }

    if upstream.disable().await.is_ok() {
        tracing::info!("Upstream torn down");
    }
    pipeline.destroy().await;
    tracing::info!("Bye");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "av_uplink=error,tower_http=error",
        LogLevel::Warn => "av_uplink=warn,tower_http=warn",
        LogLevel::Info => "av_uplink=info,tower_http=info",
        LogLevel::Debug => "av_uplink=debug,tower_http=debug",
        LogLevel::Trace => "av_uplink=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("AV_UPLINK_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/av-uplink")
}
