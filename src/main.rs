//! Sensor Key Graphs CLI
//!
//! Live hardware telemetry graphs for programmable keypad keys.

use anyhow::Context;
use clap::{Parser, Subcommand};
use sensor_key_graphs::{
    config::PluginConfig,
    core::settings::KeySettings,
    plugin::{bridge, ChannelSink, FrameCache, PluginCoordinator},
    sensors::{
        CombinedSource, ScriptedSource, SensorRegistry, SensorSource, SystemSensors,
        WebSocketSource,
    },
    ActivityStats, KeyController, KeyId, SharedStats, VERSION,
};
use statrs::statistics::Statistics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sensor-graphs")]
#[command(version = VERSION)]
#[command(about = "Live hardware sensor graphs for keypad keys", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a plugin, speaking JSON lines on stdin/stdout
    Run {
        /// Use synthetic sensors instead of the hardware
        #[arg(long)]
        demo: bool,
    },

    /// List the sensors that can be bound to a key
    Sensors {
        #[arg(long)]
        demo: bool,
    },

    /// Sample one sensor for a while and write the rendered key image
    Sample {
        /// Sensor to sample
        #[arg(long, default_value = "cpu.load")]
        sensor: String,

        /// How long to sample, also used as the graph window
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Sampling interval in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Graph style (line or area)
        #[arg(long, default_value = "line")]
        style: String,

        /// Output PNG path
        #[arg(long, short, default_value = "graph.png")]
        output: PathBuf,

        #[arg(long)]
        demo: bool,
    },

    /// Serve the HTTP surface instead of stdio (requires server feature)
    Serve {
        /// Port to bind on 127.0.0.1 (0 for random)
        #[arg(long, default_value = "7870")]
        port: u16,

        #[arg(long)]
        demo: bool,
    },

    /// Show configuration
    Config {
        /// Write the current configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(PluginConfig::config_path);
    let config = match &cli.config {
        Some(path) => PluginConfig::load_from(path),
        None => PluginConfig::load(),
    }
    .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config.log_filter);

    if let Commands::Config { init } = cli.command {
        if init {
            match &cli.config {
                Some(path) => config.save_to(path),
                None => config.save(),
            }
            .with_context(|| format!("writing {}", config_path.display()))?;
            println!("Wrote {}", config_path.display());
        }
        cmd_config(&config, &config_path);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    let result = runtime.block_on(dispatch(cli.command, config));
    // A pending stdin read would otherwise hold the runtime open.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

/// Logs go to stderr: stdout carries the host protocol in `run` mode.
fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(command: Commands, config: PluginConfig) -> anyhow::Result<()> {
    let feeds = CancellationToken::new();
    let result = match command {
        Commands::Run { demo } => cmd_run(config, demo, &feeds).await,
        Commands::Sensors { demo } => cmd_sensors(config, demo, &feeds).await,
        Commands::Sample {
            sensor,
            seconds,
            interval_ms,
            style,
            output,
            demo,
        } => {
            let sample = SampleArgs {
                sensor: &sensor,
                seconds,
                interval_ms,
                style: &style,
                output: &output,
            };
            cmd_sample(config, sample, demo, &feeds).await
        }
        Commands::Serve { port, demo } => cmd_serve(config, port, demo, &feeds).await,
        Commands::Config { .. } => Ok(()),
    };
    feeds.cancel();
    result
}

/// Hardware (or demo) sensors plus any configured WebSocket feeds, whose
/// connections stay open until `feeds` is cancelled.
fn sensor_source(
    demo: bool,
    config: &PluginConfig,
    feeds: &CancellationToken,
) -> Arc<dyn SensorSource> {
    let mut source = CombinedSource::new();
    if !config.websocket_feeds.is_empty() {
        let websocket = WebSocketSource::new(config.websocket_feeds.iter().cloned());
        websocket.spawn(feeds.clone());
        tracing::info!(feeds = config.websocket_feeds.len(), "websocket feeds enabled");
        source = source.with(Arc::new(websocket));
    }
    let source = if demo {
        tracing::info!("using synthetic demo sensors");
        source.with(Arc::new(ScriptedSource::demo()))
    } else {
        source.with(Arc::new(SystemSensors::new()))
    };
    Arc::new(source)
}

/// Cancel the returned token on Ctrl+C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
    cancel
}

async fn cmd_run(config: PluginConfig, demo: bool, feeds: &CancellationToken) -> anyhow::Result<()> {
    tracing::info!(version = VERSION, "sensor graphs plugin starting");

    let stats: SharedStats = Arc::new(ActivityStats::new());
    let (sink, outputs) = ChannelSink::new(64);
    let source = sensor_source(demo, &config, feeds);
    let runtime = config.key_runtime(source, Arc::new(sink), stats.clone());
    let coordinator = PluginCoordinator::new(runtime).spawn();

    let summary = bridge::run(
        tokio::io::stdin(),
        tokio::io::stdout(),
        coordinator,
        outputs,
        ctrl_c_token(),
    )
    .await
    .context("host connection failed")?;

    tracing::info!(
        events = summary.events,
        rejected = summary.rejected,
        outputs = summary.outputs,
        "host bridge stopped"
    );
    eprintln!("{}", stats.summary());
    Ok(())
}

async fn cmd_sensors(config: PluginConfig, demo: bool, feeds: &CancellationToken) -> anyhow::Result<()> {
    let source = sensor_source(demo, &config, feeds);
    let registry = SensorRegistry::with_timeout(source, config.sensor_timeout);
    let sensors = registry.list_available().await;
    if sensors.is_empty() {
        println!("No readable sensors found.");
        return Ok(());
    }

    println!("{:<32} {:<32} Unit", "Id", "Name");
    for sensor in sensors {
        println!(
            "{:<32} {:<32} {}",
            sensor.id.as_str(),
            sensor.display_name,
            sensor.unit
        );
    }
    Ok(())
}

struct SampleArgs<'a> {
    sensor: &'a str,
    seconds: u64,
    interval_ms: u64,
    style: &'a str,
    output: &'a Path,
}

async fn cmd_sample(
    config: PluginConfig,
    args: SampleArgs<'_>,
    demo: bool,
    feeds: &CancellationToken,
) -> anyhow::Result<()> {
    let SampleArgs {
        sensor,
        seconds,
        interval_ms,
        style,
        output,
    } = args;
    let frames = Arc::new(FrameCache::new());
    let stats: SharedStats = Arc::new(ActivityStats::new());
    let source = sensor_source(demo, &config, feeds);
    let runtime = config.key_runtime(source, frames.clone(), stats.clone());

    let (settings, issues) = KeySettings::from_raw(&serde_json::json!({
        "sensorId": sensor,
        "windowSeconds": seconds,
        "samplingIntervalMs": interval_ms,
        "style": style,
    }));
    for issue in issues {
        tracing::warn!(%issue, "using default for invalid setting");
    }
    let window = settings.window;

    println!("Sampling {sensor} for {seconds}s...");
    let mut key = KeyController::new(KeyId::new("sample"), runtime);
    key.configure(settings)?;
    let cancel = ctrl_c_token();
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = cancel.cancelled() => {}
    }

    key.request_refresh();
    key.on_tick().await;
    let samples = key.store().window(window);
    key.destroy().await;

    let frame = frames
        .latest(key.key())
        .context("no frame was rendered")?;
    let png = frame.image.to_png()?;
    std::fs::write(output, png).with_context(|| format!("writing {}", output.display()))?;

    let values: Vec<f64> = samples.iter().filter(|s| s.valid).map(|s| s.value).collect();
    println!();
    println!("Samples: {} ({} gaps)", samples.len(), samples.len() - values.len());
    if !values.is_empty() {
        println!("  Min:     {:.2}", Statistics::min(values.iter()));
        println!("  Max:     {:.2}", Statistics::max(values.iter()));
        println!("  Mean:    {:.2}", values.iter().mean());
        if values.len() > 1 {
            println!("  Std dev: {:.2}", values.iter().std_dev());
        }
    }
    println!("Wrote {}x{} image to {:?}", frame.image.width(), frame.image.height(), output);
    Ok(())
}

#[cfg(feature = "server")]
async fn cmd_serve(
    config: PluginConfig,
    port: u16,
    demo: bool,
    feeds: &CancellationToken,
) -> anyhow::Result<()> {
    use sensor_key_graphs::server::{self, ServerConfig, ServerState};

    let frames = Arc::new(FrameCache::new());
    let stats: SharedStats = Arc::new(ActivityStats::new());
    let source = sensor_source(demo, &config, feeds);
    let runtime = config.key_runtime(source, frames.clone(), stats.clone());
    let registry = runtime.registry.clone();
    let coordinator = PluginCoordinator::new(runtime).spawn();

    let state = Arc::new(ServerState::new(
        coordinator.clone(),
        frames,
        registry,
        stats.clone(),
    ));
    let (addr, shutdown_tx) = server::run(ServerConfig::new(port), state).await?;
    println!("Listening on http://{addr}");
    println!("Press Ctrl+C to stop");

    ctrl_c_token().cancelled().await;
    let _ = shutdown_tx.send(());
    coordinator.shutdown().await;

    println!();
    println!("{}", stats.summary());
    Ok(())
}

#[cfg(not(feature = "server"))]
async fn cmd_serve(
    _config: PluginConfig,
    _port: u16,
    _demo: bool,
    _feeds: &CancellationToken,
) -> anyhow::Result<()> {
    anyhow::bail!("the serve command needs the `server` feature enabled at compile time")
}

fn cmd_config(config: &PluginConfig, path: &Path) {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(config).unwrap_or_else(|_| "Error".to_string())
    );
}
