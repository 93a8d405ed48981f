use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use netsight_core::config::{Config, SinkKind};
use netsight_core::mitm::CertificateAuthority;
use netsight_core::persist::{DatabaseConnector, JsonLinesConnector, TracingConnector};
use netsight_core::tracker::TrackerTrie;
use netsight_tun::process::ProcNetFinder;
use netsight_tun::{ComponentManager, EngineServices};

#[derive(Parser)]
#[command(name = "netsight")]
#[command(about = "netsight - on-device traffic monitor with TLS interception")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log file directory (enables file logging)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capturing traffic (requires root)
    Run {
        /// Seconds between traffic statistics log lines
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },
    /// Validate the configuration file
    Validate,
    /// Generate a default configuration file
    Init,
    /// Write the root CA certificate (PEM), creating the CA if needed
    ExportCa {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // the config may not exist yet (init), so its log level is optional
    let level = Config::load(&cli.config)
        .map(|c| c.general.log_level)
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("netsight={level}")))
        .unwrap_or_else(|_| EnvFilter::new("netsight=info"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Optional file logging
    let _guard = if let Some(ref log_dir) = cli.log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, "netsight.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    match cli.command {
        Commands::Run { stats_interval } => cmd_run(&cli.config, stats_interval).await,
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Init => cmd_init(&cli.config),
        Commands::ExportCa { output } => cmd_export_ca(&cli.config, output.as_deref()),
    }
}

async fn cmd_run(config_path: &Path, stats_interval: u64) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let persistence: Arc<dyn DatabaseConnector> = match config.persistence.sink {
        SinkKind::Log => Arc::new(TracingConnector),
        SinkKind::JsonLines => Arc::new(JsonLinesConnector::open(&config.persistence.path).await?),
    };
    let trackers = match &config.trackers {
        Some(path) => TrackerTrie::load(path)
            .with_context(|| format!("failed to load tracker list {}", path.display()))?,
        None => TrackerTrie::new(),
    };

    tracing::info!(
        device = %config.vpn.device_name,
        network = %config.vpn.network(),
        dns = %config.vpn.dns_server(),
        mitm = config.mitm_active(),
        scope = ?config.monitoring.scope,
        sink = ?config.persistence.sink,
        trackers = trackers.len(),
        "starting netsight"
    );

    let services = EngineServices {
        persistence,
        app_finder: Arc::new(ProcNetFinder::new()),
        trackers,
    };
    let mut engine = ComponentManager::start(config, services).await?;
    tracing::info!("engine running, press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = engine.stats();
                tracing::info!(
                    active = engine.active_flows(),
                    opened = stats.connections_opened,
                    outbound_bytes = stats.outbound_bytes,
                    inbound_bytes = stats.inbound_bytes,
                    dropped = stats.dropped_packets,
                    stray_resets = stats.stray_resets,
                    "traffic"
                );
            }
            _ = engine.stopped() => {
                tracing::error!("engine stopped on its own, see errors above");
                break;
            }
            result = &mut shutdown => {
                result?;
                tracing::info!("shutting down engine...");
                break;
            }
        }
    }

    let stats = engine.stop().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    println!("Configuration is valid.");
    println!("  Device: {} ({}, mtu {})", config.vpn.device_name, config.vpn.network(), config.vpn.mtu);
    println!("  DNS server: {}", config.vpn.dns_server());
    match config.vpn.socket_mark {
        Some(mark) => println!("  Socket mark: {mark:#x}"),
        None => println!("  Socket mark: none"),
    }
    println!(
        "  TLS interception: {} (mode {:?})",
        if config.mitm_active() { "on" } else { "off" },
        config.monitoring.mode
    );
    println!("  CA: {}/{}", config.mitm.ca_dir.display(), config.mitm.alias);
    println!("  Scope: {:?} ({} apps listed)", config.monitoring.scope, config.monitoring.apps.len());
    println!("  Sink: {:?}", config.persistence.sink);
    if let Some(path) = &config.trackers {
        let trackers = TrackerTrie::load(path)?;
        println!("  Trackers: {} hosts from {}", trackers.len(), path.display());
    }
    Ok(())
}

fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("config file already exists: {}", config_path.display());
    }

    let config = Config::default_config();
    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(config_path, yaml)?;
    println!("Default config written to {}", config_path.display());
    Ok(())
}

fn cmd_export_ca(config_path: &Path, output: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let authority = CertificateAuthority::load_or_create(config.mitm.authority())?;

    match output {
        Some(path) => {
            std::fs::write(path, authority.ca_cert_pem())?;
            println!("Root CA certificate written to {}", path.display());
        }
        None => print!("{}", authority.ca_cert_pem()),
    }
    Ok(())
}
