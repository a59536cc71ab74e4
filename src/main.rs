use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use tryst_sync::config::Config;
use tryst_sync::indicator::TerminalIndicator;
use tryst_sync::peer::{now_millis, Fix};
use tryst_sync::prefs::Preferences;
use tryst_sync::provider::StaticLocationProvider;
use tryst_sync::state::{StateReader, SyncState};
use tryst_sync::{build_store, Backend, SyncOutcome, SyncService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Share this device's location with a group", long_about = None)]
struct Args {
    /// JSON config file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend to sync through, overrides the config file
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Preferences file, overrides the config file
    #[arg(long)]
    prefs: Option<PathBuf>,

    /// Latitude of this device. Without a position nothing is shared.
    #[arg(long, allow_hyphen_values = true)]
    latitude: Option<f64>,

    /// Longitude of this device
    #[arg(long, allow_hyphen_values = true)]
    longitude: Option<f64>,

    /// Display name stored in preferences
    #[arg(long)]
    name: Option<String>,

    /// Group label stored in preferences
    #[arg(long)]
    group: Option<String>,

    /// Seconds between sync iterations
    #[arg(long)]
    interval: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(level));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(path) = args.prefs {
        config.prefs_path = path;
    }
    if let Some(interval) = args.interval {
        config.interval_secs = interval;
    }

    let prefs = Arc::new(Preferences::open(&config.prefs_path));
    if let Some(name) = &args.name {
        prefs.set_name(name)?;
    }
    if let Some(group) = &args.group {
        prefs.set_group(group)?;
    }
    info!(
        "Sharing as '{}' in group '{}' (prefs: {})",
        prefs.name(),
        prefs.group(),
        prefs.path().display()
    );

    let fix = match (args.latitude, args.longitude) {
        (Some(lat), Some(lon)) => Some(Fix::new(lat, lon)?),
        (None, None) => None,
        _ => bail!("--latitude and --longitude must be given together"),
    };
    if fix.is_none() {
        warn!("No position configured, location sharing is not permitted.");
    }

    let store = build_store(&config, prefs.clone())?;
    let provider = Arc::new(StaticLocationProvider::new(fix));
    let indicator = Arc::new(TerminalIndicator::new());
    let service = SyncService::from_config(&config, provider, store, indicator.clone(), prefs);

    let stop = service.stop_handle();
    indicator.set_stop_action(move || stop.stop());
    let stop_control = indicator.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        stop_control.press_stop();
    })?;

    tokio::spawn(log_updates(service.state()));

    service.start().await;
    match service.wait().await.unwrap_or(SyncOutcome::Success) {
        SyncOutcome::Success => {
            info!("Exiting.");
            Ok(())
        }
        SyncOutcome::Failure(reason) => Err(anyhow!("Location sync failed: {}", reason)),
    }
}

async fn log_updates(mut reader: StateReader) {
    while let Some(state) = reader.changed().await {
        log_state(&state);
    }
}

fn log_state(state: &SyncState) {
    let now = now_millis();
    info!(
        "[Status] Me at {} | {} peer(s)",
        state.current_location,
        state.peers.len()
    );
    for peer in state.peers.values() {
        info!(
            "[Status]   {} at {}, {}",
            peer.name,
            peer.position(),
            peer.staleness(now)
        );
    }
}
