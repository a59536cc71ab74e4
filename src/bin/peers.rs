//! One-shot peer listing through the configured backend.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tryst_sync::config::Config;
use tryst_sync::peer::now_millis;
use tryst_sync::prefs::Preferences;
use tryst_sync::{build_store, Backend};

#[derive(Parser, Debug)]
#[command(author, version, about = "List peers visible to this installation", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<Backend>,

    #[arg(long)]
    prefs: Option<PathBuf>,

    /// Group to query instead of the one in preferences
    #[arg(long)]
    group: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));
    let args = Args::parse();

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

    let prefs = Arc::new(Preferences::open(&config.prefs_path));
    let group = args.group.unwrap_or_else(|| prefs.group());
    let store = build_store(&config, prefs)?;

    if !store.filters_by_group() {
        println!("(backend ignores groups, listing every entry)");
    }
    let peers = store.fetch_peers(&group).await;
    if peers.is_empty() {
        println!("No peers found in group '{}'.", group);
        return Ok(());
    }

    let now = now_millis();
    println!("{:<38} {:<20} {:>10} {:>11}  {}", "Id", "Name", "Lat", "Lon", "Updated");
    println!("{}", "-".repeat(96));
    for peer in peers.values() {
        println!(
            "{:<38} {:<20} {:>10.5} {:>11.5}  {}",
            peer.id,
            peer.name,
            peer.latitude,
            peer.longitude,
            peer.staleness(now)
        );
    }
    Ok(())
}
