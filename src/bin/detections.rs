//! detections - operator CLI over the local detection log and remote store

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use roadwatch::{
    run_sync, DetectionStore, HttpRemoteStore, RemoteSettings, RemoteStore, SyncClient,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the local detection database.
    #[arg(long, default_value = "roadwatch.db")]
    db_path: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Per-class counts and averages over the whole log.
    Stats,
    /// Most recent detections, newest first.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Export recent detections to a JSON file.
    Export {
        #[arg(long, default_value = "detections_export.json")]
        output: String,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
    /// Run one sync pass against the remote store.
    Sync(RemoteArgs),
    /// Check remote store reachability.
    Probe(RemoteArgs),
}

#[derive(clap::Args, Debug)]
struct RemoteArgs {
    /// Remote store base URL.
    #[arg(long, env = "ROADWATCH_REMOTE_URL")]
    remote_url: String,
    /// Remote store API key.
    #[arg(long, env = "ROADWATCH_REMOTE_KEY", hide_env_values = true)]
    remote_key: String,
    /// Remote table name.
    #[arg(long, env = "ROADWATCH_REMOTE_TABLE", default_value = "detections")]
    remote_table: String,
}

impl RemoteArgs {
    fn settings(self) -> RemoteSettings {
        RemoteSettings {
            url: self.remote_url,
            api_key: self.remote_key,
            table: self.remote_table,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let store = DetectionStore::open(&args.db_path)?;

    match args.command {
        Command::Stats => {
            let stats = store.class_stats()?;
            if stats.is_empty() {
                println!("no detections recorded");
                return Ok(());
            }
            println!(
                "{:<14} {:>7} {:>10} {:>10} {:>10}",
                "class", "count", "avg conf", "avg width", "avg depth"
            );
            for entry in stats {
                println!(
                    "{:<14} {:>7} {:>10} {:>10} {:>10}",
                    entry.road_class,
                    entry.count,
                    format_avg(entry.avg_confidence, 2),
                    format_avg(entry.avg_width, 1),
                    format_avg(entry.avg_depth, 1),
                );
            }
            println!(
                "total: {} rows, {} awaiting sync",
                store.total_count()?,
                store.unsynced_count()?
            );
        }
        Command::Recent { limit } => {
            let rows = store.recent(limit)?;
            if rows.is_empty() {
                println!("no detections recorded");
                return Ok(());
            }
            for row in rows {
                println!(
                    "#{} {} {} conf={:.2} width={} depth={} synced={}",
                    row.id,
                    row.timestamp,
                    row.road_class,
                    row.confidence,
                    format_avg(row.width_cm, 1),
                    format_avg(row.depth_cm, 1),
                    row.synced
                );
            }
        }
        Command::Export { output, limit } => {
            let rows = store.recent(limit)?;
            let json = serde_json::to_vec_pretty(&rows)?;
            std::fs::write(&output, json)?;
            println!("exported {} detection(s) to {}", rows.len(), output);
        }
        Command::Sync(remote) => {
            let client = SyncClient::new(HttpRemoteStore::new(remote.settings()));
            let synced = run_sync(&store, &client)?;
            println!("synced {} detection(s)", synced);
        }
        Command::Probe(remote) => {
            let remote = HttpRemoteStore::new(remote.settings());
            if remote.probe() {
                println!("remote store reachable");
            } else {
                return Err(anyhow!("remote store unreachable"));
            }
        }
    }
    Ok(())
}

fn format_avg(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(value) => format!("{:.*}", decimals, value),
        None => "-".to_string(),
    }
}
