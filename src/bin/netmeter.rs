use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use netmeter::config::{self, DEFAULT_CONFIG_PATH, MonitorConfig};
use netmeter::history::HistoryStore;
use netmeter::logging::init_logging;
use netmeter::metrics::{InterfaceSample, TrafficMonitor};
use netmeter::units::{SpeedUnit, format_bytes, format_speed};
use netmeter::version::VERSION;
use netmeter::{HistoryRecord, MetricsEngine};

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample interfaces and record history until Ctrl-C
    Run,
    /// Measure current per-interface speeds over one interval
    Snapshot,
    /// Traffic recorded today and this month
    Totals {
        #[arg(short, long)]
        interface: Option<String>,
    },
    /// Most recent history records, newest first
    Recent {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(short, long)]
        interface: Option<String>,
        /// Only records from the current local day
        #[arg(long)]
        today: bool,
        #[arg(long)]
        json: bool,
    },
    /// Delete history older than the given number of days (0 deletes all)
    Trim {
        #[arg(long, allow_negative_numbers = true)]
        days: i64,
    },
    /// Delete all recorded history
    Purge,
}

fn open_store(config: &MonitorConfig) -> HistoryStore {
    HistoryStore::new(config.history.database_path.clone())
}

fn print_sample(sample: &InterfaceSample, unit: SpeedUnit) {
    println!(
        "{:<24} down {:>14}  up {:>14}  (peak {} / {})  total {} / {}",
        sample.name,
        format_speed(sample.download_speed, unit),
        format_speed(sample.upload_speed, unit),
        format_speed(sample.peak_download_speed, unit),
        format_speed(sample.peak_upload_speed, unit),
        format_bytes(sample.bytes_received),
        format_bytes(sample.bytes_sent),
    );
}

fn print_record(record: &HistoryRecord) {
    let when = record
        .recorded_at()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| record.timestamp.to_string());
    println!(
        "{when}  {:<24} down {:>12}  up {:>12}",
        record.source,
        format_bytes(record.bytes_down),
        format_bytes(record.bytes_up),
    );
}

async fn run_engine(config: &MonitorConfig) -> Result<(), Box<dyn Error>> {
    let engine = Arc::new(MetricsEngine::from_config(config));
    if !engine.launch().await {
        error!("Could not query network interfaces. Exiting.");
        return Err("network interface query failed".into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let loop_handle = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down.");
    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Metrics engine task ended abnormally.");
    }

    // Writer flush and store close happen off the async threads.
    tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    Ok(())
}

async fn snapshot(config: &MonitorConfig) -> Result<(), Box<dyn Error>> {
    let monitor = TrafficMonitor::system();
    if !monitor.start() {
        return Err("network interface query failed".into());
    }
    tokio::time::sleep(config.update_interval()).await;
    if !monitor.update() {
        return Err("network interface query failed".into());
    }

    let unit = config.display_unit;
    let all = monitor.get_all_stats();
    if all.is_empty() {
        println!("No active Ethernet, wireless or PPP interfaces.");
    }
    for sample in &all {
        print_sample(sample, unit);
    }
    print_sample(&monitor.get_aggregated_stats(), unit);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {e}", args.config.display());
            return Err(e.into());
        }
    };
    init_logging(&config.logging.directory, config.logging.debug);
    info!(version = VERSION, "Starting netmeter...");

    match args.command {
        Command::Run => run_engine(&config).await?,
        Command::Snapshot => snapshot(&config).await?,
        Command::Totals { interface } => {
            let store = open_store(&config);
            let filter = interface.as_deref();
            match (store.totals_today(filter), store.totals_this_month(filter)) {
                (Some(today), Some(month)) => {
                    let label = interface.as_deref().unwrap_or("all sources");
                    println!("Totals for {label}");
                    println!(
                        "  today:      down {}  up {}",
                        format_bytes(today.bytes_down),
                        format_bytes(today.bytes_up)
                    );
                    println!(
                        "  this month: down {}  up {}",
                        format_bytes(month.bytes_down),
                        format_bytes(month.bytes_up)
                    );
                }
                _ => println!("Traffic history is unavailable."),
            }
        }
        Command::Recent {
            limit,
            interface,
            today,
            json,
        } => {
            let store = open_store(&config);
            let Some(records) = store.recent_samples(limit, interface.as_deref(), today) else {
                println!("Traffic history is unavailable.");
                return Ok(());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No history recorded yet.");
            } else {
                records.iter().for_each(print_record);
            }
        }
        Command::Trim { days } => {
            if !open_store(&config).trim_to_recent_days(days) {
                return Err("failed to trim traffic history".into());
            }
            println!("History trimmed.");
        }
        Command::Purge => {
            if !open_store(&config).delete_all() {
                return Err("failed to delete traffic history".into());
            }
            println!("History deleted.");
        }
    }
    Ok(())
}
