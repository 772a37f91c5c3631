use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use humantime::FormattedDuration;
use tokio::time::{self, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use blelog_discovery::{local::LocalScanner, supervisor::ScanSupervisor};
use blelog_domain::{
    chrono_extra::WholeSeconds,
    device::DeviceId,
    gatt::{SENSOR_CHARACTERISTIC_UUID, SENSOR_SERVICE_UUID},
    retry::RetryPolicy,
    session::SessionState,
    snapshot::{Comparison, RssiComparison, Snapshot},
    state::State,
};
use blelog_session::{
    SessionConfig, SessionEventKind, btle::BtleConnector, manager::SessionManager,
};
use blelog_sinks::{
    catalog::Catalog,
    history::{FanOutSink, ObservationSink, SinkFormat},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct Options {
    /// folder holding one folder per device and the catalog
    #[arg(long, global = true, default_value = "blelog-data")]
    data_dir: PathBuf,

    /// service the sensor advertises
    #[arg(long, global = true, default_value_t = SENSOR_SERVICE_UUID)]
    service_uuid: Uuid,

    /// characteristic carrying samples
    #[arg(long, global = true, default_value_t = SENSOR_CHARACTERISTIC_UUID)]
    characteristic_uuid: Uuid,

    /// limit for one connection attempt
    #[arg(long, global = true, default_value = "10s", value_parser = humantime::parse_duration)]
    connect_timeout: Duration,

    /// connection attempts before giving up
    #[arg(long, global = true, default_value_t = 3)]
    max_attempts: u32,
}

impl Options {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            service: self.service_uuid,
            characteristic: self.characteristic_uuid,
            connect_timeout: self.connect_timeout,
            retry: RetryPolicy::bounded(self.max_attempts),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// list nearby devices
    Scan {
        /// how long to keep scanning
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// length of one scan round
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        window: Duration,

        /// include devices not advertising the sensor service
        #[arg(long)]
        all: bool,
    },
    /// connect to a device and record its samples
    Log {
        address: DeviceId,

        /// existing file to append to, instead of the selected one
        #[arg(long, conflicts_with = "new_file")]
        file: Option<String>,

        /// start a new file even if one is selected
        #[arg(long)]
        new_file: bool,

        /// also write samples here (.csv, .jsonl or .sqlite)
        #[arg(long)]
        mirror: Option<PathBuf>,

        /// stop after this long instead of waiting for Ctrl-C
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
    /// list remembered devices
    Devices,
    /// forget a remembered device
    Forget {
        address: DeviceId,

        /// also delete the device's folder and files
        #[arg(long)]
        delete_files: bool,
    },
    /// manage a device's CSV files
    Files {
        #[command(subcommand)]
        command: FilesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum FilesCommand {
    List { address: DeviceId },
    New { address: DeviceId },
    Rm { address: DeviceId, name: String },
    /// select the file new samples go to; no name clears the selection
    Select { address: DeviceId, name: Option<String> },
    Show { address: DeviceId, name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Scan {
            duration,
            window,
            all,
        } => scan(&args.options, duration, window, all).await,
        Commands::Log {
            address,
            file,
            new_file,
            mirror,
            duration,
        } => log(&args.options, &address, file, new_file, mirror, duration).await,
        Commands::Devices => devices(&args.options).await,
        Commands::Forget {
            address,
            delete_files,
        } => forget(&args.options, &address, delete_files).await,
        Commands::Files { command } => files(&args.options, command).await,
    }
}

async fn scan(options: &Options, duration: Duration, window: Duration, all: bool) -> Result<()> {
    let services = if all { vec![] } else { vec![options.service_uuid] };
    let scanner = LocalScanner::new(window)
        .await
        .context("no Bluetooth adapter")?
        .with_services(services);
    let (mut rounds, handle) = ScanSupervisor::new(scanner, RetryPolicy::bounded(options.max_attempts))
        .with_period(Some(duration))
        .spawn(4);

    let mut state = State::default();
    let start = Utc::now();
    let mut previous_snapshot = Snapshot::default();
    while let Some(events) = rounds.recv().await {
        state.discover(&events);
        let current_snapshot = state.snapshot();
        print_scan_results(&current_snapshot, &previous_snapshot, Utc::now(), start);
        previous_snapshot = current_snapshot;
    }

    let summary = handle.await.context("scan task failed")?;
    info!(
        "{} scan rounds, {} failures",
        summary.rounds, summary.failures
    );
    if summary.gave_up {
        bail!("scanning failed {} times", summary.failures);
    }
    Ok(())
}

fn print_scan_results(
    current: &Snapshot,
    previous: &Snapshot,
    now: DateTime<Utc>,
    start: DateTime<Utc>,
) {
    let runtime = format_duration(now - start);
    println!("\n=== Scan Results at {} (Runtime: {}) ===", now, runtime);
    println!(
        "{:<17} {:<24} {:>6} {:>4} {:>6}",
        "Address", "Name", "Age", "RSSI", "Change"
    );
    println!("{}", "-".repeat(61));
    for (state, comparison) in current.compared_to(now, previous) {
        println!(
            "{:<17} {:<24} {:>6} {:>4} {:>6}",
            state.device,
            state.name.as_deref().unwrap_or(""),
            age_summary(&comparison),
            state.rssi,
            rssi_summary(&comparison)
        );
    }
    println!("\nTotal devices: {}", current.0.len());
}

fn format_duration(duration: chrono::Duration) -> FormattedDuration {
    humantime::format_duration(duration.whole_seconds())
}

fn age_summary(comparison: &Comparison) -> FormattedDuration {
    format_duration(comparison.relative_age)
}

fn rssi_summary(comparison: &Comparison) -> &'static str {
    match comparison.rssi {
        RssiComparison::Louder => "↑",
        RssiComparison::Quieter => "⌄",
        RssiComparison::Same => "=",
        RssiComparison::New => "*",
    }
}

async fn log(
    options: &Options,
    device: &DeviceId,
    file: Option<String>,
    new_file: bool,
    mirror: Option<PathBuf>,
    duration: Option<Duration>,
) -> Result<()> {
    let catalog = Catalog::open(&options.data_dir)
        .await
        .with_context(|| format!("opening {}", options.data_dir.display()))?;
    let adapter = blelog_discovery::local::first_adapter()
        .await
        .context("no Bluetooth adapter")?;
    let connector = BtleConnector::new(adapter, options.service_uuid, options.connect_timeout);
    let (mut manager, mut events) =
        SessionManager::new(Arc::new(connector), options.session_config(), catalog);

    match file {
        Some(name) => manager
            .catalog_mut()
            .select_file(device, Some(&name))
            .await
            .with_context(|| format!("selecting {name:?}"))?,
        None if new_file || manager.catalog().selected_path(device).is_none() => {
            let name = manager.start_new_file(device).await?;
            info!("{device}: writing to new file {name:?}");
        }
        None => {}
    }

    let mut sinks: Vec<Box<dyn ObservationSink>> = vec![];
    if let Some(csv) = manager.open_selected_sink(device).await? {
        sinks.push(csv);
    }
    if let Some(path) = mirror {
        let mirror = SinkFormat::create_from_file(&path)
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .to_sink()
            .await
            .map_err(|e| anyhow::anyhow!("opening {}: {e}", path.display()))?;
        sinks.push(mirror);
    }

    manager.connect(device).await?;
    manager
        .set_sink(device, Some(Box::new(FanOutSink::new(sinks))))
        .await?;
    manager.subscribe(device).await?;

    let deadline = duration.map(|d| Instant::now() + d);
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break Ok(());
            }
            _ = sleep_until(deadline) => break Ok(()),
            event = events.recv() => {
                let Some(event) = event else { break Ok(()) };
                manager.apply(&event).await?;
                match event.kind {
                    SessionEventKind::Observation(observation) => {
                        println!("{} {}", local_time(observation.date_time.timestamp_millis()), observation.value);
                    }
                    SessionEventKind::StateChanged(SessionState::Failed { reason }) => {
                        break Err(anyhow::anyhow!("{device}: {reason}"));
                    }
                    SessionEventKind::StateChanged(SessionState::Disconnected) => {
                        warn!("{device}: disconnected");
                        break Ok(());
                    }
                    _ => {}
                }
            }
        }
    };
    manager.shutdown().await;
    outcome
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn local_time(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => millis.to_string(),
    }
}

async fn devices(options: &Options) -> Result<()> {
    let catalog = Catalog::open(&options.data_dir).await?;
    let known = catalog.known_devices();
    if known.is_empty() {
        println!("No remembered devices");
        return Ok(());
    }
    println!("{:<17} {:>5} {}", "Address", "Files", "Selected");
    println!("{}", "-".repeat(52));
    for device in known.iter() {
        println!(
            "{:<17} {:>5} {}",
            device,
            catalog.files(device).len(),
            catalog.selected_file(device).unwrap_or("-")
        );
    }
    Ok(())
}

async fn forget(options: &Options, device: &DeviceId, delete_files: bool) -> Result<()> {
    let mut catalog = Catalog::open(&options.data_dir).await?;
    if !catalog.forget_device(device).await? {
        warn!("{device} was not remembered");
    }
    if delete_files {
        catalog.delete_device_folder(device).await?;
    }
    Ok(())
}

async fn files(options: &Options, command: FilesCommand) -> Result<()> {
    let mut catalog = Catalog::open(&options.data_dir).await?;
    match command {
        FilesCommand::List { address } => {
            let selected = catalog.selected_file(&address);
            for name in catalog.files(&address) {
                let marker = if Some(name.as_str()) == selected { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        FilesCommand::New { address } => {
            catalog.create_device_folder(&address).await?;
            let name = catalog.create_csv_file(&address, &Local::now()).await?;
            println!("{name}");
        }
        FilesCommand::Rm { address, name } => {
            catalog.delete_csv_file(&address, &name).await?;
        }
        FilesCommand::Select { address, name } => {
            catalog.select_file(&address, name.as_deref()).await?;
        }
        FilesCommand::Show { address, name } => {
            for (millis, value) in catalog.read_series(&address, &name).await? {
                println!("{} {value}", local_time(millis));
            }
        }
    }
    Ok(())
}
