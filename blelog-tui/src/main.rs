use std::{
    fs::OpenOptions,
    io::{self, Stdout},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use humantime::FormattedDuration;
use ratatui::{
    layout::{Constraint, Direction, Layout},
    widgets::{Block, Borders},
};
use ratatui::{
    prelude::*,
    widgets::{Cell, Paragraph, Row, Table},
};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{info, warn};
use uuid::Uuid;

use blelog_discovery::{local::LocalScanner, supervisor::ScanSupervisor};
use blelog_domain::{
    chrono_extra::WholeSeconds,
    device::DeviceId,
    discover::DiscoveryEvent,
    gatt::{SENSOR_CHARACTERISTIC_UUID, SENSOR_SERVICE_UUID},
    retry::RetryPolicy,
    session::SessionState,
    snapshot::{Comparison, RssiComparison, Snapshot},
    state::State,
};
use blelog_session::{
    SessionConfig, SessionEvent, SessionEventKind, btle::BtleConnector, manager::SessionManager,
};
use blelog_sinks::catalog::Catalog;

const LOG_FILE: &str = "blelog.log";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// folder holding one folder per device, the catalog and the log
    #[arg(long, default_value = "blelog-data")]
    data_dir: PathBuf,

    /// service the sensor advertises
    #[arg(long, default_value_t = SENSOR_SERVICE_UUID)]
    service_uuid: Uuid,

    /// characteristic carrying samples
    #[arg(long, default_value_t = SENSOR_CHARACTERISTIC_UUID)]
    characteristic_uuid: Uuid,

    /// limit for one connection attempt
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    connect_timeout: Duration,

    /// connection attempts before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// length of one scan round
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    window: Duration,

    /// devices to connect to and record on start
    #[arg(long, num_args = 1..)]
    connect: Vec<DeviceId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;
    init_logging(&args.data_dir)?;

    let catalog = Catalog::open(&args.data_dir).await?;
    let scanner = LocalScanner::new(args.window)
        .await
        .context("no Bluetooth adapter")?
        .with_services(vec![args.service_uuid]);
    let connector = BtleConnector::new(
        scanner.adapter().clone(),
        args.service_uuid,
        args.connect_timeout,
    );
    let config = SessionConfig {
        service: args.service_uuid,
        characteristic: args.characteristic_uuid,
        connect_timeout: args.connect_timeout,
        retry: RetryPolicy::bounded(args.max_attempts),
    };
    let (mut manager, events) = SessionManager::new(Arc::new(connector), config, catalog);
    for device in &args.connect {
        if let Err(e) = start_logging(&mut manager, device).await {
            warn!("{device}: could not start logging: {e:#}");
        }
    }

    let supervisor = ScanSupervisor::new(
        scanner,
        RetryPolicy::unbounded(Duration::from_secs(1), Duration::from_secs(30)),
    );
    let (rounds, scan_task) = supervisor.spawn(4);

    let mut terminal = setup_terminal().context("setup failed")?;
    let outcome = run(&mut terminal, &mut manager, rounds, events).await;
    restore_terminal(&mut terminal).context("restore terminal failed")?;

    scan_task.abort();
    manager.shutdown().await;
    outcome
}

fn init_logging(data_dir: &Path) -> Result<()> {
    let path = data_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

/// Connects, subscribes and writes to the device's selected file, starting a
/// new one when nothing is selected.
async fn start_logging(manager: &mut SessionManager, device: &DeviceId) -> Result<()> {
    if manager.catalog().selected_path(device).is_none() {
        let name = manager.start_new_file(device).await?;
        info!("{device}: writing to new file {name:?}");
    }
    manager.connect(device).await?;
    let sink = manager.open_selected_sink(device).await?;
    manager.set_sink(device, sink).await?;
    manager.subscribe(device).await?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    let mut stdout = io::stdout();
    enable_raw_mode().context("failed to enable raw mode")?;
    execute!(stdout, EnterAlternateScreen).context("unable to enter alternate screen")?;
    Terminal::new(CrosstermBackend::new(stdout)).context("creating terminal failed")
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("unable to switch to main screen")?;
    terminal.show_cursor().context("unable to show cursor")
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    manager: &mut SessionManager,
    mut rounds: mpsc::Receiver<Vec<DiscoveryEvent>>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<()> {
    let mut state = State::default();
    let start = Utc::now();
    let mut current_snapshot = Snapshot::default();
    let mut previous_snapshot = Snapshot::default();
    let mut scanning = true;
    loop {
        terminal.draw(|f| {
            let now = Utc::now();
            let discovered = current_snapshot.without(manager.active());
            let rows = snapshot_to_table_rows(&discovered, &previous_snapshot, now);
            let main_layout = layout(f);
            let runtime = format_duration(now - start);
            let scan_status = if scanning { "scanning" } else { "scan stopped" };
            let footer = Paragraph::new(format!(
                "Now: {now}, Total Run time: {runtime}, {scan_status}\n(press 'q' to quit)"
            ))
            .block(Block::default().title("Context").borders(Borders::ALL))
            .style(Style::default().fg(Color::Black));
            f.render_widget(footer, main_layout[0]);
            f.render_widget(devices_table(rows), main_layout[1]);
            f.render_widget(sessions_table(session_rows(manager)), main_layout[2]);
        })?;
        if should_quit()? {
            break;
        }

        loop {
            match rounds.try_recv() {
                Ok(discovered) => {
                    state.discover(&discovered);
                    previous_snapshot = std::mem::replace(&mut current_snapshot, state.snapshot());
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if scanning {
                        warn!("scanning stopped");
                    }
                    scanning = false;
                    break;
                }
            }
        }
        while let Ok(event) = events.try_recv() {
            if let SessionEventKind::StateChanged(session) = &event.kind
                && session.is_active()
            {
                state.forget(&event.device);
            }
            if let Err(e) = manager.apply(&event).await {
                warn!("{}: {e}", event.device);
            }
        }
    }
    Ok(())
}

fn snapshot_to_table_rows<'a>(
    current: &Snapshot,
    previous: &Snapshot,
    now: DateTime<Utc>,
) -> Vec<Row<'a>> {
    current
        .compared_to(now, previous)
        .into_iter()
        .map(|(state, comparison)| {
            let style = match comparison.rssi {
                RssiComparison::New => Style::default().fg(Color::Red),
                _ => Style::default().fg(Color::Black),
            };
            let cells = vec![
                Cell::from(state.device.to_string()).style(style),
                Cell::from(state.name.clone().unwrap_or_default()).style(style),
                Cell::from(age_summary(&comparison).to_string()).style(style),
                Cell::from(format!("{}", state.rssi)).style(style),
                Cell::from(rssi_summary(&comparison)).style(style),
            ];
            Row::new(cells).style(style)
        })
        .collect()
}

fn session_rows<'a>(manager: &SessionManager) -> Vec<Row<'a>> {
    manager
        .states()
        .iter()
        .map(|(device, session)| {
            let style = match session {
                SessionState::Streaming | SessionState::Subscribed => {
                    Style::default().fg(Color::Green)
                }
                SessionState::Failed { .. } => Style::default().fg(Color::Red),
                _ => Style::default().fg(Color::Black),
            };
            let latest = manager
                .latest_value(device)
                .map(|o| o.value.to_string())
                .unwrap_or_default();
            let file = manager
                .catalog()
                .selected_file(device)
                .unwrap_or("-")
                .to_string();
            Row::new(vec![
                Cell::from(device.to_string()),
                Cell::from(session.to_string()),
                Cell::from(latest),
                Cell::from(file),
            ])
            .style(style)
        })
        .collect()
}

fn format_duration(duration: chrono::Duration) -> FormattedDuration {
    humantime::format_duration(duration.whole_seconds())
}

fn age_summary(comparison: &Comparison) -> FormattedDuration {
    format_duration(comparison.relative_age)
}

fn rssi_summary(comparison: &Comparison) -> String {
    match comparison.rssi {
        RssiComparison::Louder => "↑",
        RssiComparison::Quieter => "⌄",
        RssiComparison::Same => "=",
        RssiComparison::New => "*",
    }
    .to_string()
}

fn devices_table<'a>(rows: Vec<Row<'a>>) -> Table<'a> {
    Table::new(
        rows,
        &[
            Constraint::Length(18),
            Constraint::Length(21),
            Constraint::Length(10),
            Constraint::Length(6),
            Constraint::Length(6),
        ],
    )
    .style(Style::default().fg(Color::Black))
    .block(Block::default().title("Discovered").borders(Borders::ALL))
    .header(
        Row::new(vec!["Address", "Name", "Last Seen", "Rssi", "Change"])
            .style(Style::default().fg(Color::Yellow)),
    )
}

fn sessions_table<'a>(rows: Vec<Row<'a>>) -> Table<'a> {
    Table::new(
        rows,
        &[
            Constraint::Length(18),
            Constraint::Length(28),
            Constraint::Length(12),
            Constraint::Min(20),
        ],
    )
    .style(Style::default().fg(Color::Black))
    .block(Block::default().title("Sessions").borders(Borders::ALL))
    .header(
        Row::new(vec!["Address", "State", "Latest", "File"])
            .style(Style::default().fg(Color::Yellow)),
    )
}

fn layout(frame: &mut Frame) -> Rc<[Rect]> {
    Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints(
            [
                Constraint::Percentage(10),
                Constraint::Percentage(55),
                Constraint::Percentage(35),
            ]
            .as_ref(),
        )
        .split(frame.area())
}

fn should_quit() -> Result<bool> {
    if event::poll(Duration::from_millis(250)).context("event poll failed")?
        && let Event::Key(key) = event::read().context("event read failed")?
    {
        return Ok(KeyCode::Char('q') == key.code);
    }
    Ok(false)
}
