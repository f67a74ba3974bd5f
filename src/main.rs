//! rstchart - statechart runner
//!
//! Loads a chart, starts a session and feeds it events from the command
//! line or stdin, printing the active configuration after every step.

use clap::Parser;
use rstchart_core::{Chart, Event, StatechartEngine};
use rstchart_runtime::{Config, DriverHandle, SessionDriver, SessionUpdate, TokioScheduler};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstchart")]
#[command(about = "Run a statechart and feed it events")]
#[command(version)]
struct Cli {
    /// Chart file (.json, .yaml or .yml)
    chart: PathBuf,

    /// Event to send, as `name` or `name=<json data>`. Repeatable. Events
    /// are read from stdin, one per line, when none are given.
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Session id (generated when omitted)
    #[arg(long)]
    session_id: Option<String>,

    /// Initial values for top-level data, as a JSON object
    #[arg(long)]
    data: Option<String>,

    /// Keep running this long after the last event so delayed sends can fire
    #[arg(long, default_value_t = 0)]
    linger_ms: u64,

    /// Configuration file
    #[arg(short, long, env = "RSTCHART_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(path) = &cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }

    let chart = load_chart(&cli.chart)?;
    let chart_name = chart.name().to_string();
    tracing::info!(
        "Loaded chart '{}' ({} states, checksum {})",
        chart_name,
        chart.state_count(),
        chart.checksum()
    );

    let (scheduler, fired) = TokioScheduler::new(tokio::runtime::Handle::current());
    let engine = Arc::new(
        StatechartEngine::new()
            .with_scheduler(Arc::new(scheduler))
            .with_config(config.engine.session_config()),
    );
    engine.register_chart(chart)?;

    let initial_values = match &cli.data {
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => map,
            _ => return Err("--data must be a JSON object".into()),
        },
        None => Map::new(),
    };
    let session_id = engine.create_session(&chart_name, cli.session_id.as_deref(), initial_values)?;
    let snapshot = engine.snapshot(&session_id)?;
    print_update(&SessionUpdate {
        session_id: snapshot.session_id,
        status: snapshot.status,
        configuration: snapshot.configuration,
        done_data: snapshot.done_data,
    });

    let (driver, handle) = SessionDriver::new(Arc::clone(&engine), fired, &config.driver);
    let mut updates = handle.subscribe();
    let driver_task = tokio::spawn(driver.run());
    let printer_task = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            print_update(&update);
        }
    });

    if cli.events.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            send_event(&handle, &session_id, line).await?;
        }
    } else {
        for spec in &cli.events {
            send_event(&handle, &session_id, spec).await?;
        }
    }

    if cli.linger_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cli.linger_ms)).await;
    }

    handle.shutdown();
    let _ = driver_task.await;
    drop(handle);
    let _ = printer_task.await;

    let snapshot = engine.snapshot(&session_id)?;
    if let Some(done) = &snapshot.done_data {
        println!("done data: {}", done);
    }
    tracing::info!(
        "Session {} ended {} in [{}]",
        session_id,
        snapshot.status.as_str(),
        snapshot.configuration.join(", ")
    );
    Ok(())
}

fn load_chart(path: &Path) -> Result<Chart, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let chart = if is_yaml {
        Chart::from_yaml(&text)?
    } else {
        Chart::from_json(&serde_json::from_str(&text)?)?
    };
    Ok(chart)
}

/// Parses `name` or `name=<json>` into an event.
fn parse_event(spec: &str) -> Result<Event, serde_json::Error> {
    match spec.split_once('=') {
        Some((name, data)) => Ok(Event::external(name.trim()).with_data(serde_json::from_str(data)?)),
        None => Ok(Event::external(spec.trim())),
    }
}

async fn send_event(
    handle: &DriverHandle,
    session_id: &str,
    spec: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let event = parse_event(spec)?;
    tracing::debug!("Sending event {}", event.name);
    handle.send(session_id, event).await?;
    Ok(())
}

fn print_update(update: &SessionUpdate) {
    println!(
        "{} [{}] {}",
        update.session_id,
        update.status.as_str(),
        update.configuration.join(" ")
    );
}
