mod config;
mod session;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::SessionConfig;
use delta_ingest_core::{channel, ConnectionManager, ConnectionState, MessageTransport};
use delta_ingest_replay::ReplayTransport;
use delta_ingest_sse::SseTransport;
use iox::CaptureWriter;
use normalize::Normalizer;
use session::{Session, SessionDecoder};

#[derive(Parser, Debug)]
#[command(name = "delta-shadow")]
#[command(about = "Live lap delta against a theoretical-best shadow lap")]
#[command(version)]
struct Cli {
    /// Event stream URL (http/https) or a capture file to replay
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Session config (JSON); defaults to the per-user config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Append every raw message to this capture file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Write completed laps on exit, as CSV or NDJSON by extension
    #[arg(long)]
    export_laps: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cfg = config::load(cli.config.as_deref())?;
    let endpoint = cli
        .endpoint
        .clone()
        .or_else(|| cfg.endpoint.clone())
        .context("no endpoint: pass --endpoint or set \"endpoint\" in the session config")?;

    let recorder = cli.record.as_deref().map(CaptureWriter::create).transpose()?;
    let decoder = SessionDecoder::new(Normalizer::new(), recorder);
    let session = Session::new(cfg.shadow.clone(), cfg.report_every_frames);

    if is_http(&endpoint) {
        let transport = SseTransport::new(cfg.sse.clone())?;
        run(transport, decoder, &cfg, &endpoint, &session).await?;
    } else {
        let transport = ReplayTransport::new(cfg.replay.clone());
        run(transport, decoder, &cfg, &endpoint, &session).await?;
    }

    finish(&session, cli.export_laps.as_deref())
}

fn is_http(endpoint: &str) -> bool {
    endpoint.starts_with("http://") || endpoint.starts_with("https://")
}

async fn run<T: MessageTransport>(
    transport: T,
    decoder: SessionDecoder,
    cfg: &SessionConfig,
    endpoint: &str,
    session: &Session,
) -> Result<()> {
    let manager = ConnectionManager::new(transport, decoder, cfg.connection.clone());
    let (tx, rx) = channel();
    let pump = session.spawn_pump(rx);
    let frames = manager.subscribe(move |frame| {
        let _ = tx.send(frame.clone());
    });

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let states = manager.on_state_change(move |s| {
        tracing::info!(state = %s, "connection");
        let _ = state_tx.send(*s);
    });

    tracing::info!(endpoint, "connecting");
    manager.connect(endpoint);

    // the replayed state arrives first; only an idle after it ends the run
    let mut started = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            state = state_rx.recv() => {
                match state {
                    None => break,
                    Some(ConnectionState::Dead) => {
                        tracing::warn!(endpoint, "giving up after exhausting the retry budget");
                        break;
                    }
                    Some(ConnectionState::Idle) if started => break,
                    Some(ConnectionState::Idle) => {}
                    Some(_) => started = true,
                }
            }
        }
    }

    manager.disconnect();
    states.unsubscribe();
    // drops the last sender so the pump drains and exits
    frames.unsubscribe();
    tokio::task::spawn_blocking(move || pump.join())
        .await?
        .map_err(|_| anyhow!("frame pump panicked"))
}

fn finish(session: &Session, export: Option<&Path>) -> Result<()> {
    let engine = session.engine();
    let engine = engine.lock();
    let laps = engine.completed_laps();
    let summary = analysis::lap_summary(laps);
    tracing::info!(summary = %summary, "session summary");

    if let Some(path) = export {
        let is_csv = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if is_csv {
            iox::export_laps_csv(laps, path)?;
        } else {
            iox::export_laps_ndjson(laps, path)?;
        }
        tracing::info!(path = %path.display(), laps = laps.len(), "laps exported");
    }
    Ok(())
}
