use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::time::timeout;
use tracing::{error, info};
use url::Url;

use nasasniff::analyzer::{PacketAnalyzer, SharedAnalyzer};
use nasasniff::capture::{self, CaptureConfig};
use nasasniff::config::init_logging;
use nasasniff::export;
use nasasniff::format::{format_packet, ConsoleSink};
use nasasniff::session::{LiveSession, PacketSink, DEFAULT_HISTORY_CAPACITY};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Passive sniffer for the Samsung NASA HVAC bus.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the port to sniff
    ///
    /// either serial:///device/path or tcp+raw://host:port URLs supported
    #[arg(required_unless_present = "view")]
    port: Option<Url>,

    /// Load a persisted capture instead of sniffing (view mode)
    #[arg(long, conflicts_with = "port")]
    view: Option<PathBuf>,

    /// Packets retained in the live history ring
    #[arg(long, default_value_t = DEFAULT_HISTORY_CAPACITY)]
    capacity: usize,

    /// Bound the per-group history kept for reporting (unbounded if unset)
    #[arg(long)]
    group_history: Option<usize>,

    /// Write the retained history to FILE as JSON on exit
    #[arg(long)]
    export: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Plain packet lines without colour
    #[arg(long)]
    no_colour: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    let analyzer = match args.group_history {
        Some(limit) => PacketAnalyzer::with_history_limit(limit),
        None => PacketAnalyzer::new(),
    };
    let analyzer = SharedAnalyzer::new(analyzer);

    match &args.view {
        Some(path) => view(path, analyzer),
        None => {
            let url = args.port.clone().expect("clap enforces port or --view");
            live(&args, url, analyzer).await
        }
    }
}

/// Replay a persisted capture: no port, no live decodes.
fn view(path: &PathBuf, analyzer: SharedAnalyzer) -> Result<()> {
    let packets = export::load_packets(path)
        .with_context(|| format!("failed to load capture from {}", path.display()))?;

    info!(count = packets.len(), "loaded capture into view mode");

    let session = LiveSession::in_view_mode(packets);

    for packet in session.history_snapshot() {
        analyzer.on_packet(&packet);
        println!("{}", format_packet(&packet));
    }

    println!();
    println!("{}", analyzer.report());

    session.close();
    Ok(())
}

async fn live(args: &Args, url: Url, analyzer: SharedAnalyzer) -> Result<()> {
    let session = Arc::new(LiveSession::new(args.capacity));
    session.add_sink(Arc::new(analyzer.clone()));
    session.add_sink(Arc::new(ConsoleSink::new(!args.no_colour)));
    session.start();

    let mut capture = tokio::spawn(capture::run(
        url,
        session.clone(),
        CaptureConfig::default(),
    ));

    tokio::select! {
        signal = signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("shutting down");
            session.close();

            match timeout(SHUTDOWN_GRACE, &mut capture).await {
                Ok(result) => {
                    if let Err(err) = result.expect("capture task panicked") {
                        error!(%err, "capture failed");
                    }
                }
                Err(_) => {
                    error!("shutdown did not complete in {SHUTDOWN_GRACE:?}, forcing exit");
                    process::exit(1);
                }
            }
        }
        result = &mut capture => {
            // the capture loop only ends on its own if the initial
            // connect failed or the session stopped underneath it
            session.close();
            result.expect("capture task panicked")?;
        }
    }

    let counters = session.counters();
    info!(
        packets = counters.packets,
        decode_errors = counters.decode_errors,
        resyncs = counters.resyncs,
        "capture finished"
    );

    println!();
    println!("{}", analyzer.report());

    if let Some(path) = &args.export {
        let history = session.history_snapshot();
        export::save_packets(path, &history)
            .with_context(|| format!("failed to export capture to {}", path.display()))?;
        info!(count = history.len(), path = %path.display(), "history exported");
    }

    Ok(())
}
