//! graphite-relay - metric routing relay for the Graphite ecosystem
//!
//! This is the main entry point: flag parsing, logging setup, signal
//! wiring, and the route-test mode.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use graphite_relay::config::parser;
use graphite_relay::dispatcher::{DispatchStats, MetricAssembler, SanitiseConfig};
use graphite_relay::domain::{
    BatchSize, IoTimeoutMs, MaxLineLength, MaxStalls, QueueCapacity, StatsInterval, WorkerCount,
};
use graphite_relay::relay::{hostname_of, Relay, RelayOptions};
use graphite_relay::router::Router;

#[derive(Parser, Debug)]
#[command(
    name = "graphite-relay",
    version,
    about = "High-throughput metric routing relay for the Graphite ecosystem"
)]
struct Args {
    /// Configuration file
    #[arg(short = 'f', long = "config", default_value = "/etc/graphite-relay.conf")]
    config: PathBuf,

    /// Default listen port
    #[arg(short = 'p', long = "port", default_value_t = 2003)]
    port: u16,

    /// Interface to bind the default listeners on
    #[arg(short = 'i', long = "interface", default_value = "")]
    interface: String,

    /// Number of worker threads
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Metrics per batch write
    #[arg(short = 'b', long = "batch", default_value_t = 2500)]
    batch: usize,

    /// Queue size per destination
    #[arg(short = 'q', long = "queue", default_value_t = 25_000)]
    queue: usize,

    /// Consecutive stalls before dropping
    #[arg(short = 'L', long = "stalls", default_value_t = 4)]
    stalls: usize,

    /// Socket I/O timeout in milliseconds
    #[arg(short = 'T', long = "iotimeout", default_value_t = 600)]
    iotimeout: u64,

    /// Statistics submission interval in seconds
    #[arg(short = 'S', long = "interval", default_value_t = 60)]
    interval: u64,

    /// Listen backlog
    #[arg(long = "backlog", default_value_t = 32)]
    backlog: u32,

    /// Socket receive buffer size (bytes); kernel default when absent
    #[arg(short = 'U', long = "sockbufsize")]
    sockbufsize: Option<usize>,

    /// Maximum length of one input line, terminator included
    #[arg(short = 'M', long = "maxinputlength", default_value_t = 32_768)]
    max_line_length: usize,

    /// Maximum length of a metric name
    #[arg(short = 'm', long = "maxmetriclength", default_value_t = 32_768)]
    max_metric_length: usize,

    /// Extra characters allowed in metric names
    #[arg(short = 'c', long = "allowed-chars", default_value = "-_:#")]
    allowed_chars: String,

    /// Hostname used in self-statistics
    #[arg(short = 'H', long = "hostname")]
    hostname: Option<String>,

    /// Submit statistics as per-interval deltas instead of cumulative
    /// counters
    #[arg(long = "reset-stats")]
    reset_stats: bool,

    /// Log file; stderr when absent
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Route-test mode: print matching destinations for metrics read
    /// from stdin, then exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "graphite_relay=debug"
    } else {
        "graphite_relay=info"
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(default_directive.parse()?);
    match &args.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    if args.test {
        return test_mode(&args);
    }

    let workers = args
        .workers
        .unwrap_or_else(|| num_cpus::get().clamp(1, 512));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("cannot build runtime")?;
    runtime.block_on(run(args, workers))
}

fn options(args: &Args, workers: usize) -> Result<RelayOptions> {
    Ok(RelayOptions {
        config_path: args.config.clone(),
        listen_interface: args.interface.clone(),
        listen_port: args.port,
        workers: WorkerCount::try_new(workers).context("invalid worker count")?,
        batch_size: BatchSize::try_new(args.batch).context("invalid batch size")?,
        queue_size: QueueCapacity::try_new(args.queue).context("invalid queue size")?,
        max_stalls: MaxStalls::try_new(args.stalls).context("invalid stall count")?,
        io_timeout: IoTimeoutMs::try_new(args.iotimeout).context("invalid I/O timeout")?,
        stats_interval: StatsInterval::try_new(args.interval)
            .context("invalid statistics interval")?,
        listen_backlog: args.backlog,
        socket_buffer: args.sockbufsize,
        max_line_length: MaxLineLength::try_new(args.max_line_length)
            .context("invalid input length bound")?,
        max_metric_length: args.max_metric_length,
        allowed_chars: args.allowed_chars.clone(),
        hostname: args.hostname.clone().unwrap_or_else(hostname_of),
        cumulative_stats: !args.reset_stats,
    })
}

async fn run(args: Args, workers: usize) -> Result<()> {
    let opts = options(&args, workers)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers, "starting graphite-relay"
    );

    let mut relay = Relay::start(opts).await?;

    let mut hup = signal(SignalKind::hangup()).context("cannot install SIGHUP handler")?;
    let mut term = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("cannot install SIGQUIT handler")?;

    loop {
        tokio::select! {
            _ = hup.recv() => {
                if let Err(e) = relay.reload().await {
                    error!(error = %e, "reload failed");
                }
            }
            _ = term.recv() => {
                info!("caught SIGTERM, shutting down");
                break;
            }
            _ = quit.recv() => {
                info!("caught SIGQUIT, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("caught SIGINT, shutting down");
                break;
            }
        }
    }

    relay.shutdown().await;
    Ok(())
}

/// Reads metrics from stdin and prints where each would go.
fn test_mode(args: &Args) -> Result<()> {
    let config = parser::parse_file(&args.config)?;
    let opts = options(args, 1)?;
    let router = Router::build(config, &opts.router_options())?;
    let sanitise = Arc::new(SanitiseConfig::new(
        args.max_line_length,
        args.max_metric_length,
        &args.allowed_chars,
    ));
    let stats = DispatchStats::default();

    let stdin = std::io::stdin();
    for input in stdin.lock().lines() {
        let input = input?;
        if input.is_empty() {
            continue;
        }
        // a bare name is enough for routing purposes
        let padded = if input.contains(' ') {
            format!("{input}\n")
        } else {
            format!("{input} 1 1\n")
        };
        let mut assembler = MetricAssembler::new(Arc::clone(&sanitise));
        let mut lines = Vec::new();
        assembler.feed(padded.as_bytes(), &mut lines, &stats);
        let Some((mut line, mut firstspace)) = lines.pop() else {
            println!("{input}\n    discarded");
            continue;
        };

        let mut dests = Vec::new();
        let blackholed = router.route(&mut line, &mut firstspace, "127.0.0.1", &mut dests);
        println!("{}", String::from_utf8_lossy(&line[..firstspace]));
        if dests.is_empty() && blackholed {
            println!("    blackholed");
        }
        for (sender, payload) in dests {
            println!(
                "    {} ({})",
                sender.descriptor(),
                String::from_utf8_lossy(&payload[..payload.len().saturating_sub(1)])
            );
        }
    }
    Ok(())
}
