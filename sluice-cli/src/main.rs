use anyhow::Context;
use clap::{Parser, Subcommand};
use sluice_cli::config::ProfileConfig;
use sluice_cli::echo::EchoHandler;
use sluice_cli::ping;
use sluice_core::ChannelPool;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sluice: thread-pooled TCP channels
///
/// Settings come from an optional TOML profile; any value can be overridden
/// with dot notation.
///
/// Example usage:
///   sluice serve --listen 0.0.0.0:7878
///   sluice ping 127.0.0.1:7878 --count 10
///   sluice ping -P profiles/loopback.toml --set pool.multiplexer=poll
#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about = "Echo server and round-trip client on a sluice channel pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", global = true)]
    log_level: String,

    /// Path to a TOML profile
    #[arg(short = 'P', long, global = true)]
    profile: Option<PathBuf>,

    /// Override a profile value using dot notation (can be specified multiple times)
    ///
    /// Examples:
    ///   --set pool.thread_count=4
    ///   --set pool.write_high_water_mark=65536
    ///   --set ping.interval=50ms
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    set: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        /// Listen address (overrides serve.address)
        #[arg(long)]
        listen: Option<String>,

        /// Event manager threads (overrides pool.thread_count)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Stop after this long, e.g. "30s" (overrides serve.duration)
        #[arg(long)]
        duration: Option<String>,
    },

    /// Measure round trips against an echo server
    Ping {
        /// Server addresses, tried in order (override ping.targets)
        targets: Vec<String>,

        /// Number of probes (overrides ping.count)
        #[arg(short, long)]
        count: Option<u32>,

        /// Bytes per probe (overrides ping.payload_size)
        #[arg(short, long)]
        size: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut overrides = cli.set.clone();
    match &cli.command {
        Commands::Serve { listen, threads, duration } => {
            if let Some(listen) = listen {
                overrides.push(format!("serve.address={listen}"));
            }
            if let Some(threads) = threads {
                overrides.push(format!("pool.thread_count={threads}"));
            }
            if let Some(duration) = duration {
                overrides.push(format!("serve.duration={duration}"));
            }
        }
        Commands::Ping { targets, count, size } => {
            if !targets.is_empty() {
                let quoted: Vec<String> = targets.iter().map(|t| format!("\"{t}\"")).collect();
                overrides.push(format!("ping.targets=[{}]", quoted.join(",")));
            }
            if let Some(count) = count {
                overrides.push(format!("ping.count={count}"));
            }
            if let Some(size) = size {
                overrides.push(format!("ping.payload_size={size}"));
            }
        }
    }

    let profile = match &cli.profile {
        Some(path) => {
            tracing::info!("Loading profile: {}", path.display());
            ProfileConfig::from_file_with_overrides(path, &overrides)?
        }
        None => ProfileConfig::from_overrides(&overrides)?,
    };

    match cli.command {
        Commands::Serve { .. } => serve(&profile),
        Commands::Ping { .. } => {
            let report = ping::run(&profile)?;
            println!("{report}");
            Ok(())
        }
    }
}

fn serve(profile: &ProfileConfig) -> anyhow::Result<()> {
    let address = profile.serve_address()?;
    let handler = EchoHandler::new();
    let stats = handler.stats();

    let pool = ChannelPool::new(profile.pool.clone(), handler)?;
    let server = pool
        .listen_default(address, |_, _, channel, peer| {
            tracing::debug!(channel = %channel, %peer, "accepted");
        })
        .with_context(|| format!("Cannot serve on {address}"))?;
    let bound = pool.server_address(server)?;

    tracing::info!("=== Echo server ===");
    tracing::info!("Listening: {bound}");
    tracing::info!("Threads: {}", pool.num_threads());
    tracing::info!("Multiplexer: {}", profile.pool.multiplexer);
    tracing::info!("===================");

    let report_every = Duration::from_secs(10);
    let status_stats = stats.clone();
    let status = pool.register_clock(report_every, Some(report_every), move |pool, _| {
        let totals = pool.totals();
        tracing::info!(
            channels = pool.num_channels(),
            loads = ?pool.manager_loads(),
            read = totals.bytes_read,
            written = totals.bytes_written,
            echoed = status_stats.bytes_echoed.load(Ordering::Relaxed),
            "status"
        );
    })?;

    match profile.serve.duration {
        Some(duration) => thread::sleep(duration),
        None => loop {
            thread::park();
        },
    }

    pool.deregister_clock(status)?;
    pool.shutdown()?;
    tracing::info!(
        "Served {} channels, echoed {} bytes ({} stalls)",
        stats.channels.load(Ordering::Relaxed),
        stats.bytes_echoed.load(Ordering::Relaxed),
        stats.stalls.load(Ordering::Relaxed)
    );
    Ok(())
}
