use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sluice_config::SluiceConfig;
use sluice_hdu::HeaderDataUnit;
use sluice_ipc::{Key, OpenMode, Ring, RingStats, ShmNamespace, Stream};
use std::time::Duration;

mod logging;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Create, inspect and repair shared-memory rings")]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Base key in hex; overrides the config
    #[arg(short, long)]
    key: Option<Key>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a ring, or a data ring plus header ring with --hdu
    Create {
        #[arg(long)]
        nbufs: Option<u64>,
        #[arg(long)]
        bufsz: Option<u64>,
        #[arg(long)]
        readers: Option<usize>,
        #[arg(long)]
        device: Option<i32>,
        #[arg(long)]
        hdu: bool,
        /// Pin the new ring into RAM and keep it pinned until interrupted
        #[arg(long)]
        lock: bool,
    },
    /// Remove a ring and all its resources
    Destroy {
        #[arg(long)]
        hdu: bool,
    },
    /// Print ring state once
    Stat {
        #[arg(long)]
        json: bool,
    },
    /// Print ring state repeatedly
    Monitor {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long)]
        json: bool,
    },
    /// Follow the data ring as a passive viewer, reporting each transfer
    View,
    /// Release permits held by processes that have died
    Recover,
    /// Zero every cursor and count; corrupts in-flight transfers
    HardReset {
        #[arg(long)]
        yes: bool,
    },
    /// Zero every slot so all pages are resident
    Page,
    /// Pin the ring into RAM until interrupted
    LockMemory,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SluiceConfig::load(path.as_str()).with_context(|| format!("loading {path}"))?,
        None => SluiceConfig::default(),
    };
    logging::init(&config)?;

    let key = match cli.key {
        Some(key) => key,
        None => config.key()?,
    };
    let ns = config.namespace();
    tracing::debug!(%key, dir = %ns.dir().display(), "using namespace");

    match cli.command {
        Commands::Create {
            nbufs,
            bufsz,
            readers,
            device,
            hdu,
            lock,
        } => {
            let mut config = config;
            if let Some(n) = nbufs {
                config.data.nbufs = n;
            }
            if let Some(n) = bufsz {
                config.data.bufsz = n;
            }
            if let Some(n) = readers {
                config.data.readers = n;
            }
            if device.is_some() {
                config.data.device = device;
            }
            config.validate()?;

            if hdu {
                HeaderDataUnit::create_rings(&ns, key, config.data_ring(), config.header_ring())
                    .with_context(|| format!("creating unit at {key}"))?;
                println!("created data ring {key} and header ring {}", key.next());
            } else {
                Ring::create(&ns, key, config.data_ring())
                    .with_context(|| format!("creating ring {key}"))?;
                println!("created ring {key}");
            }

            if lock {
                hold_locked(&Ring::connect(&ns, key)?)?;
            }
        }
        Commands::Destroy { hdu } => {
            if hdu {
                HeaderDataUnit::destroy_rings(&ns, key)
                    .with_context(|| format!("destroying unit at {key}"))?;
            } else {
                Ring::destroy_key(&ns, key).with_context(|| format!("destroying ring {key}"))?;
            }
            println!("destroyed {key}");
        }
        Commands::Stat { json } => {
            let ring = connect(&ns, key)?;
            print_stats(&ring.stats(), json)?;
        }
        Commands::Monitor { interval_ms, json } => {
            let ring = connect(&ns, key)?;
            loop {
                print_stats(&ring.stats(), json)?;
                std::thread::sleep(Duration::from_millis(interval_ms));
            }
        }
        Commands::View => {
            let mut viewer = open_viewer(&ns, key, &config)?;
            loop {
                let mut bytes = 0u64;
                while let Some((_, block)) = viewer.open_block_read()? {
                    let n = block.len() as u64;
                    bytes += n;
                    viewer.close_block_read(n)?;
                }
                println!(
                    "transfer of {bytes} bytes ended, {} slots skipped",
                    viewer.ring().view_skipped()
                );
                viewer.reset()?;
            }
        }
        Commands::Recover => {
            let ring = connect(&ns, key)?;
            let report = ring.recover()?;
            if report.is_empty() {
                println!("nothing to recover");
            }
            if let Some(pid) = report.writer {
                println!("released writer permit of dead pid {pid}");
            }
            for (identity, pid) in &report.readers {
                println!("released reader {identity} of dead pid {pid}");
            }
        }
        Commands::HardReset { yes } => {
            if !yes {
                bail!("hard reset corrupts transfers in flight; pass --yes to proceed");
            }
            let mut ring = connect(&ns, key)?;
            ring.hard_reset()?;
            println!("hard reset {key}");
        }
        Commands::Page => {
            let mut ring = connect(&ns, key)?;
            ring.page();
            println!("paged {} slots of {key}", ring.nbufs());
        }
        Commands::LockMemory => {
            hold_locked(&connect(&ns, key)?)?;
        }
    }
    Ok(())
}

fn connect(ns: &ShmNamespace, key: Key) -> Result<Ring> {
    Ring::connect(ns, key).with_context(|| format!("connecting to ring {key} in {}", ns.dir().display()))
}

fn open_viewer(ns: &ShmNamespace, key: Key, config: &SluiceConfig) -> Result<Stream> {
    let mut ring = connect(ns, key)?;
    ring.set_view_poll(config.viewer_poll());
    let mut viewer = Stream::new(ring);
    viewer.open(OpenMode::View)?;
    Ok(viewer)
}

/// Page locks are per process, so this keeps the mapping alive.
fn hold_locked(ring: &Ring) -> Result<()> {
    ring.lock_memory()
        .with_context(|| format!("locking ring {} into memory", ring.key()))?;
    tracing::info!(key = %ring.key(), "ring locked into memory, holding until interrupted");
    loop {
        std::thread::park();
    }
}

fn print_stats(stats: &RingStats, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(stats)?);
        return Ok(());
    }

    let writer = match stats.writer_pid {
        Some(pid) => format!("locked by pid {pid}"),
        None if stats.writer_locked => "locked".to_string(),
        None => "free".to_string(),
    };
    println!(
        "ring {}: {} x {} bytes, written {} (xfer {}, {}), writer {}",
        stats.key,
        stats.nbufs,
        stats.bufsz,
        stats.nwrite,
        stats.xfer,
        if stats.writing { "in transfer" } else { "idle" },
        writer,
    );
    println!("  {:>3} {:>10} {:>5} {:>5} {:>5} {:>5} {:>6} {:>6}  state", "id", "read", "xfer", "full", "clear", "free", "sodack", "eodack");
    for r in &stats.readers {
        let state = match (r.connected, r.pid) {
            (true, Some(pid)) => format!("pid {pid}{}", if r.reading { " reading" } else { "" }),
            (true, None) => "connected".to_string(),
            (false, _) => "-".to_string(),
        };
        println!(
            "  {:>3} {:>10} {:>5} {:>5} {:>5} {:>5} {:>6} {:>6}  {}",
            r.identity, r.nread, r.xfer, r.full, r.clear, r.free, r.sodack, r.eodack, state
        );
    }
    Ok(())
}
