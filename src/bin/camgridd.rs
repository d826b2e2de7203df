//! camgridd - camera grid host
//!
//! Restores the configured cameras, keeps every feed connected, runs the
//! connection watchdog, logs each feed's status and optionally writes
//! periodic snapshots until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use camgrid::{CamgridConfig, FeedContext, FeedError, FeedRegistry, FeedStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Seconds between status lines for every feed.
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,
    /// Start recording on every feed as soon as it has a frame.
    #[arg(long)]
    record: bool,
    /// Seconds between JPEG snapshots of every feed into the configured
    /// snapshots directory; 0 disables them.
    #[arg(long, default_value_t = 0)]
    snapshot_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = CamgridConfig::load().context("load configuration")?;
    let ctx = FeedContext::from_config(&cfg);
    let mut registry = FeedRegistry::restore(FeedStore::new(&cfg.store_path), ctx)
        .with_context(|| format!("restore cameras from {}", cfg.store_path.display()))?;
    if registry.is_empty() {
        log::warn!(
            "no cameras configured in {}; add one with `camgrid add`",
            cfg.store_path.display()
        );
    }

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let status_interval = Duration::from_secs(args.status_interval_secs.max(1));
    let tick = Duration::from_millis(500);
    let mut next_watchdog = Instant::now() + cfg.watchdog_interval;
    let mut next_status = Instant::now() + status_interval;
    let snapshot_interval =
        (args.snapshot_interval_secs > 0).then(|| Duration::from_secs(args.snapshot_interval_secs));
    let mut next_snapshot = snapshot_interval.map(|interval| Instant::now() + interval);

    loop {
        match rx.recv_timeout(tick) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if args.record {
            for feed in registry.feeds() {
                if feed.is_recording() || feed.current_frame().is_none() {
                    continue;
                }
                match feed.start_recording() {
                    Ok(path) => log::info!("{}: recording to {}", feed.id(), path.display()),
                    Err(FeedError::NoFrameAvailable) => {}
                    Err(err) => log::warn!("{}: cannot record: {}", feed.id(), err),
                }
            }
        }

        let now = Instant::now();
        if now >= next_watchdog {
            for (id, err) in registry.check_all() {
                log::warn!("{id}: watchdog: {err}");
            }
            next_watchdog = now + cfg.watchdog_interval;
        }
        if now >= next_status {
            for feed in registry.feeds() {
                log::info!(
                    "{} {}: {}",
                    feed.id(),
                    feed.identity().hardware_address(),
                    feed.status()
                );
            }
            next_status = now + status_interval;
        }
        if let (Some(interval), Some(due)) = (snapshot_interval, next_snapshot) {
            if now >= due {
                match registry.snapshot_all(&cfg.snapshots_dir) {
                    Ok(results) => {
                        for (id, result) in results {
                            match result {
                                Ok(_) | Err(FeedError::NoFrameAvailable) => {}
                                Err(err) => log::warn!("{id}: snapshot failed: {err}"),
                            }
                        }
                    }
                    Err(err) => log::warn!(
                        "cannot write snapshots to {}: {}",
                        cfg.snapshots_dir.display(),
                        err
                    ),
                }
                next_snapshot = Some(now + interval);
            }
        }
    }

    log::info!("shutting down {} feed(s)", registry.len());
    registry.shutdown_all();
    Ok(())
}
