use std::sync::Arc;
use std::thread;

use anyhow::Result;
use log::info;

// Import our modules
use moonfleet::config::Config;
use moonfleet::fetcher::StatusFetcher;
use moonfleet::reconcile::Reconciler;
use moonfleet::scheduler::PollScheduler;
use moonfleet::store::FleetStore;

/// Moonfleet - fleet monitor for Moonraker-based 3D printers.
///
/// Registers the configured printers, starts one independent polling loop
/// per device, and logs a periodic fleet summary. Each printer is polled
/// over its own HTTP API; failures are reconciled into an offline record
/// state and never affect the rest of the fleet.
///
/// # Environment Variables
///
/// Required:
/// * `PRINTER_URLS` - Comma-separated printer base URLs
///
/// Optional (with defaults):
/// * `POLL_INTERVAL_SECONDS` - Poll period per device (default: "5")
/// * `RUST_LOG` - Log level filter (default: info)
///
/// # Usage
///
/// ```bash
/// export PRINTER_URLS="http://voron.local:7125,10.0.0.5:7125"
/// ./moonfleet
/// ```
fn main() -> Result<()> {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let config = Config::load().expect(
        "Failed to load configuration. Please ensure all required environment variables are set.",
    );

    info!("Moonfleet starting...");
    info!(
        "Monitoring {} printer(s), poll interval {}s",
        config.printers.len(),
        config.poll_interval.as_secs()
    );

    let store = FleetStore::new();
    let fetcher = Arc::new(StatusFetcher::new());
    let reconciler = Reconciler::new(store.clone());
    let scheduler = Arc::new(PollScheduler::new(
        fetcher,
        reconciler,
        config.poll_interval,
    ));

    for entry in &config.printers {
        let address = store
            .register(Some(entry.name.clone()), &entry.address)
            .map_err(|e| anyhow::anyhow!("Failed to register {}: {}", entry.address, e))?;
        scheduler.start(&address);
    }

    info!("Fleet registered. Polling started.");

    // Fleet summary loop: one line per printer every poll interval.
    loop {
        thread::sleep(config.poll_interval);
        for record in store.snapshot_all() {
            let remaining = record
                .job
                .as_ref()
                .and_then(|job| job.remaining_seconds)
                .map(|secs| format!(", {}m left", secs / 60))
                .unwrap_or_default();
            info!(
                "{} [{}] {} | {} | {}{}",
                record.name,
                record.address,
                record.status_text,
                record.temperatures.summary(),
                record.job_filename(),
                remaining
            );
        }
    }
}
