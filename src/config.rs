use std::time::Duration;

/// Configuration for the fleet monitor loaded from environment variables.
///
/// All values come from the environment to support containerized
/// deployments; only the printer list is required.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial fleet registrations, in declaration order.
    ///
    /// Environment variable: `PRINTER_URLS`, comma-separated base URLs or
    /// bare hosts (e.g. `http://printer1.local:7125,10.0.0.5`). Entries
    /// without a scheme get `http://` prefixed.
    pub printers: Vec<PrinterEntry>,

    /// Interval between status polls for each device.
    ///
    /// Environment variable: `POLL_INTERVAL_SECONDS` (default: "5")
    pub poll_interval: Duration,
}

/// One initial registration: display name plus normalized base URL.
#[derive(Debug, Clone)]
pub struct PrinterEntry {
    pub name: String,
    pub address: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are not set or
    /// cannot be parsed:
    /// - `PRINTER_URLS`: comma-separated printer base URLs (required)
    /// - `POLL_INTERVAL_SECONDS`: poll period in seconds (default: "5")
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let raw_urls = std::env::var("PRINTER_URLS")
            .map_err(|_| "PRINTER_URLS environment variable is required")?;

        let printers: Vec<PrinterEntry> = raw_urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .enumerate()
            .map(|(index, url)| PrinterEntry {
                name: format!("Printer {}", index + 1),
                address: crate::store::normalize_address(url),
            })
            .collect();

        if printers.is_empty() {
            return Err("PRINTER_URLS must list at least one printer".into());
        }

        let poll_interval_seconds = std::env::var("POLL_INTERVAL_SECONDS")
            .unwrap_or_else(|_| constants::POLL_INTERVAL_SECONDS.to_string())
            .parse::<u64>()
            .map_err(|e| format!("Invalid POLL_INTERVAL_SECONDS: {}", e))?;

        Ok(Config {
            printers,
            poll_interval: Duration::from_secs(poll_interval_seconds),
        })
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Default interval between status polls, in seconds.
    pub const POLL_INTERVAL_SECONDS: u64 = 5;

    /// Timeout for the `/server/info` availability probe, in seconds.
    pub const PROBE_TIMEOUT_SECONDS: u64 = 3;

    /// Timeout for `/printer/objects/query` requests, in seconds.
    pub const QUERY_TIMEOUT_SECONDS: u64 = 2;

    /// Timeout for control command POSTs, in seconds.
    pub const COMMAND_TIMEOUT_SECONDS: u64 = 3;

    /// G-code macro executed by the light toggle command.
    pub const LIGHT_SWITCH_MACRO: &str = "LIGHT_SWITCH";
}
