use std::time::Duration;

use anyhow::Result;
use log::debug;
use serde_json::Value;

use crate::config::constants;
use crate::store::{PrinterStatus, Temperatures};

/// One normalized, point-in-time read of a device's reported state.
///
/// Ephemeral: produced by a single fetch attempt and consumed immediately
/// by the reconciler, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: PrinterStatus,
    pub status_text: String,
    pub temperatures: Temperatures,
    pub filename: Option<String>,
    pub filename_stem: Option<String>,
    pub remaining_seconds: Option<u64>,
}

/// Result of one fetch attempt.
///
/// `Unreachable` is a normal, expected value: transport errors and
/// explicit offline reports are frequent in a fleet and are handled by the
/// reconciler, never escalated as application errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Snapshot(StatusSnapshot),
    Unreachable,
}

/// Status fetching service for the Moonraker API.
///
/// Performs the multi-request status read for one device and normalizes the
/// raw JSON into a [`StatusSnapshot`]. Holds its own HTTP client; safe to
/// share across poll workers.
pub struct StatusFetcher {
    client: reqwest::blocking::Client,
}

impl Default for StatusFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }

    /// Fetch and normalize the current status of the device at `address`.
    ///
    /// Issues the availability probe, heater query and print-state query in
    /// sequence. Any transport failure or malformed reply on a required
    /// request yields `FetchOutcome::Unreachable`; only the chamber-sensor
    /// discovery is best-effort (many printers have no chamber probe).
    ///
    /// No side effects beyond the remote reads.
    pub fn fetch(&self, address: &str) -> FetchOutcome {
        if let Err(e) = self.probe(address) {
            debug!("Availability probe failed for {}: {}", address, e);
            return FetchOutcome::Unreachable;
        }

        let mut temperatures = match self.query_heaters(address) {
            Ok(temps) => temps,
            Err(e) => {
                debug!("Heater query failed for {}: {}", address, e);
                return FetchOutcome::Unreachable;
            }
        };
        temperatures.chamber = self.query_chamber(address);

        match self.query_print_state(address) {
            Ok(mut snapshot) => {
                snapshot.temperatures = temperatures;
                FetchOutcome::Snapshot(snapshot)
            }
            Err(e) => {
                debug!("Print state query failed for {}: {}", address, e);
                FetchOutcome::Unreachable
            }
        }
    }

    /// Availability probe: `GET /server/info`.
    ///
    /// # Errors
    ///
    /// Returns an error on any transport failure or non-success status;
    /// the caller maps this to `Unreachable`.
    fn probe(&self, address: &str) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/server/info", address))
            .timeout(Duration::from_secs(constants::PROBE_TIMEOUT_SECONDS))
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "availability probe returned HTTP {}",
                response.status()
            ));
        }

        Ok(())
    }

    /// Query extruder and bed heater temperatures.
    fn query_heaters(&self, address: &str) -> Result<Temperatures> {
        let data = self.query_objects(address, "extruder&extruder1&heater_bed")?;
        let status = &data["result"]["status"];

        Ok(Temperatures {
            extruder0: normalize_reading(status["extruder"]["temperature"].as_f64()),
            extruder1: normalize_reading(status["extruder1"]["temperature"].as_f64()),
            bed: normalize_reading(status["heater_bed"]["temperature"].as_f64()),
            chamber: None,
        })
    }

    /// Discover and read a chamber temperature sensor, if the printer has
    /// one. Best-effort: any failure leaves the reading absent.
    fn query_chamber(&self, address: &str) -> Option<i64> {
        let result: Result<Option<i64>> = (|| {
            let data = self.query_objects(address, "heaters")?;
            let sensors = &data["result"]["status"]["heaters"]["available_sensors"];
            let chamber_sensor = sensors
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .find(|name| name.to_uppercase().contains("CHAMBER"));

            let Some(sensor_name) = chamber_sensor else {
                return Ok(None);
            };

            let data = self.query_objects(address, sensor_name)?;
            Ok(normalize_reading(
                data["result"]["status"][sensor_name]["temperature"].as_f64(),
            ))
        })();

        match result {
            Ok(reading) => reading,
            Err(e) => {
                debug!("Chamber sensor query failed for {}: {}", address, e);
                None
            }
        }
    }

    /// Query print state, job filename and progress, producing a snapshot
    /// without temperatures (filled in by the caller).
    fn query_print_state(&self, address: &str) -> Result<StatusSnapshot> {
        let data = self.query_objects(address, "print_stats&virtual_sdcard")?;
        let print_stats = &data["result"]["status"]["print_stats"];

        let state = print_stats["state"].as_str().unwrap_or("unknown");
        let status = PrinterStatus::from_report(state);
        let status_text = match status.label() {
            Some(label) => label.to_string(),
            None => capitalize(state),
        };

        let filename = print_stats["filename"]
            .as_str()
            .filter(|f| !f.is_empty())
            .map(str::to_string);
        let filename_stem = filename.as_deref().map(strip_extension).map(str::to_string);

        let remaining_seconds = match status {
            PrinterStatus::Printing | PrinterStatus::Paused => estimate_remaining(
                print_stats["print_duration"].as_f64(),
                data["result"]["status"]["virtual_sdcard"]["progress"].as_f64(),
            ),
            _ => None,
        };

        Ok(StatusSnapshot {
            status,
            status_text,
            temperatures: Temperatures::default(),
            filename,
            filename_stem,
            remaining_seconds,
        })
    }

    /// `GET /printer/objects/query?{query}` with the shared query timeout.
    fn query_objects(&self, address: &str, query: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/printer/objects/query?{}", address, query))
            .timeout(Duration::from_secs(constants::QUERY_TIMEOUT_SECONDS))
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "object query '{}' returned HTTP {}",
                query,
                response.status()
            ));
        }

        Ok(response.json()?)
    }
}

/// Normalize a raw temperature reading.
///
/// Rounds to the nearest integer. Missing and zero readings both map to
/// `None`: device firmware reports 0 for disconnected sensors, so zero
/// means "no reading" by convention.
pub fn normalize_reading(raw: Option<f64>) -> Option<i64> {
    match raw {
        Some(value) if value != 0.0 => Some(value.round() as i64),
        _ => None,
    }
}

/// Strip the final `.ext` suffix from a filename, if any.
pub fn strip_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(index) => &filename[..index],
        None => filename,
    }
}

/// Estimate seconds remaining from elapsed print time and sd-card progress.
fn estimate_remaining(print_duration: Option<f64>, progress: Option<f64>) -> Option<u64> {
    let duration = print_duration?;
    let progress = progress?;
    if progress <= 0.0 || duration <= 0.0 {
        return None;
    }
    let remaining = duration * (1.0 - progress) / progress;
    Some(remaining.round() as u64)
}

fn capitalize(state: &str) -> String {
    let mut chars = state.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
