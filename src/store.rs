use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

/// Display value for a temperature sensor with no reading.
pub const TEMP_SENTINEL: &str = "-";

/// Fallback display value when a device reports no job filename.
pub const DEFAULT_FILENAME: &str = "no data";

/// Enumerated printer state as reported by the Moonraker `print_stats` object,
/// plus the locally-derived `offline` state for unreachable devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterStatus {
    Operational,
    Error,
    Offline,
    Printing,
    Paused,
    Complete,
    Standby,
    Cancelled,
    Unknown,
}

impl PrinterStatus {
    /// Map a raw Moonraker state string onto the status enum.
    ///
    /// Unrecognized states map to `Unknown`; the raw string is still carried
    /// through `status_text` so nothing is lost for display.
    pub fn from_report(state: &str) -> Self {
        match state {
            "operational" => PrinterStatus::Operational,
            "error" => PrinterStatus::Error,
            "printing" => PrinterStatus::Printing,
            "paused" => PrinterStatus::Paused,
            "complete" => PrinterStatus::Complete,
            "standby" => PrinterStatus::Standby,
            "cancelled" => PrinterStatus::Cancelled,
            _ => PrinterStatus::Unknown,
        }
    }

    /// Human-readable label for a mapped status, or `None` for `Unknown`
    /// (callers fall back to the capitalized raw state string).
    pub fn label(&self) -> Option<&'static str> {
        match self {
            PrinterStatus::Operational => Some("Operational"),
            PrinterStatus::Error => Some("Error"),
            PrinterStatus::Offline => Some("Offline"),
            PrinterStatus::Printing => Some("Printing"),
            PrinterStatus::Paused => Some("Paused"),
            PrinterStatus::Complete => Some("Complete"),
            PrinterStatus::Standby => Some("Standby"),
            PrinterStatus::Cancelled => Some("Cancelled"),
            PrinterStatus::Unknown => None,
        }
    }
}

/// Rounded temperature readings for the named heater/sensor slots.
///
/// `None` means "no reading": the sensor is missing, disconnected, or the
/// firmware reported zero (device convention for an absent probe).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Temperatures {
    pub extruder0: Option<i64>,
    pub extruder1: Option<i64>,
    pub bed: Option<i64>,
    pub chamber: Option<i64>,
}

impl Temperatures {
    /// Compact one-line rendering for fleet summary logs, e.g.
    /// `ext 210/- bed 60 chamber -`.
    pub fn summary(&self) -> String {
        format!(
            "ext {}/{} bed {} chamber {}",
            fmt_reading(self.extruder0),
            fmt_reading(self.extruder1),
            fmt_reading(self.bed),
            fmt_reading(self.chamber)
        )
    }
}

/// Render a temperature reading, substituting the `-` sentinel when absent.
pub fn fmt_reading(reading: Option<i64>) -> String {
    match reading {
        Some(value) => value.to_string(),
        None => TEMP_SENTINEL.to_string(),
    }
}

/// Details of the job a device is currently printing (or last printed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Full G-code filename as reported by the device.
    pub filename: String,
    /// Filename with its final extension stripped; keys the thumbnail path.
    pub filename_stem: String,
    /// Estimated seconds until completion, when derivable from progress.
    pub remaining_seconds: Option<u64>,
}

/// Last-observed state of one registered printer.
///
/// Identity is the `address` field; it never changes after registration.
/// All other fields are rewritten wholesale by the reconciler on every poll.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// User-facing display label. Mutable through rename.
    pub name: String,
    /// Base URL of the device API. Primary key, immutable.
    pub address: String,
    pub status: PrinterStatus,
    /// Human-readable status detail shown alongside the status icon.
    pub status_text: String,
    pub temperatures: Temperatures,
    pub job: Option<JobInfo>,
    /// Whether the live webcam stream is currently believed reachable.
    /// Only ever lowered by the media resolver; a fresh poll does not
    /// restore it.
    pub media_available: bool,
    /// Wall-clock time of the most recent reconciliation.
    pub last_updated: DateTime<Local>,
}

impl DeviceRecord {
    pub fn new(name: String, address: String) -> Self {
        Self {
            name,
            address,
            status: PrinterStatus::Unknown,
            status_text: "loading".to_string(),
            temperatures: Temperatures::default(),
            job: None,
            media_available: true,
            last_updated: Local::now(),
        }
    }

    /// Job filename for display, with the declared default when absent.
    pub fn job_filename(&self) -> &str {
        self.job.as_ref().map_or(DEFAULT_FILENAME, |j| j.filename.as_str())
    }

    /// Job filename stem, or the empty string when no job is known.
    pub fn job_stem(&self) -> &str {
        self.job.as_ref().map_or("", |j| j.filename_stem.as_str())
    }
}

/// Normalize a user-entered device address into a canonical base URL.
///
/// Bare host/IP entries get an `http://` prefix; trailing slashes are
/// trimmed so endpoint paths can be appended uniformly.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// In-memory table of known devices, keyed by address.
///
/// The store is shared between the poll workers, the command dispatcher and
/// any readers; writes are mutex-scoped so readers always observe a fully
/// reconciled record, never a partial update. The only sanctioned writers
/// are the reconciler and the media resolver's one-way stream downgrade.
#[derive(Clone)]
pub struct FleetStore {
    inner: Arc<Mutex<HashMap<String, DeviceRecord>>>,
}

impl Default for FleetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a device, normalizing its address and filling record
    /// defaults. Rejects duplicate addresses.
    ///
    /// # Arguments
    ///
    /// * `name` - Display label; `None` yields `Printer {n}` in
    ///   registration order
    /// * `address` - Base URL or bare host of the device API
    ///
    /// # Returns
    ///
    /// The normalized address under which the device was stored.
    pub fn register(&self, name: Option<String>, address: &str) -> anyhow::Result<String> {
        let address = normalize_address(address);
        let mut table = self.lock();
        if table.contains_key(&address) {
            return Err(anyhow::anyhow!("printer already added: {}", address));
        }
        let name = name.unwrap_or_else(|| format!("Printer {}", table.len() + 1));
        table.insert(address.clone(), DeviceRecord::new(name, address.clone()));
        Ok(address)
    }

    /// Remove a device record. Returns false if the address was unknown.
    ///
    /// Callers must stop the device's poll worker first so no in-flight
    /// tick writes into the removed slot.
    pub fn remove(&self, address: &str) -> bool {
        self.lock().remove(address).is_some()
    }

    /// Update the local display label. Returns false if the address was
    /// unknown.
    pub fn rename(&self, address: &str, name: &str) -> bool {
        match self.lock().get_mut(address) {
            Some(record) => {
                record.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Cloned view of one record.
    pub fn get(&self, address: &str) -> Option<DeviceRecord> {
        self.lock().get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().contains_key(address)
    }

    /// Addresses of all registered devices.
    pub fn addresses(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Cloned view of the whole fleet, ordered by address for stable output.
    pub fn snapshot_all(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Apply a closure to one record slot under the store lock.
    ///
    /// Restricted to this crate: the reconciler and the media resolver are
    /// the only permitted writers.
    pub(crate) fn update<F>(&self, address: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut DeviceRecord),
    {
        match self.lock().get_mut(address) {
            Some(record) => {
                mutate(record);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceRecord>> {
        // A poisoned mutex means a writer panicked mid-update; that is a
        // programming invariant violation, the one error class allowed to
        // abort.
        self.inner.lock().expect("fleet store mutex poisoned")
    }
}
