use chrono::Local;
use log::debug;

use crate::fetcher::{FetchOutcome, StatusSnapshot};
use crate::store::{DeviceRecord, FleetStore, JobInfo, PrinterStatus, Temperatures};

/// Status detail shown for a device that failed its last poll.
pub const OFFLINE_STATUS_TEXT: &str = "device unreachable";

/// Merge one fetch outcome into a device record.
///
/// Both branches fully replace the observable fields from the latest truth;
/// nothing is incrementally patched against prior history, so stale job or
/// temperature data never survives past one failed poll.
///
/// `media_available` is the one exception: a snapshot never raises it. Once
/// the media resolver has marked the stream dead, only re-registration
/// brings it back.
///
/// Idempotent over the observable fields (`last_updated` excluded):
/// applying the same outcome twice yields the same record.
pub fn apply(record: &mut DeviceRecord, outcome: &FetchOutcome) {
    match outcome {
        FetchOutcome::Unreachable => reset_offline(record),
        FetchOutcome::Snapshot(snapshot) => overlay(record, snapshot),
    }
    record.last_updated = Local::now();
}

/// Full reset for an unreachable device. Not a partial merge.
fn reset_offline(record: &mut DeviceRecord) {
    record.status = PrinterStatus::Offline;
    record.status_text = OFFLINE_STATUS_TEXT.to_string();
    record.temperatures = Temperatures::default();
    record.job = None;
    record.media_available = false;
}

/// Full replace from a snapshot, with declared defaults for absent fields.
fn overlay(record: &mut DeviceRecord, snapshot: &StatusSnapshot) {
    record.status = snapshot.status;
    record.status_text = snapshot.status_text.clone();
    record.temperatures = snapshot.temperatures;
    record.job = snapshot.filename.as_ref().map(|filename| JobInfo {
        filename: filename.clone(),
        filename_stem: snapshot.filename_stem.clone().unwrap_or_default(),
        remaining_seconds: snapshot.remaining_seconds,
    });
}

/// Applies fetch outcomes to the device record store.
///
/// The reconciler and the media resolver's stream downgrade are the only
/// writers the store permits.
#[derive(Clone)]
pub struct Reconciler {
    store: FleetStore,
}

impl Reconciler {
    pub fn new(store: FleetStore) -> Self {
        Self { store }
    }

    /// Reconcile one outcome into the record for `address`.
    ///
    /// Returns false when the device is no longer registered (a late
    /// outcome for a removed device is dropped, never re-creates a slot).
    pub fn reconcile(&self, address: &str, outcome: &FetchOutcome) -> bool {
        let updated = self.store.update(address, |record| apply(record, outcome));
        if updated {
            debug!("Reconciled {}: {:?}", address, outcome_kind(outcome));
        } else {
            debug!("Dropped outcome for unregistered device {}", address);
        }
        updated
    }
}

fn outcome_kind(outcome: &FetchOutcome) -> PrinterStatus {
    match outcome {
        FetchOutcome::Unreachable => PrinterStatus::Offline,
        FetchOutcome::Snapshot(snapshot) => snapshot.status,
    }
}
