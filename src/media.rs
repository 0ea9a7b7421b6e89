use log::info;

use crate::store::{DeviceRecord, FleetStore, PrinterStatus};

/// Image served when no live or cached media source is usable.
pub const PLACEHOLDER_IMAGE: &str = "/static/default_printer.jpg";

/// MJPEG stream endpoint on the device.
pub fn stream_url(address: &str) -> String {
    format!("{}/webcam/?action=stream", address)
}

/// Thumbnail cached by the device for the named G-code file.
pub fn thumbnail_url(address: &str, stem: &str) -> String {
    format!(
        "{}/server/files/gcodes/.thumbs/{}-300x300.png",
        address, stem
    )
}

/// Pick the image source to display for a device record.
///
/// Deterministic priority, evaluated fresh on every call:
/// 1. offline device: placeholder, unconditionally
/// 2. live stream believed reachable: stream endpoint
/// 3. printing or paused with a known filename stem: job thumbnail
/// 4. placeholder
pub fn resolve_image_source(record: &DeviceRecord) -> String {
    if record.status == PrinterStatus::Offline {
        return PLACEHOLDER_IMAGE.to_string();
    }

    if record.media_available {
        return stream_url(&record.address);
    }

    if matches!(record.status, PrinterStatus::Printing | PrinterStatus::Paused)
        && !record.job_stem().is_empty()
    {
        return thumbnail_url(&record.address, record.job_stem());
    }

    PLACEHOLDER_IMAGE.to_string()
}

/// Media fallback state machine over the record store.
///
/// States `{live, thumbnail, placeholder}` with a single forward-only edge:
/// a live-stream load failure lowers `media_available` and drops to the
/// thumbnail (if eligible) or the placeholder. Thumbnail and placeholder
/// are terminal within a polling cycle.
#[derive(Clone)]
pub struct MediaResolver {
    store: FleetStore,
}

impl MediaResolver {
    pub fn new(store: FleetStore) -> Self {
        Self { store }
    }

    /// Current image source for the device at `address`.
    pub fn resolve(&self, address: &str) -> String {
        match self.store.get(address) {
            Some(record) => resolve_image_source(&record),
            None => PLACEHOLDER_IMAGE.to_string(),
        }
    }

    /// React to a load failure of the currently displayed source.
    ///
    /// If the failed source was the live stream, the stream is marked dead
    /// on the record (one-way; a later successful poll does not retry it)
    /// and the source is re-resolved, yielding the thumbnail when eligible.
    /// A failed thumbnail or placeholder falls through to the placeholder
    /// with no further state change.
    pub fn handle_image_error(&self, address: &str) -> String {
        let Some(record) = self.store.get(address) else {
            return PLACEHOLDER_IMAGE.to_string();
        };

        if record.media_available {
            info!("Live stream for {} failed to load, falling back", address);
            self.store.update(address, |r| r.media_available = false);
            return match self.store.get(address) {
                Some(updated) => resolve_image_source(&updated),
                None => PLACEHOLDER_IMAGE.to_string(),
            };
        }

        PLACEHOLDER_IMAGE.to_string()
    }
}
