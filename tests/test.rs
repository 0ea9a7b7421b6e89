use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use moonfleet::command::{CommandDispatcher, CommandKind};
use moonfleet::error::CommandError;
use moonfleet::fetcher::{self, FetchOutcome, StatusFetcher, StatusSnapshot};
use moonfleet::media::{self, MediaResolver};
use moonfleet::reconcile::{self, Reconciler, OFFLINE_STATUS_TEXT};
use moonfleet::scheduler::PollScheduler;
use moonfleet::store::{DeviceRecord, FleetStore, PrinterStatus, Temperatures};

/// Address that refuses connections immediately (nothing listens there).
const DEAD_ADDRESS: &str = "http://127.0.0.1:1";

/// Minimal loopback HTTP responder standing in for a Moonraker endpoint.
///
/// Serves canned status payloads for the fetcher's query sequence and
/// records the POST endpoints it receives.
struct StubPrinter {
    base_url: String,
    probe_hits: Arc<AtomicUsize>,
    command_hits: Arc<Mutex<Vec<String>>>,
}

fn spawn_stub(
    state: &'static str,
    extruder_temp: f64,
    bed_temp: f64,
    filename: &'static str,
) -> StubPrinter {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let base_url = format!("http://{}", listener.local_addr().expect("stub addr"));
    let probe_hits = Arc::new(AtomicUsize::new(0));
    let command_hits = Arc::new(Mutex::new(Vec::new()));

    let thread_probe_hits = Arc::clone(&probe_hits);
    let thread_command_hits = Arc::clone(&command_hits);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            handle_connection(
                stream,
                state,
                extruder_temp,
                bed_temp,
                filename,
                &thread_probe_hits,
                &thread_command_hits,
            );
        }
    });

    StubPrinter {
        base_url,
        probe_hits,
        command_hits,
    }
}

fn handle_connection(
    mut stream: TcpStream,
    state: &str,
    extruder_temp: f64,
    bed_temp: f64,
    filename: &str,
    probe_hits: &AtomicUsize,
    command_hits: &Mutex<Vec<String>>,
) {
    let Some((method, path)) = read_request(&mut stream) else {
        return;
    };

    let body = if method == "POST" {
        command_hits.lock().expect("hit log").push(path);
        serde_json::json!({ "result": "ok" }).to_string()
    } else if path.starts_with("/server/info") {
        probe_hits.fetch_add(1, Ordering::SeqCst);
        serde_json::json!({ "result": { "klippy_state": "ready" } }).to_string()
    } else if path.contains("heater_bed") {
        serde_json::json!({
            "result": { "status": {
                "extruder": { "temperature": extruder_temp },
                "heater_bed": { "temperature": bed_temp }
            } }
        })
        .to_string()
    } else if path.contains("query?heaters") {
        serde_json::json!({
            "result": { "status": { "heaters": { "available_sensors": [] } } }
        })
        .to_string()
    } else if path.contains("print_stats") {
        let mut print_stats = serde_json::json!({
            "state": state,
            "print_duration": 600.0
        });
        if !filename.is_empty() {
            print_stats["filename"] = serde_json::json!(filename);
        }
        serde_json::json!({
            "result": { "status": {
                "print_stats": print_stats,
                "virtual_sdcard": { "progress": 0.5 }
            } }
        })
        .to_string()
    } else {
        serde_json::json!({ "result": {} }).to_string()
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Read one HTTP request (headers plus any Content-Length body), returning
/// method and path.
fn read_request(stream: &mut TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut request_line = head.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let content_length = head
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut remaining = content_length.saturating_sub(buf.len() - header_end);
    while remaining > 0 {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }

    Some((method, path))
}

fn printing_snapshot(stem: &str, extruder0: Option<i64>) -> StatusSnapshot {
    StatusSnapshot {
        status: PrinterStatus::Printing,
        status_text: "Printing".to_string(),
        temperatures: Temperatures {
            extruder0,
            extruder1: None,
            bed: Some(60),
            chamber: None,
        },
        filename: Some(format!("{}.gcode", stem)),
        filename_stem: Some(stem.to_string()),
        remaining_seconds: Some(600),
    }
}

fn observable_fields(
    record: &DeviceRecord,
) -> (
    PrinterStatus,
    String,
    Temperatures,
    Option<moonfleet::store::JobInfo>,
    bool,
) {
    (
        record.status,
        record.status_text.clone(),
        record.temperatures,
        record.job.clone(),
        record.media_available,
    )
}

#[test]
fn test_address_normalization_and_duplicate_registration() {
    let store = FleetStore::new();
    let address = store.register(None, "10.0.0.5").expect("register");
    assert_eq!(address, "http://10.0.0.5");

    let record = store.get(&address).expect("record");
    assert_eq!(record.name, "Printer 1");
    assert!(record.media_available);

    // Same printer again, already normalized: rejected.
    assert!(store.register(None, "http://10.0.0.5/").is_err());
    assert_eq!(store.len(), 1);
}

#[test]
fn test_unreachable_reconcile_fully_resets_record() {
    let mut record = DeviceRecord::new("Voron".to_string(), "http://10.0.0.5".to_string());
    reconcile::apply(&mut record, &FetchOutcome::Snapshot(printing_snapshot("cube", Some(211))));
    assert!(record.job.is_some());

    reconcile::apply(&mut record, &FetchOutcome::Unreachable);
    assert_eq!(record.status, PrinterStatus::Offline);
    assert_eq!(record.status_text, OFFLINE_STATUS_TEXT);
    assert_eq!(record.temperatures, Temperatures::default());
    assert!(record.job.is_none());
    assert!(!record.media_available);
}

#[test]
fn test_reconcile_is_idempotent() {
    let outcome = FetchOutcome::Snapshot(printing_snapshot("benchy", Some(205)));
    let mut first = DeviceRecord::new("A".to_string(), "http://10.0.0.5".to_string());
    let mut second = DeviceRecord::new("A".to_string(), "http://10.0.0.5".to_string());

    reconcile::apply(&mut first, &outcome);
    reconcile::apply(&mut second, &outcome);
    reconcile::apply(&mut second, &outcome);
    assert_eq!(observable_fields(&first), observable_fields(&second));

    let offline = FetchOutcome::Unreachable;
    reconcile::apply(&mut first, &offline);
    reconcile::apply(&mut second, &offline);
    reconcile::apply(&mut second, &offline);
    assert_eq!(observable_fields(&first), observable_fields(&second));
}

#[test]
fn test_zero_temperature_reads_as_absent() {
    assert_eq!(fetcher::normalize_reading(Some(0.0)), None);
    assert_eq!(fetcher::normalize_reading(None), None);
    assert_eq!(fetcher::normalize_reading(Some(210.4)), Some(210));
    assert_eq!(fetcher::normalize_reading(Some(210.6)), Some(211));

    // A printing device whose extruder reports 0 renders "-" but keeps its
    // job data.
    let mut record = DeviceRecord::new("A".to_string(), "http://10.0.0.5".to_string());
    let snapshot = printing_snapshot("part1", fetcher::normalize_reading(Some(0.0)));
    reconcile::apply(&mut record, &FetchOutcome::Snapshot(snapshot));
    assert_eq!(record.temperatures.extruder0, None);
    assert_eq!(moonfleet::store::fmt_reading(record.temperatures.extruder0), "-");
    assert_eq!(record.job_stem(), "part1");
}

#[test]
fn test_snapshot_defaults_when_no_job_reported() {
    let mut record = DeviceRecord::new("A".to_string(), "http://10.0.0.5".to_string());
    reconcile::apply(&mut record, &FetchOutcome::Snapshot(printing_snapshot("cube", Some(200))));

    let idle = StatusSnapshot {
        status: PrinterStatus::Standby,
        status_text: "Standby".to_string(),
        temperatures: Temperatures::default(),
        filename: None,
        filename_stem: None,
        remaining_seconds: None,
    };
    reconcile::apply(&mut record, &FetchOutcome::Snapshot(idle));

    // Full replace: the old job does not linger, display falls back to the
    // declared defaults.
    assert!(record.job.is_none());
    assert_eq!(record.job_filename(), "no data");
    assert_eq!(record.job_stem(), "");
}

#[test]
fn test_filename_stem_stripping() {
    assert_eq!(fetcher::strip_extension("cube.gcode"), "cube");
    assert_eq!(fetcher::strip_extension("part.v2.gcode"), "part.v2");
    assert_eq!(fetcher::strip_extension("noext"), "noext");
}

#[test]
fn test_media_offline_overrides_stream_flag() {
    let mut record = DeviceRecord::new("A".to_string(), "http://10.0.0.5".to_string());
    record.status = PrinterStatus::Offline;
    record.media_available = true;
    assert_eq!(media::resolve_image_source(&record), media::PLACEHOLDER_IMAGE);
}

#[test]
fn test_media_fallback_live_to_thumbnail_to_placeholder() {
    let store = FleetStore::new();
    let address = store.register(None, "http://10.0.0.5").expect("register");
    let reconciler = Reconciler::new(store.clone());
    reconciler.reconcile(
        &address,
        &FetchOutcome::Snapshot(printing_snapshot("cube", Some(210))),
    );

    let resolver = MediaResolver::new(store.clone());
    assert_eq!(resolver.resolve(&address), media::stream_url(&address));

    // Live stream fails to load: one-way downgrade to the thumbnail.
    let fallback = resolver.handle_image_error(&address);
    assert_eq!(fallback, media::thumbnail_url(&address, "cube"));
    assert!(!store.get(&address).expect("record").media_available);

    // Thumbnail fails too: placeholder, no further state change.
    let fallback = resolver.handle_image_error(&address);
    assert_eq!(fallback, media::PLACEHOLDER_IMAGE);
    assert!(!store.get(&address).expect("record").media_available);
}

#[test]
fn test_media_flag_not_raised_by_successful_poll() {
    let store = FleetStore::new();
    let address = store.register(None, "http://10.0.0.5").expect("register");
    let reconciler = Reconciler::new(store.clone());
    let resolver = MediaResolver::new(store.clone());

    reconciler.reconcile(
        &address,
        &FetchOutcome::Snapshot(printing_snapshot("cube", Some(210))),
    );
    resolver.handle_image_error(&address);
    assert!(!store.get(&address).expect("record").media_available);

    // A later healthy poll does not resurrect the stream.
    reconciler.reconcile(
        &address,
        &FetchOutcome::Snapshot(printing_snapshot("cube", Some(212))),
    );
    assert!(!store.get(&address).expect("record").media_available);
    assert_eq!(resolver.resolve(&address), media::thumbnail_url(&address, "cube"));
}

#[test]
fn test_media_idle_device_without_stream_shows_placeholder() {
    let mut record = DeviceRecord::new("A".to_string(), "http://10.0.0.5".to_string());
    record.status = PrinterStatus::Standby;
    record.media_available = false;
    assert_eq!(media::resolve_image_source(&record), media::PLACEHOLDER_IMAGE);
}

#[test]
fn test_fetch_transport_failure_is_unreachable() {
    let fetcher = StatusFetcher::new();
    assert_eq!(fetcher.fetch(DEAD_ADDRESS), FetchOutcome::Unreachable);

    let store = FleetStore::new();
    let address = store.register(None, DEAD_ADDRESS).expect("register");
    let reconciler = Reconciler::new(store.clone());
    reconciler.reconcile(&address, &fetcher.fetch(&address));

    let record = store.get(&address).expect("record");
    assert_eq!(record.status, PrinterStatus::Offline);
    assert_eq!(record.status_text, OFFLINE_STATUS_TEXT);
    assert!(!record.media_available);
}

#[test]
fn test_fetch_normalizes_stub_payload() {
    let stub = spawn_stub("printing", 210.6, 0.0, "cube.gcode");
    let fetcher = StatusFetcher::new();

    let FetchOutcome::Snapshot(snapshot) = fetcher.fetch(&stub.base_url) else {
        panic!("expected a snapshot from the stub printer");
    };

    assert_eq!(snapshot.status, PrinterStatus::Printing);
    assert_eq!(snapshot.status_text, "Printing");
    assert_eq!(snapshot.temperatures.extruder0, Some(211));
    // Zero bed reading means "no reading" by firmware convention.
    assert_eq!(snapshot.temperatures.bed, None);
    assert_eq!(snapshot.temperatures.extruder1, None);
    assert_eq!(snapshot.filename.as_deref(), Some("cube.gcode"));
    assert_eq!(snapshot.filename_stem.as_deref(), Some("cube"));
    // 600s elapsed at 50% progress: 600s to go.
    assert_eq!(snapshot.remaining_seconds, Some(600));
    assert_eq!(stub.probe_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_scheduler_isolates_unreachable_device() {
    let stub = spawn_stub("printing", 210.0, 60.0, "cube.gcode");
    let store = FleetStore::new();
    let healthy = store.register(None, &stub.base_url).expect("register");
    let dead = store.register(None, DEAD_ADDRESS).expect("register");

    let scheduler = PollScheduler::new(
        Arc::new(StatusFetcher::new()),
        Reconciler::new(store.clone()),
        Duration::from_millis(200),
    );
    scheduler.start(&healthy);
    scheduler.start(&dead);

    thread::sleep(Duration::from_millis(700));
    let first_pass = store.get(&healthy).expect("record");
    assert_eq!(first_pass.status, PrinterStatus::Printing);

    // The healthy device keeps updating on its own cadence while the other
    // fails every poll.
    thread::sleep(Duration::from_millis(500));
    let second_pass = store.get(&healthy).expect("record");
    assert!(second_pass.last_updated > first_pass.last_updated);
    assert_eq!(second_pass.status, PrinterStatus::Printing);

    let dead_record = store.get(&dead).expect("record");
    assert_eq!(dead_record.status, PrinterStatus::Offline);
    assert!(!dead_record.media_available);

    scheduler.stop_all();
}

#[test]
fn test_scheduler_stop_joins_before_removal() {
    let store = FleetStore::new();
    let address = store.register(None, DEAD_ADDRESS).expect("register");

    let scheduler = PollScheduler::new(
        Arc::new(StatusFetcher::new()),
        Reconciler::new(store.clone()),
        Duration::from_secs(5),
    );
    scheduler.start(&address);
    assert!(scheduler.is_running(&address));

    // Stop joins the worker mid-sleep; afterwards the slot is safe to drop.
    assert!(scheduler.stop(&address));
    assert!(!scheduler.is_running(&address));
    assert!(store.remove(&address));
    assert!(!scheduler.stop(&address));
}

fn dispatcher_for(store: &FleetStore) -> CommandDispatcher {
    let scheduler = Arc::new(PollScheduler::new(
        Arc::new(StatusFetcher::new()),
        Reconciler::new(store.clone()),
        Duration::from_secs(5),
    ));
    CommandDispatcher::new(store.clone(), scheduler)
}

#[test]
fn test_command_to_unknown_device_is_rejected() {
    let store = FleetStore::new();
    let dispatcher = dispatcher_for(&store);
    let result = dispatcher.dispatch("http://10.9.9.9", CommandKind::EmergencyStop);
    assert!(matches!(result, Err(CommandError::UnknownDevice { .. })));
}

#[test]
fn test_command_transport_failure_is_reported() {
    let store = FleetStore::new();
    let address = store.register(None, DEAD_ADDRESS).expect("register");
    let dispatcher = dispatcher_for(&store);

    let result = dispatcher.dispatch(&address, CommandKind::EmergencyStop);
    assert!(matches!(result, Err(CommandError::Unreachable { .. })));

    let result = dispatcher.dispatch(&address, CommandKind::CancelPrint);
    assert!(matches!(result, Err(CommandError::Unreachable { .. })));
}

#[test]
fn test_emergency_stop_triggers_one_forced_reconcile() {
    let stub = spawn_stub("standby", 0.0, 0.0, "");
    let store = FleetStore::new();
    let address = store.register(None, &stub.base_url).expect("register");
    let dispatcher = dispatcher_for(&store);

    dispatcher
        .dispatch(&address, CommandKind::EmergencyStop)
        .expect("dispatch");

    let hits = stub.command_hits.lock().expect("hit log").clone();
    assert_eq!(hits, vec!["/printer/emergency_stop".to_string()]);

    // Exactly one out-of-cycle pass ran: one availability probe, and the
    // record already reflects the device's reported state.
    assert_eq!(stub.probe_hits.load(Ordering::SeqCst), 1);
    let record = store.get(&address).expect("record");
    assert_eq!(record.status, PrinterStatus::Standby);
    assert_eq!(record.status_text, "Standby");
}

#[test]
fn test_pause_resume_requires_active_job() {
    let stub = spawn_stub("standby", 0.0, 0.0, "");
    let store = FleetStore::new();
    let address = store.register(None, &stub.base_url).expect("register");
    let dispatcher = dispatcher_for(&store);

    let result = dispatcher.dispatch(&address, CommandKind::PauseResume);
    match result {
        Err(CommandError::InvalidState { current_state, .. }) => {
            assert_eq!(current_state, "standby");
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert!(stub.command_hits.lock().expect("hit log").is_empty());
}

#[test]
fn test_pause_resume_picks_endpoint_from_state() {
    let stub = spawn_stub("printing", 210.0, 60.0, "cube.gcode");
    let store = FleetStore::new();
    let address = store.register(None, &stub.base_url).expect("register");
    let dispatcher = dispatcher_for(&store);

    dispatcher
        .dispatch(&address, CommandKind::PauseResume)
        .expect("dispatch");
    let hits = stub.command_hits.lock().expect("hit log").clone();
    assert_eq!(hits, vec!["/printer/print/pause".to_string()]);
}

#[test]
fn test_toggle_light_skips_forced_reconcile() {
    let stub = spawn_stub("standby", 0.0, 0.0, "");
    let store = FleetStore::new();
    let address = store.register(None, &stub.base_url).expect("register");
    let dispatcher = dispatcher_for(&store);

    dispatcher
        .dispatch(&address, CommandKind::ToggleLight)
        .expect("dispatch");

    let hits = stub.command_hits.lock().expect("hit log").clone();
    assert_eq!(hits, vec!["/printer/gcode/script".to_string()]);
    // Not state-affecting: no out-of-cycle poll, so no probe either.
    assert_eq!(stub.probe_hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_rename_is_local_only() {
    let store = FleetStore::new();
    // Device is unreachable; rename must still succeed without transport.
    let address = store.register(None, DEAD_ADDRESS).expect("register");
    let dispatcher = dispatcher_for(&store);

    dispatcher
        .dispatch(&address, CommandKind::Rename("Workhorse".to_string()))
        .expect("dispatch");
    assert_eq!(store.get(&address).expect("record").name, "Workhorse");
}
