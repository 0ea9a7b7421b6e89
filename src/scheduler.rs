use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::fetcher::{FetchOutcome, StatusFetcher};
use crate::reconcile::Reconciler;

/// Per-device polling worker handle.
struct DeviceWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
    /// In-flight guard: held for the duration of one fetch+reconcile pass.
    /// Shared with the forced-poll path so a forced pass never overlaps a
    /// scheduled tick for the same device.
    tick_lock: Arc<Mutex<()>>,
}

/// Runs one independent polling loop per registered device.
///
/// Each device gets its own worker thread that fires an immediate poll on
/// start, then polls at a fixed period scheduled against absolute deadlines
/// (a slow fetch eats into the idle window instead of stretching the
/// cadence). Devices never block each other; a device that fails every poll
/// is retried at the same interval indefinitely, without backoff.
///
/// Workers are keyed by address in a scheduler-owned map, so registration
/// and removal never misalign (no index-based routing).
pub struct PollScheduler {
    fetcher: Arc<StatusFetcher>,
    reconciler: Reconciler,
    interval: Duration,
    workers: Mutex<HashMap<String, DeviceWorker>>,
}

impl PollScheduler {
    pub fn new(fetcher: Arc<StatusFetcher>, reconciler: Reconciler, interval: Duration) -> Self {
        Self {
            fetcher,
            reconciler,
            interval,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start the polling loop for one device. Idempotent: a second start
    /// for an address that already has a live worker is ignored.
    pub fn start(&self, address: &str) {
        let mut workers = self.lock_workers();
        if workers.contains_key(address) {
            warn!("Poll worker for {} already running", address);
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let tick_lock = Arc::new(Mutex::new(()));

        let fetcher = Arc::clone(&self.fetcher);
        let reconciler = self.reconciler.clone();
        let interval = self.interval;
        let worker_lock = Arc::clone(&tick_lock);
        let worker_address = address.to_string();

        let handle = thread::spawn(move || {
            debug!("Poll worker started for {}", worker_address);
            let mut next_tick = Instant::now();
            loop {
                {
                    let _in_flight = worker_lock.lock().expect("tick lock poisoned");
                    poll_pass(&fetcher, &reconciler, &worker_address);
                }

                next_tick += interval;
                let wait = next_tick.saturating_duration_since(Instant::now());
                if wait.is_zero() {
                    // The fetch overran the whole period; poll again right
                    // away and rebase the cadence from now.
                    next_tick = Instant::now();
                    match stop_rx.try_recv() {
                        Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                        Err(mpsc::TryRecvError::Empty) => continue,
                    }
                }
                match stop_rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
            debug!("Poll worker stopped for {}", worker_address);
        });

        workers.insert(
            address.to_string(),
            DeviceWorker {
                stop_tx,
                handle,
                tick_lock,
            },
        );
        info!("Started polling {}", address);
    }

    /// Stop the polling loop for one device and wait for it to finish.
    ///
    /// Joins the worker thread, so once this returns no in-flight tick can
    /// write into the device's record slot; callers may then remove the
    /// record safely. Returns false if no worker was running.
    pub fn stop(&self, address: &str) -> bool {
        let worker = match self.lock_workers().remove(address) {
            Some(worker) => worker,
            None => return false,
        };

        // Ignore send errors: the worker may already have exited.
        let _ = worker.stop_tx.send(());
        if worker.handle.join().is_err() {
            warn!("Poll worker for {} panicked during shutdown", address);
        }
        info!("Stopped polling {}", address);
        true
    }

    /// Stop every worker. Used at shutdown.
    pub fn stop_all(&self) {
        let addresses: Vec<String> = self.lock_workers().keys().cloned().collect();
        for address in addresses {
            self.stop(&address);
        }
    }

    /// Whether a polling worker is currently running for `address`.
    pub fn is_running(&self, address: &str) -> bool {
        self.lock_workers().contains_key(address)
    }

    /// Run one immediate, out-of-cycle fetch+reconcile pass for a device.
    ///
    /// Used by the command dispatcher after a state-affecting command so
    /// the record reflects the new state without waiting for the next
    /// scheduled tick. Shares the device's in-flight guard with the poll
    /// worker; if a tick is outstanding, this blocks until it completes and
    /// then runs exactly once.
    pub fn poll_now(&self, address: &str) {
        let tick_lock = self
            .lock_workers()
            .get(address)
            .map(|worker| Arc::clone(&worker.tick_lock));

        match tick_lock {
            Some(lock) => {
                let _in_flight = lock.lock().expect("tick lock poisoned");
                poll_pass(&self.fetcher, &self.reconciler, address);
            }
            // No worker (e.g. commands sent before polling starts): still
            // honor the single forced pass.
            None => poll_pass(&self.fetcher, &self.reconciler, address),
        }
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceWorker>> {
        self.workers.lock().expect("scheduler worker map poisoned")
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// One fetch+reconcile pass for one device.
///
/// Anything that goes wrong inside the fetch, including a panic, is
/// contained here and reconciled as an unreachable outcome; nothing from a
/// single device's poll path may escape to affect another device or the
/// scheduler itself.
fn poll_pass(fetcher: &StatusFetcher, reconciler: &Reconciler, address: &str) {
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch(address))) {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("Status fetch for {} panicked; treating as unreachable", address);
            FetchOutcome::Unreachable
        }
    };
    reconciler.reconcile(address, &outcome);
}
