//! Owns one pipeline per configured port, the shared raw-pair and measure
//! queues, the mapping watcher, and graceful shutdown. See SPEC_FULL.md §4.5.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::MappingWatcher;
use crate::decoder;
use crate::error::Result;
use crate::fetcher::{Fetcher, FetcherConfig};
use crate::framer::Correlator;
use crate::live_status::LiveStatus;
use crate::logging::tlog;
use crate::measure_store::MeasureStore;
use crate::model::{Mapping, Pair};
use crate::raw_store::RawStore;

pub struct ControllerConfig {
    pub ports: Vec<String>,
    pub baud_rate: u32,
    pub clear_interval: chrono::Duration,
    pub site_devices_path: PathBuf,
    pub templates_path: PathBuf,
    pub raw_db_path: PathBuf,
    pub measure_db_path: PathBuf,
    pub live_status_dir: PathBuf,
}

/// Runs until `stop` is set, then joins every pipeline thread with a bounded
/// timeout and returns. Blocking, meant to be called from `main` (or a
/// dedicated thread if the caller wants to retain control of its own
/// thread, e.g. to drive the signal handler concurrently).
pub fn run(config: ControllerConfig, stop: Arc<AtomicBool>) -> Result<()> {
    let raw_store = RawStore::open(&config.raw_db_path)?;
    let measure_store = MeasureStore::open(&config.measure_db_path)?;
    let live_status = Arc::new(LiveStatus::new(&config.live_status_dir)?);

    let mapping: Arc<ArcSwap<Mapping>> = Arc::new(ArcSwap::from_pointee(Mapping::new()));
    let mut watcher = MappingWatcher::new(config.site_devices_path.clone(), config.templates_path.clone());
    if let Some(built) = watcher.reload_if_changed() {
        mapping.store(Arc::new(built));
    }

    let (pair_tx, pair_rx) = mpsc::channel::<Pair>();
    let (measure_tx, measure_rx) = mpsc::channel::<decoder::Measure>();

    let handles: Vec<_> = config
        .ports
        .iter()
        .cloned()
        .map(|port| {
            let mapping = mapping.clone();
            let pair_tx = pair_tx.clone();
            let measure_tx = measure_tx.clone();
            let live_status = live_status.clone();
            let stop = stop.clone();
            let baud_rate = config.baud_rate;
            let clear_interval = config.clear_interval;
            std::thread::spawn(move || {
                run_pipeline(
                    port,
                    baud_rate,
                    clear_interval,
                    mapping,
                    pair_tx,
                    measure_tx,
                    live_status,
                    stop,
                )
            })
        })
        .collect();
    drop(pair_tx);
    drop(measure_tx);

    while !stop.load(Ordering::SeqCst) {
        match pair_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(pair) => {
                if let Err(e) = raw_store.insert(&pair) {
                    tlog!("[controller] raw store insert failed, dropping pair: {}", e);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {}
        }

        while let Ok(measure) = measure_rx.try_recv() {
            let now = chrono::Local::now();
            if let Err(e) = measure_store.insert(&measure, now) {
                tlog!("[controller] measure store insert failed, dropping measure: {}", e);
            }
        }

        if let Some(built) = watcher.reload_if_changed() {
            tlog!("[controller] mapping reloaded ({} ports)", built.len());
            mapping.store(Arc::new(built));
        }
    }

    for (port, handle) in config.ports.iter().zip(handles) {
        join_with_timeout(port, handle, Duration::from_secs(3));
    }

    Ok(())
}

/// Joins `handle` but doesn't wait past `timeout` — a thread that's still
/// alive past that point is logged and abandoned rather than blocking
/// process exit, per §5's ~3s bounded-join shutdown policy.
fn join_with_timeout(port: &str, handle: std::thread::JoinHandle<()>, timeout: Duration) {
    let (done_tx, done_rx) = mpsc::channel::<()>();
    std::thread::spawn(move || {
        let _ = handle.join();
        let _ = done_tx.send(());
    });
    if done_rx.recv_timeout(timeout).is_err() {
        tlog!(
            "[controller:{}] pipeline did not stop within {:?}, abandoning join",
            port,
            timeout
        );
    }
}

fn run_pipeline(
    port: String,
    baud_rate: u32,
    clear_interval: chrono::Duration,
    mapping: Arc<ArcSwap<Mapping>>,
    pair_tx: mpsc::Sender<Pair>,
    measure_tx: mpsc::Sender<decoder::Measure>,
    live_status: Arc<LiveStatus>,
    stop: Arc<AtomicBool>,
) {
    'outer: loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let fetcher = match Fetcher::start(FetcherConfig::new(&port, baud_rate)) {
            Ok(f) => f,
            Err(e) => {
                tlog!("[controller:{}] fatal: {}", port, e);
                return;
            }
        };
        let mut correlator = Correlator::new(&port);
        let mut watchdog_tripped = false;

        while !stop.load(Ordering::SeqCst) {
            let incoming = fetcher.drain();
            let now = chrono::Local::now();

            if !incoming.is_empty() {
                let _ = live_status.mirror_bytes(&port, &incoming);
            }

            let outcome = correlator.tick(&incoming, now, clear_interval);

            if outcome.watchdog_tripped {
                tlog!("[controller:{}] buffer watchdog tripped, restarting fetcher", port);
                watchdog_tripped = true;
                break;
            }

            for pair in outcome.pairs {
                let _ = live_status.record_pair(&pair);

                let measures = mapping
                    .load()
                    .get(&port)
                    .and_then(|by_slave| by_slave.get(&pair.slave))
                    .map(|device| decoder::decode(&pair, device))
                    .unwrap_or_default();
                for measure in measures {
                    let _ = measure_tx.send(measure);
                }

                if pair_tx.send(pair).is_err() {
                    break 'outer;
                }
            }

            if !outcome.stale_targets.is_empty() {
                tlog!(
                    "[controller:{}] {} communication target(s) went stale, resetting",
                    port,
                    outcome.stale_targets.len()
                );
            }

            std::thread::sleep(Duration::from_millis(20));
        }

        fetcher.stop();

        if !watchdog_tripped {
            return;
        }
    }
}
