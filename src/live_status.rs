//! Bounded ring-style JSON views of wiretap activity, read by the HTTP/UI
//! layer this core doesn't implement. Guarded by an in-process mutex (other
//! Framers in this process) and a cross-process advisory file lock (other
//! processes that might also touch these files), held for the minimum span
//! of a read-modify-write. See SPEC_FULL.md §5/§6.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::logging::tlog;
use crate::model::Pair;

const SERIAL_STREAM_RING: usize = 500;
const FOUND_PAIRS_RING: usize = 20;

/// How long to poll the advisory file lock before giving up on this tick,
/// per SPEC_FULL.md §7's lock-contention policy.
const LOCK_WAIT: Duration = Duration::from_millis(300);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FoundPair {
    pub uuid: String,
    pub port: String,
    pub device_id: u8,
    pub request: String,
    pub response: String,
    pub time: String,
}

pub struct LiveStatus {
    serial_streams_path: PathBuf,
    found_pairs_path: PathBuf,
    counts_path: PathBuf,
    guard: Mutex<()>,
}

impl LiveStatus {
    pub fn new(dir: &Path) -> crate::error::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            serial_streams_path: dir.join("serialStreams.json"),
            found_pairs_path: dir.join("foundPairs.json"),
            counts_path: dir.join("counts.json"),
            guard: Mutex::new(()),
        })
    }

    /// Mirrors the last `SERIAL_STREAM_RING` bytes of `port`'s buffer into
    /// `serialStreams.json`, as comma-free two-hex-digit tokens.
    pub fn mirror_bytes(&self, port: &str, recent_tail: &[u8]) -> crate::error::Result<()> {
        let _guard = self.guard.lock().unwrap();
        with_locked_json::<HashMap<String, Vec<String>>, _>(&self.serial_streams_path, |streams| {
            let entry = streams.entry(port.to_string()).or_default();
            entry.extend(recent_tail.iter().map(|b| format!("{:02X}", b)));
            let len = entry.len();
            if len > SERIAL_STREAM_RING {
                entry.drain(..len - SERIAL_STREAM_RING);
            }
        })
    }

    /// Appends a matched Pair to `foundPairs.json` (newest-last, capped) and
    /// bumps `counts.json`.
    pub fn record_pair(&self, pair: &Pair) -> crate::error::Result<()> {
        let _guard = self.guard.lock().unwrap();
        with_locked_json::<Vec<FoundPair>, _>(&self.found_pairs_path, |pairs| {
            pairs.push(FoundPair {
                uuid: pair.uuid(),
                port: pair.port.clone(),
                device_id: pair.slave,
                request: hex::encode_upper(&pair.request)
                    .as_bytes()
                    .chunks(2)
                    .map(|c| std::str::from_utf8(c).unwrap().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                response: hex::encode_upper(&pair.response)
                    .as_bytes()
                    .chunks(2)
                    .map(|c| std::str::from_utf8(c).unwrap().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                time: pair.timestamp.to_rfc3339(),
            });
            if pairs.len() > FOUND_PAIRS_RING {
                pairs.remove(0);
            }
        })?;

        with_locked_json::<Counts, _>(&self.counts_path, |counts| {
            counts.total += 1;
            *counts
                .by_port
                .entry(pair.port.clone())
                .or_default()
                .entry(pair.slave)
                .or_insert(0) += 1;
        })
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct Counts {
    total: u64,
    #[serde(flatten)]
    by_port: HashMap<String, HashMap<u8, u64>>,
}

fn with_locked_json<T, F>(path: &Path, mutate: F) -> crate::error::Result<()>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(&mut T),
{
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;

    if !try_lock_with_deadline(&file) {
        tlog!(
            "[live_status] lock contention on {}, skipping this update",
            path.display()
        );
        return Ok(());
    }

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let mut value: T = if contents.trim().is_empty() {
        T::default()
    } else {
        serde_json::from_str(&contents).unwrap_or_default()
    };

    mutate(&mut value);

    let serialized = serde_json::to_string(&value)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.flush()?;

    file.unlock()?;
    Ok(())
}

/// Polls `try_lock_exclusive()` until it succeeds or `LOCK_WAIT` elapses.
/// Never blocks indefinitely: a lock held by another process for longer than
/// that is assumed stuck or merely unlucky timing, and this tick is skipped
/// rather than stalling the caller.
fn try_lock_with_deadline(file: &std::fs::File) -> bool {
    let deadline = Instant::now() + LOCK_WAIT;
    loop {
        if file.try_lock_exclusive().is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(LOCK_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_stream_ring_is_trimmed_to_500() {
        let dir = tempfile::tempdir().unwrap();
        let status = LiveStatus::new(dir.path()).unwrap();
        for _ in 0..10 {
            status.mirror_bytes("/dev/ttyUSB0", &[0u8; 60]).unwrap();
        }
        let raw = std::fs::read_to_string(dir.path().join("serialStreams.json")).unwrap();
        let streams: HashMap<String, Vec<String>> = serde_json::from_str(&raw).unwrap();
        assert_eq!(streams["/dev/ttyUSB0"].len(), SERIAL_STREAM_RING);
    }

    #[test]
    fn found_pairs_ring_is_capped_at_20() {
        let dir = tempfile::tempdir().unwrap();
        let status = LiveStatus::new(dir.path()).unwrap();
        for slave in 0..25u8 {
            let pair = Pair::new(
                "/dev/ttyUSB0",
                vec![slave, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
                vec![slave, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xFA, 0x9D],
                chrono::Local::now(),
            );
            status.record_pair(&pair).unwrap();
        }
        let raw = std::fs::read_to_string(dir.path().join("foundPairs.json")).unwrap();
        let pairs: Vec<FoundPair> = serde_json::from_str(&raw).unwrap();
        assert_eq!(pairs.len(), FOUND_PAIRS_RING);
        assert_eq!(pairs[0].device_id, 5);

        let counts_raw = std::fs::read_to_string(dir.path().join("counts.json")).unwrap();
        let counts: Counts = serde_json::from_str(&counts_raw).unwrap();
        assert_eq!(counts.total, 25);
    }
}
