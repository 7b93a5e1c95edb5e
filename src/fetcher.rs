//! Owns one serial port handle and turns it into a stream of raw bytes.
//!
//! One dedicated OS thread per port: the underlying `read()` is itself a
//! blocking syscall bounded by a short timeout, so there's nothing an async
//! executor buys here (see SPEC_FULL.md §5.1).

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::logging::tlog;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub open_retries: u32,
    pub open_retry_delay: Duration,
}

impl FetcherConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout: Duration::from_secs(1),
            open_retries: 5,
            open_retry_delay: Duration::from_secs(2),
        }
    }
}

/// A running Fetcher. Dropping this without calling `stop()` leaves the
/// worker thread running until the process exits; `stop()` is the normal
/// teardown path used by the Framer on watchdog reset and by the Controller
/// on shutdown.
pub struct Fetcher {
    config: FetcherConfig,
    stop_flag: Arc<AtomicBool>,
    rx: Receiver<u8>,
    handle: Option<JoinHandle<()>>,
}

impl Fetcher {
    /// Opens the port (retrying per `config.open_retries`/`open_retry_delay`)
    /// and spawns the read-loop thread. Fatal if every attempt fails.
    pub fn start(config: FetcherConfig) -> crate::error::Result<Self> {
        let mut last_err = None;
        let mut port = None;
        for attempt in 0..=config.open_retries {
            match serialport::new(&config.port, config.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .timeout(config.read_timeout)
                .open()
            {
                Ok(p) => {
                    port = Some(p);
                    break;
                }
                Err(e) => {
                    tlog!(
                        "[fetcher:{}] open attempt {}/{} failed: {}",
                        config.port,
                        attempt + 1,
                        config.open_retries + 1,
                        e
                    );
                    last_err = Some(e);
                    if attempt < config.open_retries {
                        std::thread::sleep(config.open_retry_delay);
                    }
                }
            }
        }

        let Some(mut port) = port else {
            return Err(crate::error::WiretapError::SerialOpenExhausted(
                config.port.clone(),
                config.open_retries + 1,
            ));
        };
        let _ = last_err;

        let (tx, rx) = mpsc::channel::<u8>();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_worker = stop_flag.clone();
        let port_label = config.port.clone();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            while !stop_flag_worker.load(Ordering::SeqCst) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            if tx.send(byte).is_err() {
                                return;
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        tlog!("[fetcher:{}] read error (continuing): {}", port_label, e);
                    }
                }
            }
        });

        Ok(Self {
            config,
            stop_flag,
            rx,
            handle: Some(handle),
        })
    }

    /// Non-blocking: drains every byte currently queued.
    pub fn drain(&self) -> Vec<u8> {
        self.rx.try_iter().collect()
    }

    pub fn port(&self) -> &str {
        &self.config.port
    }

    /// Signals the worker to exit and joins it (bounded by the caller via
    /// the Controller's overall shutdown timeout).
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_spec() {
        let cfg = FetcherConfig::new("/dev/ttyUSB0", 9600);
        assert_eq!(cfg.open_retries, 5);
        assert_eq!(cfg.open_retry_delay, Duration::from_secs(2));
        assert_eq!(cfg.read_timeout, Duration::from_secs(1));
    }
}
