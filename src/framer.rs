//! Frame synchronizer and request/response correlator.
//!
//! One `Correlator` per serial port. Drains bytes handed up by that port's
//! Fetcher, maintains a rolling buffer, and turns the unframed, unsolicited
//! byte stream into validated `Pair`s. See SPEC_FULL.md §4.3.

use std::collections::VecDeque;

use chrono::{DateTime, Local};

use crate::crc;
use crate::model::{request_len, Pair};

/// Rolling buffer clears and the Fetcher for this port is restarted once it
/// grows past this many unframed bytes (the line is presumed garbled).
pub const WATCHDOG_BYTES: usize = 1000;

/// Oldest unclaimed candidate is evicted once the list would exceed this.
pub const UNCLAIMED_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Cold,
    Hot,
}

struct CommEntry {
    slave: u8,
    function: u8,
    last_seen: DateTime<Local>,
}

/// Outcome of a single `tick()` call.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub pairs: Vec<Pair>,
    pub watchdog_tripped: bool,
    /// (slave, function) targets whose mirrored data block the surrounding
    /// context should mark stale, per the clear-interval sweep.
    pub stale_targets: Vec<(u8, u8)>,
}

pub struct Correlator {
    port: String,
    buffer: VecDeque<u8>,
    unclaimed: Vec<Vec<u8>>,
    communications: std::collections::HashMap<String, CommEntry>,
    state: State,
}

impl Correlator {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            buffer: VecDeque::new(),
            unclaimed: Vec::new(),
            communications: std::collections::HashMap::new(),
            state: State::Cold,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_hot(&self) -> bool {
        self.state == State::Hot
    }

    /// Feeds newly fetched bytes in, mirrors/advances state, and returns
    /// everything this produced: zero or more Pairs, whether the watchdog
    /// tripped, and any communications targets that went stale.
    pub fn tick(
        &mut self,
        incoming: &[u8],
        now: DateTime<Local>,
        clear_interval: chrono::Duration,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        self.buffer.extend(incoming);

        if self.buffer.len() > WATCHDOG_BYTES {
            self.buffer.clear();
            self.unclaimed.clear();
            self.state = State::Cold;
            outcome.watchdog_tripped = true;
            return outcome;
        }

        if self.state == State::Hot {
            outcome.stale_targets = self.sweep_stale_communications(now, clear_interval);
        }

        loop {
            if self.buffer.len() > WATCHDOG_BYTES {
                self.buffer.clear();
                self.unclaimed.clear();
                self.state = State::Cold;
                outcome.watchdog_tripped = true;
                break;
            }

            let progressed = match self.state {
                State::Cold => self.cold_step(),
                State::Hot => match self.hot_step(now) {
                    HotStep::Pair(pair) => {
                        outcome.pairs.push(pair);
                        true
                    }
                    HotStep::Progressed => true,
                    HotStep::Wait => false,
                },
            };

            if !progressed {
                break;
            }
        }

        outcome
    }

    fn push_unclaimed(&mut self, request: Vec<u8>) {
        self.unclaimed.push(request);
        if self.unclaimed.len() > UNCLAIMED_CAP {
            self.unclaimed.remove(0);
        }
    }

    fn note_communication(&mut self, pair: &Pair, now: DateTime<Local>) {
        self.communications.insert(
            pair.uuid(),
            CommEntry {
                slave: pair.slave,
                function: pair.function,
                last_seen: now,
            },
        );
    }

    fn sweep_stale_communications(
        &mut self,
        now: DateTime<Local>,
        clear_interval: chrono::Duration,
    ) -> Vec<(u8, u8)> {
        let mut stale = Vec::new();
        for entry in self.communications.values_mut() {
            if now.signed_duration_since(entry.last_seen) >= clear_interval {
                stale.push((entry.slave, entry.function));
                entry.last_seen = now;
            }
        }
        stale
    }

    /// COLD: find the first validated request to establish sync. Returns
    /// whether the buffer was advanced (by one resync byte or a full frame).
    fn cold_step(&mut self) -> bool {
        if self.buffer.len() < 8 {
            return false;
        }
        let fc = self.buffer[1];
        let Some(len) = request_len(fc) else {
            self.buffer.pop_front();
            return true;
        };
        if self.buffer.len() < len {
            return false;
        }
        let candidate: Vec<u8> = self.buffer.iter().take(len).copied().collect();
        if crc::is_valid_frame(&candidate) {
            self.buffer.drain(..len);
            self.push_unclaimed(candidate);
            self.state = State::Hot;
            true
        } else {
            self.buffer.pop_front();
            true
        }
    }

    /// HOT: try to match the head of the buffer against an outstanding
    /// request's response shape before falling back to treating it as a
    /// new request.
    fn hot_step(&mut self, now: DateTime<Local>) -> HotStep {
        if self.buffer.len() < 2 {
            return HotStep::Wait;
        }
        let fc = self.buffer[1];
        if request_len(fc).is_none() {
            self.buffer.pop_front();
            return HotStep::Progressed;
        }

        let matched_idx = self.unclaimed.iter().position(|req| {
            req.len() >= 2 && req[0] == self.buffer[0] && req[1] == self.buffer[1]
        });

        let mut needs_more_data = false;
        if let Some(idx) = matched_idx {
            if self.buffer.len() >= 3 {
                let n = self.buffer[2] as usize;
                let total = n + 5;
                if self.buffer.len() >= total {
                    let candidate: Vec<u8> = self.buffer.iter().take(total).copied().collect();
                    if crc::is_valid_frame(&candidate) {
                        let request = self.unclaimed.remove(idx);
                        self.buffer.drain(..total);
                        let pair = Pair::new(self.port.clone(), request, candidate, now);
                        self.note_communication(&pair, now);
                        return HotStep::Pair(pair);
                    }
                    // CRC mismatch: coincidental prefix match, fall through
                    // to the request-attempt path below.
                } else {
                    needs_more_data = true;
                }
            } else {
                needs_more_data = true;
            }
        }

        let len = request_len(fc).expect("checked above");
        if self.buffer.len() >= len {
            let candidate: Vec<u8> = self.buffer.iter().take(len).copied().collect();
            if crc::is_valid_frame(&candidate) {
                self.buffer.drain(..len);
                self.push_unclaimed(candidate);
                return HotStep::Progressed;
            }
        }

        if needs_more_data {
            HotStep::Wait
        } else {
            self.buffer.pop_front();
            HotStep::Progressed
        }
    }
}

enum HotStep {
    Pair(Pair),
    Progressed,
    Wait,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Local> {
        // fixed instant: tests never depend on wall-clock flow, only on
        // comparisons against the same `now` value passed into tick().
        DateTime::<Local>::from(std::time::UNIX_EPOCH)
    }

    const DEFAULT_CLEAR_INTERVAL: i64 = 300;

    fn tick(c: &mut Correlator, bytes: &[u8]) -> TickOutcome {
        c.tick(bytes, now(), chrono::Duration::seconds(DEFAULT_CLEAR_INTERVAL))
    }

    #[test]
    fn scenario_1_happy_path_holding_registers() {
        let mut c = Correlator::new("/dev/ttyUSB0");
        let stream = [
            0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B, // request
            0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xFA, 0x9D, // response
        ];
        let outcome = tick(&mut c, &stream);
        assert_eq!(outcome.pairs.len(), 1);
        let pair = &outcome.pairs[0];
        assert_eq!(pair.slave, 1);
        assert_eq!(pair.function, 3);
        assert_eq!(pair.start_address, 0);
        assert_eq!(pair.end_address, 2);
        assert_eq!(pair.response_payload(), &[0x12, 0x34, 0x56, 0x78]);
        assert!(c.is_hot());
        assert_eq!(c.buffer_len(), 0);
    }

    #[test]
    fn scenario_2_resync_drops_garbage_prefix() {
        let mut c = Correlator::new("/dev/ttyUSB0");
        let mut stream = vec![0xFF, 0xAA];
        stream.extend_from_slice(&[
            0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B, 0x01, 0x03, 0x04, 0x12, 0x34, 0x56,
            0x78, 0xFA, 0x9D,
        ]);
        let outcome = tick(&mut c, &stream);
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].slave, 1);
    }

    #[test]
    fn scenario_3_interleaved_traffic_leaves_other_slave_outstanding() {
        let mut c = Correlator::new("/dev/ttyUSB0");
        let request1 = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
        let request2_body = [0x02u8, 0x03, 0x00, 0x10, 0x00, 0x01];
        let (lo, hi) = crc::crc16(&request2_body);
        let mut request2 = request2_body.to_vec();
        request2.push(lo);
        request2.push(hi);
        let response1 = [0x01u8, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xFA, 0x9D];

        let mut stream = request1.to_vec();
        stream.extend_from_slice(&request2);
        stream.extend_from_slice(&response1);

        let outcome = tick(&mut c, &stream);
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].slave, 1);
        assert_eq!(c.unclaimed.len(), 1);
        assert_eq!(c.unclaimed[0][0], 2);
    }

    #[test]
    fn scenario_4_buffer_overflow_trips_watchdog_and_resets_to_cold() {
        let mut c = Correlator::new("/dev/ttyUSB0");
        let garbage = vec![0x5Au8; 1001];
        let outcome = tick(&mut c, &garbage);
        assert!(outcome.watchdog_tripped);
        assert_eq!(c.buffer_len(), 0);
        assert!(!c.is_hot());
    }

    #[test]
    fn boundary_waits_for_full_request_before_consuming() {
        let mut c = Correlator::new("/dev/ttyUSB0");
        let outcome = tick(&mut c, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4]);
        assert!(outcome.pairs.is_empty());
        assert_eq!(c.buffer_len(), 7);
    }

    #[test]
    fn boundary_unknown_function_code_pops_one_byte() {
        let mut c = Correlator::new("/dev/ttyUSB0");
        let outcome = tick(&mut c, &[0x01, 0x99, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(outcome.pairs.is_empty());
        assert_eq!(c.buffer_len(), 7);
    }

    #[test]
    fn unclaimed_cap_evicts_oldest() {
        let mut c = Correlator::new("/dev/ttyUSB0");
        c.state = State::Hot;
        for slave in 0..25u8 {
            let body = [slave, 0x03, 0x00, 0x00, 0x00, 0x01];
            let (lo, hi) = crc::crc16(&body);
            let mut req = body.to_vec();
            req.push(lo);
            req.push(hi);
            tick(&mut c, &req);
        }
        assert_eq!(c.unclaimed.len(), UNCLAIMED_CAP);
        assert_eq!(c.unclaimed[0][0], 5);
    }
}
