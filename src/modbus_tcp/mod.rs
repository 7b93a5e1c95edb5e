//! On-demand Modbus-TCP probes: an active register reader and a discovery
//! scanner. Neither touches the Raw Store, Measure Store, or live-status
//! files the passive wiretap pipeline writes to — these are synchronous,
//! caller-driven diagnostics, not a supervised background pipeline. See
//! SPEC_FULL.md §6.1/§6.2.
//!
//! Grounded in the teacher's `io/modbus_tcp/{reader,scanner}.rs`, stripped of
//! the Tauri `AppHandle`/event-emission layer that doesn't apply here: a
//! caller (the CLI) gets a return value instead of a stream of frontend
//! events.

pub mod reader;
pub mod scanner;

pub use reader::{PollGroup, PollResult, RegisterType, TcpReaderConfig};
pub use scanner::{scan_registers, scan_unit_ids, DeviceInfo, RegisterScanConfig, UnitIdScanConfig};
