pub mod config;
pub mod controller;
pub mod crc;
pub mod decoder;
pub mod error;
pub mod fetcher;
#[macro_use]
pub mod logging;
pub mod framer;
pub mod live_status;
pub mod measure_store;
pub mod model;
pub mod modbus_tcp;
pub mod raw_store;
