//! Active Modbus-TCP register reader. One connection, one or more poll
//! groups read once each, byte vectors out. See SPEC_FULL.md §6.1.

use std::net::SocketAddr;
use std::time::Duration;

use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;

use crate::error::{Result, WiretapError};
use crate::logging::tlog;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

/// One `(register_type, start_address, quantity)` unit of work.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct PollGroup {
    pub register_type: RegisterType,
    pub start_address: u16,
    pub quantity: u16,
}

#[derive(Clone, Debug)]
pub struct TcpReaderConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub request_timeout: Duration,
    /// Consecutive Modbus-exception responses tolerated for a single poll
    /// group before it is abandoned; a transport error aborts the whole
    /// operation regardless of this count.
    pub max_consecutive_errors: u32,
}

impl TcpReaderConfig {
    pub fn new(host: impl Into<String>, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port: 502,
            unit_id,
            request_timeout: Duration::from_secs(3),
            max_consecutive_errors: 3,
        }
    }
}

/// Outcome of one poll group: either the raw bytes it read, or the error
/// that poll group hit. Never fatal to the other poll groups in the batch.
#[derive(Debug)]
pub struct PollResult {
    pub poll: PollGroup,
    pub outcome: std::result::Result<Vec<u8>, String>,
}

/// Connects once and reads every poll group in order. A transport-level
/// error aborts the whole batch (the connection is unusable); a Modbus
/// exception is recorded against that poll group only and the batch
/// continues, per §6.1's error-kind distinction.
pub async fn read_all(config: &TcpReaderConfig, polls: &[PollGroup]) -> Result<Vec<PollResult>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| WiretapError::ModbusTcp(format!("invalid address: {e}")))?;

    let mut ctx = tcp::connect_slave(addr, Slave(config.unit_id))
        .await
        .map_err(|e| WiretapError::ModbusTcp(format!("connect to {addr}: {e}")))?;

    let mut results = Vec::with_capacity(polls.len());
    for poll in polls {
        let outcome = read_one(&mut ctx, config, poll).await?;
        results.push(PollResult {
            poll: poll.clone(),
            outcome,
        });
    }
    Ok(results)
}

async fn read_one(
    ctx: &mut Context,
    config: &TcpReaderConfig,
    poll: &PollGroup,
) -> Result<std::result::Result<Vec<u8>, String>> {
    let mut consecutive_errors = 0;
    loop {
        let read = tokio::time::timeout(
            config.request_timeout,
            dispatch_read(ctx, poll.register_type, poll.start_address, poll.quantity),
        )
        .await
        .map_err(|_| WiretapError::ModbusTcp(format!("{:?} poll timed out", poll.register_type)))?;

        match read {
            Ok(Ok(bytes)) => return Ok(Ok(bytes)),
            Ok(Err(exception)) => {
                consecutive_errors += 1;
                tlog!(
                    "[modbus_tcp] unit {} {:?}@{}: exception {} ({}/{})",
                    config.unit_id,
                    poll.register_type,
                    poll.start_address,
                    exception,
                    consecutive_errors,
                    config.max_consecutive_errors
                );
                if consecutive_errors >= config.max_consecutive_errors {
                    return Ok(Err(format!("modbus exception: {exception}")));
                }
            }
            Err(transport_err) => {
                return Err(WiretapError::ModbusTcp(format!(
                    "transport error reading unit {}: {}",
                    config.unit_id, transport_err
                )));
            }
        }
    }
}

async fn dispatch_read(
    ctx: &mut Context,
    register_type: RegisterType,
    start: u16,
    quantity: u16,
) -> std::result::Result<std::result::Result<Vec<u8>, ExceptionCode>, std::io::Error> {
    match register_type {
        RegisterType::Holding => match ctx.read_holding_registers(start, quantity).await {
            Ok(Ok(regs)) => Ok(Ok(registers_to_bytes(&regs))),
            Ok(Err(exc)) => Ok(Err(exc)),
            Err(e) => Err(e),
        },
        RegisterType::Input => match ctx.read_input_registers(start, quantity).await {
            Ok(Ok(regs)) => Ok(Ok(registers_to_bytes(&regs))),
            Ok(Err(exc)) => Ok(Err(exc)),
            Err(e) => Err(e),
        },
        RegisterType::Coil => match ctx.read_coils(start, quantity).await {
            Ok(Ok(bits)) => Ok(Ok(coils_to_bytes(&bits))),
            Ok(Err(exc)) => Ok(Err(exc)),
            Err(e) => Err(e),
        },
        RegisterType::Discrete => match ctx.read_discrete_inputs(start, quantity).await {
            Ok(Ok(bits)) => Ok(Ok(coils_to_bytes(&bits))),
            Ok(Err(exc)) => Ok(Err(exc)),
            Err(e) => Err(e),
        },
    }
}

/// Big-endian, two bytes per register — matches the passive decoder's own
/// register byte order so a caller can reuse one decode routine either way.
pub fn registers_to_bytes(regs: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(regs.len() * 2);
    for reg in regs {
        out.extend_from_slice(&reg.to_be_bytes());
    }
    out
}

/// LSB-first within each byte, per the Modbus-TCP coil/discrete wire
/// convention.
pub fn coils_to_bytes(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_to_bytes_is_big_endian() {
        assert_eq!(registers_to_bytes(&[0x1234, 0xABCD]), vec![0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn coils_to_bytes_packs_lsb_first() {
        let bits = vec![true, false, true, false, false, false, false, false, true];
        assert_eq!(coils_to_bytes(&bits), vec![0b0000_0101, 0b0000_0001]);
    }
}
