//! Discovery scanner: register range scan (chunked with binary subdivision
//! on exception) and unit-id scan (FC43 Read Device Identification with a
//! register-probe fallback). See SPEC_FULL.md §6.2.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

use crate::error::{Result, WiretapError};
use crate::logging::tlog;
use crate::modbus_tcp::reader::{coils_to_bytes, registers_to_bytes, RegisterType};

const MIN_CHUNK: u16 = 1;

#[derive(Clone, Debug)]
pub struct RegisterScanConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub register_type: RegisterType,
    pub start_address: u16,
    pub end_address: u16,
    pub max_chunk_size: u16,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct UnitIdScanConfig {
    pub host: String,
    pub port: u16,
    pub start_unit_id: u8,
    pub end_unit_id: u8,
    pub probe_register: u16,
    pub probe_register_type: RegisterType,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub unit_id: u8,
    pub vendor: Option<String>,
    pub product_code: Option<String>,
    pub revision: Option<String>,
}

/// Reads `[start_address, end_address]` in `max_chunk_size`-register blocks.
/// A chunk that raises a Modbus exception is binary-subdivided and retried
/// down to a single register before its sub-range is given up on, so one
/// unsupported address in the middle of a chunk doesn't sink the whole
/// block's worth of otherwise-readable registers.
pub async fn scan_registers(config: &RegisterScanConfig) -> Result<BTreeMap<u16, u8>> {
    if config.start_address > config.end_address {
        return Err(WiretapError::ModbusTcp(
            "start address must be <= end address".to_string(),
        ));
    }
    if config.max_chunk_size == 0 {
        return Err(WiretapError::ModbusTcp("chunk size must be > 0".to_string()));
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| WiretapError::ModbusTcp(format!("invalid address: {e}")))?;
    let mut ctx = tcp::connect_slave(addr, Slave(config.unit_id))
        .await
        .map_err(|e| WiretapError::ModbusTcp(format!("connect to {addr}: {e}")))?;

    let mut found: BTreeMap<u16, u8> = BTreeMap::new();
    let mut cursor = config.start_address;
    while cursor <= config.end_address {
        let quantity = config
            .max_chunk_size
            .min(config.end_address - cursor + 1);
        scan_chunk(&mut ctx, config, cursor, quantity, &mut found).await?;
        cursor = cursor.saturating_add(quantity);
        if quantity == 0 {
            break;
        }
    }

    Ok(found)
}

fn scan_chunk<'a>(
    ctx: &'a mut tokio_modbus::client::Context,
    config: &'a RegisterScanConfig,
    start: u16,
    quantity: u16,
    found: &'a mut BTreeMap<u16, u8>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        let read = tokio::time::timeout(
            config.request_timeout,
            read_typed(ctx, config.register_type, start, quantity),
        )
        .await
        .map_err(|_| WiretapError::ModbusTcp(format!("scan chunk {start}..+{quantity} timed out")))?;

        match read {
            Ok(Ok(bytes)) => {
                for (offset, byte) in bytes.into_iter().enumerate() {
                    found.insert(start + offset as u16, byte);
                }
                Ok(())
            }
            Ok(Err(_exception)) if quantity > MIN_CHUNK => {
                let half = quantity / 2;
                scan_chunk(ctx, config, start, half, found).await?;
                scan_chunk(ctx, config, start + half, quantity - half, found).await?;
                Ok(())
            }
            Ok(Err(exception)) => {
                tlog!(
                    "[modbus_scan] register {} unsupported: {}",
                    start,
                    exception
                );
                Ok(())
            }
            Err(transport_err) => Err(WiretapError::ModbusTcp(format!(
                "transport error scanning register {start}: {transport_err}"
            ))),
        }
    })
}

async fn read_typed(
    ctx: &mut tokio_modbus::client::Context,
    register_type: RegisterType,
    start: u16,
    quantity: u16,
) -> std::result::Result<std::result::Result<Vec<u8>, ExceptionCode>, std::io::Error> {
    match register_type {
        RegisterType::Holding => ctx
            .read_holding_registers(start, quantity)
            .await
            .map(|r| r.map(|regs| registers_to_bytes(&regs))),
        RegisterType::Input => ctx
            .read_input_registers(start, quantity)
            .await
            .map(|r| r.map(|regs| registers_to_bytes(&regs))),
        RegisterType::Coil => ctx
            .read_coils(start, quantity)
            .await
            .map(|r| r.map(|bits| coils_to_bytes(&bits))),
        RegisterType::Discrete => ctx
            .read_discrete_inputs(start, quantity)
            .await
            .map(|r| r.map(|bits| coils_to_bytes(&bits))),
    }
}

/// Probes every unit id in `[start_unit_id, end_unit_id]`. Tries FC43 (Read
/// Device Identification, "Basic" category) first; if the first attempt in
/// the scan comes back as a transport error (gateway doesn't speak FC43 at
/// all), FC43 is skipped for the rest of the scan and every unit id falls
/// back straight to the register probe.
pub async fn scan_unit_ids(config: &UnitIdScanConfig) -> Result<Vec<DeviceInfo>> {
    if config.start_unit_id > config.end_unit_id {
        return Err(WiretapError::ModbusTcp(
            "start unit id must be <= end unit id".to_string(),
        ));
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| WiretapError::ModbusTcp(format!("invalid address: {e}")))?;

    let mut found = Vec::new();
    let mut fc43_supported = true;

    for unit_id in config.start_unit_id..=config.end_unit_id {
        let mut ctx = match tcp::connect_slave(addr, Slave(unit_id)).await {
            Ok(ctx) => ctx,
            Err(_) => continue,
        };

        let mut info = None;
        if fc43_supported {
            match tokio::time::timeout(
                config.request_timeout,
                ctx.read_device_identification(ReadCode::Basic, 0x00),
            )
            .await
            {
                Ok(Ok(Ok(response))) => {
                    let mut device = DeviceInfo {
                        unit_id,
                        ..Default::default()
                    };
                    for obj in &response.device_id_objects {
                        let text = obj.value_as_str().map(String::from);
                        match obj.id {
                            0x00 => device.vendor = text,
                            0x01 => device.product_code = text,
                            0x02 => device.revision = text,
                            _ => {}
                        }
                    }
                    info = Some(device);
                }
                Ok(Ok(Err(_exception))) => {
                    // unit answered, doesn't implement FC43; register probe below
                }
                Ok(Err(_)) | Err(_) => {
                    tlog!(
                        "[modbus_scan] FC43 not supported by {}:{}, falling back to register probe for remaining unit ids",
                        config.host,
                        config.port
                    );
                    fc43_supported = false;
                }
            }
        }

        if info.is_none() {
            let probe = tokio::time::timeout(
                config.request_timeout,
                read_typed(&mut ctx, config.probe_register_type, config.probe_register, 1),
            )
            .await;
            if matches!(probe, Ok(Ok(Ok(_)))) {
                info = Some(DeviceInfo {
                    unit_id,
                    ..Default::default()
                });
            }
        }

        if let Some(device) = info {
            found.push(device);
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_scan_rejects_inverted_range() {
        let config = RegisterScanConfig {
            host: "127.0.0.1".into(),
            port: 502,
            unit_id: 1,
            register_type: RegisterType::Holding,
            start_address: 10,
            end_address: 5,
            max_chunk_size: 16,
            request_timeout: Duration::from_secs(1),
        };
        let result = block_on(scan_registers(&config));
        assert!(result.is_err());
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }
}
