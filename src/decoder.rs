//! Decodes a correlated Pair's response payload into typed measures, per the
//! device mapping and template entries in effect for (port, slave).

use crate::model::{ByteWordOrder, DataType, DeviceMapping, Pair, ReadFunction, TemplateEntry};

/// One decoded measure, ready for the Measure Store.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub device_daq: String,
    pub measure_name: String,
    pub value: f64,
}

/// Decodes every template entry that falls inside `pair`'s address span.
/// Entries out of range are silently skipped (§4.4) — a later pair with a
/// wider span may pick them up.
pub fn decode(pair: &Pair, device: &DeviceMapping) -> Vec<Measure> {
    let payload = pair.response_payload();
    let mut measures = Vec::new();

    for entry in device.templates.iter() {
        if entry.address < pair.start_address || entry.address > pair.end_address {
            continue;
        }
        let Some(value) = decode_entry(entry, pair.start_address, payload) else {
            continue;
        };
        measures.push(Measure {
            device_daq: device.daq_name.to_string(),
            measure_name: entry.measure.clone(),
            value,
        });
    }

    measures
}

fn decode_entry(entry: &TemplateEntry, start: u16, payload: &[u8]) -> Option<f64> {
    if entry.function.is_register_read() {
        decode_register_entry(entry, start, payload)
    } else {
        decode_bit_entry(entry, start, payload)
    }
}

fn decode_register_entry(entry: &TemplateEntry, start: u16, payload: &[u8]) -> Option<f64> {
    let adjusted = (entry.address - start) as usize * 2;
    if adjusted >= payload.len() {
        return None;
    }
    let data_type = entry.data_type?;

    if data_type == DataType::Bitpacked16 {
        let word = payload.get(adjusted..adjusted + 2)?;
        let raw = u16::from_be_bytes([word[0], word[1]]);
        let bit = entry.bit?;
        return Some(if raw & (1 << bit) != 0 { 1.0 } else { 0.0 });
    }

    let width = match data_type {
        DataType::Int16 | DataType::Uint16 => 2,
        DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
        DataType::Bitpacked16 => unreachable!(),
    };
    let raw_bytes = payload.get(adjusted..adjusted + width)?;
    let ordered = reorder_bytes(raw_bytes, entry.byteword_order.unwrap_or(ByteWordOrder::BigByteBigWord));

    let raw_value = match data_type {
        DataType::Int16 => i16::from_be_bytes([ordered[0], ordered[1]]) as f64,
        DataType::Uint16 => u16::from_be_bytes([ordered[0], ordered[1]]) as f64,
        DataType::Int32 => {
            i32::from_be_bytes([ordered[0], ordered[1], ordered[2], ordered[3]]) as f64
        }
        DataType::Uint32 => {
            u32::from_be_bytes([ordered[0], ordered[1], ordered[2], ordered[3]]) as f64
        }
        DataType::Float32 => {
            f32::from_be_bytes([ordered[0], ordered[1], ordered[2], ordered[3]]) as f64
        }
        DataType::Bitpacked16 => unreachable!(),
    };

    Some(match &entry.scaling {
        Some(mode) => mode.apply(raw_value),
        None => raw_value,
    })
}

fn decode_bit_entry(entry: &TemplateEntry, start: u16, payload: &[u8]) -> Option<f64> {
    let adjusted = ((entry.address - start) / 8) as usize;
    let byte = *payload.get(adjusted)?;
    let bit_position = (entry.address - (start + (adjusted as u16) * 8)) as u32;
    Some(if byte & (1 << bit_position) != 0 { 1.0 } else { 0.0 })
}

/// Applies word-order then byte-within-register order, per
/// `E.byteword_order`. Two-byte values only swap byte order; four-byte
/// values swap both register (word) order and byte-within-register order.
fn reorder_bytes(raw: &[u8], order: ByteWordOrder) -> Vec<u8> {
    if raw.len() == 2 {
        return match order {
            ByteWordOrder::BigByteBigWord | ByteWordOrder::BigByteSmallWord => raw.to_vec(),
            ByteWordOrder::SmallByteBigWord | ByteWordOrder::SmallByteSmallWord => {
                vec![raw[1], raw[0]]
            }
        };
    }

    debug_assert_eq!(raw.len(), 4);
    let (reg0, reg1) = match order {
        ByteWordOrder::BigByteBigWord | ByteWordOrder::SmallByteBigWord => (&raw[0..2], &raw[2..4]),
        ByteWordOrder::BigByteSmallWord | ByteWordOrder::SmallByteSmallWord => {
            (&raw[2..4], &raw[0..2])
        }
    };
    let swap_bytes = matches!(
        order,
        ByteWordOrder::SmallByteBigWord | ByteWordOrder::SmallByteSmallWord
    );
    let mut out = Vec::with_capacity(4);
    for reg in [reg0, reg1] {
        if swap_bytes {
            out.push(reg[1]);
            out.push(reg[0]);
        } else {
            out.push(reg[0]);
            out.push(reg[1]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScaleMode;
    use std::sync::Arc;

    fn device_with(templates: Vec<TemplateEntry>) -> DeviceMapping {
        DeviceMapping {
            daq_name: Arc::from("inverter-1"),
            templates: Arc::new(templates),
        }
    }

    fn sample_pair() -> Pair {
        Pair::new(
            "/dev/ttyUSB0",
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
            vec![0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xFA, 0x9D],
            chrono::Local::now(),
        )
    }

    #[test]
    fn scenario_6_uint16_bigbyte_bigword() {
        let pair = sample_pair();
        let device = device_with(vec![TemplateEntry {
            measure: "voltage".into(),
            address: 0,
            function: ReadFunction::ReadHoldingRegisters,
            data_type: Some(DataType::Uint16),
            byteword_order: Some(ByteWordOrder::BigByteBigWord),
            bit: None,
            scaling: None,
        }]);
        let measures = decode(&pair, &device);
        assert_eq!(measures.len(), 1);
        assert_eq!(measures[0].value, 0x1234 as f64);
    }

    #[test]
    fn scaling_slope_intercept_matches_scenario_6() {
        let pair = sample_pair();
        let device = device_with(vec![TemplateEntry {
            measure: "power".into(),
            address: 0,
            function: ReadFunction::ReadHoldingRegisters,
            data_type: Some(DataType::Uint16),
            byteword_order: Some(ByteWordOrder::BigByteBigWord),
            bit: None,
            scaling: Some(ScaleMode::SlopeIntercept {
                slope: 0.1,
                offset: 5.0,
            }),
        }]);
        // raw = 0x1234 = 4660 -> 0.1*4660+5 = 471.0, not the spec's
        // standalone scaling example (raw=1000) but exercises the same path.
        let measures = decode(&pair, &device);
        assert_eq!(measures[0].value, 471.0);
    }

    #[test]
    fn out_of_range_entry_is_skipped() {
        let pair = sample_pair();
        let device = device_with(vec![TemplateEntry {
            measure: "unreachable".into(),
            address: 50,
            function: ReadFunction::ReadHoldingRegisters,
            data_type: Some(DataType::Uint16),
            byteword_order: None,
            bit: None,
            scaling: None,
        }]);
        assert!(decode(&pair, &device).is_empty());
    }

    #[test]
    fn bitpacked16_reads_raw_bit_with_no_endianness_conversion() {
        let pair = Pair::new(
            "/dev/ttyUSB0",
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00],
            vec![0x01, 0x03, 0x02, 0x00, 0x04, 0x00, 0x00],
            chrono::Local::now(),
        );
        let device = device_with(vec![TemplateEntry {
            measure: "running".into(),
            address: 0,
            function: ReadFunction::ReadHoldingRegisters,
            data_type: Some(DataType::Bitpacked16),
            byteword_order: None,
            bit: Some(2),
            scaling: None,
        }]);
        let measures = decode(&pair, &device);
        assert_eq!(measures[0].value, 1.0);
    }

    #[test]
    fn coil_bit_selection() {
        // payload byte 0 = 0b0000_0101 -> bits 0 and 2 set
        let pair = Pair::new(
            "/dev/ttyUSB0",
            vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00],
            vec![0x01, 0x01, 0x01, 0b0000_0101, 0x00, 0x00],
            chrono::Local::now(),
        );
        let device = device_with(vec![
            TemplateEntry {
                measure: "coil0".into(),
                address: 0,
                function: ReadFunction::ReadCoils,
                data_type: None,
                byteword_order: None,
                bit: None,
                scaling: None,
            },
            TemplateEntry {
                measure: "coil1".into(),
                address: 1,
                function: ReadFunction::ReadCoils,
                data_type: None,
                byteword_order: None,
                bit: None,
                scaling: None,
            },
        ]);
        let measures = decode(&pair, &device);
        assert_eq!(measures[0].value, 1.0);
        assert_eq!(measures[1].value, 0.0);
    }
}
