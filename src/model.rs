//! Core data model shared across the fetcher, framer, decoder, and stores.

use std::collections::HashMap;
use std::sync::Arc;

/// Maps a Modbus function code to the fixed length (bytes, CRC included) of
/// a *request* carrying that function code. Only the function codes this
/// system can frame without a preceding length byte are listed; any other
/// byte following a slave address invalidates that buffer position.
pub fn request_len(fc: u8) -> Option<usize> {
    match fc {
        0x01 | 0x02 | 0x03 | 0x04 | 0x05 | 0x06 => Some(8),
        0x0F => Some(11),
        0x10 => Some(13),
        _ => None,
    }
}

/// A validated (request, response) pair, as handed from the Framer/Correlator
/// to the Decoder and the Controller's raw-pair queue.
#[derive(Debug, Clone)]
pub struct Pair {
    pub port: String,
    pub slave: u8,
    pub function: u8,
    pub start_address: u16,
    pub end_address: u16,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub timestamp: chrono::DateTime<chrono::Local>,
}

impl Pair {
    /// Builds a Pair from a matched (request, response) byte span, deriving
    /// slave/function/start/end from the request header per §4.3's emit rule.
    pub fn new(
        port: impl Into<String>,
        request: Vec<u8>,
        response: Vec<u8>,
        timestamp: chrono::DateTime<chrono::Local>,
    ) -> Self {
        let slave = request[0];
        let function = request[1];
        let start_address = u16::from_be_bytes([request[2], request[3]]);
        let count = u16::from_be_bytes([request[4], request[5]]);
        Self {
            port: port.into(),
            slave,
            function,
            start_address,
            end_address: start_address + count,
            request,
            response,
            timestamp,
        }
    }

    /// `concat(request payload bytes as hex) || (slave*1000 + fc) || port`
    ///
    /// Kept textual and concatenative on purpose (see DESIGN.md) to match
    /// the on-disk key shape of the system this one supersedes; collisions
    /// between adjacent request payloads that happen to share
    /// `slave*1000+fc` are a known, documented residual risk, not masked by
    /// switching to a hash.
    pub fn uuid(&self) -> String {
        // request[2..len-2]: start/quantity payload, excluding addr+fc header
        // and the trailing 2-byte CRC.
        let payload = if self.request.len() >= 4 {
            &self.request[2..self.request.len() - 2]
        } else {
            &self.request[..]
        };
        let mut uuid = hex::encode_upper(payload);
        uuid.push_str(&((self.slave as u32) * 1000 + self.function as u32).to_string());
        uuid.push_str(&self.port);
        uuid
    }

    /// Payload of the response: everything after addr+fc+bytecount, up to
    /// but excluding the trailing 2-byte CRC.
    pub fn response_payload(&self) -> &[u8] {
        let len = self.response.len();
        if len <= 5 {
            return &[];
        }
        &self.response[3..len - 2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Bitpacked16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum ByteWordOrder {
    #[serde(rename = "bigByte_bigWord")]
    BigByteBigWord,
    #[serde(rename = "bigByte_smallWord")]
    BigByteSmallWord,
    #[serde(rename = "smallByte_bigWord")]
    SmallByteBigWord,
    #[serde(rename = "smallByte_smallWord")]
    SmallByteSmallWord,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "scale_mode", rename_all = "snake_case")]
pub enum ScaleMode {
    SlopeIntercept { slope: f64, offset: f64 },
    PointSlope {
        target_min: f64,
        target_max: f64,
        value_min: f64,
        value_max: f64,
    },
}

impl ScaleMode {
    pub fn apply(&self, raw: f64) -> f64 {
        match *self {
            ScaleMode::SlopeIntercept { slope, offset } => round_to(slope * raw + offset, 2),
            ScaleMode::PointSlope {
                target_min,
                target_max,
                value_min,
                value_max,
            } => {
                let scaled = (target_max - target_min) / (value_max - value_min) * (raw - value_min)
                    + target_min;
                scaled.round()
            }
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadFunction {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
}

impl ReadFunction {
    pub fn is_register_read(self) -> bool {
        matches!(
            self,
            ReadFunction::ReadHoldingRegisters | ReadFunction::ReadInputRegisters
        )
    }
}

/// One measure definition from `sos_templates_modbus.json`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TemplateEntry {
    pub measure: String,
    pub address: u16,
    pub function: ReadFunction,
    #[serde(default)]
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub byteword_order: Option<ByteWordOrder>,
    #[serde(default)]
    pub bit: Option<u8>,
    #[serde(default)]
    pub scaling: Option<ScaleMode>,
}

/// `port -> slave_id -> (device_daq_name, templates)`, published atomically
/// by the Controller whenever `site_devices.json`/`sos_templates_modbus.json`
/// change (see `config::Mapping` consumers via `arc_swap::ArcSwap`).
pub type Mapping = HashMap<String, HashMap<u8, DeviceMapping>>;

#[derive(Debug, Clone)]
pub struct DeviceMapping {
    pub daq_name: Arc<str>,
    pub templates: Arc<Vec<TemplateEntry>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lengths_match_function_code_table() {
        for fc in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06] {
            assert_eq!(request_len(fc), Some(8));
        }
        assert_eq!(request_len(0x0F), Some(11));
        assert_eq!(request_len(0x10), Some(13));
        assert_eq!(request_len(0x07), None);
    }

    fn sample_pair() -> Pair {
        Pair {
            port: "/dev/ttyUSB0".into(),
            slave: 1,
            function: 3,
            start_address: 0,
            end_address: 2,
            request: vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
            response: vec![0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xFA, 0x9D],
            timestamp: chrono::Local::now(),
        }
    }

    #[test]
    fn uuid_matches_the_documented_shape() {
        let pair = sample_pair();
        // request[2..-2] = 00 00 00 02 -> "00000002"; slave*1000+fc = 1003
        assert_eq!(pair.uuid(), "00000002" .to_string() + "1003" + "/dev/ttyUSB0");
    }

    #[test]
    fn response_payload_strips_header_and_crc() {
        let pair = sample_pair();
        assert_eq!(pair.response_payload(), &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn scaling_slope_intercept_rounds_to_two_places() {
        let mode = ScaleMode::SlopeIntercept {
            slope: 0.1,
            offset: 5.0,
        };
        assert_eq!(mode.apply(1000.0), 105.0);
    }

    #[test]
    fn scaling_point_slope_rounds_to_integer() {
        let mode = ScaleMode::PointSlope {
            target_min: 0.0,
            target_max: 100.0,
            value_min: 0.0,
            value_max: 4095.0,
        };
        assert_eq!(mode.apply(2048.0), 50.0);
    }
}
