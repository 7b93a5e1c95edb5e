//! Error types for the wiretap core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WiretapError {
    #[error("serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial port {0} failed to open after {1} attempts")]
    SerialOpenExhausted(String, u32),

    #[error("store I/O: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("config {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("modbus-tcp: {0}")]
    ModbusTcp(String),

    #[error("decode: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, WiretapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_wraps_rusqlite() {
        let sqlite_err = rusqlite::Error::InvalidQuery;
        let err: WiretapError = sqlite_err.into();
        assert!(matches!(err, WiretapError::Store(_)));
        assert!(err.to_string().starts_with("store I/O:"));
    }

    #[test]
    fn serial_open_exhausted_message() {
        let err = WiretapError::SerialOpenExhausted("/dev/ttyUSB0".to_string(), 5);
        assert_eq!(
            err.to_string(),
            "serial port /dev/ttyUSB0 failed to open after 5 attempts"
        );
    }
}
