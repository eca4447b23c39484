/// Failure types for configuration, transport, decoding and export.
///
/// None of these abort a session: the controller turns transport and decode
/// failures into per-device reports and keeps going.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no IMU devices configured, set IMU_DEVICES or IMU_DEVICE_<N>_NAME/_CHARACTERISTIC/_FORMAT")]
    EmptyRegistry,
    #[error("malformed device entry '{0}', expected name=uuid:format")]
    MalformedEntry(String),
    #[error("unknown packet format '{0}'")]
    UnknownFormat(String),
    #[error("invalid characteristic id '{value}': {source}")]
    InvalidCharacteristic {
        value: String,
        #[source]
        source: uuid::Error,
    },
    #[error("device name '{0}' appears more than once")]
    DuplicateName(String),
    #[error("characteristic {0} is assigned to more than one device")]
    DuplicateCharacteristic(uuid::Uuid),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Errors surfaced by the wireless transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(uuid::Uuid),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("{0}")]
    Other(String),
}

/// A packet that could not be decoded. The packet is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("payload contains no fields")]
    Empty,
    #[error("field {index} ('{field}') is not a number")]
    Field { index: usize, field: String },
    #[error("device timestamp {0} ms cannot be placed on the session clock")]
    Timestamp(i64),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("reference timestamp '{0}' is not an integer")]
    ReferenceTimestamp(String),
    #[error("export task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
