use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::ConfigError;

/// Wire format carried by one data characteristic.
///
/// Bound once per registry entry and never inferred from payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    NineAxis,
    SixAxisTimestamped,
    IntervalDual,
    IntervalGrouped,
    Angle,
}

impl FromStr for PacketFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nine_axis" => Ok(PacketFormat::NineAxis),
            "six_axis" => Ok(PacketFormat::SixAxisTimestamped),
            "interval_dual" => Ok(PacketFormat::IntervalDual),
            "interval_grouped" => Ok(PacketFormat::IntervalGrouped),
            "angle" => Ok(PacketFormat::Angle),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

impl PacketFormat {
    /// Whether packets in this format carry a device timestamp.
    pub fn is_timestamped(self) -> bool {
        matches!(self, PacketFormat::SixAxisTimestamped | PacketFormat::Angle)
    }
}

/// One recognized device in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub name: String,
    pub characteristic: Uuid,
    pub format: PacketFormat,
}

/// A device seen during discovery whose advertised name is in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub name: String,
    pub address: String,
}

/// A live connection to a registry device.
#[derive(Debug, Clone)]
pub struct ConnectedDevice<H> {
    pub profile: DeviceProfile,
    pub handle: H,
    pub address: String,
}

/// One notification payload as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub device: String,
    pub bytes: Vec<u8>,
    /// Host milliseconds since connect when the packet was received.
    pub received_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NineAxisReading {
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
    pub mag: [i16; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SixAxisReading {
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
    /// Device-local milliseconds since the device booted.
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalReport {
    Dual { accel_gyro_ms: u32, mag_ms: u32 },
    Grouped { interval_ms: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AngleReading {
    pub timestamp_ms: i64,
    pub angles: Vec<f64>,
}

/// A decoded packet. The variant is fixed by the characteristic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedSample {
    NineAxis(NineAxisReading),
    SixAxis(SixAxisReading),
    Interval(IntervalReport),
    Angle(AngleReading),
}

impl DecodedSample {
    /// Device-local timestamp, for the variants that carry one.
    pub fn device_timestamp(&self) -> Option<i64> {
        match self {
            DecodedSample::SixAxis(r) => Some(i64::from(r.timestamp_ms)),
            DecodedSample::Angle(r) => Some(r.timestamp_ms),
            DecodedSample::NineAxis(_) | DecodedSample::Interval(_) => None,
        }
    }
}

/// A sample as kept in a device's series: the decoded payload plus its
/// host-relative timestamp when the variant is timestamped.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub aligned_ms: Option<i64>,
    pub sample: DecodedSample,
}

/// Ordered samples for one device over one streaming session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorSeries {
    pub device: String,
    pub samples: Vec<StoredSample>,
}

impl SensorSeries {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            samples: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A single export cell in the device's native units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Int(i64),
    Float(f64),
    Empty,
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Empty => Ok(()),
        }
    }
}

/// Lifecycle of one connect, stream, stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Streaming,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
