/// Binary packet decoders, one per wire format
///
/// Every decoder is a pure function over the payload. A packet that fails to
/// decode leaves nothing behind, so the next packet decodes from a clean slate.
use crate::error::DecodeError;
use crate::models::{
    AngleReading, DecodedSample, IntervalReport, NineAxisReading, PacketFormat, SixAxisReading,
};

const NINE_AXIS_LEN: usize = 18;
const SIX_AXIS_LEN: usize = 16;
const INTERVAL_DUAL_LEN: usize = 8;
const INTERVAL_GROUPED_LEN: usize = 4;

/// Decode a payload with the decoder bound to its characteristic.
pub fn decode(format: PacketFormat, data: &[u8]) -> Result<DecodedSample, DecodeError> {
    match format {
        PacketFormat::NineAxis => decode_nine_axis(data).map(DecodedSample::NineAxis),
        PacketFormat::SixAxisTimestamped => decode_six_axis(data).map(DecodedSample::SixAxis),
        PacketFormat::IntervalDual => decode_interval_dual(data).map(DecodedSample::Interval),
        PacketFormat::IntervalGrouped => {
            decode_interval_grouped(data).map(DecodedSample::Interval)
        }
        PacketFormat::Angle => decode_angle(data).map(DecodedSample::Angle),
    }
}

fn expect_len(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() != expected {
        return Err(DecodeError::Length {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn i16_at(data: &[u8], index: usize) -> i16 {
    i16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// 9 x i16 LE: accel x/y/z, gyro x/y/z, mag x/y/z.
pub fn decode_nine_axis(data: &[u8]) -> Result<NineAxisReading, DecodeError> {
    expect_len(data, NINE_AXIS_LEN)?;
    Ok(NineAxisReading {
        accel: [i16_at(data, 0), i16_at(data, 1), i16_at(data, 2)],
        gyro: [i16_at(data, 3), i16_at(data, 4), i16_at(data, 5)],
        mag: [i16_at(data, 6), i16_at(data, 7), i16_at(data, 8)],
    })
}

/// 6 x i16 LE (accel, gyro) followed by a u32 LE device timestamp in ms.
pub fn decode_six_axis(data: &[u8]) -> Result<SixAxisReading, DecodeError> {
    expect_len(data, SIX_AXIS_LEN)?;
    Ok(SixAxisReading {
        accel: [i16_at(data, 0), i16_at(data, 1), i16_at(data, 2)],
        gyro: [i16_at(data, 3), i16_at(data, 4), i16_at(data, 5)],
        timestamp_ms: u32_at(data, 12),
    })
}

pub fn decode_interval_dual(data: &[u8]) -> Result<IntervalReport, DecodeError> {
    expect_len(data, INTERVAL_DUAL_LEN)?;
    Ok(IntervalReport::Dual {
        accel_gyro_ms: u32_at(data, 0),
        mag_ms: u32_at(data, 4),
    })
}

pub fn decode_interval_grouped(data: &[u8]) -> Result<IntervalReport, DecodeError> {
    expect_len(data, INTERVAL_GROUPED_LEN)?;
    Ok(IntervalReport::Grouped {
        interval_ms: u32_at(data, 0),
    })
}

/// Whitespace-delimited text: device timestamp, then angle components.
///
/// The timestamp is device milliseconds since boot and shares the `u32` range
/// of the binary formats. Radio buffers are fixed size, so trailing NUL
/// padding is ignored.
pub fn decode_angle(data: &[u8]) -> Result<AngleReading, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::Utf8)?;
    let text = text.trim_end_matches('\0');
    let mut fields = text.split_whitespace();

    let first = fields.next().ok_or(DecodeError::Empty)?;
    let timestamp_ms = first
        .parse::<u32>()
        .map(i64::from)
        .map_err(|_| DecodeError::Field {
            index: 0,
            field: first.to_string(),
        })?;

    let angles = fields
        .enumerate()
        .map(|(i, field)| {
            field
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| DecodeError::Field {
                    index: i + 1,
                    field: field.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AngleReading {
        timestamp_ms,
        angles,
    })
}
