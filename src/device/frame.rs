//! Servo frame codec.
//!
//! Command frame:   `AA 56 01` followed by `[id][angle×10 hi][angle×10 lo]` per servo.
//! Telemetry frame: `AA 56 81` followed by the same groups. A trailing incomplete group is padding
//! and is ignored.

use crate::device::constants::{COMMAND_HEADER, SERVO_GROUP_LEN, TELEMETRY_HEADER};
use crate::device::types::{AngleRange, ServoTarget, ServoTelemetryRecord};
use crate::error::FrameError;

const HEADER_LEN: usize = 3;
const MIN_TELEMETRY_LEN: usize = 4;

fn angle_to_tenths(angle: f32) -> u16 {
    // clamped angles are never negative, the cast saturates at u16::MAX for absurd ranges
    (angle * 10.0).round() as u16
}

pub fn encode_command(targets: &[ServoTarget], range: &AngleRange) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + SERVO_GROUP_LEN * targets.len());
    frame.extend_from_slice(&COMMAND_HEADER);

    for target in targets {
        let tenths = angle_to_tenths(range.clamp(target.angle));
        frame.push(target.servo_id);
        frame.extend_from_slice(&tenths.to_be_bytes());
    }

    frame
}

fn read_groups(body: &[u8]) -> Vec<ServoTelemetryRecord> {
    body.chunks_exact(SERVO_GROUP_LEN)
        .map(|group| ServoTelemetryRecord {
            servo_id: group[0],
            angle_tenths: u16::from_be_bytes([group[1], group[2]]),
        })
        .collect()
}

pub fn decode_telemetry(frame: &[u8]) -> Result<Vec<ServoTelemetryRecord>, FrameError> {
    if frame.len() < MIN_TELEMETRY_LEN || frame[..HEADER_LEN] != TELEMETRY_HEADER {
        return Err(FrameError::MalformedFrame { length: frame.len() });
    }

    Ok(read_groups(&frame[HEADER_LEN..]))
}

/// Reads back the raw `(servo id, tenths)` groups of a command frame.
pub fn parse_command(frame: &[u8]) -> Result<Vec<(u8, u16)>, FrameError> {
    if frame.len() < HEADER_LEN || frame[..HEADER_LEN] != COMMAND_HEADER {
        return Err(FrameError::MalformedFrame { length: frame.len() });
    }

    Ok(read_groups(&frame[HEADER_LEN..])
        .into_iter()
        .map(|record| (record.servo_id, record.angle_tenths))
        .collect())
}
