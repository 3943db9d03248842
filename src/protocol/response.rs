//! Response decoding
//!
//! Turns inbound 29-byte bodies into telemetry records. Decoders are looked
//! up by message type in a static table; types without an entry fall back to
//! a raw hex dump so that new firmware messages never break the receive path.

use bytes::Buf;
use serde::Serialize;
use thiserror::Error;

use super::{MotorMask, BODY_SIZE, CTRL_ADDRESS_MASK, CTRL_COMMAND_FLAG, FIELD_COUNT};

/// Field-level decode failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Field '{field}' is not a finite number ({value})")]
    NonFinite { field: &'static str, value: f32 },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Known response types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// PID parameter echo (0x01)
    PidEcho,
    /// Periodic status (0x04)
    Status,
    /// Status sent in reply to a control mode change (0x31)
    ModeStatus,
    /// Multi-motor sync acknowledgment (0x41)
    MultiMotorAck,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(MessageType::PidEcho),
            0x04 => Some(MessageType::Status),
            0x31 => Some(MessageType::ModeStatus),
            0x41 => Some(MessageType::MultiMotorAck),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MessageType::PidEcho => 0x01,
            MessageType::Status => 0x04,
            MessageType::ModeStatus => 0x31,
            MessageType::MultiMotorAck => 0x41,
        }
    }
}

/// Decoded payload of a response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Telemetry {
    Pid {
        p: f32,
        i: f32,
        d: f32,
        i_limit: f32,
        out_limit: f32,
        deadzone: f32,
    },
    Status {
        position: f32,
        velocity: f32,
        current: f32,
        voltage: f32,
        error_code: i32,
        state: i32,
    },
    /// The controller reports masks in f32 wire fields. They are kept as
    /// received; use [`Telemetry::applied_masks`] for the 7-bit view.
    MultiMotorAck {
        applied_selection: f32,
        applied_direction: f32,
        current_speed: f32,
    },
    /// Fallback for types without a registered decoder
    Raw { hex: String },
}

impl Telemetry {
    /// Selection and direction masks of a multi-motor ack, truncated to 7 bits
    pub fn applied_masks(&self) -> Option<(MotorMask, MotorMask)> {
        match self {
            Telemetry::MultiMotorAck {
                applied_selection,
                applied_direction,
                ..
            } => Some((
                MotorMask::from_f32_lossy(*applied_selection),
                MotorMask::from_f32_lossy(*applied_direction),
            )),
            _ => None,
        }
    }
}

/// A decoded inbound body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Motor (or group) address from the low 7 bits of ctrl
    pub address: u8,
    /// Raw type code
    #[serde(rename = "type")]
    pub type_code: u8,
    /// Set when the command flag is clear
    pub is_response: bool,
    pub data: Telemetry,
}

impl TelemetryRecord {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.type_code)
    }
}

type DecodeFn = fn(&[f32; FIELD_COUNT]) -> DecodeResult<Telemetry>;

/// Decoder registry; extend by adding a row
const DECODERS: &[(MessageType, DecodeFn)] = &[
    (MessageType::PidEcho, decode_pid),
    (MessageType::Status, decode_status),
    (MessageType::ModeStatus, decode_status),
    (MessageType::MultiMotorAck, decode_multi_motor_ack),
];

fn decoder_for(message_type: MessageType) -> Option<DecodeFn> {
    DECODERS
        .iter()
        .find(|(registered, _)| *registered == message_type)
        .map(|(_, decode)| *decode)
}

fn decode_pid(fields: &[f32; FIELD_COUNT]) -> DecodeResult<Telemetry> {
    let [p, i, d, i_limit, out_limit, deadzone] = *fields;
    Ok(Telemetry::Pid {
        p,
        i,
        d,
        i_limit,
        out_limit,
        deadzone,
    })
}

fn decode_status(fields: &[f32; FIELD_COUNT]) -> DecodeResult<Telemetry> {
    let [position, velocity, current, voltage, error_code, state] = *fields;
    Ok(Telemetry::Status {
        position,
        velocity,
        current,
        voltage,
        error_code: integral("error_code", error_code)?,
        state: integral("state", state)?,
    })
}

fn decode_multi_motor_ack(fields: &[f32; FIELD_COUNT]) -> DecodeResult<Telemetry> {
    let [applied_selection, applied_direction, current_speed, ..] = *fields;
    integral("applied_selection", applied_selection)?;
    integral("applied_direction", applied_direction)?;
    Ok(Telemetry::MultiMotorAck {
        applied_selection,
        applied_direction,
        current_speed,
    })
}

/// Integer carried in an f32 field, truncated toward zero
fn integral(field: &'static str, value: f32) -> DecodeResult<i32> {
    if !value.is_finite() {
        return Err(DecodeError::NonFinite { field, value });
    }
    Ok(value as i32)
}

/// Space-separated lowercase hex dump
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode a body into a telemetry record.
///
/// Returns `None` (after logging) when the body has the wrong length or a
/// known type carries fields that cannot be unpacked. Unknown types produce
/// a [`Telemetry::Raw`] record.
pub fn process(body: &[u8]) -> Option<TelemetryRecord> {
    if body.len() != BODY_SIZE {
        tracing::warn!("Body length error: expected {}, got {}", BODY_SIZE, body.len());
        return None;
    }

    let mut buf = body;
    let ctrl = buf.get_u8();
    let type_code = buf.get_u8();
    let mut fields = [0f32; FIELD_COUNT];
    for field in fields.iter_mut() {
        *field = buf.get_f32_le();
    }

    let address = ctrl & CTRL_ADDRESS_MASK;
    let is_response = ctrl & CTRL_COMMAND_FLAG == 0;

    let decoder = MessageType::from_code(type_code).and_then(decoder_for);
    let data = match decoder {
        Some(decode) => match decode(&fields) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    "Failed to decode type {:#04x} from address {}: {}",
                    type_code,
                    address,
                    e
                );
                return None;
            }
        },
        None => {
            tracing::debug!(
                "Unknown type {:#04x} from address {} | Raw: {}",
                type_code,
                address,
                hex_dump(body)
            );
            Telemetry::Raw {
                hex: hex_dump(body),
            }
        }
    };

    tracing::debug!("Decoded {:?} from address {}", data, address);

    Some(TelemetryRecord {
        address,
        type_code,
        is_response,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_pid_encode_decode_symmetry() {
        let body = payload::encode(2, false, 0x01, &[1.25, 0.5, 0.1, 100.0, 80.0, 0.02]);
        let record = process(&body).unwrap();

        assert_eq!(record.address, 2);
        assert!(record.is_response);
        assert_eq!(record.message_type(), Some(MessageType::PidEcho));
        match record.data {
            Telemetry::Pid {
                p,
                i,
                d,
                i_limit,
                out_limit,
                deadzone,
            } => {
                assert!(approx(p, 1.25));
                assert!(approx(i, 0.5));
                assert!(approx(d, 0.1));
                assert!(approx(i_limit, 100.0));
                assert!(approx(out_limit, 80.0));
                assert!(approx(deadzone, 0.02));
            }
            other => panic!("Wrong telemetry: {:?}", other),
        }
    }

    #[test]
    fn test_status_types() {
        for code in [0x04, 0x31] {
            let body = payload::encode(5, false, code, &[12.5, -3.0, 0.75, 24.1, 2.0, 1.9]);
            let record = process(&body).unwrap();
            assert_eq!(
                record.data,
                Telemetry::Status {
                    position: 12.5,
                    velocity: -3.0,
                    current: 0.75,
                    voltage: 24.1,
                    error_code: 2,
                    state: 1,
                }
            );
        }
    }

    #[test]
    fn test_multi_motor_ack_masks() {
        let body = payload::encode(0x7F, false, 0x41, &[96.0, 32.0, 512.0]);
        let record = process(&body).unwrap();

        assert_eq!(record.address, 0x7F);
        let (selection, direction) = record.data.applied_masks().unwrap();
        assert_eq!(selection.bits(), 0b1100000);
        assert_eq!(direction.bits(), 0b0100000);
    }

    #[test]
    fn test_unknown_type_falls_back_to_raw() {
        let body = payload::encode(1, false, 0x99, &[1.0]);
        let record = process(&body).unwrap();

        assert_eq!(record.message_type(), None);
        match record.data {
            Telemetry::Raw { hex } => {
                assert!(hex.starts_with("01 99 00 00 80 3f"));
                assert_eq!(hex.split(' ').count(), BODY_SIZE);
            }
            other => panic!("Wrong telemetry: {:?}", other),
        }
    }

    #[test]
    fn test_command_flag_marks_non_response() {
        let body = payload::encode(3, true, 0x04, &[]);
        let record = process(&body).unwrap();
        assert!(!record.is_response);
    }

    #[test]
    fn test_wrong_length_yields_none() {
        assert!(process(&[0u8; 28]).is_none());
        assert!(process(&[0u8; 30]).is_none());
    }

    #[test]
    fn test_non_finite_status_field_yields_none() {
        let body = payload::encode(1, false, 0x04, &[0.0, 0.0, 0.0, 0.0, f32::NAN, 0.0]);
        assert!(process(&body).is_none());

        let body = payload::encode(1, false, 0x41, &[f32::INFINITY, 0.0, 0.0]);
        assert!(process(&body).is_none());
    }

    #[test]
    fn test_record_serializes_to_json() {
        let body = payload::encode(3, false, 0x01, &[1.0, 2.0, 3.0]);
        let record = process(&body).unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["address"], 3);
        assert_eq!(json["type"], 1);
        assert_eq!(json["data"]["kind"], "pid");
        assert_eq!(json["data"]["p"], 1.0);
    }
}
