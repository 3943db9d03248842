//! Command payload encoding
//!
//! Builds the 29-byte bodies for every command the motor controller accepts.
//! Encoding is total: ranges (speed limits, valid addresses) are checked by
//! the caller, never here.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use super::{
    Body, MotorMask, BODY_SIZE, BROADCAST_ADDRESS, CTRL_ADDRESS_MASK, CTRL_COMMAND_FLAG,
    FIELD_COUNT,
};

/// Size of the zeroed tail of every body
const RESERVED_SIZE: usize = 3;

/// Command type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    MotorStart = 0x11,
    MotorStop = 0x12,
    SetDirection = 0x13,
    SetSpeed = 0x14,
    SetTargetAngle = 0x21,
    SetPid = 0x22,
    SetControlMode = 0x31,
    SyncMove = 0x41,
    SyncStop = 0x42,
}

impl CommandCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x11 => Some(CommandCode::MotorStart),
            0x12 => Some(CommandCode::MotorStop),
            0x13 => Some(CommandCode::SetDirection),
            0x14 => Some(CommandCode::SetSpeed),
            0x21 => Some(CommandCode::SetTargetAngle),
            0x22 => Some(CommandCode::SetPid),
            0x31 => Some(CommandCode::SetControlMode),
            0x41 => Some(CommandCode::SyncMove),
            0x42 => Some(CommandCode::SyncStop),
            _ => None,
        }
    }
}

/// Rotation direction (0 = reverse, 1 = forward on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Reverse = 0,
    Forward = 1,
}

impl Direction {
    pub fn from_forward(is_forward: bool) -> Self {
        if is_forward {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }
}

/// Motor control loop (0 = open loop, 1 = closed loop on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlMode {
    OpenLoop = 0,
    ClosedLoop = 1,
}

impl ControlMode {
    pub fn from_closed_loop(is_closed_loop: bool) -> Self {
        if is_closed_loop {
            ControlMode::ClosedLoop
        } else {
            ControlMode::OpenLoop
        }
    }
}

/// Encode a body from its raw parts.
///
/// The address is masked to 7 bits, bit 7 of ctrl carries `is_command`,
/// `fields` is zero-padded (or truncated) to six little-endian f32 values and
/// the reserved tail is zeroed.
pub fn encode(address: u8, is_command: bool, type_code: u8, fields: &[f32]) -> Body {
    let flag = if is_command { CTRL_COMMAND_FLAG } else { 0 };
    let ctrl = flag | (address & CTRL_ADDRESS_MASK);

    let mut buf = BytesMut::with_capacity(BODY_SIZE);
    buf.put_u8(ctrl);
    buf.put_u8(type_code);
    for i in 0..FIELD_COUNT {
        buf.put_f32_le(fields.get(i).copied().unwrap_or(0.0));
    }
    buf.put_bytes(0, RESERVED_SIZE);

    let mut body = [0u8; BODY_SIZE];
    body.copy_from_slice(&buf);
    body
}

/// A command addressed to one motor, or to the group for sync commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    MotorStart,
    MotorStop,
    SetDirection(Direction),
    SetSpeed(f32),
    SetTargetAngle(f32),
    SetPid { p: f32, i: f32, d: f32 },
    SetControlMode(ControlMode),
    SyncMove {
        selection: MotorMask,
        direction: MotorMask,
        speed: f32,
    },
    SyncStop,
}

impl Command {
    /// Get the command type code
    pub fn code(&self) -> CommandCode {
        match self {
            Command::MotorStart => CommandCode::MotorStart,
            Command::MotorStop => CommandCode::MotorStop,
            Command::SetDirection(_) => CommandCode::SetDirection,
            Command::SetSpeed(_) => CommandCode::SetSpeed,
            Command::SetTargetAngle(_) => CommandCode::SetTargetAngle,
            Command::SetPid { .. } => CommandCode::SetPid,
            Command::SetControlMode(_) => CommandCode::SetControlMode,
            Command::SyncMove { .. } => CommandCode::SyncMove,
            Command::SyncStop => CommandCode::SyncStop,
        }
    }

    /// Group commands always go to the broadcast address
    pub fn is_group(&self) -> bool {
        matches!(self, Command::SyncMove { .. } | Command::SyncStop)
    }

    /// The f32 fields carried by this command, in wire order
    pub fn fields(&self) -> Vec<f32> {
        match *self {
            Command::MotorStart | Command::MotorStop | Command::SyncStop => Vec::new(),
            Command::SetDirection(direction) => vec![direction as u8 as f32],
            Command::SetSpeed(speed) => vec![speed],
            Command::SetTargetAngle(angle) => vec![angle],
            Command::SetPid { p, i, d } => vec![p, i, d],
            Command::SetControlMode(mode) => vec![mode as u8 as f32],
            Command::SyncMove {
                selection,
                direction,
                speed,
            } => vec![selection.as_f32(), direction.as_f32(), speed],
        }
    }

    /// Parse a command body back into its address and command.
    ///
    /// This is the device side of [`Command::encode`]. Returns `None` for
    /// bodies of the wrong length, bodies without the command flag and
    /// unknown type codes. Direction and mode fields are nonzero-is-set.
    pub fn decode(body: &[u8]) -> Option<(u8, Command)> {
        if body.len() != BODY_SIZE {
            return None;
        }

        let mut buf = body;
        let ctrl = buf.get_u8();
        if ctrl & CTRL_COMMAND_FLAG == 0 {
            return None;
        }
        let code = CommandCode::from_u8(buf.get_u8())?;

        let mut fields = [0f32; FIELD_COUNT];
        for field in fields.iter_mut() {
            *field = buf.get_f32_le();
        }

        let command = match code {
            CommandCode::MotorStart => Command::MotorStart,
            CommandCode::MotorStop => Command::MotorStop,
            CommandCode::SetDirection => {
                Command::SetDirection(Direction::from_forward(fields[0] != 0.0))
            }
            CommandCode::SetSpeed => Command::SetSpeed(fields[0]),
            CommandCode::SetTargetAngle => Command::SetTargetAngle(fields[0]),
            CommandCode::SetPid => Command::SetPid {
                p: fields[0],
                i: fields[1],
                d: fields[2],
            },
            CommandCode::SetControlMode => {
                Command::SetControlMode(ControlMode::from_closed_loop(fields[0] != 0.0))
            }
            CommandCode::SyncMove => Command::SyncMove {
                selection: MotorMask::from_f32_lossy(fields[0]),
                direction: MotorMask::from_f32_lossy(fields[1]),
                speed: fields[2],
            },
            CommandCode::SyncStop => Command::SyncStop,
        };

        Some((ctrl & CTRL_ADDRESS_MASK, command))
    }

    /// Encode into a body. Group commands ignore `address`.
    pub fn encode(&self, address: u8) -> Body {
        let address = if self.is_group() {
            BROADCAST_ADDRESS
        } else {
            address
        };
        encode(address, true, self.code().as_u8(), &self.fields())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::MotorStart => write!(f, "start"),
            Command::MotorStop => write!(f, "stop"),
            Command::SetDirection(Direction::Forward) => write!(f, "direction: forward"),
            Command::SetDirection(Direction::Reverse) => write!(f, "direction: reverse"),
            Command::SetSpeed(speed) => write!(f, "speed: {}", speed),
            Command::SetTargetAngle(angle) => write!(f, "target angle: {:.2}", angle),
            Command::SetPid { p, i, d } => write!(f, "PID: P={} I={} D={}", p, i, d),
            Command::SetControlMode(ControlMode::OpenLoop) => write!(f, "mode: open loop"),
            Command::SetControlMode(ControlMode::ClosedLoop) => write!(f, "mode: closed loop"),
            Command::SyncMove {
                selection,
                direction,
                speed,
            } => write!(
                f,
                "sync move: selection {} direction {} speed {}",
                selection, direction, speed
            ),
            Command::SyncStop => write!(f, "sync stop"),
        }
    }
}

/// 0x11: start turning
pub fn motor_start(address: u8) -> Body {
    Command::MotorStart.encode(address)
}

/// 0x12: stop turning
pub fn motor_stop(address: u8) -> Body {
    Command::MotorStop.encode(address)
}

/// 0x13: change direction
pub fn motor_direction(address: u8, direction: Direction) -> Body {
    Command::SetDirection(direction).encode(address)
}

/// 0x14: change speed
pub fn motor_speed(address: u8, speed: f32) -> Body {
    Command::SetSpeed(speed).encode(address)
}

/// 0x21: set the target angle
pub fn set_target_angle(address: u8, angle: f32) -> Body {
    Command::SetTargetAngle(angle).encode(address)
}

/// 0x22: set PID gains
pub fn set_pid(address: u8, p: f32, i: f32, d: f32) -> Body {
    Command::SetPid { p, i, d }.encode(address)
}

/// 0x31: switch between open and closed loop
pub fn set_control_mode(address: u8, mode: ControlMode) -> Body {
    Command::SetControlMode(mode).encode(address)
}

/// 0x41: move the selected motors together, sent to the broadcast address
pub fn multi_motor_move(selection: MotorMask, direction: MotorMask, speed: f32) -> Body {
    Command::SyncMove {
        selection,
        direction,
        speed,
    }
    .encode(BROADCAST_ADDRESS)
}

/// 0x42: stop every motor in a sync move
pub fn multi_motor_stop() -> Body {
    Command::SyncStop.encode(BROADCAST_ADDRESS)
}
