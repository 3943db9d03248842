//! Protocol module - Defines the wire protocol spoken with the motor nodes
//!
//! Every datagram is a fixed 32-byte frame:
//! - 2 bytes header (`0x55 0xAA`)
//! - 29 bytes body: ctrl(1) + type(1) + six little-endian f32 fields(24) + reserved(3)
//! - 1 byte checksum (sum of the preceding 31 bytes, mod 256)

pub mod frame;
pub mod mask;
pub mod payload;
pub mod response;

pub use frame::FrameError;
pub use mask::{MaskError, MotorMask};
pub use payload::{Command, CommandCode, ControlMode, Direction};
pub use response::{MessageType, Telemetry, TelemetryRecord};

/// Fixed frame header
pub const HEADER: [u8; 2] = [0x55, 0xAA];

/// Total size of a frame on the wire
pub const FRAME_SIZE: usize = 32;

/// Size of the body carried inside a frame
pub const BODY_SIZE: usize = 29;

/// Number of f32 fields carried in a body
pub const FIELD_COUNT: usize = 6;

/// Address reserved for group/broadcast operations
pub const BROADCAST_ADDRESS: u8 = 0x7F;

/// Bit 7 of the ctrl byte: set for commands, clear for responses
pub const CTRL_COMMAND_FLAG: u8 = 0x80;

/// Bits 0-6 of the ctrl byte
pub const CTRL_ADDRESS_MASK: u8 = 0x7F;

/// Number of motors addressable through selection/direction masks
pub const MOTOR_COUNT: u8 = 7;

/// Default port the motor controller listens on
pub const DEFAULT_REMOTE_PORT: u16 = 9000;

/// Default local port telemetry is sent back to
pub const DEFAULT_LOCAL_PORT: u16 = 8081;

/// A 29-byte frame body
pub type Body = [u8; BODY_SIZE];

/// A complete 32-byte frame
pub type RawFrame = [u8; FRAME_SIZE];
