//! Motor selection and direction masks
//!
//! Both masks are 7-bit fields where bit `k` stands for motor `k + 1`.
//! Operators write them as binary strings (`"0100000"` selects motor 6),
//! which map one-to-one onto the integer value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::MOTOR_COUNT;

/// Mask parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskError {
    #[error("Mask string is empty")]
    Empty,

    #[error("Mask has {0} digits (max: {})", MOTOR_COUNT)]
    TooLong(usize),

    #[error("Invalid mask digit '{0}' (expected 0 or 1)")]
    InvalidDigit(char),
}

pub type MaskResult<T> = Result<T, MaskError>;

/// A 7-bit motor mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MotorMask(u8);

impl MotorMask {
    const BITS: u8 = 0x7F;

    pub const NONE: MotorMask = MotorMask(0);
    pub const ALL: MotorMask = MotorMask(Self::BITS);

    /// Build a mask, discarding anything above bit 6
    pub fn new(bits: u8) -> Self {
        Self(bits & Self::BITS)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Mask containing a single motor (1-based); out-of-range motors yield an empty mask
    pub fn single(motor: u8) -> Self {
        if (1..=MOTOR_COUNT).contains(&motor) {
            Self(1 << (motor - 1))
        } else {
            Self::NONE
        }
    }

    /// Parse the binary-string notation, most significant bit first
    pub fn from_binary_str(s: &str) -> MaskResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MaskError::Empty);
        }
        if s.len() > MOTOR_COUNT as usize {
            return Err(MaskError::TooLong(s.len()));
        }

        let mut bits = 0u8;
        for c in s.chars() {
            let bit = match c {
                '0' => 0,
                '1' => 1,
                other => return Err(MaskError::InvalidDigit(other)),
            };
            bits = (bits << 1) | bit;
        }
        Ok(Self(bits))
    }

    /// Seven-digit binary string, most significant bit first
    pub fn to_binary_string(self) -> String {
        format!("{:07b}", self.0)
    }

    /// Whether the given motor (1-based) is set
    pub fn contains(self, motor: u8) -> bool {
        !self.intersect(Self::single(motor)).is_empty()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: MotorMask) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: MotorMask) -> Self {
        Self(self.0 & other.0)
    }

    /// Flip the bits covered by `selection`, leaving the rest untouched.
    ///
    /// Used on a direction mask to reverse a group: `direction XOR selection`.
    pub fn flipped_within(self, selection: MotorMask) -> Self {
        Self(self.0 ^ selection.0)
    }

    /// Motors (1-based) present in the mask, in ascending order
    pub fn motors(self) -> impl Iterator<Item = u8> {
        (1..=MOTOR_COUNT).filter(move |m| self.contains(*m))
    }

    /// The mask as carried in an f32 wire field
    pub fn as_f32(self) -> f32 {
        self.0 as f32
    }

    /// Recover a mask from an f32 wire field.
    ///
    /// The value is truncated toward zero and clamped to 7 bits; non-finite
    /// and negative values give an empty mask.
    pub fn from_f32_lossy(value: f32) -> Self {
        if !value.is_finite() || value < 0.0 {
            return Self::NONE;
        }
        Self::new(value.trunc().min(u8::MAX as f32) as u8)
    }
}

impl From<u8> for MotorMask {
    fn from(bits: u8) -> Self {
        Self::new(bits)
    }
}

impl FromStr for MotorMask {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_binary_str(s)
    }
}

impl TryFrom<String> for MotorMask {
    type Error = MaskError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_binary_str(&s)
    }
}

impl From<MotorMask> for String {
    fn from(mask: MotorMask) -> Self {
        mask.to_binary_string()
    }
}

impl fmt::Display for MotorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:07b}", self.0)
    }
}
