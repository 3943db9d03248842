//! Frame codec for the fixed-length wire format
//!
//! Wraps a 29-byte body with the header and checksum, and strips them back
//! off inbound datagrams.

use thiserror::Error;

use super::{Body, RawFrame, BODY_SIZE, FRAME_SIZE, HEADER};

/// Frame codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid body length: {0} bytes (expected {})", BODY_SIZE)]
    InvalidBodyLength(usize),
}

pub type FrameResult<T> = Result<T, FrameError>;

/// Sum of all bytes, mod 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Wrap a body into a complete frame.
///
/// ```text
/// ┌────────────┬──────────────────┬──────────┐
/// │ 0x55 0xAA  │ body (29B)       │ sum (1B) │
/// └────────────┴──────────────────┴──────────┘
/// ```
pub fn wrap(body: &[u8]) -> FrameResult<RawFrame> {
    if body.len() != BODY_SIZE {
        return Err(FrameError::InvalidBodyLength(body.len()));
    }

    let mut frame = [0u8; FRAME_SIZE];
    frame[..2].copy_from_slice(&HEADER);
    frame[2..FRAME_SIZE - 1].copy_from_slice(body);
    frame[FRAME_SIZE - 1] = checksum(&frame[..FRAME_SIZE - 1]);
    Ok(frame)
}

/// Validate a frame and return its body.
///
/// Returns `None` when the buffer is not a frame: wrong length, header
/// mismatch or checksum mismatch. These are routine on a UDP port and are
/// only traced.
pub fn unwrap(frame: &[u8]) -> Option<Body> {
    if frame.len() != FRAME_SIZE {
        tracing::trace!("Dropping {} byte buffer: not a frame", frame.len());
        return None;
    }

    if frame[..2] != HEADER {
        tracing::trace!("Dropping frame with header {:02X} {:02X}", frame[0], frame[1]);
        return None;
    }

    let expected = checksum(&frame[..FRAME_SIZE - 1]);
    if expected != frame[FRAME_SIZE - 1] {
        tracing::trace!(
            "Dropping frame with checksum {:#04x} (expected {:#04x})",
            frame[FRAME_SIZE - 1],
            expected
        );
        return None;
    }

    let mut body = [0u8; BODY_SIZE];
    body.copy_from_slice(&frame[2..FRAME_SIZE - 1]);
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body() -> Body {
        let mut body = [0u8; BODY_SIZE];
        for (i, b) in body.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        body
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let body = sample_body();
        let frame = wrap(&body).unwrap();

        assert_eq!(frame.len(), FRAME_SIZE);
        assert_eq!(&frame[..2], &HEADER);
        assert_eq!(unwrap(&frame), Some(body));
    }

    #[test]
    fn test_checksum_is_sum_of_first_31_bytes() {
        let frame = wrap(&[0xFF; BODY_SIZE]).unwrap();
        let sum: u32 = frame[..31].iter().map(|b| *b as u32).sum();
        assert_eq!(frame[31], (sum % 256) as u8);
    }

    #[test]
    fn test_wrap_rejects_wrong_body_length() {
        assert_eq!(wrap(&[0u8; 28]), Err(FrameError::InvalidBodyLength(28)));
        assert_eq!(wrap(&[0u8; 30]), Err(FrameError::InvalidBodyLength(30)));
        assert_eq!(wrap(&[]), Err(FrameError::InvalidBodyLength(0)));
    }

    #[test]
    fn test_unwrap_rejects_wrong_length() {
        let frame = wrap(&sample_body()).unwrap();
        assert!(unwrap(&frame[..31]).is_none());
        assert!(unwrap(&[]).is_none());

        let mut long = frame.to_vec();
        long.push(0);
        assert!(unwrap(&long).is_none());
    }

    #[test]
    fn test_unwrap_rejects_bad_header() {
        let mut frame = wrap(&sample_body()).unwrap();
        frame[0] = 0xAA;
        frame[1] = 0x55;
        frame[31] = checksum(&frame[..31]);
        assert!(unwrap(&frame).is_none());
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let frame = wrap(&sample_body()).unwrap();

        for byte in 0..FRAME_SIZE {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[byte] ^= 1 << bit;
                assert!(
                    unwrap(&corrupted).is_none(),
                    "flip of bit {} in byte {} went undetected",
                    bit,
                    byte
                );
            }
        }
    }
}
