//! Heart Rate Measurement characteristic decoding.
//!
//! The first byte carries flags. Bit 0 selects the width of the heart-rate
//! field that follows: clear for a `u8`, set for a little-endian `u16`.
//! The remaining flag bits (sensor contact, energy expended, RR intervals)
//! describe trailing fields this decoder does not need.

use crate::error::DecodeError;

const FLAG_HR_FORMAT_U16: u8 = 0x01;

/// Decode the heart rate in beats per minute from a raw notification.
pub fn decode(payload: &[u8]) -> Result<u16, DecodeError> {
    let Some(&flags) = payload.first() else {
        return Err(DecodeError::Empty);
    };

    if flags & FLAG_HR_FORMAT_U16 == 0 {
        match payload.get(1) {
            Some(&hr) => Ok(u16::from(hr)),
            None => Err(DecodeError::TooShort { needed: 2, got: payload.len() }),
        }
    } else {
        match payload.get(1..3) {
            Some(&[lo, hi]) => Ok(u16::from_le_bytes([lo, hi])),
            _ => Err(DecodeError::TooShort { needed: 3, got: payload.len() }),
        }
    }
}
