//! Signed variable-length integers.
//!
//! The first byte holds the 6 least significant bits of the magnitude, the sign in bit 6 and a
//! continuation flag in bit 7. Every following byte adds 7 more bits of magnitude, least
//! significant first, with its own continuation flag in bit 7.

use std::io;

const FIRST_MASK: u8 = 0x3f;
const SIGN_BIT: u8 = 0x40;
const CONT_BIT: u8 = 0x80;
const REST_MASK: u8 = 0x7f;

/// Why a varint could not be read.
#[derive(Debug, PartialEq, Eq)]
pub enum VarintError {
    /// The input ended while the continuation bit was still set.
    Truncated,
    /// The value does not fit in 64 bits.
    Overflow,
}

/// Write `value` to `writer`, returning the number of bytes written.
pub fn write<W: io::Write>(mut writer: W, value: i64) -> io::Result<usize> {
    let mut buf = [0u8; 10];
    let n = encode(value, &mut buf);
    writer.write_all(&buf[..n])?;
    Ok(n)
}

/// Encode `value` into `buf`, returning how many bytes were used. Ten bytes always suffice.
pub fn encode(value: i64, buf: &mut [u8; 10]) -> usize {
    let mut magnitude = value.unsigned_abs();

    let mut byte = (magnitude as u8) & FIRST_MASK;
    if value < 0 {
        byte |= SIGN_BIT;
    }
    magnitude >>= 6;
    if magnitude != 0 {
        byte |= CONT_BIT;
    }
    buf[0] = byte;

    let mut n = 1;
    while magnitude != 0 {
        let mut byte = (magnitude as u8) & REST_MASK;
        magnitude >>= 7;
        if magnitude != 0 {
            byte |= CONT_BIT;
        }
        buf[n] = byte;
        n += 1;
    }
    n
}

/// Decode a varint from the front of `bytes`, returning the value and the bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(i64, usize), VarintError> {
    let mut bytes = bytes.iter().copied();
    let mut next = || bytes.next().ok_or(VarintError::Truncated);
    let mut consumed = 0;
    let value = read_with(|| {
        consumed += 1;
        next()
    })?;
    Ok((value, consumed))
}

/// Assemble a varint out of bytes handed out one at a time by `next_byte`.
pub(crate) fn read_with<F, E>(mut next_byte: F) -> Result<i64, E>
where
    F: FnMut() -> Result<u8, E>,
    E: From<VarintError>,
{
    let first = next_byte()?;
    let negative = first & SIGN_BIT != 0;
    let mut magnitude = u64::from(first & FIRST_MASK);
    let mut shift = 6;
    let mut byte = first;

    while byte & CONT_BIT != 0 {
        byte = next_byte()?;
        let bits = u64::from(byte & REST_MASK);
        if shift >= 64 || (bits << shift) >> shift != bits {
            return Err(VarintError::Overflow.into());
        }
        magnitude |= bits << shift;
        shift += 7;
    }

    if negative {
        if magnitude > 1 << 63 {
            return Err(VarintError::Overflow.into());
        }
        // 2^63 wraps onto i64::MIN, which is exactly its negation
        Ok((magnitude as i64).wrapping_neg())
    } else if magnitude > i64::MAX as u64 {
        Err(VarintError::Overflow.into())
    } else {
        Ok(magnitude as i64)
    }
}
