//! Hex helpers. Hashes are displayed byte-reversed, as upstream nodes print them.

use std::fmt;

use crate::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidChar,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidChar => write!(f, "invalid hex character"),
        }
    }
}

impl std::error::Error for HexError {}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        out.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>, HexError> {
    let input = input.trim();
    let raw = input.as_bytes();
    if raw.len() % 2 != 0 {
        return Err(HexError::InvalidLength);
    }
    let mut out = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        let high = nibble(pair[0])?;
        let low = nibble(pair[1])?;
        out.push((high << 4) | low);
    }
    Ok(out)
}

fn nibble(ch: u8) -> Result<u8, HexError> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        b'A'..=b'F' => Ok(ch - b'A' + 10),
        _ => Err(HexError::InvalidChar),
    }
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    bytes_to_hex(&reversed)
}

pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let bytes = hex_to_bytes(hex)?;
    let mut out = [0u8; 32];
    for (slot, byte) in out.iter_mut().zip(bytes.iter().rev()) {
        *slot = *byte;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_is_byte_reversed() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        hash[31] = 0xab;
        let hex = hash256_to_hex(&hash);
        assert!(hex.starts_with("ab"));
        assert!(hex.ends_with("01"));
        assert_eq!(hash256_from_hex(&hex), Ok(hash));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(hex_to_bytes("abc"), Err(HexError::InvalidLength));
        assert_eq!(hex_to_bytes("zz"), Err(HexError::InvalidChar));
        assert_eq!(hash256_from_hex("00"), Err(HexError::InvalidLength));
        assert_eq!(hex_to_bytes("0aFF"), Ok(vec![0x0a, 0xff]));
    }
}
