//! Script digests used as index keys.

use std::fmt;

use crate::hash::sha256;
use crate::hex::bytes_to_hex;
use crate::Hash256;

pub const HASHX_LEN: usize = 11;

const OP_RETURN: u8 = 0x6a;

/// Truncated `sha256(script_pubkey)`; the key every per-script table is indexed by.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HashX([u8; HASHX_LEN]);

impl HashX {
    pub const fn from_bytes(bytes: [u8; HASHX_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns `None` for provably unspendable (`OP_RETURN`) outputs, which are not indexed.
    pub fn from_script(script_pubkey: &[u8]) -> Option<Self> {
        if script_pubkey.first() == Some(&OP_RETURN) {
            return None;
        }
        Some(Self::from_script_hash(&sha256(script_pubkey)))
    }

    /// Truncates a full 32-byte script hash as clients address it.
    pub fn from_script_hash(script_hash: &Hash256) -> Self {
        let mut out = [0u8; HASHX_LEN];
        out.copy_from_slice(&script_hash[..HASHX_LEN]);
        Self(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; HASHX_LEN] = bytes.get(..HASHX_LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASHX_LEN] {
        &self.0
    }
}

impl fmt::Display for HashX {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bytes_to_hex(&self.0))
    }
}
