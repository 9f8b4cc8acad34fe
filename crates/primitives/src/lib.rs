//! Chain data types, their consensus serialization, and the script digests
//! used as index keys.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod hex;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub type Hash256 = [u8; 32];

pub use block::{Block, BlockHeader};
pub use hash::{sha256, sha256d};
pub use hex::{bytes_to_hex, hash256_from_hex, hash256_to_hex, hex_to_bytes, HexError};
pub use outpoint::OutPoint;
pub use script::{HashX, HASHX_LEN};
pub use transaction::{Transaction, TxIn, TxOut};
