//! Confirmed-chain index: UTXO set, per-script history, tx numbering,
//! headers and undo records, with a writer-owned write-back cache.

pub mod cache;
pub mod error;
pub mod flush;
pub mod header;
pub mod history;
pub mod state;
pub mod store;
pub mod txnum;
pub mod undo;
pub mod utxo;
pub mod view;

/// Position of a confirmed transaction in chain order, starting at zero.
pub type TxNum = u64;

pub use error::ChainStateError;
pub use flush::{FlushController, FlushPolicy, FlushState};
pub use state::{Advance, ChainState, ChainStateConfig, FlushOutcome, RewindOutcome};
pub use store::{ChainBatch, ChainStore};
pub use utxo::UtxoRecord;
pub use view::{ChainSnapshot, ChainView};
