use std::fmt;

use hashxd_primitives::encoding::DecodeError;
use hashxd_storage::StoreError;

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Decode(DecodeError),
    /// The index and the chain disagree; continuing would corrupt derived state.
    Consistency(String),
    MissingUndo(u32),
    ForkTooDeep {
        fork_height: i32,
        min_height: i32,
    },
    /// The writer already hit a fatal fault and refuses further work.
    Poisoned(String),
}

impl ChainStateError {
    /// Fatal faults stop the writer; only storage I/O errors may be retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChainStateError::Store(_))
    }
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "store error: {err}"),
            ChainStateError::Decode(err) => write!(f, "decode error: {err}"),
            ChainStateError::Consistency(message) => write!(f, "consistency fault: {message}"),
            ChainStateError::MissingUndo(height) => write!(
                f,
                "consistency fault: missing undo record for height {height}; resync required"
            ),
            ChainStateError::ForkTooDeep {
                fork_height,
                min_height,
            } => write!(
                f,
                "fork point {fork_height} is below the retained undo window (lowest rewindable height {min_height}); resync required"
            ),
            ChainStateError::Poisoned(message) => {
                write!(f, "writer halted after fatal fault: {message}")
            }
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}
