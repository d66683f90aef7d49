//! # error
//!
//! why: typed failures for write-ahead logging and recovery
//! relations: returned by persister.rs and server.rs
//! what: WalError enum

use thiserror::Error;

use extentfs_extent::{ExtentError, ExtentId};

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A log or checkpoint file held bytes that do not parse as records.
    #[error("corrupt wal data: {0}")]
    Corrupt(String),

    /// A PUT reached the checkpoint for an inode that has no CREATE slot.
    /// Only the permanent root inode is exempt.
    #[error("checkpoint PUT for inode {inum} with no prior CREATE")]
    MissingCreate { inum: ExtentId },

    /// `begin` was called while a transaction was already open.
    #[error("a transaction is already open")]
    NestedTransaction,

    /// `commit` was called with no open transaction.
    #[error("no open transaction")]
    NoTransaction,

    #[error(transparent)]
    Extent(#[from] ExtentError),
}
