//! # extentfs-wal
//!
//! why: single-node durability for the extent store, without consensus
//! relations: builds on extentfs-extent's ExtentStore; the replicated variant
//!            lives in extentfs-extent instead
//! what: write-ahead log records, persister with checkpoint folding, and the
//!       transactional server that brackets every mutation in a transaction

pub mod error;
pub mod persister;
pub mod record;
pub mod server;

pub use error::WalError;
pub use persister::Persister;
pub use record::{TxId, WalRecord};
pub use server::TransactionalExtentServer;
