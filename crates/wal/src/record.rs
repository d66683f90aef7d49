//! # record
//!
//! why: give every logged mutation a fixed binary form the replay can trust
//! relations: written/read by persister.rs, redone by server.rs
//! what: WalRecord enum, tag + little-endian codec
//!
//! wire format: `tag: u32, txid: u64`, then per-tag fields -
//! CREATE carries `type: u32, inum: u64`; PUT carries `inum: u64, len: i32,
//! bytes[len]`; REMOVE carries `inum: u64`; BEGIN/COMMIT carry nothing else.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use extentfs_extent::ExtentId;

/// Unique, monotonically increasing transaction identifier
pub type TxId = u64;

const TAG_BEGIN: u32 = 0;
const TAG_COMMIT: u32 = 1;
const TAG_CREATE: u32 = 2;
const TAG_PUT: u32 = 3;
const TAG_REMOVE: u32 = 4;

/// One record in the write-ahead log.
///
/// A transaction is the contiguous run from a BEGIN to its matching COMMIT;
/// anything after the last COMMIT is an unterminated tail and is discarded on
/// replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Begin { txid: TxId },
    Commit { txid: TxId },
    Create { txid: TxId, file_type: u32, inum: ExtentId },
    Put { txid: TxId, inum: ExtentId, data: Vec<u8> },
    Remove { txid: TxId, inum: ExtentId },
}

impl WalRecord {
    pub fn txid(&self) -> TxId {
        match *self {
            WalRecord::Begin { txid }
            | WalRecord::Commit { txid }
            | WalRecord::Create { txid, .. }
            | WalRecord::Put { txid, .. }
            | WalRecord::Remove { txid, .. } => txid,
        }
    }

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        match self {
            WalRecord::Begin { txid } => {
                out.write_u32::<LittleEndian>(TAG_BEGIN)?;
                out.write_u64::<LittleEndian>(*txid)?;
            }
            WalRecord::Commit { txid } => {
                out.write_u32::<LittleEndian>(TAG_COMMIT)?;
                out.write_u64::<LittleEndian>(*txid)?;
            }
            WalRecord::Create { txid, file_type, inum } => {
                out.write_u32::<LittleEndian>(TAG_CREATE)?;
                out.write_u64::<LittleEndian>(*txid)?;
                out.write_u32::<LittleEndian>(*file_type)?;
                out.write_u64::<LittleEndian>(*inum)?;
            }
            WalRecord::Put { txid, inum, data } => {
                out.write_u32::<LittleEndian>(TAG_PUT)?;
                out.write_u64::<LittleEndian>(*txid)?;
                out.write_u64::<LittleEndian>(*inum)?;
                out.write_i32::<LittleEndian>(data.len() as i32)?;
                out.write_all(data)?;
            }
            WalRecord::Remove { txid, inum } => {
                out.write_u32::<LittleEndian>(TAG_REMOVE)?;
                out.write_u64::<LittleEndian>(*txid)?;
                out.write_u64::<LittleEndian>(*inum)?;
            }
        }
        Ok(())
    }

    /// Read the next record. `Ok(None)` marks a clean end of stream; an
    /// UnexpectedEof error means the stream ends inside a record (a torn
    /// write, which recovery treats as the end of usable log).
    pub fn read_from(input: &mut impl Read) -> io::Result<Option<Self>> {
        let tag = match input.read_u32::<LittleEndian>() {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let txid = input.read_u64::<LittleEndian>()?;
        let record = match tag {
            TAG_BEGIN => WalRecord::Begin { txid },
            TAG_COMMIT => WalRecord::Commit { txid },
            TAG_CREATE => {
                let file_type = input.read_u32::<LittleEndian>()?;
                let inum = input.read_u64::<LittleEndian>()?;
                WalRecord::Create { txid, file_type, inum }
            }
            TAG_PUT => {
                let inum = input.read_u64::<LittleEndian>()?;
                let len = input.read_i32::<LittleEndian>()?;
                if len < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("negative PUT length {len}"),
                    ));
                }
                let mut data = vec![0u8; len as usize];
                input.read_exact(&mut data)?;
                WalRecord::Put { txid, inum, data }
            }
            TAG_REMOVE => {
                let inum = input.read_u64::<LittleEndian>()?;
                WalRecord::Remove { txid, inum }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown wal record tag {other}"),
                ))
            }
        };
        Ok(Some(record))
    }
}
