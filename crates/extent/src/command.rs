//! # command
//!
//! why: give replicated extent operations a fixed binary wire form
//! relations: encoded into raft log entries, decoded by state_machine.rs
//! what: Command enum, tag-byte codec
//!
//! wire format: one tag byte, then little-endian fields -
//! CREATE carries `type: u32`; PUT carries `id: u64, len: i32, bytes[len]`;
//! GET / GETATTR / REMOVE carry `id: u64`; NONE has no payload.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::ExtentError;
use crate::store::ExtentId;

const TAG_NONE: u8 = 0;
const TAG_CREATE: u8 = 1;
const TAG_PUT: u8 = 2;
const TAG_GET: u8 = 3;
const TAG_GETATTR: u8 = 4;
const TAG_REMOVE: u8 = 5;

/// A state-machine command carried through the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Placeholder command; applying it is a no-op.
    None,
    Create { file_type: u32 },
    Put { id: ExtentId, data: Vec<u8> },
    Get { id: ExtentId },
    GetAttr { id: ExtentId },
    Remove { id: ExtentId },
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Command::None => out.push(TAG_NONE),
            Command::Create { file_type } => {
                out.push(TAG_CREATE);
                out.extend_from_slice(&file_type.to_le_bytes());
            }
            Command::Put { id, data } => {
                out.push(TAG_PUT);
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&(data.len() as i32).to_le_bytes());
                out.extend_from_slice(data);
            }
            Command::Get { id } => {
                out.push(TAG_GET);
                out.extend_from_slice(&id.to_le_bytes());
            }
            Command::GetAttr { id } => {
                out.push(TAG_GETATTR);
                out.extend_from_slice(&id.to_le_bytes());
            }
            Command::Remove { id } => {
                out.push(TAG_REMOVE);
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ExtentError> {
        let bad = |what: &str| ExtentError::Codec(what.to_string());
        let mut cur = Cursor::new(bytes);
        let tag = cur.read_u8().map_err(|_| bad("empty command"))?;
        let cmd = match tag {
            TAG_NONE => Command::None,
            TAG_CREATE => Command::Create {
                file_type: cur.read_u32::<LittleEndian>().map_err(|_| bad("truncated CREATE"))?,
            },
            TAG_PUT => {
                let id = cur.read_u64::<LittleEndian>().map_err(|_| bad("truncated PUT"))?;
                let len = cur.read_i32::<LittleEndian>().map_err(|_| bad("truncated PUT"))?;
                if len < 0 {
                    return Err(bad("negative PUT length"));
                }
                let mut data = vec![0u8; len as usize];
                std::io::Read::read_exact(&mut cur, &mut data)
                    .map_err(|_| bad("short PUT payload"))?;
                Command::Put { id, data }
            }
            TAG_GET => Command::Get {
                id: cur.read_u64::<LittleEndian>().map_err(|_| bad("truncated GET"))?,
            },
            TAG_GETATTR => Command::GetAttr {
                id: cur.read_u64::<LittleEndian>().map_err(|_| bad("truncated GETATTR"))?,
            },
            TAG_REMOVE => Command::Remove {
                id: cur.read_u64::<LittleEndian>().map_err(|_| bad("truncated REMOVE"))?,
            },
            other => return Err(ExtentError::Codec(format!("unknown command tag {other}"))),
        };
        Ok(cmd)
    }
}
