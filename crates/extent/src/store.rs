//! # store
//!
//! why: hold the actual extent contents that every server variant mutates
//! relations: written by state_machine.rs (replicated) and the wal server
//! what: ExtentStore inode table, Attr metadata, allocation

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ExtentError;

/// Identifier of an extent (an inode number)
pub type ExtentId = u64;

/// Directory extent type tag
pub const TYPE_DIR: u32 = 1;
/// Regular file extent type tag
pub const TYPE_FILE: u32 = 2;

/// The root directory: always present, never removable.
pub const ROOT_ID: ExtentId = 1;

/// Extent metadata, in the shape the filesystem layer expects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attr {
    pub file_type: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

#[derive(Debug, Clone)]
struct Extent {
    data: Vec<u8>,
    attr: Attr,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An in-memory table of extents addressed by inode number.
///
/// Inode 1 is the root directory and exists from construction. Allocation
/// hands out increasing ids; `create_at` pins a specific id during recovery,
/// because normal allocation is not deterministic across a replay.
#[derive(Debug)]
pub struct ExtentStore {
    extents: HashMap<ExtentId, Extent>,
    next_id: ExtentId,
}

impl Default for ExtentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentStore {
    pub fn new() -> Self {
        let mut store = Self { extents: HashMap::new(), next_id: ROOT_ID };
        store.create(TYPE_DIR); // allocates ROOT_ID
        store
    }

    /// Allocate a fresh inode of the given type and return its id.
    pub fn create(&mut self, file_type: u32) -> ExtentId {
        let id = self.next_id;
        self.next_id += 1;
        let now = unix_now();
        self.extents.insert(
            id,
            Extent {
                data: Vec::new(),
                attr: Attr { file_type, size: 0, atime: now, mtime: now, ctime: now },
            },
        );
        id
    }

    /// Create an extent under a pinned id. Recovery-only: replaying a log
    /// must land each create on the inode it originally got.
    pub fn create_at(&mut self, id: ExtentId, file_type: u32) {
        let now = unix_now();
        self.extents.insert(
            id,
            Extent {
                data: Vec::new(),
                attr: Attr { file_type, size: 0, atime: now, mtime: now, ctime: now },
            },
        );
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }

    pub fn get(&self, id: ExtentId) -> Result<Vec<u8>, ExtentError> {
        self.extents
            .get(&id)
            .map(|e| e.data.clone())
            .ok_or(ExtentError::NotFound(id))
    }

    /// Replace the extent's contents entirely.
    pub fn put(&mut self, id: ExtentId, data: Vec<u8>) -> Result<(), ExtentError> {
        let extent = self.extents.get_mut(&id).ok_or(ExtentError::NotFound(id))?;
        let now = unix_now();
        extent.attr.size = data.len() as u64;
        extent.attr.mtime = now;
        extent.attr.ctime = now;
        extent.data = data;
        Ok(())
    }

    /// Write `data` at byte offset `off`, zero-filling any gap between the
    /// current length and `off`. Returns the number of bytes written.
    pub fn write_at(&mut self, id: ExtentId, off: usize, data: &[u8]) -> Result<usize, ExtentError> {
        let mut buf = self.get(id)?;
        if off > buf.len() {
            buf.resize(off, 0);
        }
        if off + data.len() > buf.len() {
            buf.resize(off + data.len(), 0);
        }
        buf[off..off + data.len()].copy_from_slice(data);
        self.put(id, buf)?;
        Ok(data.len())
    }

    pub fn getattr(&self, id: ExtentId) -> Result<Attr, ExtentError> {
        self.extents
            .get(&id)
            .map(|e| e.attr)
            .ok_or(ExtentError::NotFound(id))
    }

    pub fn remove(&mut self, id: ExtentId) -> Result<(), ExtentError> {
        if id == ROOT_ID {
            return Err(ExtentError::Permanent(id));
        }
        self.extents
            .remove(&id)
            .map(|_| ())
            .ok_or(ExtentError::NotFound(id))
    }

    pub fn contains(&self, id: ExtentId) -> bool {
        self.extents.contains_key(&id)
    }

    /// The id the next `create` will hand out. Lets a caller that must log
    /// an allocation before performing it name the inode up front.
    pub fn next_id(&self) -> ExtentId {
        self.next_id
    }
}
