//! Backing-store interface.
//!
//! The swap space persists objects through this interface: one record per
//! object id, plus a single designated root record id used to locate the
//! swap-space index at restart.

use betula_common::Result;
use std::io::{Read, Seek, Write};

/// A byte stream over one backing-store record.
///
/// Obtained from [`BackingStore::get`] and released with
/// [`BackingStore::put`], which flushes any buffered writes.
pub trait RecordStream: Read + Write + Seek {
    /// Flushes outstanding writes and releases the stream.
    fn complete(self: Box<Self>) -> Result<()>;
}

/// Bytes-on-disk by record id.
///
/// Record ids are assigned by [`allocate`](BackingStore::allocate) and are
/// never reused within a store's lifetime. Id 0 is reserved to mean "no
/// record" and is only ever returned by [`get_root`](BackingStore::get_root)
/// on a store without a root.
pub trait BackingStore {
    /// Reserves a new record and returns its id. `len` is a size hint;
    /// implementations may ignore it.
    fn allocate(&mut self, len: usize) -> Result<u64>;

    /// Removes a record and reclaims its space.
    fn deallocate(&mut self, id: u64) -> Result<()>;

    /// Opens a record for reading and writing, positioned at the start.
    fn get(&mut self, id: u64) -> Result<Box<dyn RecordStream>>;

    /// Releases a stream returned by [`get`](BackingStore::get), flushing
    /// writes through to durable storage.
    fn put(&mut self, stream: Box<dyn RecordStream>) -> Result<()> {
        stream.complete()
    }

    /// Durably records `id` as the designated root record.
    fn set_root(&mut self, id: u64) -> Result<()>;

    /// Returns the designated root record id, or 0 if none was ever set.
    fn get_root(&mut self) -> Result<u64>;
}
