//! Cache management interfaces.
//!
//! A cache manager decides which resident objects to page out. It never
//! touches object state directly; the owning space hands it a [`CacheSpace`]
//! view through which it may inspect objects and invoke the clean/evict
//! protocol on victims.

use betula_common::{ObjectId, Result};

/// The object space as seen by a cache policy.
pub trait CacheSpace {
    /// Whether the object currently has an in-memory representation.
    fn is_resident(&self, id: ObjectId) -> bool;

    /// Whether the object has unwritten modifications.
    fn is_dirty(&self, id: ObjectId) -> bool;

    /// Whether the object is pinned. Pinned objects must not be evicted.
    fn is_pinned(&self, id: ObjectId) -> bool;

    /// The id of the unit that must be written back when this object is
    /// made durable. May be the object itself.
    fn write_unit(&self, id: ObjectId) -> ObjectId;

    /// Serializes the object to the backing store and marks it clean.
    fn clean(&mut self, id: ObjectId) -> Result<()>;

    /// Drops the object's in-memory representation. The object must be
    /// clean and unpinned.
    fn evict(&mut self, id: ObjectId) -> Result<()>;
}

/// Eviction policy for a swap space.
///
/// The space notifies the manager of every state transition an object goes
/// through: `birth` (created), `load` (paged in), `read`/`write` (accessed
/// through a pin), `clean` (made durable), `evict` (paged out), and `death`
/// (destroyed). Birth and load may push residency over budget and so
/// receive a mutable view for triggering evictions.
pub trait CacheManager {
    /// A new object was created in memory.
    fn note_birth(&mut self, id: ObjectId, space: &mut dyn CacheSpace) -> Result<()>;

    /// An object was loaded into memory from the backing store.
    fn note_load(&mut self, id: ObjectId, space: &mut dyn CacheSpace) -> Result<()>;

    /// A resident object was examined.
    fn note_read(&mut self, id: ObjectId, space: &dyn CacheSpace);

    /// A resident object was modified.
    fn note_write(&mut self, id: ObjectId, space: &dyn CacheSpace);

    /// A resident object was made durable.
    fn note_clean(&mut self, id: ObjectId);

    /// An object's in-memory representation was dropped.
    fn note_evict(&mut self, id: ObjectId);

    /// An object was destroyed.
    fn note_death(&mut self, id: ObjectId);

    /// Writes every dirty write-unit back without evicting anything.
    fn checkpoint(&mut self, space: &mut dyn CacheSpace) -> Result<()>;

    /// Adjusts the residency budget, evicting as needed.
    fn set_capacity(&mut self, capacity: usize, space: &mut dyn CacheSpace) -> Result<()>;
}
