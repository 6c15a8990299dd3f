//! Object paging for Betula.
//!
//! This crate provides the swap space: a layer that owns typed,
//! reference-counted objects and transparently moves them between memory
//! and a backing store. Code holds [`Ptr`] handles to objects and pins
//! them for access; the swap space loads absent objects on demand, tracks
//! dirty state, and lets a cache manager page clean, unpinned objects out
//! to honor a residency budget.
//!
//! Objects serialize their cross-references as ids. Each serialized
//! reference counts toward the target's reference count, so a durable
//! image keeps its referents' records alive; rewriting an image releases
//! the old image's contributions. Objects with no remaining references are
//! destroyed and their records reclaimed, cascading.

mod codec;
mod pointer;
mod space;

pub use pointer::{PinGuard, Ptr};
pub use space::SwapSpace;

pub mod serde_codec {
    //! Re-exported codec helpers for object payloads.
    pub use crate::codec::{decode, encode};
}

use betula_common::{ObjectId, Result};

/// An object the swap space can page in and out.
///
/// `encode` and `decode` translate between the in-memory form and the
/// durable byte image. Cross-references to other swappable objects are
/// stored as ids and rebuilt through [`SwapSpace::resolve`] during decode;
/// `outbound_links` reports them (with multiplicity) so the space can
/// account for the references a durable image holds.
pub trait Swappable: Sized + 'static {
    /// Serializes the object for the backing store.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Rebuilds an object from its durable image.
    fn decode(bytes: &[u8], space: &SwapSpace<Self>) -> Result<Self>;

    /// Ids of every outbound reference held by this object.
    fn outbound_links(&self) -> Vec<ObjectId>;
}
