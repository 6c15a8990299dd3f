//! Identifiers for swappable objects.

use serde::{Deserialize, Serialize};

/// Unique identifier for an object managed by the swap space.
///
/// Ids are assigned monotonically starting at 1; 0 is the null sentinel
/// used for absent references in serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The null object reference.
    pub const NULL: ObjectId = ObjectId(0);

    /// Returns true unless this is the null sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::NULL
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}
