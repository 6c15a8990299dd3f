//! Counted pointers and scoped pins.

use crate::space::{aggregate_links, release_pin, release_ref, CacheEvent, Inner};
use crate::{SwapSpace, Swappable};
use betula_common::{BetulaError, ObjectId, Result};
use std::cell::{Ref, RefCell, RefMut};
use std::io::Read;
use std::rc::{Rc, Weak};

/// A counted reference to a swappable object.
///
/// Cloning bumps the target's reference count; dropping decrements it and,
/// once the count reaches zero on an unpinned object, destroys the target.
/// Equality compares identity. A pointer serializes as its target's id.
pub struct Ptr<T: Swappable> {
    id: ObjectId,
    inner: Weak<RefCell<Inner<T>>>,
}

impl<T: Swappable> Ptr<T> {
    pub(crate) fn new(id: ObjectId, inner: Weak<RefCell<Inner<T>>>) -> Self {
        Self { id, inner }
    }

    /// The target's object id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    fn space(&self) -> Rc<RefCell<Inner<T>>> {
        self.inner
            .upgrade()
            .expect("swap space dropped while pointers remain")
    }

    /// Whether the target currently has an in-memory representation.
    pub fn is_in_memory(&self) -> bool {
        self.inner.upgrade().is_some_and(|rc| {
            rc.borrow()
                .slots
                .get(&self.id)
                .is_some_and(|s| s.value.is_some())
        })
    }

    /// Whether the target has modifications not yet written back.
    pub fn is_dirty(&self) -> bool {
        self.inner.upgrade().is_some_and(|rc| {
            rc.borrow().slots.get(&self.id).is_some_and(|s| s.dirty)
        })
    }

    /// Whether the target is pinned.
    pub fn is_pinned(&self) -> bool {
        self.inner.upgrade().is_some_and(|rc| {
            rc.borrow().slots.get(&self.id).is_some_and(|s| s.pins > 0)
        })
    }

    /// Pins the target, paging it in from the backing store if necessary.
    ///
    /// The returned guard keeps the object resident at a stable address
    /// until dropped. Pins on the same object compose additively.
    pub fn pin(&self) -> Result<PinGuard<T>> {
        let inner_rc = self.space();

        let resident = {
            let mut inner = inner_rc.borrow_mut();
            let slot = inner
                .slots
                .get_mut(&self.id)
                .ok_or(BetulaError::UnknownObject(self.id))?;
            let cell = slot.value.as_ref().map(Rc::clone);
            if cell.is_some() {
                slot.pins += 1;
            }
            cell
        };
        if let Some(value) = resident {
            return Ok(PinGuard {
                id: self.id,
                value,
                inner: inner_rc,
            });
        }

        // Page in: read the record, decode it (rebuilding child pointers),
        // then install the value clean.
        let bytes = {
            let mut inner = inner_rc.borrow_mut();
            let inner = &mut *inner;
            let record = inner.slots[&self.id].record;
            assert!(
                record != 0,
                "object {} has neither a resident value nor a durable record",
                self.id
            );
            let mut stream = inner.store.get(record)?;
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes)?;
            inner.store.put(stream)?;
            bytes
        };
        let space = SwapSpace::from_inner(Rc::clone(&inner_rc));
        let decoded = T::decode(&bytes, &space)?;

        let value = {
            let mut inner = inner_rc.borrow_mut();
            let slot = inner.slots.get_mut(&self.id).unwrap();
            debug_assert!(slot.value.is_none());
            debug_assert_eq!(
                aggregate_links(&decoded.outbound_links()),
                slot.record_links,
                "decoded links disagree with the recorded image"
            );
            let cell = Rc::new(RefCell::new(decoded));
            slot.value = Some(Rc::clone(&cell));
            slot.dirty = false;
            slot.pins += 1;
            cell
        };
        let guard = PinGuard {
            id: self.id,
            value,
            inner: inner_rc,
        };
        guard.notify(CacheEvent::Load(self.id))?;
        Ok(guard)
    }
}

impl<T: Swappable> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        if let Some(rc) = self.inner.upgrade() {
            let mut inner = rc.borrow_mut();
            let slot = inner
                .slots
                .get_mut(&self.id)
                .expect("cloned pointer must target a live object");
            slot.refs += 1;
        }
        Self {
            id: self.id,
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Swappable> Drop for Ptr<T> {
    fn drop(&mut self) {
        if let Some(rc) = self.inner.upgrade() {
            release_ref(&rc, self.id, 1);
        }
    }
}

impl<T: Swappable> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: Swappable> Eq for Ptr<T> {}

impl<T: Swappable> std::fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ptr").field(&self.id).finish()
    }
}

/// RAII guard for a pinned object.
///
/// While a guard lives the object stays resident and may not be evicted.
/// [`read`](PinGuard::read) and [`write`](PinGuard::write) hand out scoped
/// borrows of the value; a write borrow marks the object dirty. The pin is
/// released when the guard drops, on every exit path.
pub struct PinGuard<T: Swappable> {
    id: ObjectId,
    value: Rc<RefCell<T>>,
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Swappable> PinGuard<T> {
    /// The pinned object's id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Borrows the value for reading.
    pub fn read(&self) -> Ref<'_, T> {
        self.notify_quiet(CacheEvent::Read(self.id));
        self.value.borrow()
    }

    /// Borrows the value for writing, marking the object dirty.
    pub fn write(&self) -> RefMut<'_, T> {
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.slots.get_mut(&self.id) {
                slot.dirty = true;
            }
        }
        self.notify_quiet(CacheEvent::Write(self.id));
        self.value.borrow_mut()
    }

    fn notify(&self, event: CacheEvent) -> Result<()> {
        SwapSpace::from_inner(Rc::clone(&self.inner)).notify(event)
    }

    fn notify_quiet(&self, event: CacheEvent) {
        if let Err(e) = self.notify(event) {
            tracing::warn!(object = %self.id, error = %e, "cache notification failed");
        }
    }
}

impl<T: Swappable> Drop for PinGuard<T> {
    fn drop(&mut self) {
        release_pin(&self.inner, self.id);
    }
}
