//! The swap space: typed objects paged between memory and a backing store.
//!
//! Every object lives in a table slot keyed by its [`ObjectId`]. A slot
//! carries the object's reference count, pin count, dirty flag, its current
//! backing-store record (0 until first cleaned), the outbound link counts
//! recorded in that record, and the resident value when paged in.
//!
//! An object's reference count sums two kinds of contribution: live
//! [`Ptr`](crate::Ptr) handles in memory, and links embedded in durable
//! records (each serialized pointer in a record counts once). An object
//! whose count reaches zero while unpinned is destroyed: its record is
//! deallocated and the record's own link contributions are released in
//! turn, cascading.
//!
//! The cache manager is notified of births, loads, reads, writes, cleans,
//! evictions, and deaths. Notifications are queued and drained through a
//! small pump so that a manager callback (which may itself clean and evict
//! objects through its [`CacheSpace`] view) never observes the space
//! mid-mutation, and so that value teardown never runs while the table is
//! borrowed.

use crate::codec;
use crate::pointer::Ptr;
use crate::Swappable;
use betula_cache::{CacheManager, CacheSpace};
use betula_common::{BetulaError, ObjectId, Result};
use betula_store::BackingStore;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use std::rc::Rc;

/// One table entry.
pub(crate) struct Slot<T: Swappable> {
    pub(crate) refs: u64,
    pub(crate) pins: u64,
    pub(crate) dirty: bool,
    /// Backing-store record holding the object's durable image; 0 if the
    /// object has never been cleaned.
    pub(crate) record: u64,
    /// Outbound link counts embedded in the durable image.
    pub(crate) record_links: BTreeMap<ObjectId, u64>,
    pub(crate) value: Option<Rc<RefCell<T>>>,
}

pub(crate) enum CacheEvent {
    Birth(ObjectId),
    Load(ObjectId),
    Read(ObjectId),
    Write(ObjectId),
    Cleaned(ObjectId),
    Evicted(ObjectId),
    Death(ObjectId),
}

pub(crate) struct Inner<T: Swappable> {
    pub(crate) store: Box<dyn BackingStore>,
    /// Taken out of the slot while a manager callback runs.
    pub(crate) manager: Option<Box<dyn CacheManager>>,
    pub(crate) slots: HashMap<ObjectId, Slot<T>>,
    pub(crate) next_id: u64,
    pub(crate) root: ObjectId,
    /// Objects holding a retention reference from the last checkpoint.
    pub(crate) retained: Vec<ObjectId>,
    pub(crate) meta: Option<Vec<u8>>,
    pub(crate) events: VecDeque<CacheEvent>,
}

/// Durable form of the object table, written at each checkpoint.
#[derive(Serialize, Deserialize)]
struct IndexRecord {
    next_id: u64,
    root: u64,
    meta: Option<Vec<u8>>,
    objects: Vec<ObjectDescriptor>,
}

#[derive(Serialize, Deserialize)]
struct ObjectDescriptor {
    id: u64,
    record: u64,
    links: Vec<(u64, u64)>,
}

/// A paging layer that hands out counted pointers to typed objects and
/// moves them between memory and a [`BackingStore`] under the direction of
/// a [`CacheManager`].
///
/// Cloning a `SwapSpace` clones a handle to the same space.
pub struct SwapSpace<T: Swappable> {
    pub(crate) inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Swappable> Clone for SwapSpace<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Swappable> SwapSpace<T> {
    /// Opens a swap space over the given store, restoring the object table
    /// from the store's designated root record when one exists.
    pub fn open(mut store: Box<dyn BackingStore>, manager: Box<dyn CacheManager>) -> Result<Self> {
        let root_record = store.get_root()?;
        let mut inner = Inner {
            store,
            manager: Some(manager),
            slots: HashMap::new(),
            next_id: 1,
            root: ObjectId::NULL,
            retained: Vec::new(),
            meta: None,
            events: VecDeque::new(),
        };

        if root_record != 0 {
            let mut stream = inner.store.get(root_record)?;
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes)?;
            inner.store.put(stream)?;
            let index: IndexRecord = codec::decode(&bytes)?;

            inner.next_id = index.next_id;
            inner.root = ObjectId(index.root);
            inner.meta = index.meta;
            for desc in &index.objects {
                inner.slots.insert(
                    ObjectId(desc.id),
                    Slot {
                        refs: 0,
                        pins: 0,
                        dirty: false,
                        record: desc.record,
                        record_links: desc
                            .links
                            .iter()
                            .map(|&(id, n)| (ObjectId(id), n))
                            .collect(),
                        value: None,
                    },
                );
            }

            // Reference counts are derived, never persisted: each durable
            // link counts once, the index itself retains every object it
            // describes, and the designated root is held by the space.
            let mut link_counts: Vec<(ObjectId, u64)> = Vec::new();
            for desc in &index.objects {
                for &(id, n) in &desc.links {
                    link_counts.push((ObjectId(id), n));
                }
            }
            for (id, n) in link_counts {
                let slot = inner
                    .slots
                    .get_mut(&id)
                    .ok_or(BetulaError::UnknownObject(id))?;
                slot.refs += n;
            }
            for desc in &index.objects {
                let id = ObjectId(desc.id);
                inner.slots.get_mut(&id).unwrap().refs += 1;
                inner.retained.push(id);
            }
            if inner.root.is_valid() {
                let root = inner.root;
                inner
                    .slots
                    .get_mut(&root)
                    .ok_or(BetulaError::UnknownObject(root))?
                    .refs += 1;
            }
            tracing::info!(objects = index.objects.len(), "restored swap space");
        }

        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<Inner<T>>>) -> Self {
        Self { inner }
    }

    /// Creates a new object, born dirty and resident.
    pub fn allocate(&self, value: T) -> Result<Ptr<T>> {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = ObjectId(inner.next_id);
            inner.next_id += 1;
            inner.slots.insert(
                id,
                Slot {
                    refs: 1,
                    pins: 0,
                    dirty: true,
                    record: 0,
                    record_links: BTreeMap::new(),
                    value: Some(Rc::new(RefCell::new(value))),
                },
            );
            id
        };
        if let Err(e) = self.notify(CacheEvent::Birth(id)) {
            release_ref(&self.inner, id, 1);
            return Err(e);
        }
        Ok(Ptr::new(id, Rc::downgrade(&self.inner)))
    }

    /// Resolves a stored id back into a live counted pointer.
    ///
    /// Used when decoding serialized objects; the target must be a live
    /// table entry.
    pub fn resolve(&self, id: ObjectId) -> Result<Ptr<T>> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner
            .slots
            .get_mut(&id)
            .ok_or(BetulaError::UnknownObject(id))?;
        slot.refs += 1;
        drop(inner);
        Ok(Ptr::new(id, Rc::downgrade(&self.inner)))
    }

    /// Installs the designated root object used at restart.
    pub fn set_root(&self, ptr: &Ptr<T>) {
        let old = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .slots
                .get_mut(&ptr.id())
                .expect("root must be a live object");
            slot.refs += 1;
            std::mem::replace(&mut inner.root, ptr.id())
        };
        if old.is_valid() {
            release_ref(&self.inner, old, 1);
        }
    }

    /// Returns the designated root object, if any.
    pub fn root(&self) -> Option<Ptr<T>> {
        let id = self.inner.borrow().root;
        if id.is_valid() {
            Some(self.resolve(id).expect("root must be a live object"))
        } else {
            None
        }
    }

    /// Returns the application metadata blob from the last restored or
    /// written checkpoint.
    pub fn meta(&self) -> Option<Vec<u8>> {
        self.inner.borrow().meta.clone()
    }

    /// Number of live objects in the table.
    pub fn object_count(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    /// Number of objects currently resident in memory.
    pub fn resident_count(&self) -> usize {
        self.inner
            .borrow()
            .slots
            .values()
            .filter(|s| s.value.is_some())
            .count()
    }

    /// Adjusts the cache residency budget.
    pub fn set_cache_capacity(&self, capacity: usize) -> Result<()> {
        self.with_manager(|manager, view| manager.set_capacity(capacity, view))
    }

    /// Writes every dirty object back, then durably records the object
    /// table, the root object id, and `meta` as the new restart point.
    pub fn checkpoint(&self, meta: &[u8]) -> Result<()> {
        self.pump()?;
        self.with_manager(|manager, view| manager.checkpoint(view))?;

        // Hand retention over from the previous checkpoint to this one.
        // Objects alive only through the old index die here; survivors get
        // a fresh retention reference so their records outlive the index
        // that describes them.
        let previous = std::mem::take(&mut self.inner.borrow_mut().retained);
        for id in previous {
            release_ref(&self.inner, id, 1);
        }
        let mut ids: Vec<ObjectId> = self.inner.borrow().slots.keys().copied().collect();
        ids.sort_unstable();
        {
            let mut inner = self.inner.borrow_mut();
            for &id in &ids {
                inner.slots.get_mut(&id).unwrap().refs += 1;
            }
            inner.retained = ids.clone();
            inner.meta = Some(meta.to_vec());
        }

        let index = {
            let inner = self.inner.borrow();
            let mut objects = Vec::with_capacity(ids.len());
            for &id in &ids {
                let slot = &inner.slots[&id];
                debug_assert!(!slot.dirty, "checkpoint left a dirty object behind");
                if slot.record == 0 {
                    return Err(BetulaError::UncleanObject(id));
                }
                objects.push(ObjectDescriptor {
                    id: id.0,
                    record: slot.record,
                    links: slot
                        .record_links
                        .iter()
                        .map(|(&id, &n)| (id.0, n))
                        .collect(),
                });
            }
            IndexRecord {
                next_id: inner.next_id,
                root: inner.root.0,
                meta: Some(meta.to_vec()),
                objects,
            }
        };
        let bytes = codec::encode(&index)?;

        {
            let mut inner = self.inner.borrow_mut();
            let store = &mut inner.store;
            let record = store.allocate(bytes.len())?;
            let mut stream = store.get(record)?;
            stream.write_all(&bytes)?;
            store.put(stream)?;
            let old = store.get_root()?;
            store.set_root(record)?;
            if old != 0 {
                store.deallocate(old)?;
            }
        }
        tracing::debug!(objects = ids.len(), "checkpoint written");
        Ok(())
    }

    /// Queues a lifecycle event and drains the queue through the manager.
    pub(crate) fn notify(&self, event: CacheEvent) -> Result<()> {
        self.inner.borrow_mut().events.push_back(event);
        self.pump()
    }

    /// Delivers queued events to the manager one at a time. The manager is
    /// taken out of the table for the duration of each callback; events
    /// raised from inside a callback (cleans, evictions, deaths) queue up
    /// and are delivered on subsequent turns of the loop. Values torn down
    /// by a callback are parked in a graveyard and dropped only after the
    /// table borrow is released, so their pointer destructors can re-enter
    /// the space safely.
    pub(crate) fn pump(&self) -> Result<()> {
        let mut first_err: Option<BetulaError> = None;
        loop {
            let (event, mut manager) = {
                let mut inner = self.inner.borrow_mut();
                let Some(event) = inner.events.pop_front() else {
                    break;
                };
                match inner.manager.take() {
                    Some(m) => (event, m),
                    None => {
                        // A manager callback is on the stack; the event is
                        // drained when it returns.
                        inner.events.push_front(event);
                        break;
                    }
                }
            };
            let mut graveyard = Vec::new();
            let result = {
                let mut inner = self.inner.borrow_mut();
                let inner = &mut *inner;
                let mut view = SpaceView {
                    slots: &mut inner.slots,
                    store: inner.store.as_mut(),
                    events: &mut inner.events,
                    graveyard: &mut graveyard,
                };
                dispatch(manager.as_mut(), event, &mut view)
            };
            self.inner.borrow_mut().manager = Some(manager);
            drop(graveyard);
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Runs a closure against the manager with a space view, then drains
    /// any events the closure raised.
    fn with_manager<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CacheManager, &mut dyn CacheSpace) -> Result<()>,
    {
        let Some(mut manager) = self.inner.borrow_mut().manager.take() else {
            debug_assert!(false, "reentrant manager call");
            return Ok(());
        };
        let mut graveyard = Vec::new();
        let result = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let mut view = SpaceView {
                slots: &mut inner.slots,
                store: inner.store.as_mut(),
                events: &mut inner.events,
                graveyard: &mut graveyard,
            };
            f(manager.as_mut(), &mut view)
        };
        self.inner.borrow_mut().manager = Some(manager);
        drop(graveyard);
        result.and_then(|()| self.pump())
    }
}

fn dispatch<T: Swappable>(
    manager: &mut dyn CacheManager,
    event: CacheEvent,
    view: &mut SpaceView<'_, T>,
) -> Result<()> {
    match event {
        CacheEvent::Birth(id) => manager.note_birth(id, view),
        CacheEvent::Load(id) => manager.note_load(id, view),
        CacheEvent::Read(id) => {
            manager.note_read(id, &*view);
            Ok(())
        }
        CacheEvent::Write(id) => {
            manager.note_write(id, &*view);
            Ok(())
        }
        CacheEvent::Cleaned(id) => {
            manager.note_clean(id);
            Ok(())
        }
        CacheEvent::Evicted(id) => {
            manager.note_evict(id);
            Ok(())
        }
        CacheEvent::Death(id) => {
            manager.note_death(id);
            Ok(())
        }
    }
}

/// The space as exposed to a manager callback.
struct SpaceView<'a, T: Swappable> {
    slots: &'a mut HashMap<ObjectId, Slot<T>>,
    store: &'a mut dyn BackingStore,
    events: &'a mut VecDeque<CacheEvent>,
    graveyard: &'a mut Vec<Rc<RefCell<T>>>,
}

impl<T: Swappable> SpaceView<'_, T> {
    /// Releases durable link contributions, destroying objects whose
    /// counts reach zero. Runs as a worklist so a long cascade cannot
    /// overflow the stack; torn-down values go to the graveyard.
    fn release_links(&mut self, links: BTreeMap<ObjectId, u64>) {
        let mut work: Vec<(ObjectId, u64)> = links.into_iter().collect();
        while let Some((id, n)) = work.pop() {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            debug_assert!(slot.refs >= n);
            slot.refs = slot.refs.saturating_sub(n);
            if slot.refs == 0 && slot.pins == 0 {
                let slot = self.slots.remove(&id).unwrap();
                if slot.record != 0 {
                    if let Err(e) = self.store.deallocate(slot.record) {
                        tracing::warn!(object = %id, error = %e, "record deallocation failed");
                    }
                    work.extend(slot.record_links);
                }
                if let Some(value) = slot.value {
                    self.graveyard.push(value);
                }
                self.events.push_back(CacheEvent::Death(id));
            }
        }
    }
}

impl<T: Swappable> CacheSpace for SpaceView<'_, T> {
    fn is_resident(&self, id: ObjectId) -> bool {
        self.slots.get(&id).is_some_and(|s| s.value.is_some())
    }

    fn is_dirty(&self, id: ObjectId) -> bool {
        self.slots.get(&id).is_some_and(|s| s.dirty)
    }

    fn is_pinned(&self, id: ObjectId) -> bool {
        self.slots.get(&id).is_some_and(|s| s.pins > 0)
    }

    fn write_unit(&self, id: ObjectId) -> ObjectId {
        // Objects are serialized one record apiece; every object is its
        // own write unit.
        id
    }

    fn clean(&mut self, id: ObjectId) -> Result<()> {
        let Some(slot) = self.slots.get(&id) else {
            return Ok(());
        };
        if !slot.dirty {
            return Ok(());
        }
        let value = slot
            .value
            .clone()
            .expect("dirty object must be resident");
        let bytes = value.borrow().encode()?;
        let links = aggregate_links(&value.borrow().outbound_links());

        let record = self.store.allocate(bytes.len())?;
        let mut stream = self.store.get(record)?;
        stream.write_all(&bytes)?;
        self.store.put(stream)?;

        // New contributions land before the old image's are released, so
        // shared targets never transit through zero.
        for (&child, &n) in &links {
            self.slots
                .get_mut(&child)
                .expect("linked object must be live")
                .refs += n;
        }
        let slot = self.slots.get_mut(&id).unwrap();
        let old_record = std::mem::replace(&mut slot.record, record);
        let old_links = std::mem::replace(&mut slot.record_links, links);
        slot.dirty = false;
        self.events.push_back(CacheEvent::Cleaned(id));

        if old_record != 0 {
            self.store.deallocate(old_record)?;
            self.release_links(old_links);
        }
        Ok(())
    }

    fn evict(&mut self, id: ObjectId) -> Result<()> {
        let Some(slot) = self.slots.get_mut(&id) else {
            return Ok(());
        };
        debug_assert!(!slot.dirty, "evicting a dirty object");
        debug_assert_eq!(slot.pins, 0, "evicting a pinned object");
        if let Some(value) = slot.value.take() {
            self.graveyard.push(value);
            self.events.push_back(CacheEvent::Evicted(id));
        }
        Ok(())
    }
}

/// Sums pointer targets into per-target link counts.
pub(crate) fn aggregate_links(links: &[ObjectId]) -> BTreeMap<ObjectId, u64> {
    let mut counts = BTreeMap::new();
    for &id in links {
        *counts.entry(id).or_insert(0) += 1;
    }
    counts
}

/// Drops one reference; destroys the object at zero with no pins.
pub(crate) fn release_ref<T: Swappable>(
    inner_rc: &Rc<RefCell<Inner<T>>>,
    id: ObjectId,
    count: u64,
) {
    let dead = {
        let mut inner = inner_rc.borrow_mut();
        let Some(slot) = inner.slots.get_mut(&id) else {
            return;
        };
        debug_assert!(slot.refs >= count);
        slot.refs = slot.refs.saturating_sub(count);
        if slot.refs == 0 && slot.pins == 0 {
            Some(reap(&mut inner, id))
        } else {
            None
        }
    };
    finish_reap(inner_rc, dead);
}

/// Drops one pin; destroys the object if it was already unreferenced.
pub(crate) fn release_pin<T: Swappable>(inner_rc: &Rc<RefCell<Inner<T>>>, id: ObjectId) {
    let dead = {
        let mut inner = inner_rc.borrow_mut();
        let Some(slot) = inner.slots.get_mut(&id) else {
            return;
        };
        debug_assert!(slot.pins > 0);
        slot.pins = slot.pins.saturating_sub(1);
        if slot.refs == 0 && slot.pins == 0 {
            Some(reap(&mut inner, id))
        } else {
            None
        }
    };
    finish_reap(inner_rc, dead);
}

type Reaped<T> = (Option<Rc<RefCell<T>>>, BTreeMap<ObjectId, u64>);

/// Removes a dead slot from the table and reclaims its record. The value
/// and its durable links are returned for teardown outside the borrow.
fn reap<T: Swappable>(inner: &mut Inner<T>, id: ObjectId) -> Reaped<T> {
    let slot = inner.slots.remove(&id).unwrap();
    if slot.record != 0 {
        if let Err(e) = inner.store.deallocate(slot.record) {
            tracing::warn!(object = %id, error = %e, "record deallocation failed");
        }
    }
    inner.events.push_back(CacheEvent::Death(id));
    (slot.value, slot.record_links)
}

fn finish_reap<T: Swappable>(inner_rc: &Rc<RefCell<Inner<T>>>, dead: Option<Reaped<T>>) {
    let Some((value, links)) = dead else {
        return;
    };
    if let Err(e) = SwapSpace::from_inner(Rc::clone(inner_rc)).pump() {
        tracing::warn!(error = %e, "cache notification failed during teardown");
    }
    // Dropping the value releases its in-memory pointers; each release
    // re-enters the space with its own scoped borrow.
    drop(value);
    for (child, n) in links {
        release_ref(inner_rc, child, n);
    }
}
