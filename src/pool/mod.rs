//! Handle-addressable object pools.
//!
//! Every internal entity of the substrate (NIs, memory regions, match-list
//! entries, buffers, ...) lives in a [`Pool`] of its type. A pool owns a
//! growable list of chunks, each holding a whole number of slots; objects
//! are never heap-allocated individually on the hot path. Live objects are
//! addressed by an opaque [`Handle`] and kept alive by reference counting:
//! an object is reachable by handle lookup exactly while its reference
//! count is above zero.
//!
//! Slots distinguish two lifecycles:
//!
//! - the *storage* lifecycle: the object value is constructed once when its
//!   chunk is carved (`factory`) and dropped only when the pool is dropped;
//! - the *checkout* lifecycle: [`Pooled::on_checkout`] and
//!   [`Pooled::on_checkin`] run on every allocate/release cycle.
//!
//! Pools are typed, so using a handle with a pool of the wrong kind is a
//! compile-time error; stale handles of the right kind are rejected at
//! runtime by a per-slot generation counter.

mod handle;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

pub use self::handle::Handle;
use crate::error::{Error, Result};

/// The kinds of pooled objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Network interfaces.
    Ni,
    /// Registered memory regions.
    Mr,
    /// Memory descriptors.
    Md,
    /// List entries.
    Le,
    /// Match entries.
    Me,
    /// Event queues.
    Eq,
    /// Counting events.
    Ct,
    /// Initiator-side (send) transactions.
    SendXact,
    /// Target-side (receive) transactions.
    RecvXact,
    /// Transport buffers.
    Buf,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolKind::Ni => "ni",
            PoolKind::Mr => "mr",
            PoolKind::Md => "md",
            PoolKind::Le => "le",
            PoolKind::Me => "me",
            PoolKind::Eq => "eq",
            PoolKind::Ct => "ct",
            PoolKind::SendXact => "send_xact",
            PoolKind::RecvXact => "recv_xact",
            PoolKind::Buf => "buf",
        };
        f.write_str(name)
    }
}

/// Behavior attached to a pooled object type.
///
/// Implementors are expected to manage their mutable state through interior
/// mutability; the pool hands out shared references only.
pub trait Pooled: Send + Sync + 'static {
    /// The pool kind this type belongs to.
    const KIND: PoolKind;

    /// Runs each time a slot is checked out of the free list, before the
    /// object becomes reachable by handle.
    fn on_checkout(&self) {}

    /// Runs each time the last reference is dropped, before the slot
    /// returns to the free list. Must leave the object ready for reuse.
    fn on_checkin(&self) {}
}

/// One slot of a chunk.
struct Slot<T> {
    /// Reference count; zero means the slot is free.
    refs: AtomicU32,
    /// Bumped on every release, invalidating outstanding handles.
    generation: AtomicU32,
    obj: T,
}

/// A contiguous run of slots. Chunks are never freed before the pool.
struct Chunk<T> {
    /// Global index of the first slot in this chunk.
    base: u32,
    slots: Box<[Slot<T>]>,
}

/// Minimum number of slots carved per chunk, so tiny types still amortize.
const MIN_SLOTS_PER_CHUNK: usize = 8;

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    // SAFETY: sysconf with a valid name has no preconditions.
    *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize)
}

struct PoolInner<T: Pooled> {
    /// Constructs a slot's object once, when its chunk is carved. The
    /// argument is the global slot index.
    factory: Box<dyn Fn(u32) -> T + Send + Sync>,

    /// Maximum number of slots this pool may ever hold.
    cap: usize,

    /// Slots per full chunk, derived from the page size.
    slots_per_chunk: usize,

    /// Carved chunks, ordered by base index.
    chunks: RwLock<Vec<Arc<Chunk<T>>>>,

    /// Serializes chunk carving so the factory never runs twice for a slot.
    grow: Mutex<()>,

    /// Free slot indices. Held only for push/pop, never across hooks.
    free: Mutex<Vec<u32>>,

    /// Number of checked-out objects.
    live: AtomicUsize,

    /// Signaled when `live` drops to zero; see [`Pool::drain`].
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl<T: Pooled> PoolInner<T> {
    fn find_chunk(&self, index: u32) -> Option<Arc<Chunk<T>>> {
        let chunks = self.chunks.read().unwrap();
        let which = index as usize / self.slots_per_chunk;
        chunks.get(which).cloned()
    }

    /// Returns the slot to the free list. Runs after the last reference to
    /// the object has been dropped.
    fn release(self: &Arc<Self>, chunk: &Chunk<T>, index: u32) {
        let slot = &chunk.slots[(index - chunk.base) as usize];
        slot.obj.on_checkin();
        slot.generation.fetch_add(1, Ordering::Release);

        self.free.lock().unwrap().push(index);

        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.drain_lock.lock().unwrap();
            self.drained.notify_all();
        }
    }
}

/// A typed, chunked, freelist-backed object pool.
///
/// Cheap to clone; clones share the same storage behind an `Arc`.
pub struct Pool<T: Pooled> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Pooled> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Pooled> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("kind", &T::KIND)
            .field("live", &self.live())
            .field("available", &self.available())
            .finish()
    }
}

impl<T: Pooled> Pool<T> {
    /// Create a pool holding at most `cap` objects. No objects are carved
    /// up front.
    ///
    /// `factory` constructs each slot's object exactly once, when the slot's
    /// chunk is carved; it receives the global slot index.
    pub fn new<F>(cap: usize, factory: F) -> Self
    where
        F: Fn(u32) -> T + Send + Sync + 'static,
    {
        let slot_size = std::mem::size_of::<Slot<T>>().max(1);
        let slots_per_chunk = (page_size() / slot_size).max(MIN_SLOTS_PER_CHUNK);
        Pool {
            inner: Arc::new(PoolInner {
                factory: Box::new(factory),
                cap,
                slots_per_chunk,
                chunks: RwLock::new(Vec::new()),
                grow: Mutex::new(()),
                free: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                drain_lock: Mutex::new(()),
                drained: Condvar::new(),
            }),
        }
    }

    /// The pool kind.
    #[inline]
    pub fn kind(&self) -> PoolKind {
        T::KIND
    }

    /// Number of checked-out objects.
    #[inline]
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Current length of the free list.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Total number of carved slots.
    pub fn total(&self) -> usize {
        let chunks = self.inner.chunks.read().unwrap();
        chunks.iter().map(|c| c.slots.len()).sum()
    }

    /// Carve a new chunk and stock the free list with its slots.
    ///
    /// Fails with `OutOfMemory` once the pool holds `cap` slots. The factory
    /// runs outside the free-list lock.
    fn grow(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.grow.lock().unwrap();

        // Another thread may have grown the pool while we waited.
        if !inner.free.lock().unwrap().is_empty() {
            return Ok(());
        }

        let total: usize = self.total();
        if total >= inner.cap {
            return Err(Error::OutOfMemory);
        }
        let count = inner.slots_per_chunk.min(inner.cap - total);
        let base = total as u32;

        let slots: Box<[Slot<T>]> = (0..count)
            .map(|i| Slot {
                refs: AtomicU32::new(0),
                generation: AtomicU32::new(0),
                obj: (inner.factory)(base + i as u32),
            })
            .collect();
        log::trace!("{} pool: carved chunk of {} slots at {}", T::KIND, count, base);

        inner.chunks.write().unwrap().push(Arc::new(Chunk { base, slots }));
        let mut free = inner.free.lock().unwrap();
        free.extend((0..count as u32).map(|i| base + i));
        Ok(())
    }

    /// Check an object out of the pool.
    ///
    /// The object's reference count starts at 1 and its handle stays valid
    /// until the last [`ObjRef`] is dropped. Fails with `OutOfMemory` when
    /// the pool is at capacity.
    pub fn alloc(&self) -> Result<ObjRef<T>> {
        let inner = &self.inner;
        let index = loop {
            if let Some(index) = inner.free.lock().unwrap().pop() {
                break index;
            }
            self.grow()?;
        };

        let chunk = inner
            .find_chunk(index)
            .expect("free list held an index with no chunk");
        let slot = &chunk.slots[(index - chunk.base) as usize];

        debug_assert_eq!(slot.refs.load(Ordering::Acquire), 0);
        slot.refs.store(1, Ordering::Release);
        inner.live.fetch_add(1, Ordering::AcqRel);

        let handle = Handle::new(index, slot.generation.load(Ordering::Acquire));
        slot.obj.on_checkout();

        Ok(ObjRef {
            pool: inner.clone(),
            chunk,
            index,
            handle,
        })
    }

    /// Look an object up by handle, acquiring a reference.
    ///
    /// Fails with `InvalidHandle` when the index is out of range, the slot
    /// is free, or the handle's generation is stale.
    pub fn lookup(&self, handle: Handle) -> Result<ObjRef<T>> {
        if handle == Handle::NONE {
            return Err(Error::InvalidHandle);
        }
        let index = handle.index();
        let chunk = self.inner.find_chunk(index).ok_or(Error::InvalidHandle)?;
        let local = (index - chunk.base) as usize;
        if local >= chunk.slots.len() {
            return Err(Error::InvalidHandle);
        }
        let slot = &chunk.slots[local];

        // Acquire a reference without ever resurrecting a slot whose count
        // already reached zero.
        let mut refs = slot.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return Err(Error::InvalidHandle);
            }
            match slot.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => refs = cur,
            }
        }

        let obj = ObjRef {
            pool: self.inner.clone(),
            chunk,
            index,
            handle,
        };
        // The slot is live, but it may have been recycled since the handle
        // was issued. Dropping `obj` walks the normal release path, so this
        // cannot leak the reference we just took.
        if obj.chunk.slots[local].generation.load(Ordering::Acquire) != handle.generation() {
            return Err(Error::InvalidHandle);
        }
        Ok(obj)
    }

    /// Block until no object is checked out, or `timeout` elapses.
    ///
    /// Returns `true` if the pool fully drained. Used by shutdown paths to
    /// wait for outstanding references instead of sleeping and rechecking.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.drain_lock.lock().unwrap();
        while self.live() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .inner
                .drained
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
        true
    }
}

/// A counted reference to a pooled object.
///
/// Dereferences to the object. Cloning acquires another reference; dropping
/// the last one runs [`Pooled::on_checkin`] and returns the slot to the
/// free list.
pub struct ObjRef<T: Pooled> {
    pool: Arc<PoolInner<T>>,
    chunk: Arc<Chunk<T>>,
    index: u32,
    handle: Handle,
}

impl<T: Pooled> ObjRef<T> {
    /// The object's handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Current reference count. Racy by nature; intended for diagnostics
    /// and shutdown assertions.
    pub fn ref_count(&self) -> u32 {
        self.slot().refs.load(Ordering::Acquire)
    }

    #[inline]
    fn slot(&self) -> &Slot<T> {
        &self.chunk.slots[(self.index - self.chunk.base) as usize]
    }
}

impl<T: Pooled> Deref for ObjRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.slot().obj
    }
}

impl<T: Pooled> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        self.slot().refs.fetch_add(1, Ordering::AcqRel);
        ObjRef {
            pool: self.pool.clone(),
            chunk: self.chunk.clone(),
            index: self.index,
            handle: self.handle,
        }
    }
}

impl<T: Pooled> Drop for ObjRef<T> {
    fn drop(&mut self) {
        if self.slot().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.release(&self.chunk, self.index);
        }
    }
}

impl<T: Pooled> fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef<{}>({:?})", T::KIND, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestObj {
        index: u32,
        checkouts: AtomicUsize,
        checkins: AtomicUsize,
    }

    impl Pooled for TestObj {
        const KIND: PoolKind = PoolKind::Md;

        fn on_checkout(&self) {
            self.checkouts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_checkin(&self) {
            self.checkins.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_pool(cap: usize) -> Pool<TestObj> {
        Pool::new(cap, |index| TestObj {
            index,
            checkouts: AtomicUsize::new(0),
            checkins: AtomicUsize::new(0),
        })
    }

    #[test]
    fn handle_round_trip() {
        let pool = test_pool(64);
        let obj = pool.alloc().unwrap();
        let handle = obj.handle();

        let looked_up = pool.lookup(handle).unwrap();
        assert_eq!(looked_up.index, obj.index);
        assert_eq!(looked_up.ref_count(), 2);
        drop(looked_up);

        drop(obj);
        assert_eq!(pool.lookup(handle).unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    fn stale_handle_rejected_after_reuse() {
        let pool = test_pool(64);
        let first = pool.alloc().unwrap();
        let stale = first.handle();
        drop(first);

        // The slot comes back with a bumped generation.
        let second = pool.alloc().unwrap();
        assert_eq!(second.handle().index(), stale.index());
        assert_ne!(second.handle(), stale);
        assert_eq!(pool.lookup(stale).unwrap_err(), Error::InvalidHandle);
        assert!(pool.lookup(second.handle()).is_ok());
    }

    #[test]
    fn exhaustion_leaves_free_list_unchanged() {
        let pool = test_pool(4);
        let held: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        let before = pool.available();

        assert_eq!(pool.alloc().unwrap_err(), Error::OutOfMemory);
        assert_eq!(pool.available(), before);
        assert_eq!(pool.live(), 4);
        drop(held);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn hooks_run_per_cycle_and_init_once() {
        let pool = test_pool(8);
        let obj = pool.alloc().unwrap();
        let handle_index = obj.handle().index();
        assert_eq!(obj.checkouts.load(Ordering::SeqCst), 1);
        drop(obj);

        // Free list is LIFO, so the same slot is reused. Its object was
        // constructed once; only the cycle hooks ran again.
        let obj = pool.alloc().unwrap();
        assert_eq!(obj.handle().index(), handle_index);
        assert_eq!(obj.checkouts.load(Ordering::SeqCst), 2);
        assert_eq!(obj.checkins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clone_holds_slot_live() {
        let pool = test_pool(8);
        let obj = pool.alloc().unwrap();
        let extra = obj.clone();
        let handle = obj.handle();
        drop(obj);

        assert!(pool.lookup(handle).is_ok());
        drop(extra);
        assert!(pool.lookup(handle).is_err());
    }

    #[test]
    fn drain_waits_for_releases() {
        let pool = test_pool(8);
        let obj = pool.alloc().unwrap();
        assert!(!pool.drain(Duration::from_millis(10)));

        let pool2 = pool.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(obj);
        });
        assert!(pool2.drain(Duration::from_secs(2)));
        t.join().unwrap();
    }

    #[test]
    fn concurrent_alloc_release() {
        let pool = test_pool(1024);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let obj = pool.alloc().unwrap();
                        let h = obj.handle();
                        assert!(pool.lookup(h).is_ok());
                        drop(obj);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.live(), 0);
    }
}
