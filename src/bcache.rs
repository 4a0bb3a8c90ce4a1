//! A sharded, LRU cache of disk-block buffers.
//!
//! The cache holds a fixed number of buffers, each a cached copy of one
//! disk block. Caching cuts down on disk reads and gives every block a
//! single synchronization point: at most one buffer anywhere in the cache
//! matches a given [`BlockId`], and only one thread at a time owns that
//! buffer's payload.
//!
//! Buffers are spread across hash buckets. Each bucket guards, with one
//! short-hold spin lock, a circular doubly-linked ring ordered by how
//! recently each buffer was released. The rings are expressed as `prev`/
//! `next` indices into one fixed slot arena, with one sentinel index per
//! bucket, so there are no raw pointers to alias. A single eviction lock
//! serializes the slow path that hunts across buckets for a reusable
//! buffer; it is never held across disk I/O.
//!
//! Interface:
//! * [`BufferCache::fetch`] returns an exclusively-owned buffer holding a
//!   block's contents, reading it from disk if needed.
//! * [`BufGuard::commit`] writes the buffer back to disk.
//! * Dropping the guard (or [`BufGuard::release`]) gives the buffer up and
//!   marks it most recently used.
//! * [`BufGuard::pin`] / [`BufferCache::unpin`] keep a buffer resident
//!   without exclusive ownership.

use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use hex_display::HexDisplayExt as _;
use util::{
    cell::SyncUnsafeCell,
    sync::{KSleepLock, KSleepLockGuard, KSpinLock},
};

use crate::{
    block::{BLOCK_SIZE, BlockDevice, BlockId},
    error::{Fatal, Result, fatal},
};

/// Geometry of a [`BufferCache`], fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct BufferCacheConfig {
    /// How many independently-locked buckets to shard into.
    pub buckets: usize,
    /// How many buffers each bucket starts with.
    pub slots_per_bucket: usize,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        Self {
            buckets: 7,
            slots_per_bucket: 30,
        }
    }
}

/// A fixed-capacity cache of disk-block buffers over a [`BlockDevice`].
///
/// All state is created once at construction and repurposed in place;
/// nothing is allocated or freed afterwards.
pub struct BufferCache<D> {
    /// The disk collaborator used to populate and persist buffers.
    device: D,
    /// One lock per bucket, guarding the bucket's ring and the metadata of
    /// every slot currently linked into it.
    bucket_locks: Box<[KSpinLock<()>]>,
    /// Serializes cross-bucket victim searches. Held together with at most
    /// one extra bucket lock at a time, and never across disk I/O.
    eviction_lock: KSpinLock<()>,
    /// `prev`/`next` ring indices for every slot, with the per-bucket
    /// sentinels stored past the real slots (bucket `b`'s sentinel is index
    /// `slots + b`).
    links: Box<[SyncUnsafeCell<Link>]>,
    /// Identity, reference count, and current bucket of every slot.
    metas: Box<[SyncUnsafeCell<BufMeta>]>,
    /// The payload of every slot, owned by whoever holds its sleep lock.
    payloads: Box<[KSleepLock<Payload>]>,
}

/// Ring membership of one slot or sentinel.
#[derive(Clone, Copy)]
struct Link {
    /// Towards the least-recently-released end.
    prev: usize,
    /// Towards the most-recently-released end.
    next: usize,
}

/// Slot metadata, guarded by the owning bucket's lock.
struct BufMeta {
    /// The block this slot currently caches.
    id: BlockId,
    /// How many fetches and pins currently hold the slot. Zero means the
    /// slot may be recycled.
    refcnt: u32,
    /// The bucket whose ring the slot is linked into. Only changes while
    /// `refcnt` is zero, under the eviction protocol.
    bucket: usize,
}

/// A slot's payload, owned via its sleep lock.
struct Payload {
    /// Whether `bytes` holds the contents of the slot's block.
    valid: bool,
    /// The cached block contents.
    bytes: [u8; BLOCK_SIZE],
}

impl<D: BlockDevice> BufferCache<D> {
    /// Construct a cache with the given geometry over `device`.
    pub fn new(device: D, config: BufferCacheConfig) -> Self {
        assert!(config.buckets > 0, "Need at least one bucket");
        assert!(
            config.slots_per_bucket > 0,
            "Need at least one buffer per bucket"
        );
        let slots = config.buckets * config.slots_per_bucket;
        let this = Self {
            device,
            bucket_locks: (0..config.buckets).map(|_| KSpinLock::new(())).collect(),
            eviction_lock: KSpinLock::new(()),
            links: (0..slots + config.buckets)
                .map(|_| SyncUnsafeCell::new(Link { prev: 0, next: 0 }))
                .collect(),
            metas: (0..slots)
                .map(|slot| {
                    SyncUnsafeCell::new(BufMeta {
                        // A key no caller collides with before the slot is
                        // first repurposed.
                        id: BlockId {
                            device: u32::MAX,
                            number: slot as u64,
                        },
                        refcnt: 0,
                        bucket: slot / config.slots_per_bucket,
                    })
                })
                .collect(),
            payloads: (0..slots)
                .map(|_| {
                    KSleepLock::new(Payload {
                        valid: false,
                        bytes: [0; BLOCK_SIZE],
                    })
                })
                .collect(),
        };
        for bucket in 0..config.buckets {
            let sentinel = this.sentinel(bucket);
            // SAFETY: No other thread can observe the cache while it is
            // being constructed.
            unsafe {
                *this.links[sentinel].get() = Link {
                    prev: sentinel,
                    next: sentinel,
                };
            }
        }
        for slot in 0..slots {
            // SAFETY: As above.
            unsafe { this.link_front(slot / config.slots_per_bucket, slot) };
        }
        log::info!(
            "buffer cache holding {slots} buffers of {BLOCK_SIZE} bytes across {} buckets",
            config.buckets
        );
        this
    }

    /// Return an exclusively-owned buffer holding the given block.
    ///
    /// Blocks the calling thread until the buffer's current owner (if any)
    /// releases it, reading the block from disk if it wasn't already
    /// cached. If every buffer in the cache is held, the kernel terminates:
    /// a fixed-size, fully-pinned cache has no well-defined way to proceed.
    pub fn fetch(&self, id: BlockId) -> Result<BufGuard<'_, D>> {
        let slot = self.claim(id);
        // Block until we own the payload. The reference taken in `claim`
        // keeps the slot from being recycled while we wait.
        let data = ManuallyDrop::new(self.payloads[slot].acquire());
        let mut guard = BufGuard {
            cache: self,
            slot,
            data,
        };
        if guard.data.valid {
            log::trace!("{id:?}: hit");
        } else {
            log::trace!("{id:?}: miss, reading from disk");
            self.device.read_block(id, &mut guard.data.bytes)?;
            guard.data.valid = true;
            log::trace!("{id:?} head: {}", guard.data.bytes[..16].hex());
        }
        Ok(guard)
    }

    /// Drop the hold taken by [`BufGuard::pin`].
    ///
    /// The buffer becomes a recycling candidate again once no other fetch
    /// or pin holds it.
    pub fn unpin(&self, pin: BufPin) {
        self.release_ref(pin.slot, false);
    }

    /// Find or claim a slot for `id`, taking one reference to it.
    fn claim(&self, id: BlockId) -> usize {
        let nbuckets = self.bucket_locks.len();
        let bucket = id.bucket_of(nbuckets);

        {
            let _bucket = self.bucket_locks[bucket].lock();
            // Is the block already cached?
            // SAFETY: We hold the bucket's lock.
            if let Some(slot) = unsafe { self.lookup(bucket, id) } {
                // SAFETY: We hold the lock of the bucket owning `slot`.
                unsafe { (*self.metas[slot].get()).refcnt += 1 };
                return slot;
            }
            // Not cached. Recycle this bucket's least-recently-released
            // free buffer; it stays where it is, so no other lock is
            // involved.
            // SAFETY: We hold the bucket's lock.
            if let Some(slot) = unsafe { self.victim_in(bucket) } {
                // SAFETY: As above, and the victim's reference count is
                // zero.
                unsafe { self.repurpose(slot, id) };
                return slot;
            }
        }

        // Slow path: hunt for a victim across all buckets. The eviction
        // lock totally orders these searches, so two threads can never
        // claim the same victim or insert the same block twice.
        let _eviction = self.eviction_lock.lock();
        let _target = self.bucket_locks[bucket].lock();
        // The block may have been inserted while we waited for the
        // eviction lock.
        // SAFETY: We hold the bucket's lock.
        if let Some(slot) = unsafe { self.lookup(bucket, id) } {
            // SAFETY: We hold the lock of the bucket owning `slot`.
            unsafe { (*self.metas[slot].get()).refcnt += 1 };
            return slot;
        }
        for source in 0..nbuckets {
            // The target bucket's lock stays held throughout so nobody can
            // slip this block in behind our back; other buckets are locked
            // one at a time, so no acquisition cycle can form.
            let _source = if source == bucket {
                None
            } else {
                Some(self.bucket_locks[source].lock())
            };
            // SAFETY: We hold bucket `source`'s lock either way.
            let Some(slot) = (unsafe { self.victim_in(source) }) else {
                continue;
            };
            // SAFETY: We hold the owning bucket's lock and the reference
            // count is zero.
            unsafe { self.repurpose(slot, id) };
            if source != bucket {
                log::debug!("moving slot {slot} from bucket {source} to bucket {bucket}");
                // While unlinked the slot is unreachable from any ring;
                // only this thread (serialized by the eviction lock) can
                // see it.
                // SAFETY: Both involved bucket locks and the eviction lock
                // are held.
                unsafe {
                    self.unlink(slot);
                    self.link_front(bucket, slot);
                    (*self.metas[slot].get()).bucket = bucket;
                }
            }
            // Guards drop in reverse acquisition order: source bucket,
            // target bucket, eviction lock.
            return slot;
        }
        // Every buffer everywhere is held. Nothing can be waited for.
        fatal(Fatal::NoFreeBuffers)
    }

    /// Find the slot caching `id` in `bucket`, if any.
    ///
    /// # Safety
    /// The bucket's lock must be held.
    unsafe fn lookup(&self, bucket: usize, id: BlockId) -> Option<usize> {
        let sentinel = self.sentinel(bucket);
        // SAFETY: The ring and the metadata of its slots are guarded by the
        // bucket lock the caller holds.
        let mut slot = unsafe { (*self.links[sentinel].get()).next };
        while slot != sentinel {
            // SAFETY: As above.
            if unsafe { (*self.metas[slot].get()).id } == id {
                return Some(slot);
            }
            // SAFETY: As above.
            slot = unsafe { (*self.links[slot].get()).next };
        }
        None
    }

    /// Find a reusable slot in `bucket`, least recently released first.
    ///
    /// Never returns a slot whose reference count is nonzero.
    ///
    /// # Safety
    /// The bucket's lock must be held.
    unsafe fn victim_in(&self, bucket: usize) -> Option<usize> {
        let sentinel = self.sentinel(bucket);
        // SAFETY: The ring and the metadata of its slots are guarded by the
        // bucket lock the caller holds.
        let mut slot = unsafe { (*self.links[sentinel].get()).prev };
        while slot != sentinel {
            // SAFETY: As above.
            if unsafe { (*self.metas[slot].get()).refcnt } == 0 {
                return Some(slot);
            }
            // SAFETY: As above.
            slot = unsafe { (*self.links[slot].get()).prev };
        }
        None
    }

    /// Re-key `slot` to cache `id`, taking the first reference to it.
    ///
    /// # Safety
    /// The lock of the bucket owning `slot` must be held and the slot's
    /// reference count must be zero.
    unsafe fn repurpose(&self, slot: usize, id: BlockId) {
        // SAFETY: Metadata is guarded by the bucket lock the caller holds.
        unsafe {
            let meta = self.metas[slot].get();
            (*meta).id = id;
            (*meta).refcnt = 1;
        }
        // SAFETY: The reference count was zero, so no thread holds or
        // awaits this sleep lock, and the held bucket lock keeps any new
        // fetcher from finding the slot until we are done.
        unsafe { (*self.payloads[slot].data_ptr()).valid = false };
    }

    /// Drop one reference to `slot`. At zero, optionally relink it at the
    /// most-recently-used end of its current bucket.
    fn release_ref(&self, slot: usize, relink_on_zero: bool) {
        // A nonzero reference count pins the slot's bucket assignment, so
        // this unlocked read cannot race a cross-bucket move.
        // SAFETY: The caller still holds one of the slot's references.
        let bucket = unsafe { (*self.metas[slot].get()).bucket };
        let _bucket = self.bucket_locks[bucket].lock();
        // SAFETY: We hold the lock of the bucket owning `slot`.
        unsafe {
            let meta = self.metas[slot].get();
            if (*meta).refcnt == 0 {
                fatal(Fatal::RefcountUnderflow);
            }
            (*meta).refcnt -= 1;
            if relink_on_zero && (*meta).refcnt == 0 {
                // Nobody is using it anymore: most recently released, last
                // in line for recycling.
                self.unlink(slot);
                self.link_front(bucket, slot);
            }
        }
    }

    /// Take one more reference to `slot`.
    fn pin_ref(&self, slot: usize) {
        // SAFETY: The caller holds a reference, pinning the bucket
        // assignment.
        let bucket = unsafe { (*self.metas[slot].get()).bucket };
        let _bucket = self.bucket_locks[bucket].lock();
        // SAFETY: We hold the lock of the bucket owning `slot`.
        unsafe { (*self.metas[slot].get()).refcnt += 1 };
    }

    /// Remove `slot` from the ring it is linked into.
    ///
    /// # Safety
    /// The lock of the bucket owning `slot` must be held.
    unsafe fn unlink(&self, slot: usize) {
        // SAFETY (all): ring cells of the owning bucket are guarded by the
        // held bucket lock.
        let Link { prev, next } = unsafe { *self.links[slot].get() };
        unsafe { (*self.links[prev].get()).next = next };
        unsafe { (*self.links[next].get()).prev = prev };
    }

    /// Insert `slot` at the most-recently-used end of `bucket`'s ring.
    ///
    /// # Safety
    /// `bucket`'s lock must be held and `slot` must not be linked anywhere.
    unsafe fn link_front(&self, bucket: usize, slot: usize) {
        let sentinel = self.sentinel(bucket);
        // SAFETY (all): the ring's cells are guarded by the held bucket
        // lock.
        let first = unsafe { (*self.links[sentinel].get()).next };
        unsafe {
            *self.links[slot].get() = Link {
                prev: sentinel,
                next: first,
            };
        }
        unsafe { (*self.links[sentinel].get()).next = slot };
        unsafe { (*self.links[first].get()).prev = slot };
    }

    /// The index of `bucket`'s sentinel in the link arena.
    const fn sentinel(&self, bucket: usize) -> usize {
        self.metas.len() + bucket
    }
}

/// Exclusive ownership of one cached buffer, built by
/// [`BufferCache::fetch`].
///
/// Dereferences to the block's bytes. Dropping the guard releases the
/// buffer and marks it most recently used in its bucket.
pub struct BufGuard<'a, D: BlockDevice> {
    cache: &'a BufferCache<D>,
    slot: usize,
    /// Dropped by hand so the exclusive lock is released before the bucket
    /// bookkeeping runs.
    data: ManuallyDrop<KSleepLockGuard<'a, Payload>>,
}

impl<D: BlockDevice> BufGuard<'_, D> {
    /// Which block this buffer caches.
    pub fn id(&self) -> BlockId {
        // SAFETY: Our reference count pins the slot's identity.
        unsafe { (*self.cache.metas[self.slot].get()).id }
    }

    /// Write the buffer's contents back to disk.
    pub fn commit(&self) -> Result<()> {
        debug_assert!(
            self.cache.payloads[self.slot].holding(),
            "Guard exists, so its thread must hold the buffer"
        );
        log::trace!("{:?}: writing to disk", self.id());
        self.cache.device.write_block(self.id(), &self.data.bytes)
    }

    /// Keep the buffer resident after this guard is gone.
    ///
    /// The returned token holds a reference count on the buffer without
    /// exclusive ownership; give it back with [`BufferCache::unpin`].
    pub fn pin(&self) -> BufPin {
        self.cache.pin_ref(self.slot);
        BufPin { slot: self.slot }
    }

    /// Give the buffer up.
    ///
    /// Dropping the guard does the same; this spelling just marks the
    /// release explicit at call sites.
    pub fn release(self) {
        drop(self);
    }
}

impl<D: BlockDevice> core::fmt::Debug for BufGuard<'_, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufGuard").field("id", &self.id()).finish_non_exhaustive()
    }
}

impl<D: BlockDevice> Deref for BufGuard<'_, D> {
    type Target = [u8; BLOCK_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.data.bytes
    }
}
impl<D: BlockDevice> DerefMut for BufGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data.bytes
    }
}
impl<D: BlockDevice> Drop for BufGuard<'_, D> {
    fn drop(&mut self) {
        // The exclusive lock goes first: spin locks are never taken while
        // it is being manipulated.
        // SAFETY: The guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release_ref(self.slot, true);
    }
}

/// A reference-count hold on a cached buffer, without exclusive ownership.
///
/// Produced by [`BufGuard::pin`] and consumed by [`BufferCache::unpin`] on
/// the cache that issued it. While any pin is outstanding the buffer will
/// not be recycled.
#[must_use]
pub struct BufPin {
    slot: usize,
}
