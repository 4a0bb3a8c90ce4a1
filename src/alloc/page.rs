//! A per-core physical page allocator with bounded work stealing.
//!
//! The managed range is split into [`PAGE_SIZE`] pages distributed across
//! one free list per core. A free page's own memory holds the link to the
//! next free page, so the allocator needs no side tables. `allocate` serves
//! from the calling core's list and steals from other cores when that list
//! is empty; `free` pushes onto the freeing core's list (by default) no
//! matter which core allocated the page.

use core::ptr::NonNull;

use util::sync::KSpinLock;

use crate::{
    alloc::{ALLOC_FILL, FREE_FILL, PAGE_SIZE},
    cpu,
    error::{Fatal, OutOfMemory, fatal},
};

/// Tunables for a [`PageAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct PageAllocatorConfig {
    /// How many per-core free lists to maintain.
    pub cores: usize,
    /// The most pages one `allocate` call may move from a foreign list into
    /// the local one. Bounds how long a steal holds the victim's lock and
    /// how lopsided a single call can make the partition.
    pub steal_budget: usize,
    /// Which list a freed page is pushed onto.
    pub placement: FreePlacement,
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        Self {
            cores: std::thread::available_parallelism().map_or(1, usize::from),
            steal_budget: 128,
            placement: FreePlacement::CallingCore,
        }
    }
}

/// Policy for which free list receives a freed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreePlacement {
    /// Push onto the freeing core's own list. No per-page bookkeeping, at
    /// the cost of long-run imbalance, which stealing bounds.
    CallingCore,
    /// Push onto the list the page's address maps to, keeping the partition
    /// balanced at the cost of cross-core lock traffic on free.
    HomeCore,
}

/// A physical page allocator over a fixed contiguous range.
pub struct PageAllocator {
    /// One free list per core.
    lists: Box<[KSpinLock<FreeList>]>,
    /// First managed address (page-aligned).
    start: usize,
    /// One past the last managed address (page-aligned).
    end: usize,
    /// See [`PageAllocatorConfig::steal_budget`].
    steal_budget: usize,
    /// See [`PageAllocatorConfig::placement`].
    placement: FreePlacement,
}

impl PageAllocator {
    /// Take ownership of the memory between `range_start` and `range_end`,
    /// and distribute it across the per-core free lists.
    ///
    /// The range is shrunk inward to page boundaries. Distribution goes
    /// through the same path as `free`, so every page starts poisoned with
    /// [`FREE_FILL`].
    ///
    /// # Safety
    /// The range must be a live allocation, not accessed by anything else
    /// for the allocator's lifetime, and must not contain address zero.
    pub unsafe fn init(
        range_start: *mut u8,
        range_end: *mut u8,
        config: PageAllocatorConfig,
    ) -> Self {
        assert!(config.cores > 0, "Need at least one core");
        let start = range_start.addr().next_multiple_of(PAGE_SIZE);
        let end = range_end.addr() & !(PAGE_SIZE - 1);
        let this = Self {
            lists: (0..config.cores)
                .map(|_| KSpinLock::new(FreeList::new()))
                .collect(),
            start,
            end: end.max(start),
            steal_budget: config.steal_budget,
            placement: config.placement,
        };

        // Keep provenance by offsetting the caller's pointer rather than
        // fabricating pointers from addresses.
        let base = range_start.wrapping_add(start - range_start.addr());
        let pages = (this.end - this.start) / PAGE_SIZE;
        for index in 0..pages {
            let page = NonNull::new(base.wrapping_add(index * PAGE_SIZE))
                .expect("Managed range contains the null address");
            // Round-robin so that every list starts populated.
            // SAFETY:
            // By caller contract we own the range, and each page is visited
            // exactly once.
            unsafe { this.free_onto(index % config.cores, page) };
        }
        log::info!(
            "page allocator managing {pages} pages across {} lists",
            config.cores
        );
        this
    }

    /// Allocate one page, filled with [`ALLOC_FILL`].
    ///
    /// The calling core's identity is fixed for the duration of the call.
    /// The local list is tried first; if it is empty, other cores' lists are
    /// visited in round-robin order and up to the steal budget of pages is
    /// moved over before one is popped.
    pub fn allocate(&self) -> Result<NonNull<u8>, OutOfMemory> {
        let ncores = self.lists.len();
        let core = cpu::current(ncores);

        if let Some(page) = self.pop_local(core) {
            return Ok(Self::hand_out(page));
        }
        for victim in (1..ncores).map(|offset| (core + offset) % ncores) {
            // Another thread sharing this core may have freed in the
            // meantime.
            if let Some(page) = self.pop_local(core) {
                return Ok(Self::hand_out(page));
            }
            let Some(chain) = self.steal_from(victim) else {
                continue;
            };
            log::debug!("core {core} stole {} pages from core {victim}", chain.len);
            let mut local = self.lists[core].lock();
            local.splice(chain);
            if let Some(page) = local.pop() {
                drop(local);
                return Ok(Self::hand_out(page));
            }
        }
        // One last look in case a concurrent free raced the steal loop.
        match self.pop_local(core) {
            Some(page) => Ok(Self::hand_out(page)),
            None => {
                log::warn!("core {core} found no pages anywhere");
                Err(OutOfMemory)
            }
        }
    }

    /// Return a page to the allocator, poisoning it with [`FREE_FILL`].
    ///
    /// Freeing a misaligned page or one outside the managed range is a
    /// contract breach and terminates the kernel.
    ///
    /// # Safety
    /// The page must have come from [`Self::allocate`] on this allocator,
    /// and nothing may access it after this call.
    pub unsafe fn free(&self, page: NonNull<u8>) {
        let addr = page.addr().get();
        if addr % PAGE_SIZE != 0 {
            fatal(Fatal::FreePageMisaligned);
        }
        if addr < self.start || addr + PAGE_SIZE > self.end {
            fatal(Fatal::FreePageOutOfRange);
        }
        let core = match self.placement {
            FreePlacement::CallingCore => cpu::current(self.lists.len()),
            FreePlacement::HomeCore => (addr - self.start) / PAGE_SIZE % self.lists.len(),
        };
        // SAFETY: By caller contract we now own the page.
        unsafe { self.free_onto(core, page) };
    }

    /// How many pages currently sit on the given core's free list.
    pub fn free_count(&self, core: usize) -> usize {
        self.lists[core].lock().len
    }

    /// How many per-core lists the allocator maintains.
    pub fn cores(&self) -> usize {
        self.lists.len()
    }

    /// Poison and push a page we own onto the given core's list.
    ///
    /// # Safety
    /// The page must be an unaliased, page-aligned [`PAGE_SIZE`]-byte
    /// allocation owned by the caller.
    unsafe fn free_onto(&self, core: usize, page: NonNull<u8>) {
        // Poison before linking; the link node overwrites the first bytes.
        // SAFETY: We own the page.
        unsafe { page.write_bytes(FREE_FILL, PAGE_SIZE) };
        self.lists[core].lock().push(page.cast());
    }

    /// Pop one page from the given core's list, if it has any.
    fn pop_local(&self, core: usize) -> Option<NonNull<FreePage>> {
        self.lists[core].lock().pop()
    }

    /// Detach up to the steal budget of pages from the victim's list.
    ///
    /// Only the victim's lock is held, never two list locks at once, so no
    /// acquisition cycle between stealing cores is possible.
    fn steal_from(&self, victim: usize) -> Option<Chain> {
        self.lists[victim].lock().detach(self.steal_budget)
    }

    /// Fill an allocated page with the allocation pattern and hand it out.
    fn hand_out(page: NonNull<FreePage>) -> NonNull<u8> {
        let page = page.cast::<u8>();
        // SAFETY: The page was just unlinked, so we own all of it.
        unsafe { page.write_bytes(ALLOC_FILL, PAGE_SIZE) };
        page
    }
}

/// A singly-linked list threaded through the free pages themselves.
struct FreeList {
    /// The most recently freed page.
    head: Option<NonNull<FreePage>>,
    /// How many pages are on the list.
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn push(&mut self, page: NonNull<FreePage>) {
        // SAFETY: The caller owns the page; the list takes it over.
        unsafe { page.as_ptr().write(FreePage { next: self.head }) };
        self.head = Some(page);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<NonNull<FreePage>> {
        let page = self.head?;
        // SAFETY: Pages on the list are live link nodes the list owns.
        self.head = unsafe { page.as_ref() }.next;
        self.len -= 1;
        Some(page)
    }

    /// Cut up to `max` pages off the head of the list.
    fn detach(&mut self, max: usize) -> Option<Chain> {
        if max == 0 {
            return None;
        }
        let head = self.head?;
        let mut tail = head;
        let mut len = 1;
        // SAFETY: Pages on the list are live link nodes the list owns.
        while len < max && let Some(next) = unsafe { tail.as_ref() }.next {
            tail = next;
            len += 1;
        }
        // SAFETY: As above.
        self.head = unsafe { tail.as_ref() }.next;
        self.len -= len;
        Some(Chain { head, tail, len })
    }

    /// Prepend a detached chain.
    fn splice(&mut self, chain: Chain) {
        // SAFETY: The chain's pages are owned by the chain; its tail link is
        // stale and overwritten here.
        unsafe { chain.tail.as_ptr().write(FreePage { next: self.head }) };
        self.head = Some(chain.head);
        self.len += chain.len;
    }
}

// SAFETY:
// The raw links are only followed while the surrounding spin lock is held,
// so moving the list between threads just moves ownership of its pages.
unsafe impl Send for FreeList {}

/// A run of pages cut out of one free list, on its way into another.
struct Chain {
    head: NonNull<FreePage>,
    tail: NonNull<FreePage>,
    len: usize,
}

/// The link node written at the start of every free page.
///
/// Kept at pointer size so that pushing a page onto a list only disturbs
/// the first word of the [`FREE_FILL`] poison.
struct FreePage {
    /// The next free page in the same list.
    next: Option<NonNull<FreePage>>,
}
