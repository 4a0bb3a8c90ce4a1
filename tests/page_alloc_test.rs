//! Tests for the per-core page allocator.

use core::ptr::NonNull;
use std::{
    alloc::Layout,
    collections::HashSet,
    sync::{Barrier, Mutex, Once},
    thread,
};

use kmem::{
    alloc::{ALLOC_FILL, FREE_FILL, PAGE_SIZE, PageAllocator, PageAllocatorConfig},
    cpu,
    error::OutOfMemory,
};

/// A page-aligned chunk of heap memory for an allocator to manage.
struct Region {
    base: *mut u8,
    layout: Layout,
}
impl Region {
    fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .expect("Region layout must be valid");
        // SAFETY: The layout has a nonzero size.
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null(), "Failed to allocate the backing region");
        Self { base, layout }
    }

    fn start(&self) -> *mut u8 {
        self.base
    }

    fn end(&self) -> *mut u8 {
        self.base.wrapping_add(self.layout.size())
    }
}
impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated with this exact layout.
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}

/// Page pointers being handed from one test thread to another.
struct SendPages(Vec<NonNull<u8>>);
// SAFETY: The pages are unaliased and wholly owned by whoever holds the
// wrapper.
unsafe impl Send for SendPages {}

fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| kmem::logger::init_logger(log::LevelFilter::Warn));
}

fn single_core() -> PageAllocatorConfig {
    PageAllocatorConfig {
        cores: 1,
        ..PageAllocatorConfig::default()
    }
}

#[test]
fn allocations_are_aligned_in_range_and_filled() {
    init_logging();
    let region = Region::new(8);
    // SAFETY: The region is unused heap memory that outlives the allocator.
    let allocator = unsafe { PageAllocator::init(region.start(), region.end(), single_core()) };

    let mut pages = Vec::new();
    for _ in 0..8 {
        let page = allocator.allocate().expect("Eight pages must fit");
        assert_eq!(page.addr().get() % PAGE_SIZE, 0, "Pages must be aligned");
        assert!(
            page.addr().get() >= region.start().addr()
                && page.addr().get() + PAGE_SIZE <= region.end().addr(),
            "Pages must come from the managed range"
        );
        // SAFETY: We own the page we were just handed.
        let bytes = unsafe { std::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
        assert!(
            bytes.iter().all(|&byte| byte == ALLOC_FILL),
            "Allocated pages must carry the allocation fill pattern"
        );
        pages.push(page);
    }
    for page in pages {
        // SAFETY: The page came from this allocator and is not used again.
        unsafe { allocator.free(page) };
    }
    assert_eq!(
        allocator.free_count(0),
        8,
        "Every page must be back on the single list"
    );
}

#[test]
fn freed_pages_are_poisoned() {
    let region = Region::new(1);
    // SAFETY: The region is unused heap memory that outlives the allocator.
    let allocator = unsafe { PageAllocator::init(region.start(), region.end(), single_core()) };

    let page = allocator.allocate().expect("One page must fit");
    let addr = page.as_ptr();
    // SAFETY: The page came from this allocator and is not accessed through
    // `page` afterwards.
    unsafe { allocator.free(page) };

    // The first word now holds the free-list link; everything past it must
    // show the free pattern.
    // SAFETY: The whole region is our own heap allocation.
    let bytes = unsafe { std::slice::from_raw_parts(addr, PAGE_SIZE) };
    assert!(
        bytes[size_of::<usize>()..]
            .iter()
            .all(|&byte| byte == FREE_FILL),
        "Freed pages must carry the free fill pattern"
    );
}

#[test]
fn exhaustion_is_recoverable() {
    let region = Region::new(2);
    // SAFETY: The region is unused heap memory that outlives the allocator.
    let allocator = unsafe { PageAllocator::init(region.start(), region.end(), single_core()) };

    let first = allocator.allocate().expect("Two pages must fit");
    let _second = allocator.allocate().expect("Two pages must fit");
    assert_eq!(
        allocator.allocate().expect_err("No third page exists"),
        OutOfMemory
    );
    // SAFETY: The page came from this allocator and is not used again.
    unsafe { allocator.free(first) };
    allocator
        .allocate()
        .expect("The freed page must be allocatable again");
}

#[test]
fn concurrent_allocations_are_disjoint() {
    init_logging();
    const PAGES: usize = 64;
    const THREADS: usize = 4;

    let region = Region::new(PAGES);
    let config = PageAllocatorConfig {
        cores: THREADS,
        ..PageAllocatorConfig::default()
    };
    // SAFETY: The region is unused heap memory that outlives the allocator.
    let allocator = unsafe { PageAllocator::init(region.start(), region.end(), config) };

    let seen = Mutex::new(HashSet::new());
    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for core in 0..THREADS {
            let allocator = &allocator;
            let seen = &seen;
            let barrier = &barrier;
            s.spawn(move || {
                cpu::pin(core);
                let mut held = Vec::new();
                while let Ok(page) = allocator.allocate() {
                    assert!(
                        seen.lock()
                            .expect("No other holder panics")
                            .insert(page.addr().get()),
                        "The same page was handed out twice"
                    );
                    held.push(page);
                }
                // Nobody frees until everyone has run dry, so a page can
                // never be recycled into a second hand-out above.
                barrier.wait();
                for page in held {
                    // SAFETY: Each page came from this allocator and is not
                    // used again.
                    unsafe { allocator.free(page) };
                }
            });
        }
    });

    let seen = seen.into_inner().expect("No holder panicked");
    assert_eq!(seen.len(), PAGES, "Every page must be handed out exactly once");
    let back: usize = (0..THREADS).map(|core| allocator.free_count(core)).sum();
    assert_eq!(back, PAGES, "Every page must be back on some list");
}

/// Drain every page onto one core's list, then measure how many a single
/// allocation on the other core carries over.
fn stolen_after_drain(pages: usize, budget: usize) -> (usize, usize) {
    let region = Region::new(pages);
    let config = PageAllocatorConfig {
        cores: 2,
        steal_budget: budget,
        ..PageAllocatorConfig::default()
    };
    // SAFETY: The region is unused heap memory that outlives the allocator.
    let allocator = unsafe { PageAllocator::init(region.start(), region.end(), config) };

    let held = thread::scope(|s| {
        s.spawn(|| {
            cpu::pin(0);
            let mut held = Vec::new();
            for _ in 0..pages {
                held.push(allocator.allocate().expect("The whole region is free"));
            }
            SendPages(held)
        })
        .join()
        .expect("Allocating thread panicked")
    });
    thread::scope(|s| {
        let allocator = &allocator;
        s.spawn(move || {
            // Capture the whole `SendPages` wrapper so its `Send` impl
            // applies, rather than the non-`Send` inner `Vec` field.
            let held = held;
            let SendPages(held) = held;
            cpu::pin(1);
            for page in held {
                // SAFETY: Each page came from this allocator and is not used
                // again.
                unsafe { allocator.free(page) };
            }
        })
        .join()
        .expect("Freeing thread panicked");
    });
    assert_eq!(allocator.free_count(0), 0, "Core 0 gave everything up");
    assert_eq!(allocator.free_count(1), pages, "Core 1 holds everything");

    thread::scope(|s| {
        s.spawn(|| {
            cpu::pin(0);
            let page = allocator
                .allocate()
                .expect("Stealing must find the other core's pages");
            // SAFETY: The page came from this allocator and is not used
            // again.
            unsafe { allocator.free(page) };
        })
        .join()
        .expect("Stealing thread panicked");
    });
    (allocator.free_count(0), allocator.free_count(1))
}

#[test]
fn stealing_moves_at_most_the_default_budget() {
    init_logging();
    // 128 stolen; the allocated page comes back to the local list.
    assert_eq!(stolen_after_drain(200, 128), (128, 72));
}

#[test]
fn steal_budget_is_configurable() {
    assert_eq!(stolen_after_drain(40, 8), (8, 32));
}

#[test]
#[should_panic(expected = "freeing a misaligned page")]
fn freeing_a_misaligned_page_is_fatal() {
    let region = Region::new(1);
    // SAFETY: The region is unused heap memory that outlives the allocator.
    let allocator = unsafe { PageAllocator::init(region.start(), region.end(), single_core()) };
    let page = allocator.allocate().expect("One page must fit");
    let skewed = NonNull::new(page.as_ptr().wrapping_add(1)).expect("Offset page is nonnull");
    // SAFETY: Deliberate contract breach; the call never returns.
    unsafe { allocator.free(skewed) };
}

#[test]
#[should_panic(expected = "freeing a page outside the managed range")]
fn freeing_a_foreign_page_is_fatal() {
    let managed = Region::new(1);
    let foreign = Region::new(1);
    // SAFETY: The region is unused heap memory that outlives the allocator.
    let allocator = unsafe { PageAllocator::init(managed.start(), managed.end(), single_core()) };
    let stray = NonNull::new(foreign.start()).expect("Region base is nonnull");
    // SAFETY: Deliberate contract breach; the call never returns.
    unsafe { allocator.free(stray) };
}
