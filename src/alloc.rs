//! Physical page allocation.

mod page;

pub use page::{FreePlacement, PageAllocator, PageAllocatorConfig};

/// The size of a single page in memory.
pub const PAGE_SIZE: usize = 4096;

/// The byte written across a page as it is handed out by `allocate`.
///
/// Reads of memory the caller never initialized show this pattern instead
/// of stale data.
pub const ALLOC_FILL: u8 = 0x05;

/// The byte written across a page as it is returned by `free`.
///
/// Reads through a dangling reference show this pattern, which is distinct
/// from [`ALLOC_FILL`].
pub const FREE_FILL: u8 = 0x01;
