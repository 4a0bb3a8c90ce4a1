//! The memory-management core of a small teaching kernel.
//!
//! Two independent subsystems live here:
//!
//! - [`alloc::PageAllocator`], a physical page allocator partitioned into
//!   per-core free lists with bounded work stealing between cores.
//! - [`bcache::BufferCache`], a fixed-capacity cache of disk-block-sized
//!   buffers, sharded into hash buckets that each carry their own LRU list
//!   and lock.
//!
//! The two are peers: the cache embeds its buffers statically and never
//! calls the page allocator. Everything else the core needs (the disk
//! transfer itself, scheduling of the calling threads) is a collaborator
//! behind the [`block::BlockDevice`] trait or outside the crate entirely.

pub mod alloc;
pub mod bcache;
pub mod block;
pub mod cpu;
pub mod error;
pub mod logger;
