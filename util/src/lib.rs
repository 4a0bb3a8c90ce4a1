//! Support primitives for the kernel memory core.
//!
//! This crate holds the pieces that don't know anything about pages or disk
//! blocks: the short-hold spin lock, the blocking exclusive-ownership lock,
//! and the cell type used for state guarded by an external locking protocol.

pub mod cell;
pub mod sync;
