//! # Opal Heap
//!
//! The slab-allocated, reference-counted object heap:
//!
//! - **Object Model**: a uniform 40-byte slot union for every heap kind
//! - **Slab Allocator**: fixed 1600-slot pages threaded through an
//!   intrusive free-span list with O(1) left-coalescing
//! - **Reference Counting**: explicit retain/release with per-kind
//!   destructors; cycles are the [`Heap::check_memory`] sweep's job
//! - **Value Map**: the hash map backing the `Map` object kind

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cycle;
pub mod heap;
pub mod map;
pub mod object;

pub use heap::{Heap, TraceStats, PAGE_SLOTS};
pub use map::{MapKey, ValueMap};
pub use object::{
    HeapObject, TypeId, CAPTURE_SPILLED, FIRST_USER_TYPE, MAX_INLINE_CAPTURES, SMALL_OBJECT_FIELDS,
    TYPE_CLOSURE, TYPE_LAMBDA, TYPE_LIST, TYPE_MAP, TYPE_SENTINEL, TYPE_STRING,
};
