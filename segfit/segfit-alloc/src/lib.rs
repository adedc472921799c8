//! # Segregated-Fit Heap Allocator
//!
//! A general-purpose dynamic allocator over a single contiguous,
//! monotonically growing region. It serves the classic allocate / free /
//! reallocate triple on raw, double-word-aligned byte blocks, and gets its
//! memory from a [`RegionProvider`](segfit_region::RegionProvider), an
//! `sbrk`-style collaborator that can only append.
//!
//! ## Heap Layout
//!
//! The entire allocator state lives inside the region itself; the
//! [`SegregatedHeap`] struct holds nothing but the provider and two
//! addresses into the range:
//!
//! ```text
//! low                                                              high
//! ┌───────────────┬─────┬───────────┬─────────────────────────┬────────┐
//! │ 10 class-head │ pad │ prologue  │ real blocks             │epilogue│
//! │ words         │     │ (8 bytes, │ (allocated and free,    │ (0, a) │
//! │               │     │ allocated)│  physically contiguous) │        │
//! └───────────────┴─────┴───────────┴─────────────────────────┴────────┘
//! ```
//!
//! Every block carries a one-word header and an identical one-word footer
//! (a *boundary tag*): the block size in the high bits, the allocated flag
//! in bit 0. Footers are kept on allocated blocks too, which makes the
//! physical predecessor reachable in O(1) and coalescing branch-free. The
//! prologue and epilogue sentinels fence the neighbor reads, so no merge
//! path performs a bounds check.
//!
//! ## Policy
//!
//! - **Segregated fits**: free blocks are filed in ten doubly-linked lists
//!   by size class (bounds doubling from `8 * WORD`, last class unbounded),
//!   LIFO at the head. The lists are intrusive: a free block's first two
//!   payload words are its links.
//! - **Pseudo best fit**: within a class the search takes the best of the
//!   first [`SCAN_LIMIT`]` + 1` suitable candidates, then gives up on
//!   improving. Bounded work per allocation, most of best-fit's packing.
//!   Classes escalate until the last one, after which the heap grows by at
//!   least [`CHUNK_SIZE`].
//! - **Split and coalesce**: placements split when the remainder can stand
//!   as a block of its own; frees merge eagerly with free physical
//!   neighbors, so two free blocks are never adjacent between calls.
//! - **Reallocation**: shrinks stay put (the slack is kept, not split off);
//!   growth absorbs a free right neighbor when possible and otherwise
//!   relocates with up to [`REALLOC_SLACK`] bytes of deliberate
//!   over-allocation so the next growth requests resolve in place.
//!
//! ## What this crate is not
//!
//! Single-threaded by design: every entry point takes `&mut self` and the
//! embedder serializes access. Memory never returns to the provider; there
//! is no compaction, no hardening against use-after-free, and no detection
//! of misuse on the fast path. [`SegregatedHeap::check`] exists for tests
//! and embedders that want the full invariant sweep after the fact.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod block;
mod check;
mod class;
mod heap;
mod index;

pub use block::{DWORD, MIN_BLOCK, WORD};
pub use check::{BlockInfo, Blocks, CheckError};
pub use class::{CLASS_COUNT, class_of};
pub use heap::{CHUNK_SIZE, InitError, REALLOC_SLACK, SCAN_LIMIT, SegregatedHeap};
