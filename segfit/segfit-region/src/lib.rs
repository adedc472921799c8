//! # Heap Region Providers
//!
//! The seam between an allocator and whatever actually owns the address
//! space. A [`RegionProvider`] hands out a single contiguous range that only
//! ever grows at the high end, in the `sbrk` manner: previously returned
//! addresses are never invalidated, nothing is ever taken back, and the
//! current extent is observable through [`low_bound`](RegionProvider::low_bound)
//! and [`high_bound`](RegionProvider::high_bound).
//!
//! The crate ships one implementation, [`FixedRegion`], which serves requests
//! out of a caller-supplied base/capacity pair by advancing a break pointer.
//! That is enough for a statically reserved heap and for host-side tests;
//! richer providers (page-table backed, mmap backed) implement the same trait.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod fixed;
mod provider;

pub use fixed::FixedRegion;
pub use provider::RegionProvider;
