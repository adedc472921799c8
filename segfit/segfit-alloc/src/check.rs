//! Heap diagnostics: the consistency checker, the block walker, and the
//! logging dump.
//!
//! None of this runs on the allocation fast path. Misuse the allocator
//! cannot detect (double free, stray writes past a payload) corrupts the
//! heap silently; [`SegregatedHeap::check`] is the surface that makes such
//! corruption visible to tests and embedders willing to pay for a full
//! walk. Every read is bounds- and step-guarded so the checker itself stays
//! safe on a damaged heap.

use crate::block::{DWORD, MIN_BLOCK, NIL, WORD, footer, header, link_next, link_prev, next_block};
use crate::class::{CLASS_COUNT, class_of};
use crate::heap::SegregatedHeap;
use log::debug;
use segfit_region::RegionProvider;

/// A consistency violation found by [`SegregatedHeap::check`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue sentinel is not an allocated double-word block.
    #[error("bad prologue at {addr:#x}")]
    BadPrologue {
        /// Prologue payload address.
        addr: usize,
    },
    /// A zero-size header that is not marked allocated.
    #[error("bad epilogue at {addr:#x}")]
    BadEpilogue {
        /// Would-be epilogue payload address.
        addr: usize,
    },
    /// The header walk left the region without meeting an epilogue.
    #[error("block at {addr:#x} runs past the heap's high bound")]
    RunawayBlock {
        /// Payload address of the block whose extent escapes the region.
        addr: usize,
    },
    /// A payload address that is not double-word aligned.
    #[error("block at {addr:#x} is not double-word aligned")]
    Misaligned {
        /// Offending payload address.
        addr: usize,
    },
    /// Header and footer of one block disagree.
    #[error("block at {addr:#x}: header {header:#x} != footer {footer:#x}")]
    TagMismatch {
        /// Offending payload address.
        addr: usize,
        /// Raw header word.
        header: usize,
        /// Raw footer word.
        footer: usize,
    },
    /// A block smaller than the minimum block size.
    #[error("block at {addr:#x}: size {size} below the minimum block size")]
    Undersized {
        /// Offending payload address.
        addr: usize,
        /// Stored block size.
        size: usize,
    },
    /// Two physically adjacent free blocks escaped coalescing.
    #[error("adjacent free blocks at {first:#x} and {second:#x}")]
    Uncoalesced {
        /// Lower block's payload address.
        first: usize,
        /// Upper block's payload address.
        second: usize,
    },
    /// A free block missing from the list its size maps to.
    #[error("free block at {addr:#x} is not in its class list")]
    NotIndexed {
        /// Offending payload address.
        addr: usize,
    },
    /// A list node whose header or footer reads allocated.
    #[error("node at {addr:#x} in class {class} is marked allocated")]
    AllocatedInList {
        /// Offending payload address.
        addr: usize,
        /// List the node was found in.
        class: usize,
    },
    /// A list node outside the region bounds.
    #[error("node at {addr:#x} in class {class} lies outside the heap")]
    LinkOutOfBounds {
        /// Offending link target.
        addr: usize,
        /// List the link was found in.
        class: usize,
    },
    /// A node filed under a class its size does not map to.
    #[error("class {class} holds a {size} byte block, which maps to class {expected}")]
    WrongClass {
        /// Offending payload address.
        addr: usize,
        /// Stored block size.
        size: usize,
        /// List the node was found in.
        class: usize,
        /// Class the size maps to.
        expected: usize,
    },
    /// A node whose prev link does not point at its list predecessor.
    #[error("node at {addr:#x}: prev link does not match the list walk")]
    BrokenLinks {
        /// Offending payload address.
        addr: usize,
    },
    /// A class list that does not terminate.
    #[error("class {class} list does not terminate")]
    ListCycle {
        /// Offending class.
        class: usize,
    },
}

/// One block of the chain, as yielded by [`SegregatedHeap::blocks`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address.
    pub payload: usize,
    /// Total block size, tags included.
    pub size: usize,
    /// Allocated flag from the header.
    pub allocated: bool,
}

/// Iterator over the real blocks between prologue and epilogue.
///
/// On a corrupted heap the walk ends early instead of leaving the region;
/// use [`SegregatedHeap::check`] to tell the two apart.
pub struct Blocks<'heap, R> {
    heap: &'heap SegregatedHeap<R>,
    bp: usize,
}

impl<R: RegionProvider> Iterator for Blocks<'_, R> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.bp == NIL {
            return None;
        }
        // SAFETY: `bp` tracks the header walk inside the region; the cursor
        // is cleared as soon as a block's extent would leave it.
        unsafe {
            let tag = header(self.bp);
            let size = tag.size();
            if size < MIN_BLOCK {
                return None; // epilogue, or damage the checker reports
            }
            let info = BlockInfo {
                payload: self.bp,
                size,
                allocated: tag.is_allocated(),
            };
            self.bp = match self.bp.checked_add(size) {
                Some(next) if next <= self.heap.region().high_bound() => next,
                _ => NIL,
            };
            Some(info)
        }
    }
}

impl<R: RegionProvider> SegregatedHeap<R> {
    /// Walk the block chain from the first real block.
    pub fn blocks(&self) -> Blocks<'_, R> {
        // SAFETY: the prologue always has intact tags.
        let first = unsafe { next_block(self.start()) };
        Blocks {
            heap: self,
            bp: first,
        }
    }

    /// Number of nodes in `class`'s free list (step- and bounds-guarded).
    #[must_use]
    pub fn class_len(&self, class: usize) -> usize {
        let mut count = 0;
        // SAFETY: every node is bounds-checked before its link word is read,
        // and the walk is step-bounded.
        unsafe {
            let mut node = self.index().head(class);
            while self.payload_in_bounds(node) && count <= self.max_list_steps() {
                count += 1;
                node = link_next(node);
            }
        }
        count
    }

    /// Verify every structural invariant the allocator promises between
    /// calls: intact sentinels, tag agreement, minimum sizes, alignment,
    /// total coalescing, free-list completeness, per-class membership, and
    /// doubly-linked list integrity inside the region bounds.
    ///
    /// # Errors
    /// The first violation found, in walk order.
    pub fn check(&self) -> Result<(), CheckError> {
        // SAFETY: every read below is fenced by the bound checks in the
        // walks themselves; the checker never writes.
        unsafe {
            self.check_sentinels_and_chain()?;
            self.check_class_lists()
        }
    }

    /// Log the whole block chain, one line per block.
    pub fn dump(&self) {
        let low = self.region().low_bound();
        let high = self.region().high_bound();
        debug!("heap [{low:#x}, {high:#x}), {} bytes", high - low);
        for block in self.blocks() {
            debug!(
                "  {:#x}: {:5} bytes, {}",
                block.payload,
                block.size,
                if block.allocated { "allocated" } else { "free" },
            );
        }
    }

    /// Upper bound on live list nodes: one per minimum-size block.
    fn max_list_steps(&self) -> usize {
        (self.region().high_bound() - self.region().low_bound()) / MIN_BLOCK + 1
    }

    /// Could `addr` be a real block's payload pointer? Real blocks start
    /// past the index, the padding word, and the prologue.
    fn payload_in_bounds(&self, addr: usize) -> bool {
        let first = self.region().low_bound() + (CLASS_COUNT + 4) * WORD;
        addr >= first && addr < self.region().high_bound()
    }

    unsafe fn check_sentinels_and_chain(&self) -> Result<(), CheckError> {
        let high = self.region().high_bound();
        let start = self.start();

        // SAFETY: prologue tags are inside the region by construction.
        unsafe {
            let prologue = header(start);
            if prologue.size() != DWORD || !prologue.is_allocated() || footer(start) != prologue {
                return Err(CheckError::BadPrologue { addr: start });
            }

            let mut prev_free_at = None;
            let mut bp = next_block(start);
            loop {
                let tag = header(bp);
                if tag.size() == 0 {
                    if tag.is_allocated() {
                        return Ok(()); // epilogue reached
                    }
                    return Err(CheckError::BadEpilogue { addr: bp });
                }
                if bp % DWORD != 0 {
                    return Err(CheckError::Misaligned { addr: bp });
                }
                if tag.size() < MIN_BLOCK {
                    return Err(CheckError::Undersized {
                        addr: bp,
                        size: tag.size(),
                    });
                }
                let end = bp.checked_add(tag.size());
                if end.is_none_or(|end| end > high) {
                    return Err(CheckError::RunawayBlock { addr: bp });
                }
                if footer(bp) != tag {
                    return Err(CheckError::TagMismatch {
                        addr: bp,
                        header: tag.raw(),
                        footer: footer(bp).raw(),
                    });
                }
                if tag.is_allocated() {
                    prev_free_at = None;
                } else {
                    if let Some(first) = prev_free_at {
                        return Err(CheckError::Uncoalesced {
                            first,
                            second: bp,
                        });
                    }
                    if !self.list_contains(class_of(tag.size()), bp) {
                        return Err(CheckError::NotIndexed { addr: bp });
                    }
                    prev_free_at = Some(bp);
                }
                bp = next_block(bp);
            }
        }
    }

    unsafe fn check_class_lists(&self) -> Result<(), CheckError> {
        let high = self.region().high_bound();

        for class in 0..CLASS_COUNT {
            let mut steps = 0;
            let mut prev = NIL;
            // SAFETY: every node is bounds-checked before its words are
            // read, and the walk is step-bounded.
            unsafe {
                let mut node = self.index().head(class);
                while node != NIL {
                    if !self.payload_in_bounds(node) {
                        return Err(CheckError::LinkOutOfBounds { addr: node, class });
                    }
                    steps += 1;
                    if steps > self.max_list_steps() {
                        return Err(CheckError::ListCycle { class });
                    }
                    let tag = header(node);
                    if tag.size() < MIN_BLOCK {
                        return Err(CheckError::Undersized {
                            addr: node,
                            size: tag.size(),
                        });
                    }
                    let end = node.checked_add(tag.size());
                    if end.is_none_or(|end| end > high) {
                        return Err(CheckError::RunawayBlock { addr: node });
                    }
                    if tag.is_allocated() || footer(node).is_allocated() {
                        return Err(CheckError::AllocatedInList { addr: node, class });
                    }
                    let expected = class_of(tag.size());
                    if expected != class {
                        return Err(CheckError::WrongClass {
                            addr: node,
                            size: tag.size(),
                            class,
                            expected,
                        });
                    }
                    if link_prev(node) != prev {
                        return Err(CheckError::BrokenLinks { addr: node });
                    }
                    prev = node;
                    node = link_next(node);
                }
            }
        }
        Ok(())
    }

    /// Is `bp` reachable from `class`'s head? Step- and bounds-guarded.
    fn list_contains(&self, class: usize, bp: usize) -> bool {
        let mut steps = 0;
        // SAFETY: every node is bounds-checked before its link word is read,
        // and the walk is step-bounded.
        unsafe {
            let mut node = self.index().head(class);
            while self.payload_in_bounds(node) && steps <= self.max_list_steps() {
                if node == bp {
                    return true;
                }
                steps += 1;
                node = link_next(node);
            }
        }
        false
    }
}
