//! The segregated-fit heap.
//!
//! Owns the block chain and the class index carved into a
//! [`RegionProvider`]'s range, and implements the allocate / free /
//! reallocate triple on top of them.

use crate::block::{
    BoundaryTag, DWORD, MIN_BLOCK, NIL, WORD, header, link_next, next_block, prev_block,
    prev_footer, set_footer, set_header, set_tags, store_word,
};
use crate::class::{CLASS_COUNT, class_of};
use crate::index::ClassIndex;
use core::cmp;
use core::ptr;
use log::{debug, trace};
use segfit_region::RegionProvider;

/// Bytes requested from the region per growth step, at minimum.
pub const CHUNK_SIZE: usize = 4096;

/// Suitable candidates examined per class before the fit search settles.
///
/// The search keeps scanning until it has looked at `SCAN_LIMIT + 1`
/// suitable blocks, then takes the best of those. Bounds the work per
/// allocation while keeping most of best-fit's packing.
pub const SCAN_LIMIT: usize = 5;

/// Cap on the growth slack reserved by a relocating reallocation.
pub const REALLOC_SLACK: usize = 24576;

/// Failed to bring up the heap.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InitError {
    /// The region provider refused the initial request.
    #[error("region provider could not supply the initial heap")]
    RegionExhausted,
    /// The region's base would misalign every payload the heap hands out.
    #[error("region base {addr:#x} is not double-word aligned")]
    MisalignedRegion {
        /// The offending base address.
        addr: usize,
    },
}

/// A segregated-fit allocator with boundary-tag coalescing.
///
/// The heap lives entirely inside the provider's range, laid out left to
/// right as: the class-head index, one padding word, an allocated prologue
/// sentinel, the real blocks, and a zero-size allocated epilogue header.
/// The sentinels fence the coalescing neighbor reads so no path needs a
/// bounds check.
///
/// All entry points assume exclusive access (`&mut self`); serialization
/// against concurrent callers is the embedder's business. Between calls the
/// heap is consistent; [`check`](Self::check) verifies exactly that.
pub struct SegregatedHeap<R> {
    region: R,
    index: ClassIndex,
    /// Payload pointer of the prologue; the block walk starts here.
    start: usize,
}

impl<R: RegionProvider> SegregatedHeap<R> {
    /// Bring up an empty heap inside `region` and seed it with one
    /// [`CHUNK_SIZE`] free block.
    ///
    /// # Errors
    /// [`InitError::RegionExhausted`] if the provider cannot supply the
    /// index, the sentinels, and the first chunk;
    /// [`InitError::MisalignedRegion`] if the range starts on an address
    /// that is not a multiple of [`DWORD`].
    pub fn init(mut region: R) -> Result<Self, InitError> {
        let setup = (CLASS_COUNT + 4) * WORD;
        let base = region
            .request(setup)
            .ok_or(InitError::RegionExhausted)?
            .as_ptr() as usize;
        if base % DWORD != 0 {
            return Err(InitError::MisalignedRegion { addr: base });
        }

        let mut index = ClassIndex::new(base);
        let pad = base + CLASS_COUNT * WORD;
        let prologue = pad + DWORD;
        // SAFETY: the provider just handed us `setup` writable bytes at
        // `base`; index, padding word, prologue, and epilogue fill exactly
        // that span.
        unsafe {
            index.clear();
            store_word(pad, 0);
            set_tags(prologue, BoundaryTag::new(DWORD, true));
            set_header(next_block(prologue), BoundaryTag::EPILOGUE);
        }

        let mut heap = Self {
            region,
            index,
            start: prologue,
        };
        if heap.extend_words(CHUNK_SIZE / WORD).is_none() {
            return Err(InitError::RegionExhausted);
        }
        debug!(
            "heap up: index at {base:#x}, {count} classes, {seed} byte seed",
            count = CLASS_COUNT,
            seed = CHUNK_SIZE
        );
        Ok(heap)
    }

    /// Allocate at least `size` bytes of [`DWORD`]-aligned payload.
    ///
    /// Returns null when `size` is zero or the region cannot grow any
    /// further; the heap is unchanged in the failure case.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let Some(asize) = adjusted_size(size) else {
            return ptr::null_mut();
        };

        // SAFETY: list nodes come from the index, which only ever holds
        // payload pointers of live free blocks.
        unsafe {
            for class in class_of(asize)..CLASS_COUNT {
                if let Some(bp) = self.scan_class(asize, class) {
                    self.index.remove(bp, class);
                    self.place(bp, asize);
                    return bp as *mut u8;
                }
            }
        }

        let grow = cmp::max(asize, CHUNK_SIZE);
        let Some(bp) = self.extend_words(grow / WORD) else {
            debug!("alloc({size}): region exhausted after {grow} byte growth request");
            return ptr::null_mut();
        };
        // SAFETY: `extend_words` coalesced and indexed `bp`, so it is a free
        // block of at least `asize` bytes sitting in its size's list.
        unsafe {
            self.index.remove(bp, class_of(header(bp).size()));
            self.place(bp, asize);
        }
        bp as *mut u8
    }

    /// Return the block at `ptr` to the heap. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a payload pointer previously returned by
    /// [`alloc`](Self::alloc) or [`realloc`](Self::realloc) on this heap
    /// and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let bp = ptr as usize;
        // SAFETY: per contract `bp` is a live allocated block of ours.
        unsafe {
            let size = header(bp).size();
            set_tags(bp, BoundaryTag::new(size, false));
            self.coalesce(bp);
        }
    }

    /// Resize the block at `ptr` to hold at least `size` bytes.
    ///
    /// Semantics follow the classic contract: a null `ptr` allocates, a
    /// zero `size` frees and returns null. Shrinking (strictly below the
    /// current payload) keeps the block and its slack. Growing absorbs a
    /// free right neighbor when that suffices; otherwise the payload moves
    /// to a fresh block over-reserved by up to [`REALLOC_SLACK`] bytes so
    /// the next few growth requests stay in place. On relocation failure
    /// the original block is untouched and null is returned.
    ///
    /// # Safety
    /// Same as [`free`](Self::free) for non-null `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            // SAFETY: forwarded contract.
            unsafe { self.free(ptr) };
            return ptr::null_mut();
        }
        if ptr.is_null() {
            return self.alloc(size);
        }
        let bp = ptr as usize;

        // SAFETY: per contract `bp` is a live allocated block; the epilogue
        // fences the next-block read.
        unsafe {
            let current = header(bp).size();
            if size < current - DWORD {
                return ptr;
            }

            let next = next_block(bp);
            let next_tag = header(next);
            let combined = current + next_tag.size();
            if !next_tag.is_allocated() && combined - DWORD >= size {
                self.index.remove(next, class_of(next_tag.size()));
                // Header first: the footer position must track the merged
                // extent. No split; the surplus stays as slack.
                set_tags(bp, BoundaryTag::new(combined, true));
                return ptr;
            }

            let new_ptr = self.alloc(reserved_size(size));
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            let copy = cmp::min(current - DWORD, size);
            ptr::copy_nonoverlapping(ptr, new_ptr, copy);
            self.free(ptr);
            new_ptr
        }
    }

    /// Pseudo-best-fit within one class: best of the first
    /// [`SCAN_LIMIT`]` + 1` suitable blocks, first match winning ties.
    ///
    /// # Safety
    /// The index must be consistent for `class`.
    unsafe fn scan_class(&self, asize: usize, class: usize) -> Option<usize> {
        let mut best = NIL;
        let mut best_padding = usize::MAX;
        let mut suitable = 0;

        // SAFETY: list traversal over indexed free blocks.
        unsafe {
            let mut bp = self.index.head(class);
            while bp != NIL {
                let size = header(bp).size();
                if size >= asize {
                    if suitable > SCAN_LIMIT {
                        break;
                    }
                    let padding = size - asize;
                    if padding < best_padding {
                        best_padding = padding;
                        best = bp;
                    }
                    suitable += 1;
                }
                bp = link_next(bp);
            }
        }
        (best != NIL).then_some(best)
    }

    /// Carve an `asize` allocation out of the free block `bp` (already
    /// removed from its list). Splits when the remainder can stand as a
    /// block of its own; the remainder is re-classified from its new size.
    ///
    /// # Safety
    /// `bp` must be a free block of at least `asize` bytes, in no list.
    unsafe fn place(&mut self, bp: usize, asize: usize) {
        // SAFETY: per contract the whole extent of `bp` is ours to rewrite.
        unsafe {
            let csize = header(bp).size();
            if csize - asize >= MIN_BLOCK {
                set_tags(bp, BoundaryTag::new(asize, true));
                let rest = next_block(bp);
                set_tags(rest, BoundaryTag::new(csize - asize, false));
                self.index.insert(rest, class_of(csize - asize));
            } else {
                set_tags(bp, BoundaryTag::new(csize, true));
            }
        }
    }

    /// Merge the newly freed block `bp` with whichever physical neighbors
    /// are free, then index the result under its final size. Returns the
    /// payload pointer of the merged block.
    ///
    /// # Safety
    /// `bp`'s tags must already read free, and `bp` must be in no list.
    unsafe fn coalesce(&mut self, bp: usize) -> usize {
        // SAFETY: prologue and epilogue fence both neighbor reads.
        unsafe {
            let prev_free = !prev_footer(bp).is_allocated();
            let next = next_block(bp);
            let next_free = !header(next).is_allocated();
            let mut size = header(bp).size();

            match (prev_free, next_free) {
                (false, false) => {
                    self.index.insert(bp, class_of(size));
                    bp
                }
                (false, true) => {
                    self.index.remove(next, class_of(header(next).size()));
                    size += header(next).size();
                    set_tags(bp, BoundaryTag::new(size, false));
                    self.index.insert(bp, class_of(size));
                    bp
                }
                (true, false) => {
                    let prev = prev_block(bp);
                    self.index.remove(prev, class_of(header(prev).size()));
                    size += header(prev).size();
                    let tag = BoundaryTag::new(size, false);
                    // Footer first: its position is derived from `bp`'s old
                    // header, which is exactly the merged block's far end.
                    set_footer(bp, tag);
                    set_header(prev, tag);
                    self.index.insert(prev, class_of(size));
                    prev
                }
                (true, true) => {
                    let prev = prev_block(bp);
                    self.index.remove(prev, class_of(header(prev).size()));
                    self.index.remove(next, class_of(header(next).size()));
                    size += header(prev).size() + header(next).size();
                    let tag = BoundaryTag::new(size, false);
                    set_footer(next, tag);
                    set_header(prev, tag);
                    self.index.insert(prev, class_of(size));
                    prev
                }
            }
        }
    }

    /// Grow the region by `words` (rounded up to even), install the new
    /// epilogue, and hand the reclaimed span to [`coalesce`](Self::coalesce).
    /// Returns the payload pointer of the resulting free block, or `None`
    /// when the provider refuses, in which case nothing changed.
    fn extend_words(&mut self, words: usize) -> Option<usize> {
        let words = if words % 2 == 0 { words } else { words + 1 };
        let bytes = words * WORD;
        let raw = self.region.request(bytes)?;
        trace!("extending heap by {bytes} bytes");

        let bp = raw.as_ptr() as usize;
        // SAFETY: the new span starts where the old epilogue header sat, so
        // `bp` is payload-positioned over it; writing the free tags and the
        // re-installed epilogue stays inside the freshly granted bytes.
        unsafe {
            set_tags(bp, BoundaryTag::new(bytes, false));
            set_header(next_block(bp), BoundaryTag::EPILOGUE);
            Some(self.coalesce(bp))
        }
    }

    pub(crate) const fn index(&self) -> &ClassIndex {
        &self.index
    }

    pub(crate) const fn region(&self) -> &R {
        &self.region
    }

    pub(crate) const fn start(&self) -> usize {
        self.start
    }
}

/// Round a request up to a legal block size: payload plus header and footer,
/// [`DWORD`]-aligned, never below [`MIN_BLOCK`]. `None` when the overhead
/// does not fit the address space; such a request can never be satisfied.
const fn adjusted_size(size: usize) -> Option<usize> {
    if size <= DWORD {
        return Some(MIN_BLOCK);
    }
    match size.checked_add(2 * DWORD - 1) {
        Some(padded) => Some(padded / DWORD * DWORD),
        None => None,
    }
}

/// Payload size a relocating reallocation actually requests:
/// `min(16 * size, size + `[`REALLOC_SLACK`]`)`. The slack soaks up the
/// next growth requests so they resolve in place.
const fn reserved_size(size: usize) -> usize {
    let grown = size.saturating_mul(16);
    let capped = size.saturating_add(REALLOC_SLACK);
    if grown < capped { grown } else { capped }
}
