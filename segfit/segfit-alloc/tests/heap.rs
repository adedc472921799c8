use segfit_alloc::{
    BlockInfo, CHUNK_SIZE, CLASS_COUNT, CheckError, DWORD, MIN_BLOCK, SCAN_LIMIT, SegregatedHeap,
    WORD, class_of,
};
use segfit_region::FixedRegion;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Host-side backing memory for a [`FixedRegion`], aligned so the heap's
/// payloads come out double-word aligned.
struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, DWORD).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
        Self { ptr, layout }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A heap over arena-backed memory; the arena outlives the heap.
struct TestHeap {
    heap: SegregatedHeap<FixedRegion>,
    _arena: Arena,
}

fn heap_with(capacity: usize) -> TestHeap {
    let arena = Arena::new(capacity);
    let region = unsafe { FixedRegion::new(arena.ptr, capacity) };
    TestHeap {
        heap: SegregatedHeap::init(region).expect("init"),
        _arena: arena,
    }
}

fn heap() -> TestHeap {
    heap_with(1 << 20)
}

fn free_blocks(heap: &SegregatedHeap<FixedRegion>) -> Vec<BlockInfo> {
    heap.blocks().filter(|b| !b.allocated).collect()
}

#[test]
fn fresh_heap_seeds_one_chunk_block() {
    let t = heap();
    t.heap.check().unwrap();

    let free = free_blocks(&t.heap);
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].size, CHUNK_SIZE);
    assert_eq!(t.heap.blocks().count(), 1);

    let seeded = class_of(CHUNK_SIZE);
    for class in 0..CLASS_COUNT {
        let expected = usize::from(class == seeded);
        assert_eq!(t.heap.class_len(class), expected, "class {class}");
    }
}

#[test]
fn small_requests_take_the_minimum_block() {
    let mut t = heap();

    // Anything that fits two words rounds up to the 4-word minimum.
    let p = t.heap.alloc(DWORD);
    assert!(!p.is_null());
    assert_eq!(p as usize % DWORD, 0);
    let block = t.heap.blocks().next().unwrap();
    assert_eq!(block.payload, p as usize);
    assert_eq!(block.size, MIN_BLOCK);
    t.heap.check().unwrap();

    // A request past the double word pays header + footer on top.
    let q = t.heap.alloc(DWORD + WORD);
    assert_eq!(q as usize % DWORD, 0);
    let block = t
        .heap
        .blocks()
        .find(|b| b.payload == q as usize)
        .unwrap();
    assert_eq!(block.size, 3 * DWORD);
    t.heap.check().unwrap();
}

#[test]
fn split_reinserts_the_remainder_in_its_class() {
    let mut t = heap();

    let p = t.heap.alloc(4 * DWORD);
    assert!(!p.is_null());
    t.heap.check().unwrap();

    let blocks: Vec<BlockInfo> = t.heap.blocks().collect();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].allocated);
    assert!(!blocks[1].allocated);
    assert_eq!(blocks[0].size, 5 * DWORD);
    assert_eq!(blocks[0].size + blocks[1].size, CHUNK_SIZE);
    assert_eq!(t.heap.class_len(class_of(blocks[1].size)), 1);
}

#[test]
fn minimal_split_remainder_goes_to_class_zero() {
    let mut t = heap();

    // Leave exactly one minimum block over; it must be filed in class 0.
    let p = t.heap.alloc(CHUNK_SIZE - MIN_BLOCK - DWORD);
    assert!(!p.is_null());
    t.heap.check().unwrap();

    let free = free_blocks(&t.heap);
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].size, MIN_BLOCK);
    assert_eq!(t.heap.class_len(0), 1);
}

#[test]
fn free_returns_the_heap_to_its_seeded_state() {
    let mut t = heap();
    let initial = free_blocks(&t.heap);

    let a = t.heap.alloc(DWORD + WORD);
    let b = t.heap.alloc(200);
    t.heap.check().unwrap();
    unsafe {
        t.heap.free(b);
        t.heap.check().unwrap();
        t.heap.free(a);
    }
    t.heap.check().unwrap();

    // Coalescing folds everything back into the original single block.
    assert_eq!(free_blocks(&t.heap), initial);
}

#[test]
fn coalesce_handles_all_neighbor_shapes() {
    let mut t = heap();

    // Three blocks that exactly exhaust the seeded chunk.
    let a = t.heap.alloc(1024 - DWORD);
    let b = t.heap.alloc(1024 - DWORD);
    let c = t.heap.alloc(2048 - DWORD);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());
    assert_eq!(free_blocks(&t.heap).len(), 0);
    t.heap.check().unwrap();

    unsafe {
        // Both neighbors allocated: B is inserted as-is.
        t.heap.free(b);
        t.heap.check().unwrap();
        assert_eq!(free_blocks(&t.heap).len(), 1);
        assert_eq!(free_blocks(&t.heap)[0].size, 1024);

        // Prologue on the left, free B on the right: A merges forward.
        t.heap.free(a);
        t.heap.check().unwrap();
        assert_eq!(free_blocks(&t.heap).len(), 1);
        assert_eq!(free_blocks(&t.heap)[0].size, 2048);

        // Free run on the left, epilogue on the right: C merges backward.
        t.heap.free(c);
    }
    t.heap.check().unwrap();
    let free = free_blocks(&t.heap);
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].size, CHUNK_SIZE);
}

#[test]
fn pseudo_best_fit_settles_within_the_scan_bound() {
    let mut t = heap();

    // Fifty free blocks in one class, sizes growing with the index, each
    // fenced by an allocated separator so none of them coalesce. LIFO
    // insertion puts the last-freed (largest) blocks at the list head.
    let count = 50;
    let mut blocks = Vec::with_capacity(count);
    for i in 0..count {
        let size = (136 + 2 * i) * WORD;
        let p = t.heap.alloc(size - DWORD);
        assert!(!p.is_null());
        blocks.push(p);
        assert!(!t.heap.alloc(DWORD).is_null());
    }
    for &p in &blocks {
        unsafe { t.heap.free(p) };
    }
    t.heap.check().unwrap();
    let class = class_of(136 * WORD);
    assert_eq!(class, class_of((136 + 2 * (count - 1)) * WORD));
    assert!(t.heap.class_len(class) >= count);

    // Every block suits this request. The head-first scan stops improving
    // after SCAN_LIMIT + 1 suitable candidates, so the winner is the
    // smallest of the most recently freed few, not the global best fit
    // sitting at the list's far end.
    let q = t.heap.alloc(128 * WORD);
    assert_eq!(q, blocks[count - (SCAN_LIMIT + 1)]);
    assert_ne!(q, blocks[0]);
    t.heap.check().unwrap();
}

#[test]
fn realloc_grows_in_place_by_absorbing_the_next_block() {
    let mut t = heap();

    let p = t.heap.alloc(4 * DWORD);
    assert_eq!(free_blocks(&t.heap).len(), 1);

    // The free tail is the physical successor; growth swallows it whole.
    let r = unsafe { t.heap.realloc(p, 8 * DWORD) };
    assert_eq!(r, p);
    t.heap.check().unwrap();

    let blocks: Vec<BlockInfo> = t.heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].allocated);
    assert_eq!(blocks[0].size, CHUNK_SIZE);
    for class in 0..CLASS_COUNT {
        assert_eq!(t.heap.class_len(class), 0);
    }
}

#[test]
fn realloc_shrink_keeps_the_block_and_its_slack() {
    let mut t = heap();

    let p = t.heap.alloc(10 * DWORD);
    let before = t.heap.blocks().next().unwrap();

    let r = unsafe { t.heap.realloc(p, DWORD) };
    assert_eq!(r, p);
    // No split: the block keeps its full extent as slack.
    assert_eq!(t.heap.blocks().next().unwrap(), before);
    t.heap.check().unwrap();
}

#[test]
fn realloc_to_the_same_payload_stays_in_place() {
    let mut t = heap();

    let p = t.heap.alloc(10 * DWORD);
    // Equal payload falls through to the growth paths; the free successor
    // keeps the block in place regardless.
    let r = unsafe { t.heap.realloc(p, 10 * DWORD) };
    assert_eq!(r, p);
    t.heap.check().unwrap();
}

#[test]
fn realloc_relocation_copies_and_reserves_slack() {
    let mut t = heap();

    let p = t.heap.alloc(100);
    let blocker = t.heap.alloc(100);
    assert!(!blocker.is_null());

    let pattern: Vec<u8> = (0..100).map(|i| i as u8).collect();
    unsafe { std::ptr::copy_nonoverlapping(pattern.as_ptr(), p, pattern.len()) };

    // In-place growth is fenced off by the blocker, so the payload moves.
    let r = unsafe { t.heap.realloc(p, 300) };
    assert!(!r.is_null());
    assert_ne!(r, p);
    t.heap.check().unwrap();
    assert_eq!(
        unsafe { std::slice::from_raw_parts(r, pattern.len()) },
        &pattern[..]
    );

    // The old block is free again.
    assert!(
        free_blocks(&t.heap)
            .iter()
            .any(|b| b.payload == p as usize)
    );

    // The relocated block was over-reserved (16x for a request this
    // small), so moderate growth resolves on the shrink/stay path.
    let again = unsafe { t.heap.realloc(r, 400) };
    assert_eq!(again, r);
    t.heap.check().unwrap();
}

#[test]
fn zero_size_and_null_inputs_follow_the_classic_contract() {
    let mut t = heap();

    assert!(t.heap.alloc(0).is_null());

    unsafe {
        // Freeing null is a no-op.
        t.heap.free(std::ptr::null_mut());
        t.heap.check().unwrap();

        // Realloc of null allocates.
        let p = t.heap.realloc(std::ptr::null_mut(), 64);
        assert!(!p.is_null());
        assert_eq!(p as usize % DWORD, 0);

        // Realloc to zero frees.
        assert!(t.heap.realloc(p, 0).is_null());
    }
    t.heap.check().unwrap();
    assert_eq!(free_blocks(&t.heap).len(), 1);
    assert_eq!(free_blocks(&t.heap)[0].size, CHUNK_SIZE);
}

#[test]
fn exhaustion_returns_null_and_leaves_the_heap_consistent() {
    // Room for the index, the sentinels, and the seed chunk, nothing more.
    let mut t = heap_with((CLASS_COUNT + 4) * WORD + CHUNK_SIZE);

    let a = t.heap.alloc(4 * DWORD);
    assert!(!a.is_null());

    // Larger than anything free and the region cannot grow.
    assert!(t.heap.alloc(CHUNK_SIZE).is_null());
    t.heap.check().unwrap();

    let pattern: Vec<u8> = (0..4 * DWORD).map(|i| (i * 7) as u8).collect();
    unsafe { std::ptr::copy_nonoverlapping(pattern.as_ptr(), a, pattern.len()) };

    // A reallocation that can neither merge nor relocate fails without
    // touching the original block.
    let r = unsafe { t.heap.realloc(a, CHUNK_SIZE) };
    assert!(r.is_null());
    t.heap.check().unwrap();
    assert_eq!(
        unsafe { std::slice::from_raw_parts(a, pattern.len()) },
        &pattern[..]
    );
    assert!(
        t.heap
            .blocks()
            .any(|b| b.payload == a as usize && b.allocated)
    );
}

#[test]
fn heap_grows_past_the_seed_chunk() {
    let mut t = heap();

    let p = t.heap.alloc(2 * CHUNK_SIZE);
    assert!(!p.is_null());
    assert_eq!(p as usize % DWORD, 0);
    t.heap.check().unwrap();

    // The growth request coalesced with the seeded free block first.
    let total: usize = t.heap.blocks().map(|b| b.size).sum();
    assert!(total > 2 * CHUNK_SIZE);
}

#[test]
fn checker_reports_a_smashed_boundary_tag() {
    let mut t = heap();

    let p = t.heap.alloc(DWORD);
    t.heap.check().unwrap();

    // Zero the footer word behind the payload.
    unsafe {
        let footer = (p as usize + MIN_BLOCK - DWORD) as *mut usize;
        footer.write(0);
    }
    assert!(matches!(
        t.heap.check(),
        Err(CheckError::TagMismatch { .. })
    ));
}

#[test]
fn mixed_traffic_stays_consistent() {
    let mut t = heap();
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    // Deterministic traffic, biased toward allocation.
    let mut state = 0x9E37_79B9_u64;
    let mut next = move || {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (state >> 33) as usize
    };

    for step in 0..400 {
        if live.is_empty() || next() % 3 != 0 {
            let size = next() % 600 + 1;
            let p = t.heap.alloc(size);
            assert!(!p.is_null(), "step {step}");
            // Scribble over the payload to catch overlapping blocks.
            unsafe { std::ptr::write_bytes(p, 0xA5, size) };
            live.push((p, size));
        } else {
            let (p, _) = live.swap_remove(next() % live.len());
            unsafe { t.heap.free(p) };
        }
        t.heap.check().unwrap();
    }

    for (p, _) in live {
        unsafe { t.heap.free(p) };
    }
    t.heap.check().unwrap();
    assert_eq!(free_blocks(&t.heap).len(), 1);
}
