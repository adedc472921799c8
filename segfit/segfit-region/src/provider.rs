use core::ptr::NonNull;

/// A contiguous, monotonically growable address range.
///
/// The provider owns the range; consumers carve their own structure into the
/// memory it returns. The contract is deliberately minimal:
///
/// - [`request`](Self::request) appends `len` bytes to the high end of the
///   range and returns the address of the newly appended run, or `None` when
///   the range cannot grow. Returned addresses are strictly increasing and
///   remain valid for the lifetime of the provider.
/// - There is no shrink and no release. Memory handed out stays out.
/// - [`low_bound`](Self::low_bound) and [`high_bound`](Self::high_bound)
///   report the current extent `[low, high)`; diagnostic code uses them to
///   validate that stored pointers stay inside the range.
pub trait RegionProvider {
    /// Grow the range by `len` bytes.
    ///
    /// Returns the address of the first newly valid byte (the previous high
    /// bound), or `None` if the provider cannot satisfy the request. A failed
    /// request leaves the extent unchanged.
    fn request(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// First address of the range.
    fn low_bound(&self) -> usize;

    /// One past the last valid address of the range.
    fn high_bound(&self) -> usize;
}
