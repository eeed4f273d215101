use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::NonNull;

use new_zealand::nz;

use crate::block::{Block, BlockLayoutInfo};
use crate::{BlockHeapBuilder, FreeError};

/// Number of slots added by every growth step unless overridden through the
/// builder.
///
/// Every block of a heap uses the same slot count, so growth always adds the
/// same amount of capacity. The value is a trade-off between allocator
/// round-trips and worst-case unused memory; callers with unusual object
/// sizes can pick their own through
/// [`slots_per_block()`](BlockHeapBuilder::slots_per_block).
#[cfg(not(miri))]
pub(crate) const DEFAULT_SLOTS_PER_BLOCK: NonZero<usize> = nz!(128);

// Under Miri, we use a smaller batch because Miri test runtime scales by
// memory usage.
#[cfg(miri)]
pub(crate) const DEFAULT_SLOTS_PER_BLOCK: NonZero<usize> = nz!(16);

/// A pool of fixed-size memory slots, allocated in contiguous blocks and
/// reused in LIFO order.
///
/// The heap hands out raw payload pointers of a fixed [`Layout`] chosen at
/// construction time. Slots are carved out of blocks, each block being one
/// contiguous allocation holding a fixed number of slots, so the underlying
/// allocator is visited once per batch rather than once per object.
///
/// # Key properties
///
/// - **Stable addresses**: a handed-out slot never moves and is never
///   re-issued until it is freed.
/// - **LIFO reuse**: the most recently freed slot is handed out first, which
///   favors cache locality.
/// - **Batched growth**: the heap grows by exactly one block whenever it runs
///   out of free slots, or once at construction when eager growth is
///   requested. Blocks are never individually released or compacted; all
///   memory is returned when the heap is dropped.
/// - **Defensive release**: freeing an address the heap does not own, or
///   freeing the same slot twice, is detected and reported without
///   corrupting the heap.
///
/// # Memory contents
///
/// Allocated slots are handed out uninitialized. Freeing a slot does not zero
/// or otherwise scrub the payload bytes; callers must not assume anything
/// about the contents of a freshly allocated slot.
///
/// # Example
///
/// ```rust
/// use block_heap::BlockHeap;
///
/// let mut heap = BlockHeap::builder().layout_of::<u64>().build();
///
/// let slot = heap.allocate().expect("heap bookkeeping is intact");
///
/// // SAFETY: the slot is sized and aligned for u64 and remains valid
/// // until freed.
/// unsafe {
///     slot.cast::<u64>().write(42);
/// }
///
/// assert_eq!(heap.len(), 1);
///
/// heap.free(slot);
/// assert_eq!(heap.len(), 0);
/// ```
///
/// # Thread safety
///
/// The heap is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]); it
/// performs no internal locking. Sharing one heap between threads requires
/// external mutual exclusion around every operation.
#[derive(Debug)]
pub struct BlockHeap {
    /// The payload layout every slot satisfies.
    slot_layout: Layout,

    /// Slots added by each growth step.
    slots_per_block: NonZero<usize>,

    /// Stride and offset math shared by every block of this heap.
    layout_info: BlockLayoutInfo,

    /// Blocks in creation order. Never reordered, never individually freed.
    blocks: Vec<Block>,

    /// Earliest block known to have a free slot, if known. This is a cache,
    /// not the ground truth - `None` means "unknown", never "no vacancy".
    /// When `Some`, no earlier block has a free slot, so allocation keeps
    /// filling blocks from the front.
    block_with_free_slot_index: Option<usize>,

    /// Total free slots across all blocks. Invariant: equals the sum of
    /// every block's free chain length.
    free_count: usize,
}

impl BlockHeap {
    /// Creates a builder for configuring and constructing a [`BlockHeap`].
    ///
    /// The payload layout is mandatory and is set with either
    /// [`layout()`](BlockHeapBuilder::layout) or
    /// [`layout_of::<T>()`](BlockHeapBuilder::layout_of); the remaining
    /// settings are optional.
    ///
    /// # Example
    ///
    /// ```rust
    /// use block_heap::BlockHeap;
    ///
    /// let heap = BlockHeap::builder().layout_of::<u32>().build();
    ///
    /// assert_eq!(heap.len(), 0);
    /// assert_eq!(heap.capacity(), 0);
    /// ```
    #[inline]
    pub fn builder() -> BlockHeapBuilder {
        BlockHeapBuilder::new()
    }

    /// Creates a new [`BlockHeap`] with the given configuration.
    ///
    /// Used internally by the builder.
    ///
    /// # Panics
    ///
    /// Panics if the payload layout has zero size.
    #[must_use]
    pub(crate) fn new_inner(
        slot_layout: Layout,
        slots_per_block: NonZero<usize>,
        eager_growth: bool,
    ) -> Self {
        assert!(
            slot_layout.size() > 0,
            "BlockHeap must have a non-zero slot size"
        );

        let mut heap = Self {
            slot_layout,
            slots_per_block,
            layout_info: BlockLayoutInfo::calculate(slot_layout, slots_per_block),
            blocks: Vec::new(),
            block_with_free_slot_index: None,
            free_count: 0,
        };

        if eager_growth {
            heap.grow();
        }

        heap
    }

    /// The payload layout every slot of this heap satisfies.
    #[must_use]
    #[inline]
    pub fn slot_layout(&self) -> Layout {
        self.slot_layout
    }

    /// Number of slots each growth step adds.
    #[must_use]
    #[inline]
    pub fn slots_per_block(&self) -> usize {
        self.slots_per_block.get()
    }

    /// Number of slots currently handed out.
    ///
    /// # Example
    ///
    /// ```rust
    /// use block_heap::BlockHeap;
    ///
    /// let mut heap = BlockHeap::builder().layout_of::<u32>().build();
    /// assert_eq!(heap.len(), 0);
    ///
    /// let slot = heap.allocate().unwrap();
    /// assert_eq!(heap.len(), 1);
    ///
    /// heap.free(slot);
    /// assert_eq!(heap.len(), 0);
    /// ```
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use and/or infinite loop.
    #[inline]
    pub fn len(&self) -> usize {
        debug_assert_eq!(
            self.capacity().wrapping_sub(self.free_count),
            self.blocks.iter().map(Block::used_len).sum::<usize>()
        );

        // free_count never exceeds capacity.
        self.capacity().wrapping_sub(self.free_count)
    }

    /// Whether no slots are currently handed out.
    ///
    /// An empty heap may still be holding block memory.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots across all blocks, free and used alike.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        // Overflow here would imply capacity is greater than virtual memory.
        self.blocks.len().wrapping_mul(self.slots_per_block.get())
    }

    /// Number of slots currently available without growing.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use and/or infinite loop.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.free_count
    }

    /// Number of blocks the heap has grown to.
    #[must_use]
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Hands out one slot and returns its payload address.
    ///
    /// The heap grows by one block first when no free slot exists. The
    /// returned memory is uninitialized and stays valid, at a stable address,
    /// until passed to [`free()`](Self::free) or the heap is dropped.
    ///
    /// Returns `None` only if the heap's internal bookkeeping is found to be
    /// inconsistent; that is a reportable bug in the pool, not back-pressure,
    /// and is accompanied by an error-level log record. Growth itself never
    /// fails softly: memory exhaustion panics.
    ///
    /// # Example
    ///
    /// ```rust
    /// use block_heap::BlockHeap;
    ///
    /// let mut heap = BlockHeap::builder().layout_of::<[u8; 48]>().build();
    ///
    /// let first = heap.allocate().unwrap();
    /// let second = heap.allocate().unwrap();
    ///
    /// // Distinct slots, one block.
    /// assert_ne!(first, second);
    /// assert_eq!(heap.block_count(), 1);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if growth is needed and the underlying allocator is out of
    /// memory.
    #[must_use]
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        if self.free_count == 0 {
            self.grow();

            // grow() always adds a full block of free slots, so this can
            // only trip when the accounting is corrupt. Report instead of
            // looping on growth.
            if self.free_count == 0 {
                log::error!("allocate failed: no free slots after growth; the free slot count is corrupt");
                return None;
            }
        }

        let Some(block_index) = self.index_of_block_with_free_slot() else {
            log::error!(
                "allocate failed: free slot count ({}) matches no block; the accounting is corrupt",
                self.free_count
            );
            return None;
        };

        #[expect(
            clippy::indexing_slicing,
            reason = "we just received knowledge that there is a block with a free slot at this index"
        )]
        let block = &mut self.blocks[block_index];

        let ptr = block.take_free_slot();

        // The cache must not keep pointing at a block that just filled up.
        if block.free_len() == 0 {
            self.block_with_free_slot_index = None;
        }

        // Cannot wrap: free_count was checked to be nonzero above.
        self.free_count = self.free_count.wrapping_sub(1);

        #[cfg(debug_assertions)]
        self.integrity_check();

        log::trace!("allocate -> {ptr:p} (block {block_index})");

        Some(ptr)
    }

    /// Returns a slot to the heap, reporting rather than propagating invalid
    /// releases.
    ///
    /// `ptr` must be an address previously returned by
    /// [`allocate()`](Self::allocate) on this heap and not freed since. A
    /// double free or an address the heap does not own is detected, recorded
    /// through the logging facade at error level, and otherwise ignored; the
    /// heap state is left untouched. Use [`try_free()`](Self::try_free) when
    /// the caller wants the verdict as a value instead.
    ///
    /// # Example
    ///
    /// ```rust
    /// use block_heap::BlockHeap;
    ///
    /// let mut heap = BlockHeap::builder().layout_of::<u32>().build();
    ///
    /// let slot = heap.allocate().unwrap();
    /// heap.free(slot);
    ///
    /// // Freeing the same slot again is detected and has no effect.
    /// heap.free(slot);
    /// assert_eq!(heap.len(), 0);
    /// ```
    #[inline]
    pub fn free(&mut self, ptr: NonNull<u8>) {
        if let Err(error) = self.try_free(ptr) {
            log::error!("{error}");
        }
    }

    /// Returns a slot to the heap.
    ///
    /// On success the slot becomes the first candidate for reuse (LIFO). The
    /// payload bytes are not zeroed or otherwise scrubbed.
    ///
    /// # Errors
    ///
    /// [`FreeError::DoubleFree`] if the address is a slot of this heap that
    /// is already free; [`FreeError::ForeignPointer`] if no block of this
    /// heap owns the address. In both cases the heap is left unchanged.
    ///
    /// Detection is a bounds-and-stride check against each block's region,
    /// so it is exact for addresses the heap has never issued. It cannot
    /// distinguish a stale copy of a legitimately issued address from the
    /// address itself: freeing through a stale copy while the slot is handed
    /// out to someone else frees that someone's slot.
    ///
    /// # Example
    ///
    /// ```rust
    /// use block_heap::{BlockHeap, FreeError};
    ///
    /// let mut heap = BlockHeap::builder().layout_of::<u32>().build();
    ///
    /// let slot = heap.allocate().unwrap();
    ///
    /// assert!(heap.try_free(slot).is_ok());
    /// assert!(matches!(
    ///     heap.try_free(slot),
    ///     Err(FreeError::DoubleFree { .. })
    /// ));
    /// ```
    pub fn try_free(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        for (block_index, block) in self.blocks.iter_mut().enumerate() {
            let Some(slot_index) = block.slot_index_of(ptr) else {
                continue;
            };

            if block.slot_is_free(slot_index) {
                return Err(FreeError::DoubleFree {
                    address: ptr.addr().get(),
                });
            }

            block.release_used_slot(slot_index);

            // Cannot overflow: at least one slot was handed out just now.
            self.free_count = self.free_count.wrapping_add(1);

            // Keep the cache pointing at the earliest block with a vacancy.
            // When the cache is unknown we leave it unknown; promoting this
            // block could skip an earlier one the next scan would find.
            self.block_with_free_slot_index = self
                .block_with_free_slot_index
                .map(|cached| cached.min(block_index));

            #[cfg(debug_assertions)]
            self.integrity_check();

            log::trace!("free {ptr:p} (block {block_index})");

            return Ok(());
        }

        Err(FreeError::ForeignPointer {
            address: ptr.addr().get(),
        })
    }

    /// Adds one block to the heap.
    ///
    /// This is the only way new memory enters the pool. It runs when
    /// [`allocate()`](Self::allocate) finds no free slot, or once at
    /// construction under eager growth.
    ///
    /// # Panics
    ///
    /// Panics if the underlying allocator is out of memory. There is no
    /// smaller unit of work to shed, so no retry is attempted.
    fn grow(&mut self) {
        debug_assert_eq!(self.free_count, 0);

        self.blocks
            .push(Block::new(self.layout_info.clone(), self.slots_per_block));

        // Growth only happens when every existing block is full, so the new
        // block is the earliest (and only) one with free slots.
        // Cannot wrap: we just pushed a block.
        self.block_with_free_slot_index = Some(self.blocks.len().wrapping_sub(1));

        // Cannot overflow: that would imply more slots than virtual memory.
        self.free_count = self.free_count.wrapping_add(self.slots_per_block.get());

        log::trace!(
            "grew to {} blocks ({} slots)",
            self.blocks.len(),
            self.capacity()
        );
    }

    /// Index of the earliest block with a free slot, consulting the cache
    /// first and falling back to an insertion-order scan.
    ///
    /// `None` despite a nonzero free count means the accounting is corrupt;
    /// the caller reports it.
    fn index_of_block_with_free_slot(&mut self) -> Option<usize> {
        if let Some(index) = self.block_with_free_slot_index {
            return Some(index);
        }

        let found = self.blocks.iter().position(|block| block.free_len() > 0);
        self.block_with_free_slot_index = found;
        found
    }

    /// Verifies heap-wide accounting and delegates per-block verification.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[allow(
        clippy::indexing_slicing,
        clippy::arithmetic_side_effects,
        reason = "the integrity check needs direct array access"
    )]
    pub(crate) fn integrity_check(&self) {
        let mut free_total = 0_usize;

        for block in &self.blocks {
            block.integrity_check();

            assert_eq!(
                block.free_len() + block.used_len(),
                block.capacity().get(),
                "block chains do not partition its slots"
            );

            free_total += block.free_len();
        }

        assert_eq!(
            free_total, self.free_count,
            "free slot count does not match the blocks' free chains"
        );

        if let Some(cached) = self.block_with_free_slot_index {
            assert!(
                self.blocks[cached].free_len() > 0,
                "cached block {cached} has no free slot"
            );
            assert!(
                self.blocks[..cached]
                    .iter()
                    .all(|block| block.free_len() == 0),
                "cached block {cached} is not the earliest with a free slot"
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockHeap: Send, std::fmt::Debug);
    assert_not_impl_any!(BlockHeap: Sync);

    fn small_heap(slots_per_block: usize) -> BlockHeap {
        BlockHeap::builder()
            .layout_of::<u64>()
            .slots_per_block(NonZero::new(slots_per_block).unwrap())
            .build()
    }

    /// free_slots() + len() == capacity(), at every point.
    fn assert_capacity_invariant(heap: &BlockHeap) {
        assert_eq!(heap.free_slots() + heap.len(), heap.capacity());

        #[cfg(debug_assertions)]
        heap.integrity_check();
    }

    #[test]
    fn smoke_test() {
        let mut heap = small_heap(4);

        let a = heap.allocate().unwrap();
        let b = heap.allocate().unwrap();

        // SAFETY: both slots are live, distinct, and sized for u64.
        unsafe {
            a.cast::<u64>().write(1);
            b.cast::<u64>().write(2);
            assert_eq!(a.cast::<u64>().read(), 1);
            assert_eq!(b.cast::<u64>().read(), 2);
        }

        assert_eq!(heap.len(), 2);
        assert_capacity_invariant(&heap);

        heap.free(a);
        heap.free(b);

        assert!(heap.is_empty());
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn lazy_heap_starts_with_no_blocks() {
        let heap = small_heap(4);

        assert_eq!(heap.block_count(), 0);
        assert_eq!(heap.capacity(), 0);
        assert_eq!(heap.free_slots(), 0);
    }

    #[test]
    fn eager_growth_materializes_the_first_block() {
        let heap = BlockHeap::builder()
            .layout_of::<u64>()
            .slots_per_block(NonZero::new(4).unwrap())
            .eager_growth()
            .build();

        assert_eq!(heap.block_count(), 1);
        assert_eq!(heap.capacity(), 4);
        assert_eq!(heap.free_slots(), 4);
        assert!(heap.is_empty());
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn fifth_allocation_triggers_exactly_one_growth() {
        let mut heap = small_heap(4);

        for _ in 0..4 {
            _ = heap.allocate().unwrap();
        }

        assert_eq!(heap.block_count(), 1);
        assert_eq!(heap.free_slots(), 0);

        _ = heap.allocate().unwrap();

        assert_eq!(heap.block_count(), 2);
        assert_eq!(heap.capacity(), 8);
        assert_eq!(heap.free_slots(), 3);
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn consecutive_allocations_never_repeat() {
        let mut heap = small_heap(4);

        let mut issued = Vec::new();
        for _ in 0..10 {
            let ptr = heap.allocate().unwrap();
            assert!(
                !issued.contains(&ptr),
                "the same slot was handed out twice without an intervening free"
            );
            issued.push(ptr);
        }

        assert_capacity_invariant(&heap);
    }

    #[test]
    fn reuse_is_lifo() {
        let mut heap = small_heap(4);

        let _keep = heap.allocate().unwrap();
        let released = heap.allocate().unwrap();

        heap.free(released);

        // The slot freed most recently comes back first.
        assert_eq!(heap.allocate().unwrap(), released);
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn freed_slot_in_an_earlier_block_is_reused_before_later_vacancies() {
        let mut heap = small_heap(2);

        // Fill two blocks completely.
        let first_block: Vec<_> = (0..2).map(|_| heap.allocate().unwrap()).collect();
        let _second_block: Vec<_> = (0..2).map(|_| heap.allocate().unwrap()).collect();
        assert_eq!(heap.block_count(), 2);

        // Free one slot in each block; the earlier block must serve next.
        heap.free(first_block[0]);

        assert_eq!(heap.allocate().unwrap(), first_block[0]);
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn round_trip_preserves_distinct_payloads() {
        let mut heap = small_heap(4);

        let slots: Vec<_> = (0..12).map(|_| heap.allocate().unwrap()).collect();

        for (marker, slot) in slots.iter().enumerate() {
            // SAFETY: each slot is live and sized for u64.
            unsafe {
                slot.cast::<u64>().write(marker as u64);
            }
        }

        for (marker, slot) in slots.iter().enumerate() {
            // SAFETY: reading back the marker written above.
            let value = unsafe { slot.cast::<u64>().read() };
            assert_eq!(value, marker as u64);
        }

        // Free everything in reverse order, then allocate the same number
        // again. No payload contents are promised for the fresh slots; the
        // heap does not zero memory on free.
        for slot in slots.iter().rev() {
            heap.free(*slot);
        }
        assert!(heap.is_empty());

        let again: Vec<_> = (0..12).map(|_| heap.allocate().unwrap()).collect();
        assert_eq!(again.len(), 12);
        assert_eq!(heap.len(), 12);
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn double_free_is_detected_and_has_no_effect() {
        let mut heap = small_heap(4);

        let slot = heap.allocate().unwrap();
        heap.try_free(slot).unwrap();

        let before_free = heap.free_slots();

        assert!(matches!(
            heap.try_free(slot),
            Err(FreeError::DoubleFree { .. })
        ));

        assert_eq!(heap.free_slots(), before_free);
        assert_capacity_invariant(&heap);

        // The logging variant swallows the verdict but must be equally
        // harmless.
        heap.free(slot);
        assert_eq!(heap.free_slots(), before_free);
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn foreign_pointer_is_detected_and_has_no_effect() {
        let mut heap = small_heap(4);

        let _live = heap.allocate().unwrap();

        let mut local = 0_u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();

        assert!(matches!(
            heap.try_free(foreign),
            Err(FreeError::ForeignPointer { .. })
        ));

        assert_eq!(heap.len(), 1);
        assert_capacity_invariant(&heap);

        heap.free(foreign);
        assert_eq!(heap.len(), 1);
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn freeing_into_an_empty_heap_is_foreign() {
        let mut heap = small_heap(4);

        let mut local = 0_u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();

        assert!(matches!(
            heap.try_free(foreign),
            Err(FreeError::ForeignPointer { .. })
        ));
    }

    #[test]
    fn mid_payload_addresses_are_foreign() {
        let mut heap = small_heap(4);

        let slot = heap.allocate().unwrap();

        // SAFETY: one byte past the payload start is still inside the block
        // region, which is what makes this case interesting.
        let interior = unsafe { slot.byte_add(1) };

        assert!(matches!(
            heap.try_free(interior),
            Err(FreeError::ForeignPointer { .. })
        ));
        assert_eq!(heap.len(), 1);
        assert_capacity_invariant(&heap);
    }

    #[test]
    fn drop_with_outstanding_allocations_succeeds() {
        let mut heap = small_heap(4);

        for _ in 0..6 {
            _ = heap.allocate().unwrap();
        }

        // Used slots are not walked at teardown; the blocks are released
        // wholesale.
        drop(heap);
    }

    #[test]
    fn capacity_invariant_survives_interleaved_use() {
        let mut heap = small_heap(3);

        let mut live = Vec::new();

        for round in 0..5 {
            for _ in 0..=round {
                live.push(heap.allocate().unwrap());
                assert_capacity_invariant(&heap);
            }

            // Free every other live slot.
            let mut index = 0;
            live.retain(|slot| {
                index += 1;
                if index % 2 == 0 {
                    heap.free(*slot);
                    false
                } else {
                    true
                }
            });
            assert_capacity_invariant(&heap);
        }
    }

    #[test]
    fn default_batch_size_is_used_when_not_overridden() {
        let mut heap = BlockHeap::builder().layout_of::<u64>().build();

        _ = heap.allocate().unwrap();

        assert_eq!(heap.slots_per_block(), DEFAULT_SLOTS_PER_BLOCK.get());
        assert_eq!(heap.capacity(), DEFAULT_SLOTS_PER_BLOCK.get());
    }

    #[test]
    fn heap_can_move_between_threads() {
        let heap = small_heap(4);

        // The heap is Send; the payload pointers it hands out are not, so
        // all slot traffic happens on the owning thread.
        let handle = std::thread::spawn(move || {
            let mut heap = heap;
            let slot = heap.allocate().unwrap();
            heap.free(slot);
            assert!(heap.is_empty());
            heap
        });

        let heap = handle.join().unwrap();
        assert_eq!(heap.block_count(), 1);
    }
}
