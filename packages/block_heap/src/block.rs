use std::alloc::{Layout, alloc, dealloc};
use std::num::NonZero;
use std::ptr::NonNull;

use crate::slot::{NO_SLOT, SlotChain, SlotLinks, SlotMeta};

/// One contiguous batch of fixed-size slots.
///
/// The region is a single allocation holding `capacity` slots at a fixed
/// stride. Each slot is a [`SlotMeta`] header immediately followed by the
/// payload bytes, so the payload address handed to callers sits at a fixed
/// offset from the slot's metadata.
///
/// All slots are partitioned between the free chain and the used chain at all
/// times; the chains are index-linked through the slot headers and never
/// allocate on their own.
#[derive(Debug)]
pub(crate) struct Block {
    /// Number of slots in the region. Fixed for the lifetime of the block.
    capacity: NonZero<usize>,

    /// Precomputed stride and offset math for the region.
    layout_info: BlockLayoutInfo,

    /// Base pointer of the region; also the metadata address of slot 0.
    first_slot_meta_ptr: NonNull<SlotMeta>,

    /// Slots available for handing out. The head is the most recently
    /// released slot, so reuse is LIFO.
    free_slots: SlotChain,

    /// Slots currently handed out.
    used_slots: SlotChain,
}

/// Layout calculations for a [`Block`].
///
/// Computed once per heap and shared by every block, since all blocks of a
/// heap use the same payload layout and slot count.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BlockLayoutInfo {
    /// Combined layout of one slot (metadata followed by payload), padded so
    /// the size is the stride between consecutive slots.
    combined_slot_layout: Layout,

    /// Byte offset from a slot's metadata to its payload.
    payload_offset: usize,

    /// Layout of the whole region, used for the single alloc/dealloc pair.
    region_layout: Layout,
}

impl BlockLayoutInfo {
    /// Calculates layout information for blocks holding `capacity` slots of
    /// the given payload layout.
    ///
    /// # Panics
    ///
    /// Panics if the payload layout has zero size or if the layout
    /// calculations overflow.
    #[must_use]
    pub(crate) fn calculate(payload_layout: Layout, capacity: NonZero<usize>) -> Self {
        assert!(
            payload_layout.size() > 0,
            "block layout cannot be calculated for a zero-sized payload"
        );

        let meta_layout = Layout::new::<SlotMeta>();

        let (combined_slot_layout, payload_offset) = meta_layout
            .extend(payload_layout)
            .expect("layout extension cannot fail for valid layouts with reasonable sizes");

        // pad_to_align() makes the size a multiple of the alignment, which is
        // exactly the stride needed for array-style slot spacing.
        let combined_slot_layout = combined_slot_layout.pad_to_align();

        let total_size = combined_slot_layout
            .size()
            .checked_mul(capacity.get())
            .expect("region size calculation cannot overflow for reasonable slot counts");

        let region_layout = Layout::from_size_align(total_size, combined_slot_layout.align())
            .expect("region layout calculation cannot fail for valid combined layouts");

        Self {
            combined_slot_layout,
            payload_offset,
            region_layout,
        }
    }

    /// Byte distance between consecutive slots.
    #[must_use]
    pub(crate) fn stride(&self) -> usize {
        self.combined_slot_layout.size()
    }

    #[must_use]
    pub(crate) fn payload_offset(&self) -> usize {
        self.payload_offset
    }
}

impl Block {
    /// Allocates one region and links every slot into the free chain in
    /// ascending slot order, so slot 0 is handed out first.
    ///
    /// # Panics
    ///
    /// Panics if the underlying allocator cannot provide the region. There is
    /// no fallback to shed, so memory exhaustion here is not recoverable.
    #[must_use]
    pub(crate) fn new(layout_info: BlockLayoutInfo, capacity: NonZero<usize>) -> Self {
        // SAFETY: region_layout is valid and non-zero-sized, guaranteed by
        // BlockLayoutInfo::calculate which rejects zero-sized payloads.
        let first_slot_meta_ptr = NonNull::new(unsafe { alloc(layout_info.region_layout) })
            .expect("out of memory while growing a block heap - this is not a recoverable condition")
            .cast::<SlotMeta>();

        let block = Self {
            capacity,
            layout_info,
            first_slot_meta_ptr,
            free_slots: SlotChain {
                head: 0,
                len: capacity.get(),
            },
            used_slots: SlotChain::empty(),
        };

        let last_index = capacity.get().wrapping_sub(1);

        for index in 0..capacity.get() {
            let links = SlotLinks {
                // Cannot wrap: index > 0 in the subtracting branch.
                prev: if index == 0 {
                    NO_SLOT
                } else {
                    index.wrapping_sub(1)
                },
                // Cannot overflow, as that would imply the block is longer
                // than virtual memory.
                next: if index == last_index {
                    NO_SLOT
                } else {
                    index.wrapping_add(1)
                },
            };

            // SAFETY: the region was allocated for capacity slots above and
            // index stays within it; the target is properly aligned because
            // the stride is a multiple of the combined layout's alignment.
            unsafe {
                block.slot_meta_ptr(index).write(SlotMeta::Free(links));
            }
        }

        block
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> NonZero<usize> {
        self.capacity
    }

    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to an infinite growth loop in the heap.
    pub(crate) fn free_len(&self) -> usize {
        self.free_slots.len
    }

    #[must_use]
    pub(crate) fn used_len(&self) -> usize {
        self.used_slots.len
    }

    fn slot_meta_ptr(&self, index: usize) -> NonNull<SlotMeta> {
        assert!(
            index < self.capacity.get(),
            "slot index {index} out of bounds in block of capacity {}",
            self.capacity.get()
        );

        // Guarded by the bounds check above. Cannot overflow because that
        // would imply the region extends beyond virtual memory.
        let offset = index.wrapping_mul(self.layout_info.stride());

        // SAFETY: first_slot_meta_ptr is the base of our region allocation
        // and the offset stays within it due to the bounds check above.
        unsafe { self.first_slot_meta_ptr.byte_add(offset) }
    }

    #[expect(clippy::needless_pass_by_ref_mut, reason = "false positive")]
    fn slot_meta_mut(&mut self, index: usize) -> &mut SlotMeta {
        let mut ptr = self.slot_meta_ptr(index);

        // SAFETY: the pointer was bounds-checked by slot_meta_ptr() and
        // points to an initialized SlotMeta that we own exclusively while
        // holding &mut self.
        unsafe { ptr.as_mut() }
    }

    fn slot_meta(&self, index: usize) -> SlotMeta {
        // SAFETY: bounds-checked by slot_meta_ptr(); every slot's metadata
        // was initialized in new() and stays initialized for the lifetime of
        // the block.
        unsafe { self.slot_meta_ptr(index).read() }
    }

    /// Payload address of the slot at `index`. This is the address handed to
    /// callers and later presented back for release.
    #[must_use]
    pub(crate) fn payload_ptr(&self, index: usize) -> NonNull<u8> {
        // SAFETY: the metadata pointer is in bounds and payload_offset was
        // calculated by BlockLayoutInfo::calculate to land on the payload
        // portion of the same slot.
        unsafe {
            self.slot_meta_ptr(index)
                .byte_add(self.layout_info.payload_offset())
                .cast::<u8>()
        }
    }

    /// Resolves a payload address to a slot index, if this block owns it.
    ///
    /// Returns `None` for addresses outside the region, addresses landing on
    /// slot metadata, and addresses inside a payload but not at its start.
    /// Ownership is a range and stride check, not a chain walk.
    #[must_use]
    #[expect(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "the divisor is the slot stride, which is never zero, and the subtraction is range-checked"
    )]
    pub(crate) fn slot_index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = self.first_slot_meta_ptr.addr().get();
        let addr = ptr.addr().get();

        // Cannot overflow: the region exists in the address space.
        let end = base.wrapping_add(self.layout_info.region_layout.size());

        if addr < base || addr >= end {
            return None;
        }

        let offset_in_region = addr - base;

        let Some(offset_in_payloads) = offset_in_region.checked_sub(self.layout_info.payload_offset())
        else {
            // Inside slot 0's metadata.
            return None;
        };

        if offset_in_payloads % self.layout_info.stride() != 0 {
            // Mid-payload, or inside a later slot's metadata.
            return None;
        }

        let index = offset_in_payloads / self.layout_info.stride();
        debug_assert!(index < self.capacity.get());

        Some(index)
    }

    /// Whether the slot at `index` is on the free chain.
    #[must_use]
    pub(crate) fn slot_is_free(&self, index: usize) -> bool {
        self.slot_meta(index).is_free()
    }

    /// Hands out the most recently released free slot and moves it onto the
    /// used chain.
    ///
    /// # Panics
    ///
    /// Panics if the block has no free slots.
    #[must_use]
    pub(crate) fn take_free_slot(&mut self) -> NonNull<u8> {
        let index = self.free_slots.head;
        assert!(
            index != NO_SLOT,
            "cannot take a slot from a block with no free slots"
        );

        self.free_slots = self.unlink(index, self.free_slots);
        self.used_slots = self.push_front(index, self.used_slots, SlotMeta::Used);

        #[cfg(debug_assertions)]
        self.integrity_check();

        self.payload_ptr(index)
    }

    /// Moves a handed-out slot back onto the free chain.
    ///
    /// The payload bytes are left untouched; released memory is not zeroed.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the slot is already free. Callers check the
    /// slot state first via [`slot_is_free()`](Self::slot_is_free).
    pub(crate) fn release_used_slot(&mut self, index: usize) {
        debug_assert!(
            !self.slot_is_free(index),
            "release of slot {index} which is already on the free chain"
        );

        self.used_slots = self.unlink(index, self.used_slots);
        self.free_slots = self.push_front(index, self.free_slots, SlotMeta::Free);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Unlinks the slot at `index` from a chain and returns the updated chain
    /// head. The slot's own links become stale until it is pushed elsewhere.
    fn unlink(&mut self, index: usize, mut chain: SlotChain) -> SlotChain {
        let links = self.slot_meta(index).links();

        if links.prev == NO_SLOT {
            debug_assert_eq!(chain.head, index);
            chain.head = links.next;
        } else {
            self.slot_meta_mut(links.prev).links_mut().next = links.next;
        }

        if links.next != NO_SLOT {
            self.slot_meta_mut(links.next).links_mut().prev = links.prev;
        }

        // Cannot wrap: the slot was a member of the chain, so len >= 1.
        chain.len = chain.len.wrapping_sub(1);
        chain
    }

    /// Pushes the slot at `index` onto the front of a chain, rewriting its
    /// metadata with the given variant, and returns the updated chain head.
    fn push_front(
        &mut self,
        index: usize,
        mut chain: SlotChain,
        meta_of: fn(SlotLinks) -> SlotMeta,
    ) -> SlotChain {
        if chain.head != NO_SLOT {
            self.slot_meta_mut(chain.head).links_mut().prev = index;
        }

        *self.slot_meta_mut(index) = meta_of(SlotLinks {
            prev: NO_SLOT,
            next: chain.head,
        });

        chain.head = index;
        // Cannot overflow: the chain is never longer than the block.
        chain.len = chain.len.wrapping_add(1);
        chain
    }

    /// Verifies that the two chains partition the slots, that cached lengths
    /// match the chains, and that all links are symmetric.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[allow(
        clippy::indexing_slicing,
        clippy::arithmetic_side_effects,
        reason = "the integrity check needs direct array access"
    )]
    pub(crate) fn integrity_check(&self) {
        let capacity = self.capacity.get();

        let mut seen = vec![false; capacity];

        for (chain, expect_free, name) in [
            (self.free_slots, true, "free"),
            (self.used_slots, false, "used"),
        ] {
            let mut walked = 0_usize;
            let mut prev = NO_SLOT;
            let mut cursor = chain.head;

            while cursor != NO_SLOT {
                assert!(
                    cursor < capacity,
                    "{name} chain contains out-of-bounds slot index {cursor}"
                );
                assert!(
                    !seen[cursor],
                    "slot {cursor} appears on more than one chain position"
                );
                seen[cursor] = true;

                let meta = self.slot_meta(cursor);
                assert_eq!(
                    meta.is_free(),
                    expect_free,
                    "slot {cursor} state disagrees with its {name} chain membership"
                );
                assert_eq!(
                    meta.links().prev,
                    prev,
                    "slot {cursor} has an asymmetric prev link on the {name} chain"
                );

                prev = cursor;
                cursor = meta.links().next;
                walked += 1;

                assert!(
                    walked <= capacity,
                    "{name} chain is longer than the block; the chain must contain a cycle"
                );
            }

            assert_eq!(
                walked, chain.len,
                "cached {name} chain length does not match the chain"
            );
        }

        assert!(
            seen.iter().all(|present| *present),
            "some slots are on neither chain"
        );
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // Slot metadata is plain data and the payloads are raw bytes, so
        // there is nothing to drop before releasing the region. Handed-out
        // slots are intentionally not walked; the region disappears with the
        // heap regardless of what is still outstanding.

        // SAFETY: the region was allocated in new() with this exact layout
        // and has not been deallocated before.
        unsafe {
            dealloc(
                self.first_slot_meta_ptr.as_ptr().cast(),
                self.layout_info.region_layout,
            );
        }
    }
}

// SAFETY: Block contains raw pointers but they target memory the block
// exclusively owns; nothing is shared across threads and no thread-local
// state is involved. All access goes through &self/&mut self methods.
unsafe impl Send for Block {}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use new_zealand::nz;

    use super::*;

    fn test_block(capacity: usize) -> Block {
        let capacity = NonZero::new(capacity).unwrap();
        Block::new(
            BlockLayoutInfo::calculate(Layout::new::<u64>(), capacity),
            capacity,
        )
    }

    #[test]
    fn new_block_is_all_free() {
        let block = test_block(4);

        assert_eq!(block.free_len(), 4);
        assert_eq!(block.used_len(), 0);

        #[cfg(debug_assertions)]
        block.integrity_check();
    }

    #[test]
    fn slots_hand_out_in_ascending_order_when_fresh() {
        let mut block = test_block(3);

        let first = block.take_free_slot();
        let second = block.take_free_slot();
        let third = block.take_free_slot();

        assert_eq!(first, block.payload_ptr(0));
        assert_eq!(second, block.payload_ptr(1));
        assert_eq!(third, block.payload_ptr(2));
        assert_eq!(block.free_len(), 0);
        assert_eq!(block.used_len(), 3);
    }

    #[test]
    fn released_slot_is_reused_first() {
        let mut block = test_block(4);

        let _a = block.take_free_slot();
        let b = block.take_free_slot();

        let b_index = block.slot_index_of(b).unwrap();
        block.release_used_slot(b_index);

        // LIFO: the slot released last comes back first.
        assert_eq!(block.take_free_slot(), b);
    }

    #[test]
    fn release_from_the_middle_of_the_used_chain() {
        let mut block = test_block(4);

        let ptrs: Vec<_> = (0..4).map(|_| block.take_free_slot()).collect();

        // Slot 1 sits in the middle of the used chain (3 -> 2 -> 1 -> 0).
        block.release_used_slot(block.slot_index_of(ptrs[1]).unwrap());

        assert_eq!(block.free_len(), 1);
        assert_eq!(block.used_len(), 3);
        assert_eq!(block.take_free_slot(), ptrs[1]);
    }

    #[test]
    fn resolution_rejects_foreign_addresses() {
        let block = test_block(2);

        // A stack address can never fall inside the heap-allocated region.
        let mut local = 0_u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();
        assert_eq!(block.slot_index_of(foreign), None);
    }

    #[test]
    fn resolution_rejects_metadata_and_interior_addresses() {
        let block = test_block(2);

        // Slot 0's metadata is the region base.
        let meta_addr = block.first_slot_meta_ptr.cast::<u8>();
        assert_eq!(block.slot_index_of(meta_addr), None);

        // One byte into a payload is not a payload start.
        // SAFETY: stays within the region.
        let interior = unsafe { block.payload_ptr(0).byte_add(1) };
        assert_eq!(block.slot_index_of(interior), None);
    }

    #[test]
    fn resolution_finds_every_slot() {
        let block = test_block(5);

        for index in 0..5 {
            assert_eq!(block.slot_index_of(block.payload_ptr(index)), Some(index));
        }
    }

    #[test]
    fn slot_state_tracks_take_and_release() {
        let mut block = test_block(2);

        assert!(block.slot_is_free(0));

        let ptr = block.take_free_slot();
        let index = block.slot_index_of(ptr).unwrap();
        assert!(!block.slot_is_free(index));

        block.release_used_slot(index);
        assert!(block.slot_is_free(index));
    }

    #[test]
    #[should_panic]
    fn taking_from_a_full_block_panics() {
        let mut block = test_block(1);

        let _only = block.take_free_slot();
        let _too_many = block.take_free_slot();
    }

    #[test]
    fn stride_covers_metadata_and_payload() {
        let payload_layout = Layout::new::<u64>();
        let info = BlockLayoutInfo::calculate(payload_layout, nz!(8));

        assert!(info.stride() >= size_of::<SlotMeta>() + payload_layout.size());
        assert!(info.payload_offset() >= size_of::<SlotMeta>());
        assert_eq!(info.payload_offset() % payload_layout.align(), 0);
        assert_eq!(info.region_layout.size(), info.stride() * 8);
    }

    #[test]
    fn stride_honors_payload_alignment() {
        #[repr(C, align(64))]
        struct Aligned {
            data: [u8; 32],
        }

        let info = BlockLayoutInfo::calculate(Layout::new::<Aligned>(), nz!(4));

        assert_eq!(info.stride() % 64, 0);
        assert_eq!(info.payload_offset() % 64, 0);

        let capacity = nz!(4);
        let block = Block::new(info, capacity);
        for index in 0..4 {
            assert_eq!(block.payload_ptr(index).addr().get() % 64, 0);
        }
    }

    #[test]
    #[should_panic]
    fn zero_sized_payload_panics() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        drop(BlockLayoutInfo::calculate(layout, nz!(4)));
    }

    #[test]
    fn payloads_of_each_slot_do_not_overlap() {
        let mut block = test_block(8);

        let ptrs: Vec<_> = (0..8).map(|_| block.take_free_slot()).collect();

        for (i, ptr) in ptrs.iter().enumerate() {
            // SAFETY: each pointer targets a distinct slot's payload, sized
            // and aligned for u64, and the block outlives the writes.
            unsafe {
                ptr.cast::<u64>().write(i as u64);
            }
        }

        for (i, ptr) in ptrs.iter().enumerate() {
            // SAFETY: reading back the value written above.
            let value = unsafe { ptr.cast::<u64>().read() };
            assert_eq!(value, i as u64);
        }
    }

    #[test]
    fn drop_with_outstanding_slots_succeeds() {
        let mut block = test_block(4);

        let _a = block.take_free_slot();
        let _b = block.take_free_slot();

        // Dropping with two slots still handed out must not panic or walk
        // the outstanding payloads.
        drop(block);
    }
}
