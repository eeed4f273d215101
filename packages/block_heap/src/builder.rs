use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::BlockHeap;
use crate::heap::DEFAULT_SLOTS_PER_BLOCK;

/// Builder for creating an instance of [`BlockHeap`].
///
/// [`BlockHeap`] requires the payload layout to be specified at construction
/// time. Use either `.layout()` to provide a specific layout or
/// `.layout_of::<T>()` to generate one from a type.
///
/// The layout is mandatory, whereas the batch size and the eager growth flag
/// are optional.
///
/// # Examples
///
/// Using a specific layout:
///
/// ```
/// use std::alloc::Layout;
///
/// use block_heap::BlockHeap;
///
/// let layout = Layout::new::<u32>();
/// let heap = BlockHeap::builder().layout(layout).build();
/// ```
///
/// Using type-based layout with a custom batch size:
///
/// ```
/// use std::num::NonZero;
///
/// use block_heap::BlockHeap;
///
/// let heap = BlockHeap::builder()
///     .layout_of::<u64>()
///     .slots_per_block(NonZero::new(32).unwrap())
///     .build();
///
/// assert_eq!(heap.slots_per_block(), 32);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred
/// between threads. It is not thread-safe ([`Sync`]) as it contains mutable
/// configuration state.
#[derive(Debug)]
#[must_use]
pub struct BlockHeapBuilder {
    slot_layout: Option<Layout>,
    slots_per_block: NonZero<usize>,
    eager_growth: bool,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl BlockHeapBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            slot_layout: None,
            slots_per_block: DEFAULT_SLOTS_PER_BLOCK,
            eager_growth: false,
            _not_sync: PhantomData,
        }
    }

    /// Sets the payload layout of the heap's slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::alloc::Layout;
    ///
    /// use block_heap::BlockHeap;
    ///
    /// let layout = Layout::from_size_align(48, 8).unwrap();
    /// let heap = BlockHeap::builder().layout(layout).build();
    ///
    /// assert_eq!(heap.slot_layout(), layout);
    /// ```
    #[inline]
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(layout.size() > 0, "BlockHeap must have a non-zero slot size");
        self.slot_layout = Some(layout);
        self
    }

    /// Sets the payload layout of the heap's slots based on a type.
    ///
    /// This is a convenience method that automatically creates the layout for
    /// the given type.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_heap::BlockHeap;
    ///
    /// let heap = BlockHeap::builder().layout_of::<u64>().build();
    /// ```
    #[inline]
    pub fn layout_of<T>(mut self) -> Self {
        let layout = Layout::new::<T>();
        assert!(layout.size() > 0, "BlockHeap must have a non-zero slot size");
        self.slot_layout = Some(layout);
        self
    }

    /// Sets the number of slots every growth step adds.
    ///
    /// Every block of the heap holds exactly this many slots. The default is
    /// a reasonable middle ground; small batches bound worst-case unused
    /// memory, large batches reduce allocator round-trips.
    #[inline]
    pub fn slots_per_block(mut self, slots_per_block: NonZero<usize>) -> Self {
        self.slots_per_block = slots_per_block;
        self
    }

    /// Materializes the first block at construction time instead of on the
    /// first allocation.
    ///
    /// Useful when the construction-time cost of the first block is preferred
    /// over a latency spike on the first allocation.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_heap::BlockHeap;
    ///
    /// let heap = BlockHeap::builder().layout_of::<u64>().eager_growth().build();
    ///
    /// assert_eq!(heap.block_count(), 1);
    /// assert!(heap.is_empty());
    /// ```
    #[inline]
    pub fn eager_growth(mut self) -> Self {
        self.eager_growth = true;
        self
    }

    /// Builds the heap with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using either
    /// [`layout`](Self::layout) or [`layout_of`](Self::layout_of).
    #[must_use]
    #[inline]
    pub fn build(self) -> BlockHeap {
        let layout = self.slot_layout.expect(
            "Layout must be set using .layout() or .layout_of::<T>() before calling .build()",
        );
        BlockHeap::new_inner(layout, self.slots_per_block, self.eager_growth)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockHeapBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(BlockHeapBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = BlockHeapBuilder::new();

        assert!(builder.slot_layout.is_none());
        assert_eq!(builder.slots_per_block, DEFAULT_SLOTS_PER_BLOCK);
        assert!(!builder.eager_growth);
    }

    #[test]
    fn layout_sets_layout_correctly() {
        let layout = Layout::new::<u64>();
        let builder = BlockHeapBuilder::new().layout(layout);
        assert_eq!(builder.slot_layout, Some(layout));
    }

    #[test]
    fn layout_of_sets_layout_correctly() {
        let builder = BlockHeapBuilder::new().layout_of::<String>();
        assert_eq!(builder.slot_layout, Some(Layout::new::<String>()));
    }

    #[test]
    fn layout_can_be_overridden() {
        let layout1 = Layout::new::<u32>();
        let layout2 = Layout::new::<u64>();

        let builder = BlockHeapBuilder::new().layout(layout1).layout(layout2);
        assert_eq!(builder.slot_layout, Some(layout2));
    }

    #[test]
    #[should_panic]
    fn layout_with_zero_size_panics() {
        let layout = Layout::new::<()>();
        let _heap = BlockHeapBuilder::new().layout(layout).build();
    }

    #[test]
    #[should_panic]
    fn layout_of_zero_sized_type_panics() {
        let _heap = BlockHeapBuilder::new().layout_of::<()>().build();
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        let _heap = BlockHeapBuilder::new().build();
    }

    #[test]
    fn builder_chaining_works() {
        let layout = Layout::new::<i32>();
        let builder = BlockHeapBuilder::new()
            .layout(layout)
            .slots_per_block(NonZero::new(7).unwrap())
            .eager_growth();

        assert_eq!(builder.slot_layout, Some(layout));
        assert_eq!(builder.slots_per_block.get(), 7);
        assert!(builder.eager_growth);
    }

    #[test]
    fn build_with_various_layouts() {
        let _heap1 = BlockHeapBuilder::new().layout_of::<u8>().build();
        let _heap2 = BlockHeapBuilder::new().layout_of::<[u8; 1000]>().build();

        let custom = Layout::from_size_align(42, 1).expect("valid layout");
        let _heap3 = BlockHeapBuilder::new().layout(custom).build();
    }

    #[test]
    fn builder_can_move_between_threads() {
        let builder = BlockHeapBuilder::new().layout_of::<u64>();
        let handle = std::thread::spawn(move || builder.build());
        let _heap = handle.join().expect("thread completed successfully");
    }
}
