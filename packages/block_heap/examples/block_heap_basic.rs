//! Basic usage example for `BlockHeap`.
//!
//! This example demonstrates pooling fixed-size objects: building a heap,
//! allocating and initializing slots, releasing them, and watching LIFO
//! reuse and batched growth do their work.

use std::num::NonZero;

use block_heap::BlockHeap;

fn main() {
    // One heap per object size. Four slots per block keeps the growth steps
    // visible in the output.
    let mut heap = BlockHeap::builder()
        .layout_of::<u64>()
        .slots_per_block(NonZero::new(4).unwrap())
        .build();

    println!(
        "Fresh heap: {} blocks, capacity {}",
        heap.block_count(),
        heap.capacity()
    );

    // The first allocation triggers the first growth step.
    let mut slots = Vec::new();
    for marker in 0..6_u64 {
        let slot = heap.allocate().expect("heap bookkeeping is intact");

        // SAFETY: the slot is sized and aligned for u64 and stays valid
        // until freed.
        unsafe {
            slot.cast::<u64>().write(marker);
        }

        slots.push(slot);
    }

    println!(
        "After 6 allocations: {} blocks, capacity {}, {} free",
        heap.block_count(),
        heap.capacity(),
        heap.free_slots()
    );

    // Read one payload back.
    // SAFETY: slot 2 is live and holds the u64 written above.
    let value = unsafe { slots[2].cast::<u64>().read() };
    println!("Slot 2 holds {value}");

    // Release everything.
    for slot in slots.drain(..) {
        heap.free(slot);
    }

    println!(
        "After freeing everything: {} used, {} free",
        heap.len(),
        heap.free_slots()
    );

    // The most recently freed slot comes back first.
    let reused = heap.allocate().expect("heap bookkeeping is intact");
    println!("Reused slot at {reused:p}");

    heap.free(reused);
}
