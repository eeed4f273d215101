//! Demonstrates the defensive handling of invalid releases.
//!
//! A double free and a foreign pointer are both detected and refused; the
//! heap keeps working afterwards. `try_free()` surfaces the verdict as a
//! value, while `free()` only reports through the logging facade.

use std::ptr::NonNull;

use block_heap::BlockHeap;

fn main() {
    let mut heap = BlockHeap::builder().layout_of::<u32>().build();

    let slot = heap.allocate().expect("heap bookkeeping is intact");
    println!("Allocated {slot:p}");

    heap.free(slot);
    println!("Freed it once; {} slots in use", heap.len());

    // Second release of the same slot: refused, reported, no effect.
    match heap.try_free(slot) {
        Ok(()) => println!("Unexpected: double free was accepted"),
        Err(error) => println!("Refused: {error}"),
    }

    // An address the heap never issued: also refused.
    let mut local = 0_u32;
    let foreign = NonNull::from(&mut local).cast::<u8>();
    match heap.try_free(foreign) {
        Ok(()) => println!("Unexpected: foreign pointer was accepted"),
        Err(error) => println!("Refused: {error}"),
    }

    // The heap is unharmed and keeps serving allocations.
    let replacement = heap.allocate().expect("heap bookkeeping is intact");
    println!(
        "Still healthy: reallocated {replacement:p}, {} in use, {} free",
        heap.len(),
        heap.free_slots()
    );

    heap.free(replacement);
}
