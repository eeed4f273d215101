//! Integration tests for the `block_heap` package.
//!
//! These exercise the public API the way a consumer would: pools of
//! application-shaped objects, growth under load, release-and-reuse churn,
//! and the defensive handling of invalid releases.
#![allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same rigor as production code"
)]

use std::num::NonZero;
use std::ptr::NonNull;

use block_heap::{BlockHeap, FreeError};

/// A payload shaped like something a server would pool.
#[repr(C)]
struct Connection {
    id: u64,
    flags: u32,
    scratch: [u8; 52],
}

#[test]
fn pool_of_structs_round_trips() {
    let mut heap = BlockHeap::builder().layout_of::<Connection>().build();

    let slot = heap.allocate().expect("fresh heap must allocate");

    // SAFETY: the slot matches Connection's layout and is live until freed.
    unsafe {
        slot.cast::<Connection>().write(Connection {
            id: 7,
            flags: 0b1010,
            scratch: [0xab; 52],
        });

        let read_back = slot.cast::<Connection>().read();
        assert_eq!(read_back.id, 7);
        assert_eq!(read_back.flags, 0b1010);
        assert_eq!(read_back.scratch, [0xab; 52]);
    }

    heap.free(slot);
    assert!(heap.is_empty());
}

#[test]
fn growth_under_load_keeps_all_slots_distinct() {
    let batch = 8;
    let mut heap = BlockHeap::builder()
        .layout_of::<u64>()
        .slots_per_block(NonZero::new(batch).unwrap())
        .build();

    let total = batch * 5;
    let slots: Vec<_> = (0..total)
        .map(|_| heap.allocate().expect("growth must keep up"))
        .collect();

    assert_eq!(heap.block_count(), 5);
    assert_eq!(heap.len(), total);
    assert_eq!(heap.free_slots(), 0);

    // Write a distinct marker everywhere, then verify nothing overlapped.
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

    for slot in slots {
        heap.free(slot);
    }

    assert!(heap.is_empty());
    assert_eq!(heap.free_slots(), heap.capacity());
}

#[test]
fn churn_workload_stays_within_one_block() {
    let mut heap = BlockHeap::builder()
        .layout_of::<u64>()
        .slots_per_block(NonZero::new(16).unwrap())
        .build();

    // Allocate and immediately free, many times over. LIFO reuse means the
    // same slot cycles and the heap never needs a second block.
    let mut last = None;
    for _ in 0..1000 {
        let slot = heap.allocate().unwrap();
        if let Some(previous) = last {
            assert_eq!(slot, previous, "LIFO reuse should cycle one slot");
        }
        heap.free(slot);
        last = Some(slot);
    }

    assert_eq!(heap.block_count(), 1);
}

#[test]
fn eager_heap_serves_first_allocation_from_existing_capacity() {
    let mut heap = BlockHeap::builder()
        .layout_of::<u64>()
        .slots_per_block(NonZero::new(4).unwrap())
        .eager_growth()
        .build();

    let capacity_before = heap.capacity();
    assert_eq!(capacity_before, 4);

    _ = heap.allocate().unwrap();

    // No growth was needed.
    assert_eq!(heap.capacity(), capacity_before);
}

#[test]
fn invalid_releases_are_reported_and_harmless() {
    let mut heap = BlockHeap::builder().layout_of::<u64>().build();

    let live = heap.allocate().unwrap();
    let released = heap.allocate().unwrap();
    heap.free(released);

    // Double free.
    let verdict = heap.try_free(released);
    assert!(matches!(verdict, Err(FreeError::DoubleFree { .. })));

    // Foreign pointer.
    let mut local = 0_u64;
    let foreign = NonNull::from(&mut local).cast::<u8>();
    let verdict = heap.try_free(foreign);
    assert!(matches!(verdict, Err(FreeError::ForeignPointer { .. })));

    // The pool kept functioning through both.
    assert_eq!(heap.len(), 1);
    heap.free(live);
    assert!(heap.is_empty());
}

#[test]
fn error_messages_are_printable() {
    let mut heap = BlockHeap::builder().layout_of::<u64>().build();

    let slot = heap.allocate().unwrap();
    heap.free(slot);

    let error = heap.try_free(slot).expect_err("second free must be refused");
    let message = error.to_string();
    assert!(message.contains("double free"));
}

#[test]
fn custom_layout_with_alignment_is_honored() {
    let layout = std::alloc::Layout::from_size_align(24, 16).unwrap();
    let mut heap = BlockHeap::builder().layout(layout).build();

    for _ in 0..10 {
        let slot = heap.allocate().unwrap();
        assert_eq!(slot.addr().get() % 16, 0, "payloads must honor alignment");
    }
}

#[test]
fn dropping_a_loaded_heap_does_not_crash() {
    let mut heap = BlockHeap::builder()
        .layout_of::<[u8; 256]>()
        .slots_per_block(NonZero::new(4).unwrap())
        .build();

    // Leave a mix of used and free slots across several blocks behind.
    let slots: Vec<_> = (0..10).map(|_| heap.allocate().unwrap()).collect();
    heap.free(slots[3]);
    heap.free(slots[7]);

    drop(heap);
}

#[test]
fn separate_heaps_do_not_recognize_each_others_slots() {
    let mut first = BlockHeap::builder().layout_of::<u64>().build();
    let mut second = BlockHeap::builder().layout_of::<u64>().build();

    let slot = first.allocate().unwrap();

    // The other heap treats the address as foreign and refuses it.
    assert!(matches!(
        second.try_free(slot),
        Err(FreeError::ForeignPointer { .. })
    ));

    // The owner still accepts it.
    assert!(first.try_free(slot).is_ok());
}
