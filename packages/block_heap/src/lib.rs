//! A pool of fixed-size memory slots, allocated in contiguous blocks and
//! reused in LIFO order.
//!
//! This crate provides [`BlockHeap`], a growing pool that hands out raw
//! payload pointers of a fixed [`std::alloc::Layout`] chosen at construction.
//! Slots are carved out of blocks - one contiguous allocation per batch - so
//! the underlying allocator is visited once per growth step instead of once
//! per object. Freed slots go back onto a per-block free chain and are reused
//! most-recently-freed-first.
//!
//! # Key features
//!
//! - **Amortized O(1) allocation**: a batch of slots per allocator round-trip
//! - **Stable addresses**: a slot never moves and is never re-issued while
//!   handed out
//! - **LIFO reuse**: the last slot freed is the first handed out again
//! - **Lazy or eager growth**: the first block can be deferred to the first
//!   allocation or materialized at construction
//! - **Defensive release**: double frees and foreign pointers are detected,
//!   reported, and ignored without corrupting the pool
//! - **Builder pattern**: configuration via [`BlockHeap::builder()`]
//!
//! # Example
//!
//! ```rust
//! use block_heap::BlockHeap;
//!
//! // One pool per object size; this one holds 64-bit payloads.
//! let mut heap = BlockHeap::builder().layout_of::<u64>().build();
//!
//! let slot = heap.allocate().expect("heap bookkeeping is intact");
//!
//! // The slot is raw, uninitialized memory until the caller writes it.
//! // SAFETY: the slot is sized and aligned for u64 and stays valid until
//! // freed.
//! unsafe {
//!     slot.cast::<u64>().write(0xfeed_beef);
//!     assert_eq!(slot.cast::<u64>().read(), 0xfeed_beef);
//! }
//!
//! heap.free(slot);
//! ```
//!
//! # What this crate is not
//!
//! The heap is not a general-purpose allocator: every slot of a heap has the
//! same size and alignment. It is not thread-safe: the heap can move between
//! threads but must not be shared without external locking. Blocks are never
//! shrunk, compacted, or released before the heap itself is dropped. Payloads
//! are raw bytes; nothing is dropped or zeroed when a slot is freed.

mod block;
mod builder;
mod error;
mod heap;
mod slot;

pub use builder::*;
pub use error::*;
pub use heap::*;
