use thiserror::Error;

/// Errors detected while returning a slot to a [`BlockHeap`][crate::BlockHeap].
///
/// Both conditions are defensive findings: the heap refuses the release,
/// leaves its own state untouched, and the program can keep running. The
/// detection is opportunistic - an unrelated pointer that happens to equal a
/// handed-out slot's payload address cannot be told apart from the real one.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FreeError {
    /// The address is a slot of this heap, but the slot is already on the
    /// free chain. The release that put it there was the valid one; this one
    /// is a bug in the caller.
    #[error("double free of slot at {address:#x}: the slot is already free")]
    DoubleFree {
        /// The payload address that was presented for release.
        address: usize,
    },

    /// No block of this heap owns the address. Either the pointer came from
    /// somewhere else entirely, or it points into a block region but not at
    /// the start of a slot payload.
    #[error("pointer {address:#x} does not belong to any block of this heap")]
    ForeignPointer {
        /// The address that was presented for release.
        address: usize,
    },
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FreeError: Send, Sync, Debug);

    #[test]
    fn messages_carry_the_offending_address() {
        let double = FreeError::DoubleFree { address: 0xbeef };
        assert!(double.to_string().contains("0xbeef"));

        let foreign = FreeError::ForeignPointer { address: 0xf00d };
        assert!(foreign.to_string().contains("0xf00d"));
    }
}
