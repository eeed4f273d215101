/// Chain index meaning "no slot". Larger than any real slot index, as that
/// would imply a block longer than virtual memory.
pub(crate) const NO_SLOT: usize = usize::MAX;

/// Chain links of one slot.
///
/// Indices refer to slot positions within the owning block, never across
/// blocks. `NO_SLOT` terminates the chain in either direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SlotLinks {
    pub(crate) prev: usize,
    pub(crate) next: usize,
}

/// Metadata header of one slot, stored in the block region immediately before
/// the slot's payload bytes.
///
/// The variant is the ground truth for whether a slot is handed out. Every
/// slot is a member of exactly one of the two per-block chains, and the chain
/// it is on always agrees with the variant.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SlotMeta {
    /// The slot is available and linked into the block's free chain.
    Free(SlotLinks),

    /// The slot is handed out and linked into the block's used chain.
    Used(SlotLinks),
}

impl SlotMeta {
    #[must_use]
    pub(crate) fn links(&self) -> SlotLinks {
        match *self {
            Self::Free(links) | Self::Used(links) => links,
        }
    }

    pub(crate) fn links_mut(&mut self) -> &mut SlotLinks {
        match self {
            Self::Free(links) | Self::Used(links) => links,
        }
    }

    #[must_use]
    pub(crate) fn is_free(&self) -> bool {
        matches!(self, Self::Free(_))
    }
}

/// Head of one index-linked slot chain.
///
/// The length is cached so that length queries are O(1); the block's
/// integrity check verifies it against the actual chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SlotChain {
    pub(crate) head: usize,
    pub(crate) len: usize,
}

impl SlotChain {
    #[must_use]
    pub(crate) fn empty() -> Self {
        Self {
            head: NO_SLOT,
            len: 0,
        }
    }
}
