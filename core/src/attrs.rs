//! Block cache keys.
//!
//! A guest address alone does not determine how a block compiles: the
//! encoding width, coprocessor enablement and privilege level all change the
//! generated code. The cache key is therefore `(address, BlockAttrs)`.

use bitflags::bitflags;

use crate::state::{GuestState, MODE_USER};

bitflags! {
    /// Mode bits that affect code generation for a given address.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockAttrs: u8 {
        /// Block decodes the compact (16-bit) encoding.
        const COMPACT = 1 << 0;
        /// Coprocessor access is permitted.
        const CP_ENABLED = 1 << 1;
        /// Privileged mode (anything but user).
        const PRIVILEGED = 1 << 2;
    }
}

impl BlockAttrs {
    /// Derive the attribute bits from the current CPU state.
    pub fn from_state(state: &GuestState) -> Self {
        let mut attrs = BlockAttrs::empty();
        if state.is_compact() {
            attrs |= BlockAttrs::COMPACT;
        }
        if state.cp_enabled != 0 {
            attrs |= BlockAttrs::CP_ENABLED;
        }
        if state.mode() != MODE_USER {
            attrs |= BlockAttrs::PRIVILEGED;
        }
        attrs
    }

    /// Instruction width in bytes under these attributes.
    pub fn insn_size(self) -> u32 {
        if self.contains(BlockAttrs::COMPACT) {
            2
        } else {
            4
        }
    }

    /// Program-counter alignment mask for this encoding width.
    pub fn pc_mask(self) -> u32 {
        if self.contains(BlockAttrs::COMPACT) {
            !1
        } else {
            !3
        }
    }
}

/// Cache key: unique per live cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub addr: u32,
    pub attrs: BlockAttrs,
}

impl BlockKey {
    pub fn new(addr: u32, attrs: BlockAttrs) -> Self {
        Self { addr, attrs }
    }
}
