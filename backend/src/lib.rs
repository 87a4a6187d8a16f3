//! armlet backend — register allocation and host code generation.
//!
//! Two host targets implement the same `CodeBackend` contract; the driver
//! picks one at startup with `native_backend()`. A compiled unit is a
//! self-contained `extern "C" fn(*mut GuestState) -> u32`: zero for a plain
//! return, otherwise a (handle, slot) code identifying the unresolved
//! direct-link exit that was taken.

pub mod aarch64;
pub mod code_buffer;
pub mod regalloc;
pub mod x86_64;

pub use code_buffer::CodeBuffer;
pub use regalloc::{allocate, Allocation, Loc, RegClassInfo};

use armlet_core::IrBlock;

/// One patchable direct-link exit left behind by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRecord {
    /// Offset of the patchable jump instruction.
    pub patch_off: usize,
    /// Offset of the fallback return path the jump initially targets.
    pub fallback_off: usize,
    /// Successor guest address.
    pub addr: u32,
    /// Successor attribute bits.
    pub attrs: u8,
}

/// Result of compiling one block.
#[derive(Debug)]
pub struct CompiledCode {
    /// Entry offset of the native function in the code buffer.
    pub entry: usize,
    /// Bytes of generated code.
    pub len: usize,
    /// Unresolved direct-link exits, in emission order (slot = index).
    pub links: Vec<LinkRecord>,
}

/// Host code generator contract.
pub trait CodeBackend {
    /// Register-class pool sizes the allocator may hand out.
    fn reg_classes(&self) -> RegClassInfo;

    /// Emit a native function for `block` under `alloc`. `handle` is the
    /// cache handle baked into this block's link-exit codes.
    fn compile(
        &self,
        buf: &mut CodeBuffer,
        block: &IrBlock,
        alloc: &Allocation,
        handle: u32,
    ) -> CompiledCode;

    /// Redirect the patchable jump at `patch_off` to `target_off`.
    fn patch_link(&self, buf: &mut CodeBuffer, patch_off: usize, target_off: usize);

    /// Restore a patched jump to its fallback return path.
    fn reset_link(&self, buf: &mut CodeBuffer, rec: &LinkRecord) {
        self.patch_link(buf, rec.patch_off, rec.fallback_off);
    }
}

/// Exit-code encoding shared by the backends and the driver. The slot field
/// is two bits wide and holds slot + 1 so the whole code stays nonzero; the
/// frontend bounds link exits per block accordingly.
pub fn encode_link_exit(handle: u32, slot: usize) -> u32 {
    debug_assert!(slot < 3, "link slot out of encoding range");
    (handle << 2) | (slot as u32 + 1)
}

/// Decode a nonzero exit value into (handle, slot).
pub fn decode_link_exit(code: u32) -> (u32, usize) {
    (code >> 2, (code & 3) as usize - 1)
}

/// Select the code generator for the machine we are running on.
#[cfg(target_arch = "x86_64")]
pub fn native_backend() -> Box<dyn CodeBackend> {
    Box::new(x86_64::X86_64Backend::new())
}

#[cfg(target_arch = "aarch64")]
pub fn native_backend() -> Box<dyn CodeBackend> {
    Box::new(aarch64::Aarch64Backend::new())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn native_backend() -> Box<dyn CodeBackend> {
    panic!("no code backend for this host architecture");
}
