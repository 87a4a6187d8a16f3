//! Execution driver.
//!
//! The outer lookup → compile → invoke loop, one compiled unit per call.
//! Linked and self-looping blocks run entirely inside one native
//! invocation; the driver only sees control again when the budget runs out,
//! the block returns, or an unresolved direct-link exit asks for linking.

use std::ffi::c_void;
use std::io;

use armlet_backend::{decode_link_exit, native_backend, CodeBuffer};
use armlet_core::{BlockAttrs, BlockKey, CompileError, GuestState};

use crate::cache::{BlockCache, Handle};

pub struct Engine {
    /// Boxed so the address baked into `GuestState::jit` stays stable.
    cache: Box<BlockCache>,
}

impl Engine {
    pub fn new() -> io::Result<Self> {
        let buf = CodeBuffer::with_default_size()?;
        Ok(Self {
            cache: Box::new(BlockCache::new(native_backend(), buf)),
        })
    }

    /// Cache/linker access for the shell and for tests.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BlockCache {
        &mut self.cache
    }

    /// Run one compiled unit (compiling it first on a cache miss) and
    /// return the guest cycles consumed. A halted guest consumes nothing.
    pub fn execute_one_unit(&mut self, state: &mut GuestState) -> Result<u32, CompileError> {
        if state.halted != 0 {
            return Ok(0);
        }
        let attrs = BlockAttrs::from_state(state);
        let pc = state.regs[15] & attrs.pc_mask();
        let key = BlockKey::new(pc, attrs);

        let handle = self.cache.lookup_or_compile(state, key)?;
        let entry = self.cache.get(handle).expect("fresh handle").entry;
        let budget_before = state.cycles;

        // The shell's write path reaches the cache through this pointer, so
        // a guest store over translated code invalidates synchronously.
        state.jit = &mut *self.cache as *mut BlockCache as *mut c_void;
        let entry_ptr = self.cache.buf.ptr_at(entry);
        // SAFETY: entry points at a function this cache compiled for the
        // exact GuestState layout, and nothing else runs on this thread
        // while it executes.
        let exit = unsafe {
            let f: unsafe extern "C" fn(*mut GuestState) -> u32 =
                std::mem::transmute(entry_ptr);
            f(state)
        };

        if exit != 0 {
            let (raw, _slot) = decode_link_exit(exit);
            let exited = Handle(raw);
            // The exiting block may have been invalidated by its own
            // stores; a dead handle just skips linking.
            if self.cache.get(exited).is_some() {
                self.cache.resolve_links(state, exited)?;
            }
        }

        Ok((budget_before - state.cycles) as u32)
    }

    /// Called by the memory-write path for stores into executable-eligible
    /// memory. Synchronous with the write.
    pub fn invalidate_range(&mut self, start: u32, len: u32) {
        self.cache.invalidate_range(start, len);
    }

    /// Full reset, e.g. on guest process teardown.
    pub fn flush_all(&mut self) {
        self.cache.flush_all();
    }
}

/// `extern "C"` invalidation entry for shells whose write hooks run inside
/// generated code. Mirrors `Engine::invalidate_range` through the state's
/// cache pointer.
///
/// # Safety
/// `state` must be the `GuestState` currently executing under an `Engine`,
/// on that engine's (single) execution thread.
pub unsafe extern "C" fn jit_invalidate(state: *mut GuestState, start: u32, len: u32) {
    let jit = (*state).jit as *mut BlockCache;
    if !jit.is_null() {
        (*jit).invalidate_range(start, len);
    }
}
