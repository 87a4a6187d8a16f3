//! Block cache and direct-link bookkeeping.
//!
//! Compiled blocks live in a slot arena addressed by generation-tagged
//! integer handles; "block A links into block B" is a handle stored in B's
//! reverse set, so invalidation walks collections instead of pointers. The
//! cache owns the code buffer, the selected backend and the scratch IR
//! block, and is the single mutable table of the whole pipeline.

use std::collections::{HashMap, VecDeque};

use armlet_backend::{allocate, CodeBackend, CodeBuffer, LinkRecord};
use armlet_core::{BlockAttrs, BlockKey, CompileError, GuestState, IrBlock};
use armlet_frontend::compile_block;

/// Entry-count bound; past it the oldest entry is evicted.
pub const MAX_BLOCKS: usize = 4096;

/// Refuse to compile into less space than a worst-case block.
const MIN_CODE_BUF_REMAINING: usize = 16 * 1024;

const PAGE_SHIFT: u32 = 12;

/// Generation-tagged slot reference. The generation guards against slot
/// reuse between the time a handle is baked into native code and the time
/// it comes back as an exit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    fn new(index: usize, gen: u16) -> Self {
        Self(((gen as u32 & 0x3FFF) << 16) | index as u32)
    }

    pub fn index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    fn gen(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// One direct-link exit and, once patched, its target.
#[derive(Debug)]
pub struct LinkState {
    pub rec: LinkRecord,
    pub resolved: Option<Handle>,
}

/// A cached compiled unit.
#[derive(Debug)]
pub struct CompiledBlock {
    pub key: BlockKey,
    /// Guest range [start, end) covered by the source instructions.
    pub start: u32,
    pub end: u32,
    /// Native entry offset in the code buffer.
    pub entry: usize,
    pub code_len: usize,
    /// Patchable exits, slot-indexed.
    pub links: Vec<LinkState>,
    /// Blocks holding a patched direct link into this one.
    pub linked_from: Vec<(Handle, u8)>,
}

struct Slot {
    gen: u16,
    block: Option<CompiledBlock>,
}

pub struct BlockCache {
    pub buf: CodeBuffer,
    backend: Box<dyn CodeBackend>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    map: HashMap<BlockKey, Handle>,
    /// Page-bucketed handles for range invalidation; a block never spans a
    /// page boundary.
    pages: HashMap<u32, Vec<Handle>>,
    /// Insertion order, for eviction.
    order: VecDeque<Handle>,
    /// Scratch IR block, reused across compilations.
    ir: IrBlock,
}

impl BlockCache {
    pub fn new(backend: Box<dyn CodeBackend>, buf: CodeBuffer) -> Self {
        Self {
            buf,
            backend,
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            pages: HashMap::new(),
            order: VecDeque::new(),
            ir: IrBlock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, handle: Handle) -> Option<&CompiledBlock> {
        let slot = self.slots.get(handle.index())?;
        if slot.gen != handle.gen() {
            return None;
        }
        slot.block.as_ref()
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut CompiledBlock> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.gen != handle.gen() {
            return None;
        }
        slot.block.as_mut()
    }

    pub fn lookup(&self, key: BlockKey) -> Option<Handle> {
        self.map.get(&key).copied()
    }

    /// Cache lookup, compiling on miss.
    pub fn lookup_or_compile(
        &mut self,
        state: &mut GuestState,
        key: BlockKey,
    ) -> Result<Handle, CompileError> {
        if let Some(handle) = self.lookup(key) {
            return Ok(handle);
        }
        self.compile_and_insert(state, key)
    }

    fn compile_and_insert(
        &mut self,
        state: &mut GuestState,
        key: BlockKey,
    ) -> Result<Handle, CompileError> {
        if self.buf.remaining() < MIN_CODE_BUF_REMAINING {
            log::debug!("code buffer exhausted, flushing all blocks");
            self.flush_all();
        }

        let mut ir = std::mem::take(&mut self.ir);
        let result = compile_block(state, &mut ir, key.addr, key.attrs);
        let outcome = result.map(|()| {
            let alloc = allocate(&ir, self.backend.reg_classes());
            let handle = self.alloc_slot();
            let code = self.backend.compile(&mut self.buf, &ir, &alloc, handle.0);
            log::trace!(
                "compiled {:#010x} attrs={:?}: {} insns, {} bytes at {:#x}",
                key.addr,
                key.attrs,
                ir.insn_count,
                code.len,
                code.entry
            );
            let block = CompiledBlock {
                key,
                start: ir.start,
                end: ir.end,
                entry: code.entry,
                code_len: code.len,
                links: code
                    .links
                    .into_iter()
                    .map(|rec| LinkState {
                        rec,
                        resolved: None,
                    })
                    .collect(),
                linked_from: Vec::new(),
            };
            let prev = self.map.insert(key, handle);
            debug_assert!(prev.is_none(), "duplicate cache key");
            self.pages
                .entry(block.start >> PAGE_SHIFT)
                .or_default()
                .push(handle);
            self.order.push_back(handle);
            self.slots[handle.index()].block = Some(block);
            handle
        });
        self.ir = ir;
        outcome
    }

    /// Claim a slot, evicting the oldest entry when the table is full.
    fn alloc_slot(&mut self) -> Handle {
        // Invalidation leaves dead handles behind in the eviction queue;
        // compact before the queue outgrows the table.
        if self.order.len() >= MAX_BLOCKS * 2 {
            let slots = &self.slots;
            self.order.retain(|h| {
                slots
                    .get(h.index())
                    .is_some_and(|s| s.gen == h.gen() && s.block.is_some())
            });
        }
        if let Some(index) = self.free.pop() {
            return Handle::new(index, self.slots[index].gen);
        }
        if self.slots.len() < MAX_BLOCKS {
            let index = self.slots.len();
            self.slots.push(Slot {
                gen: 0,
                block: None,
            });
            return Handle::new(index, 0);
        }
        // Evict in insertion order, skipping already-dead handles.
        while let Some(victim) = self.order.pop_front() {
            if self.get(victim).is_some() {
                log::debug!("evicting block {victim:?} to bound cache size");
                self.remove(victim);
                break;
            }
        }
        let index = self.free.pop().expect("eviction freed no slot");
        Handle::new(index, self.slots[index].gen)
    }

    /// Remove one entry: un-patch every incoming direct link (one-level
    /// cascade), de-register outgoing links, drop the slot.
    pub fn remove(&mut self, handle: Handle) {
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            return;
        };
        if slot.gen != handle.gen() {
            return;
        }
        let Some(block) = slot.block.take() else {
            return;
        };

        // Incoming edges: their blocks must fall back to a full lookup
        // rather than jump into dead code.
        for &(src, slot_idx) in &block.linked_from {
            if let Some(src_block) = self.get_mut(src) {
                let link = &mut src_block.links[slot_idx as usize];
                if link.resolved == Some(handle) {
                    link.resolved = None;
                    let rec = link.rec;
                    self.backend.reset_link(&mut self.buf, &rec);
                }
            }
        }

        // Outgoing edges: drop our entries in the targets' reverse sets.
        for (i, link) in block.links.iter().enumerate() {
            if let Some(target) = link.resolved {
                if target == handle {
                    continue;
                }
                if let Some(target_block) = self.get_mut(target) {
                    target_block
                        .linked_from
                        .retain(|&(h, s)| !(h == handle && s == i as u8));
                }
            }
        }

        self.map.remove(&block.key);
        if let Some(bucket) = self.pages.get_mut(&(block.start >> PAGE_SHIFT)) {
            bucket.retain(|&h| h != handle);
        }

        let slot = &mut self.slots[handle.index()];
        slot.gen = slot.gen.wrapping_add(1) & 0x3FFF;
        self.free.push(handle.index());
    }

    /// Remove every entry whose guest range intersects `[start, start+len)`,
    /// cascading one level through the reverse link sets.
    pub fn invalidate_range(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        let end = start as u64 + len as u64;
        let first_page = start >> PAGE_SHIFT;
        let last_page = ((end - 1) >> PAGE_SHIFT) as u32;

        let mut victims = Vec::new();
        for page in first_page..=last_page {
            if let Some(bucket) = self.pages.get(&page) {
                for &handle in bucket {
                    if let Some(block) = self.get(handle) {
                        if (block.start as u64) < end && start < block.end {
                            victims.push(handle);
                        }
                    }
                }
            }
        }
        for handle in victims {
            log::trace!("invalidating block {handle:?}");
            self.remove(handle);
        }
    }

    /// Resolve every unresolved direct link of `handle`: look up or compile
    /// the target, patch the site, and register the reverse edge.
    pub fn resolve_links(
        &mut self,
        state: &mut GuestState,
        handle: Handle,
    ) -> Result<(), CompileError> {
        let Some(block) = self.get(handle) else {
            return Ok(());
        };
        let nlinks = block.links.len();

        for slot in 0..nlinks {
            // Compiling a target can evict or flush; re-validate each round.
            let Some(block) = self.get(handle) else {
                return Ok(());
            };
            let link = &block.links[slot];
            if link.resolved.is_some() {
                continue;
            }
            let rec = link.rec;
            let key = BlockKey::new(rec.addr, BlockAttrs::from_bits_truncate(rec.attrs));
            let target = self.lookup_or_compile(state, key)?;
            if self.get(handle).is_none() || self.get(target).is_none() {
                continue;
            }
            let target_entry = self.get(target).unwrap().entry;
            self.backend.patch_link(&mut self.buf, rec.patch_off, target_entry);
            self.get_mut(handle).unwrap().links[slot].resolved = Some(target);
            self.get_mut(target)
                .unwrap()
                .linked_from
                .push((handle, slot as u8));
            log::trace!("linked {handle:?} slot {slot} -> {target:?}");
        }
        Ok(())
    }

    /// Drop every entry and reclaim the whole code buffer.
    pub fn flush_all(&mut self) {
        for slot in &mut self.slots {
            slot.block = None;
            slot.gen = slot.gen.wrapping_add(1) & 0x3FFF;
        }
        self.free = (0..self.slots.len()).rev().collect();
        self.map.clear();
        self.pages.clear();
        self.order.clear();
        self.buf.reset();
    }
}
