//! Storage-class register allocation.
//!
//! Every IR value gets one assignment, valid for its whole live range:
//! a scratch register, a preserved register, or a stack slot. Scratch is
//! cheapest (no prologue cost) but does not survive collaborator calls, so
//! values that live across one are steered to preserved registers, and to
//! stack slots once those run out. Live ranges are just def index to last
//! referencing index — the forward-only IR makes them exact.

use armlet_core::IrBlock;

/// Pool sizes offered by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegClassInfo {
    pub scratch: u8,
    pub preserved: u8,
}

/// Storage assignment for one IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// Op produces no value.
    None,
    Scratch(u8),
    Preserved(u8),
    Stack(u16),
}

/// Block-wide allocation result. The per-class high-water counts size the
/// prologue (preserved saves) and the stack frame.
#[derive(Debug)]
pub struct Allocation {
    pub locs: Vec<Loc>,
    pub scratch_used: u8,
    pub preserved_used: u8,
    pub stack_slots: u16,
}

impl Allocation {
    pub fn loc(&self, value: u32) -> Loc {
        self.locs[value as usize]
    }
}

/// Compute last references and call-crossing, then hand out locations in a
/// single forward walk.
pub fn allocate(block: &IrBlock, classes: RegClassInfo) -> Allocation {
    let n = block.ops.len();
    let mut last_use = vec![0u32; n];
    for (i, inst) in block.ops.iter().enumerate() {
        if !inst.a_imm {
            last_use[inst.a as usize] = i as u32;
        }
        if !inst.b_imm {
            last_use[inst.b as usize] = i as u32;
        }
    }

    // next_call[i]: index of the first collaborator call at or after i.
    let mut next_call = vec![u32::MAX; n + 1];
    for i in (0..n).rev() {
        next_call[i] = if block.ops[i].op.is_helper_call() {
            i as u32
        } else {
            next_call[i + 1]
        };
    }

    let mut locs = vec![Loc::None; n];
    let mut scratch_free: Vec<u8> = (0..classes.scratch).rev().collect();
    let mut preserved_free: Vec<u8> = (0..classes.preserved).rev().collect();
    let mut stack_free: Vec<u16> = Vec::new();
    let mut stack_next: u16 = 0;

    let mut scratch_used = 0u8;
    let mut preserved_used = 0u8;

    // Live values, as (last_use, value index).
    let mut active: Vec<(u32, u32)> = Vec::new();

    for i in 0..n {
        // Values whose last reference is at or before this op free their
        // storage for this op's own result.
        active.retain(|&(lu, v)| {
            if lu <= i as u32 {
                match locs[v as usize] {
                    Loc::Scratch(r) => scratch_free.push(r),
                    Loc::Preserved(r) => preserved_free.push(r),
                    Loc::Stack(s) => stack_free.push(s),
                    Loc::None => {}
                }
                false
            } else {
                true
            }
        });

        let inst = &block.ops[i];
        if !inst.op.produces_value() {
            continue;
        }

        let lu = last_use[i].max(i as u32);
        // A call strictly inside (def, last_use) clobbers scratch storage.
        let crosses_call = next_call[i + 1] < lu;

        let loc = if crosses_call {
            if let Some(r) = preserved_free.pop() {
                preserved_used = preserved_used.max(r + 1);
                Loc::Preserved(r)
            } else {
                alloc_stack(&mut stack_free, &mut stack_next)
            }
        } else if let Some(r) = scratch_free.pop() {
            scratch_used = scratch_used.max(r + 1);
            Loc::Scratch(r)
        } else if let Some(r) = preserved_free.pop() {
            preserved_used = preserved_used.max(r + 1);
            Loc::Preserved(r)
        } else {
            alloc_stack(&mut stack_free, &mut stack_next)
        };

        locs[i] = loc;
        active.push((lu, i as u32));
    }

    Allocation {
        locs,
        scratch_used,
        preserved_used,
        stack_slots: stack_next,
    }
}

fn alloc_stack(free: &mut Vec<u16>, next: &mut u16) -> Loc {
    if let Some(s) = free.pop() {
        Loc::Stack(s)
    } else {
        let s = *next;
        *next += 1;
        Loc::Stack(s)
    }
}
