//! Guest frontend: decodes guest instructions and builds IR blocks.

pub mod decode;
pub mod thumb;
mod trans;

pub use decode::{decode_classic, ArmInst, Cond, InstClass};
pub use thumb::decode_compact;

use armlet_core::{
    BlockAttrs, CompileError, GuestState, IrBlock, IrOp, Src, FLAG_C, FLAG_N, FLAG_V, FLAG_Z,
};

/// Invalidation granularity; a block never spans a boundary.
pub const PAGE_SIZE: u32 = 4096;

/// Patchable direct-link exits per block. The native exit code reserves two
/// bits for the slot, so later linkable terminals degrade to plain returns.
pub const MAX_BLOCK_LINKS: u8 = 2;

/// Translation state for one block.
pub struct BlockBuilder<'a> {
    pub ir: &'a mut IrBlock,
    pub attrs: BlockAttrs,
    /// Address of the instruction currently being translated.
    pub pc: u32,
    /// Raw encoding of that instruction, for trap forwarding.
    pub encoding: u32,
    /// Loaded-register reuse cache: last known source for each guest
    /// register within this block.
    reg_cache: [Option<Src>; 16],
    /// Value whose N/Z flags are already materialized.
    last_nz: Option<u32>,
    /// Patchable exits emitted so far.
    links: u8,
    /// Set once a terminal has been emitted on the unconditional path.
    pub ended: bool,
}

impl<'a> BlockBuilder<'a> {
    fn new(ir: &'a mut IrBlock, attrs: BlockAttrs, start: u32) -> Self {
        Self {
            ir,
            attrs,
            pc: start,
            encoding: 0,
            reg_cache: [None; 16],
            last_nz: None,
            links: 0,
            ended: false,
        }
    }

    /// Emit and name the result.
    pub fn emit(&mut self, op: IrOp, a: Src, b: Src) -> Src {
        Src::Val(self.ir.emit(op, a, b))
    }

    /// Emit an op whose value (if any) is not used.
    pub fn emit_discard(&mut self, op: IrOp, a: Src, b: Src) {
        self.ir.emit(op, a, b);
    }

    /// Binary op with constant folding for the address-arithmetic cases
    /// (this is the only cross-instruction optimization the builder does,
    /// besides the register reuse cache).
    pub fn add2(&mut self, x: Src, y: Src) -> Src {
        match (x, y) {
            (Src::Imm(a), Src::Imm(b)) => Src::Imm(a.wrapping_add(b)),
            (v, Src::Imm(0)) | (Src::Imm(0), v) => v,
            _ => self.emit(IrOp::Add, x, y),
        }
    }

    pub fn sub2(&mut self, x: Src, y: Src) -> Src {
        match (x, y) {
            (Src::Imm(a), Src::Imm(b)) => Src::Imm(a.wrapping_sub(b)),
            (v, Src::Imm(0)) => v,
            _ => self.emit(IrOp::Sub, x, y),
        }
    }

    /// Guest PC as seen by instructions: two fetch stages ahead, plus the
    /// architectural extras (register-specified shift and stores observe a
    /// further word on the classic pipeline).
    pub fn pc_operand(&self, extra: u32, aligned: bool) -> u32 {
        let fetch_ahead = if self.compact() { 4 } else { 8 };
        let v = self.pc.wrapping_add(fetch_ahead).wrapping_add(extra);
        if aligned {
            v & !3
        } else {
            v
        }
    }

    pub fn compact(&self) -> bool {
        self.attrs.contains(BlockAttrs::COMPACT)
    }

    /// Width in bytes of the current encoding.
    pub fn insn_size(&self) -> u32 {
        self.attrs.insn_size()
    }

    /// Read a guest register, reusing an earlier load where one is still
    /// valid. `pc_extra`/`aligned` select the architectural PC view.
    pub fn read_reg_pc(&mut self, r: u8, pc_extra: u32, aligned: bool) -> Src {
        if r == 15 {
            return Src::Imm(self.pc_operand(pc_extra, aligned));
        }
        if let Some(src) = self.reg_cache[r as usize] {
            return src;
        }
        let v = self.emit(IrOp::GetReg, Src::Imm(r as u32), Src::Imm(0));
        self.reg_cache[r as usize] = Some(v);
        v
    }

    pub fn read_reg(&mut self, r: u8) -> Src {
        self.read_reg_pc(r, 0, false)
    }

    /// Write a guest register. A PC write masks to the encoding width and
    /// terminates the block (the effective instruction address changes).
    pub fn write_reg(&mut self, r: u8, src: Src) {
        if r == 15 {
            let masked = match src {
                Src::Imm(v) => Src::Imm(v & self.attrs.pc_mask()),
                v => {
                    let mask = self.attrs.pc_mask();
                    self.emit(IrOp::And, v, Src::Imm(mask))
                }
            };
            self.emit_discard(IrOp::SetReg, Src::Imm(15), masked);
            self.emit_discard(IrOp::Return, Src::Imm(0), Src::Imm(0));
            self.ended = true;
            return;
        }
        self.emit_discard(IrOp::SetReg, Src::Imm(r as u32), src);
        self.reg_cache[r as usize] = Some(src);
    }

    pub fn get_flag(&mut self, flag: u32) -> Src {
        self.emit(IrOp::GetFlag, Src::Imm(flag), Src::Imm(0))
    }

    pub fn set_flag(&mut self, flag: u32, src: Src) {
        self.emit_discard(IrOp::SetFlag, Src::Imm(flag), src);
        if flag == FLAG_N || flag == FLAG_Z {
            self.last_nz = None;
        }
    }

    /// Materialize N/Z from a value, unless they are already current for it.
    pub fn set_nz(&mut self, src: Src) {
        if let Src::Val(v) = src {
            if self.last_nz == Some(v) {
                return;
            }
            self.emit_discard(IrOp::SetNz, src, Src::Imm(0));
            self.last_nz = Some(v);
            return;
        }
        self.emit_discard(IrOp::SetNz, src, Src::Imm(0));
        self.last_nz = None;
    }

    /// Record that a flag-setting arithmetic op materialized all four flags
    /// from `v`.
    pub fn note_flags_from(&mut self, src: Src) {
        self.last_nz = match src {
            Src::Val(v) => Some(v),
            Src::Imm(_) => None,
        };
    }

    /// Forget cached register/flag knowledge across collaborator calls that
    /// may rewrite the register file (traps, mode switches).
    pub fn invalidate_caches(&mut self) {
        self.reg_cache = [None; 16];
        self.last_nz = None;
    }

    // -- Terminals --

    pub fn term_return(&mut self) {
        self.emit_discard(IrOp::Return, Src::Imm(0), Src::Imm(0));
    }

    /// Patchable exit toward a known successor, while link slots remain.
    pub fn term_link(&mut self, target: u32, attrs: BlockAttrs) {
        if self.links >= MAX_BLOCK_LINKS {
            self.term_return();
            return;
        }
        self.links += 1;
        self.emit_discard(
            IrOp::ReturnLink,
            Src::Imm(target),
            Src::Imm(attrs.bits() as u32),
        );
    }

    pub fn term_loop(&mut self) {
        self.emit_discard(IrOp::Loop, Src::Imm(0), Src::Imm(0));
        self.ir.self_loop = true;
    }

    /// Build the 0-or-1 "execute" value for a condition code.
    fn cond_value(&mut self, cond: Cond) -> Src {
        let one = Src::Imm(1);
        match cond {
            Cond::Eq => self.get_flag(FLAG_Z),
            Cond::Ne => {
                let z = self.get_flag(FLAG_Z);
                self.emit(IrOp::Eor, z, one)
            }
            Cond::Cs => self.get_flag(FLAG_C),
            Cond::Cc => {
                let c = self.get_flag(FLAG_C);
                self.emit(IrOp::Eor, c, one)
            }
            Cond::Mi => self.get_flag(FLAG_N),
            Cond::Pl => {
                let n = self.get_flag(FLAG_N);
                self.emit(IrOp::Eor, n, one)
            }
            Cond::Vs => self.get_flag(FLAG_V),
            Cond::Vc => {
                let v = self.get_flag(FLAG_V);
                self.emit(IrOp::Eor, v, one)
            }
            Cond::Hi => {
                let c = self.get_flag(FLAG_C);
                let z = self.get_flag(FLAG_Z);
                let nz = self.emit(IrOp::Eor, z, one);
                self.emit(IrOp::And, c, nz)
            }
            Cond::Ls => {
                let c = self.get_flag(FLAG_C);
                let nc = self.emit(IrOp::Eor, c, one);
                let z = self.get_flag(FLAG_Z);
                self.emit(IrOp::Orr, nc, z)
            }
            Cond::Ge => {
                let n = self.get_flag(FLAG_N);
                let v = self.get_flag(FLAG_V);
                let nv = self.emit(IrOp::Eor, n, v);
                self.emit(IrOp::Eor, nv, one)
            }
            Cond::Lt => {
                let n = self.get_flag(FLAG_N);
                let v = self.get_flag(FLAG_V);
                self.emit(IrOp::Eor, n, v)
            }
            Cond::Gt => {
                let z = self.get_flag(FLAG_Z);
                let nz = self.emit(IrOp::Eor, z, one);
                let n = self.get_flag(FLAG_N);
                let v = self.get_flag(FLAG_V);
                let nv = self.emit(IrOp::Eor, n, v);
                let ge = self.emit(IrOp::Eor, nv, one);
                self.emit(IrOp::And, nz, ge)
            }
            Cond::Le => {
                let z = self.get_flag(FLAG_Z);
                let n = self.get_flag(FLAG_N);
                let v = self.get_flag(FLAG_V);
                let nv = self.emit(IrOp::Eor, n, v);
                self.emit(IrOp::Orr, z, nv)
            }
            Cond::Al | Cond::Nv => unreachable!("no condition value for {cond:?}"),
        }
    }
}

/// Translate one decoded instruction, wrapping conditional execution in a
/// skip branch over the unconditional effect.
fn translate_inst(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    match inst.cond {
        Cond::Al => trans::translate(b, inst),
        Cond::Nv => Ok(()),
        cond => {
            let cval = b.cond_value(cond);
            let skip = b.ir.emit(IrOp::SkipIfZero, cval, Src::Imm(0));
            let snapshot = b.reg_cache;
            let nz_snapshot = b.last_nz;
            trans::translate(b, inst)?;
            // Effects inside the guarded region are conditional; any reuse
            // state it created or changed is unusable at the join.
            for (slot, old) in b.reg_cache.iter_mut().zip(snapshot.iter()) {
                if *slot != *old {
                    *slot = None;
                }
            }
            if b.last_nz != nz_snapshot {
                b.last_nz = None;
            }
            b.ended = false;
            b.ir.patch_skip(skip, b.ir.len() as u32);
            Ok(())
        }
    }
}

/// Upper bound on IR entries one instruction may need, including its
/// condition prologue.
fn estimate_ops(inst: &ArmInst) -> usize {
    let base = match inst.class {
        InstClass::MemMulti => 12 + 4 * inst.reglist.count_ones() as usize,
        InstClass::DataProc => 36,
        InstClass::Msr => 28,
        InstClass::MulLong => 18,
        _ => 16,
    };
    let cond = if inst.cond == Cond::Al { 0 } else { 8 };
    base + cond + 4
}

/// Build the IR for one block starting at `start`.
///
/// Fetches through the state's fetch hooks, decodes at the width selected
/// by `attrs`, and emits IR until the block bound, a page boundary, or an
/// instruction that moves control flow away.
pub fn compile_block(
    state: &mut GuestState,
    block: &mut IrBlock,
    start: u32,
    attrs: BlockAttrs,
) -> Result<(), CompileError> {
    block.reset(start);
    block.emit(IrOp::BlockStart, Src::Imm(start), Src::Imm(0));

    let insn_size = attrs.insn_size();
    let page_end = (start as u64 | (PAGE_SIZE as u64 - 1)) + 1;
    let mut b = BlockBuilder::new(block, attrs, start);

    loop {
        // Never cross the invalidation granularity (or the address wrap).
        if (b.pc as u64) < start as u64 || b.pc as u64 >= page_end {
            break;
        }
        let inst = if attrs.contains(BlockAttrs::COMPACT) {
            let half = unsafe { (state.fetch16)(state, b.pc) };
            b.encoding = half & 0xFFFF;
            decode_compact(b.encoding as u16)
        } else {
            b.encoding = unsafe { (state.fetch32)(state, b.pc) };
            decode_classic(b.encoding)
        };
        if b.ir.remaining() < estimate_ops(&inst) {
            if b.ir.insn_count == 0 {
                // A single instruction that cannot fit in an empty block is
                // a builder bug, never a guest condition.
                return Err(CompileError::BlockTooLarge { addr: start });
            }
            break;
        }

        b.ir.insn_count += 1;
        b.ir.end = b.pc.wrapping_add(insn_size);
        if let Err(err) = translate_inst(&mut b, &inst) {
            log::error!(
                "translation failed at {:#010x} (encoding {:#010x}): {err}",
                b.pc,
                b.encoding
            );
            return Err(err);
        }
        if b.ended {
            debug_assert!(b.ir.ops.last().is_some_and(|i| i.op.is_terminal()));
            return Ok(());
        }
        b.pc = b.pc.wrapping_add(insn_size);
    }

    // Fallthrough exit: the successor is the next instruction under the
    // same attributes, so the exit is linkable.
    let end = b.ir.end;
    b.emit_discard(IrOp::SetReg, Src::Imm(15), Src::Imm(end));
    b.term_link(end, attrs);
    Ok(())
}
