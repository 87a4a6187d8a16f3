//! Per-class instruction translation into IR.

use armlet_core::{
    BlockAttrs, CompileError, IrOp, Src, CPSR_THUMB, FLAG_C, FLAG_N, FLAG_V, FLAG_Z,
};

use super::decode::{
    aluop, ArmInst, InstClass, ShiftKind, HALF_TYPE_SHIFT, MEM_BYTE, MEM_LOAD, MEM_PRE, MEM_SBIT,
    MEM_UP, MEM_WB,
};
use super::BlockBuilder;

pub(super) fn translate(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    match inst.class {
        InstClass::DataProc => data_proc(b, inst),
        InstClass::Mul => mul(b, inst),
        InstClass::MulLong => mul_long(b, inst),
        InstClass::Swap => swap(b, inst),
        InstClass::BranchEx => branch_ex(b, inst),
        InstClass::Branch => branch(b, inst),
        InstClass::Mrs => mrs(b, inst),
        InstClass::Msr => msr(b, inst),
        InstClass::MemSingle => mem_single(b, inst),
        InstClass::MemHalf => mem_half(b, inst),
        InstClass::MemMulti => mem_multi(b, inst),
        InstClass::Svc => svc(b, inst),
        InstClass::CpTransfer | InstClass::CpData => coprocessor(b, inst),
        InstClass::CpMem => Err(CompileError::UnsupportedCoprocessor {
            addr: b.pc,
            encoding: b.encoding,
            cp: inst.rs as u32,
        }),
        InstClass::Undefined => {
            undefined(b);
            Ok(())
        }
        InstClass::BlHigh => bl_high(b, inst),
        InstClass::BlLow => bl_low(b, inst),
    }
}

fn sign_extend(value: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}

// ---------------------------------------------------------------
// Shifted operand evaluation
// ---------------------------------------------------------------

/// Shift a register value by a constant amount, honoring the encoding
/// quirks: LSR/ASR #0 mean a 32-bit shift and ROR #0 is rotate-right-by-one
/// through carry.
fn shift_value_imm(b: &mut BlockBuilder, kind: ShiftKind, amount: u32, rm: Src) -> Src {
    match (kind, amount) {
        (ShiftKind::Lsl, 0) => rm,
        (ShiftKind::Lsl, n) => b.emit(IrOp::Shl, rm, Src::Imm(n)),
        (ShiftKind::Lsr, 0) => Src::Imm(0),
        (ShiftKind::Lsr, n) => b.emit(IrOp::Shr, rm, Src::Imm(n)),
        (ShiftKind::Asr, 0) => b.emit(IrOp::Sar, rm, Src::Imm(31)),
        (ShiftKind::Asr, n) => b.emit(IrOp::Sar, rm, Src::Imm(n)),
        (ShiftKind::Ror, 0) => {
            // Rotate right by one through carry.
            let c = b.get_flag(FLAG_C);
            let hi = b.emit(IrOp::Shl, c, Src::Imm(31));
            let lo = b.emit(IrOp::Shr, rm, Src::Imm(1));
            b.emit(IrOp::Orr, lo, hi)
        }
        (ShiftKind::Ror, n) => b.emit(IrOp::Ror, rm, Src::Imm(n)),
    }
}

/// Carry-out of a constant-amount shift; `None` leaves C untouched.
fn shift_carry_imm(b: &mut BlockBuilder, kind: ShiftKind, amount: u32, rm: Src) -> Option<Src> {
    let bit = |b: &mut BlockBuilder, n: u32| {
        let s = b.emit(IrOp::Shr, rm, Src::Imm(n));
        if n == 31 {
            s
        } else {
            b.emit(IrOp::And, s, Src::Imm(1))
        }
    };
    match (kind, amount) {
        (ShiftKind::Lsl, 0) => None,
        (ShiftKind::Lsl, n) => Some(bit(b, 32 - n)),
        (ShiftKind::Lsr, 0) | (ShiftKind::Asr, 0) => Some(bit(b, 31)),
        (ShiftKind::Lsr, n) | (ShiftKind::Asr, n) => Some(bit(b, n - 1)),
        (ShiftKind::Ror, 0) => Some(b.emit(IrOp::And, rm, Src::Imm(1))),
        (ShiftKind::Ror, n) => Some(bit(b, n - 1)),
    }
}

/// Carry-out of a register-amount shift. An amount of zero keeps the old
/// carry; otherwise the carry is the last bit shifted out, with the ≥32
/// cases following the architecture's definitions. Select-free: the two
/// candidates are merged under an all-ones/all-zeroes mask.
fn shift_carry_reg(b: &mut BlockBuilder, kind: ShiftKind, rm: Src, amt: Src) -> Src {
    let zero = b.emit(IrOp::CmpEq0, amt, Src::Imm(0));
    let zmask = b.emit(IrOp::Sub, Src::Imm(0), zero);
    let c_old = b.get_flag(FLAG_C);
    let c_new = match kind {
        ShiftKind::Lsl => {
            let n = b.emit(IrOp::Sub, Src::Imm(32), amt);
            let s = b.emit(IrOp::Shr, rm, n);
            b.emit(IrOp::And, s, Src::Imm(1))
        }
        ShiftKind::Lsr => {
            let n = b.emit(IrOp::Sub, amt, Src::Imm(1));
            let s = b.emit(IrOp::Shr, rm, n);
            b.emit(IrOp::And, s, Src::Imm(1))
        }
        ShiftKind::Asr => {
            let n = b.emit(IrOp::Sub, amt, Src::Imm(1));
            let s = b.emit(IrOp::Sar, rm, n);
            b.emit(IrOp::And, s, Src::Imm(1))
        }
        ShiftKind::Ror => {
            let n = b.emit(IrOp::Sub, amt, Src::Imm(1));
            let n31 = b.emit(IrOp::And, n, Src::Imm(31));
            let s = b.emit(IrOp::Shr, rm, n31);
            b.emit(IrOp::And, s, Src::Imm(1))
        }
    };
    let keep = b.emit(IrOp::And, c_old, zmask);
    let fresh = b.emit(IrOp::Bic, c_new, zmask);
    b.emit(IrOp::Orr, keep, fresh)
}

/// Evaluate a data-processing operand two: the rotated immediate or the
/// shifted register, with carry-out when the caller needs it.
fn shift_operand(
    b: &mut BlockBuilder,
    inst: &ArmInst,
    need_carry: bool,
) -> (Src, Option<Src>) {
    if inst.op2_imm {
        let carry = if need_carry && inst.shift_amount != 0 {
            Some(Src::Imm(inst.imm >> 31))
        } else {
            None
        };
        return (Src::Imm(inst.imm), carry);
    }
    // A register-specified shift stalls the pipeline one cycle, so r15
    // reads one word further ahead.
    let pc_extra = if inst.shift_reg && !b.compact() { 4 } else { 0 };
    let rm = b.read_reg_pc(inst.rm, pc_extra, false);
    if !inst.shift_reg {
        let n = inst.shift_amount as u32;
        let carry = if need_carry {
            shift_carry_imm(b, inst.shift, n, rm)
        } else {
            None
        };
        let value = shift_value_imm(b, inst.shift, n, rm);
        (value, carry)
    } else {
        let rs = b.read_reg(inst.rs);
        let amt = b.emit(IrOp::And, rs, Src::Imm(0xFF));
        let carry = if need_carry {
            Some(shift_carry_reg(b, inst.shift, rm, amt))
        } else {
            None
        };
        let op = match inst.shift {
            ShiftKind::Lsl => IrOp::Shl,
            ShiftKind::Lsr => IrOp::Shr,
            ShiftKind::Asr => IrOp::Sar,
            ShiftKind::Ror => IrOp::Ror,
        };
        (b.emit(op, rm, amt), carry)
    }
}

// ---------------------------------------------------------------
// Data processing
// ---------------------------------------------------------------

fn data_proc(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    use aluop::*;
    let op = inst.op;
    let logical = matches!(op, AND | EOR | TST | TEQ | ORR | MOV | BIC | MVN);
    let test_only = matches!(op, TST | TEQ | CMP | CMN);
    let (op2, carry) = shift_operand(b, inst, inst.s && logical);

    let rn = if matches!(op, MOV | MVN) {
        Src::Imm(0)
    } else {
        let pc_extra = if inst.shift_reg && !b.compact() { 4 } else { 0 };
        b.read_reg_pc(inst.rn, pc_extra, inst.align_base)
    };

    let res = match op {
        AND | TST => b.emit(IrOp::And, rn, op2),
        EOR | TEQ => b.emit(IrOp::Eor, rn, op2),
        SUB | CMP => b.emit(if inst.s { IrOp::SubFlags } else { IrOp::Sub }, rn, op2),
        RSB => b.emit(if inst.s { IrOp::SubFlags } else { IrOp::Sub }, op2, rn),
        ADD | CMN => b.emit(if inst.s { IrOp::AddFlags } else { IrOp::Add }, rn, op2),
        ADC => b.emit(if inst.s { IrOp::AdcFlags } else { IrOp::Adc }, rn, op2),
        SBC => b.emit(if inst.s { IrOp::SbcFlags } else { IrOp::Sbc }, rn, op2),
        RSC => b.emit(if inst.s { IrOp::SbcFlags } else { IrOp::Sbc }, op2, rn),
        ORR => b.emit(IrOp::Orr, rn, op2),
        // A plain move forwards the operand value; no IR is needed.
        MOV => op2,
        BIC => b.emit(IrOp::Bic, rn, op2),
        MVN => match op2 {
            Src::Imm(v) => Src::Imm(!v),
            v => b.emit(IrOp::Mvn, v, Src::Imm(0)),
        },
        _ => unreachable!(),
    };

    if inst.s {
        if logical {
            if let Some(c) = carry {
                b.set_flag(FLAG_C, c);
            }
            b.set_nz(res);
        } else {
            b.note_flags_from(res);
        }
    }

    if test_only {
        return Ok(());
    }
    if inst.rd == 15 && inst.s {
        // Exception return: restore CPSR from SPSR, then branch. The
        // collaborator re-banks; the new mode's width decides the final
        // alignment, so only bit 0 is cleared here.
        let sp = b.emit(IrOp::GetSpsr, Src::Imm(0), Src::Imm(0));
        b.invalidate_caches();
        b.emit_discard(IrOp::ModeSwitch, sp, Src::Imm(0));
        let masked = b.emit(IrOp::And, res, Src::Imm(!1));
        b.emit_discard(IrOp::SetReg, Src::Imm(15), masked);
        b.term_return();
        b.ended = true;
        return Ok(());
    }
    b.write_reg(inst.rd, res);
    Ok(())
}

// ---------------------------------------------------------------
// Multiplies
// ---------------------------------------------------------------

fn mul(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let rm = b.read_reg(inst.rm);
    let rs = b.read_reg(inst.rs);
    let mut res = b.emit(IrOp::Mul, rm, rs);
    if inst.op & 1 != 0 {
        let acc = b.read_reg(inst.rn);
        res = b.emit(IrOp::Add, res, acc);
    }
    if inst.s {
        b.set_nz(res);
    }
    b.write_reg(inst.rd, res);
    Ok(())
}

fn mul_long(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let signed = inst.op & 2 != 0;
    let accumulate = inst.op & 1 != 0;
    let rm = b.read_reg(inst.rm);
    let rs = b.read_reg(inst.rs);
    // Accumulator reads must come first: the backend fuses the low/high
    // pair only when the two multiply entries are adjacent.
    let (acc_lo, acc_hi) = if accumulate {
        (Some(b.read_reg(inst.rn)), Some(b.read_reg(inst.rd)))
    } else {
        (None, None)
    };
    let mut lo = b.emit(IrOp::Mul, rm, rs);
    let mut hi = b.emit(
        if signed { IrOp::SMulHi } else { IrOp::UMulHi },
        rm,
        rs,
    );
    if let (Some(alo), Some(ahi)) = (acc_lo, acc_hi) {
        let lo2 = b.emit(IrOp::Add, lo, alo);
        let cy = b.emit(IrOp::CmpLtU, lo2, alo);
        let hi1 = b.emit(IrOp::Add, hi, ahi);
        hi = b.emit(IrOp::Add, hi1, cy);
        lo = lo2;
    }
    if inst.s {
        // N from the high word; Z over the full 64 bits.
        b.set_nz(hi);
        let lo_zero = b.emit(IrOp::CmpEq0, lo, Src::Imm(0));
        let z = b.get_flag(FLAG_Z);
        let z64 = b.emit(IrOp::And, z, lo_zero);
        b.set_flag(FLAG_Z, z64);
    }
    b.write_reg(inst.rn, lo);
    b.write_reg(inst.rd, hi);
    Ok(())
}

// ---------------------------------------------------------------
// Swap, branches, PSR transfers
// ---------------------------------------------------------------

fn swap(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let byte = inst.op & 1 != 0;
    let addr = b.read_reg(inst.rn);
    let new = b.read_reg(inst.rm);
    let old = b.emit(
        if byte { IrOp::Load8U } else { IrOp::Load32 },
        addr,
        Src::Imm(0),
    );
    b.emit_discard(
        if byte { IrOp::Store8 } else { IrOp::Store32 },
        addr,
        new,
    );
    b.write_reg(inst.rd, old);
    Ok(())
}

fn branch_ex(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let rm = b.read_reg(inst.rm);
    // Bit 0 selects the encoding width for the target.
    let tbit = b.emit(IrOp::And, rm, Src::Imm(1));
    let base = b.emit(IrOp::GetCpsrBase, Src::Imm(0), Src::Imm(0));
    let cleared = b.emit(IrOp::Bic, base, Src::Imm(CPSR_THUMB));
    let shifted = b.emit(IrOp::Shl, tbit, Src::Imm(5));
    let merged = b.emit(IrOp::Orr, cleared, shifted);
    b.emit_discard(IrOp::SetCpsrBase, merged, Src::Imm(0));
    let target = b.emit(IrOp::And, rm, Src::Imm(!1));
    b.emit_discard(IrOp::SetReg, Src::Imm(15), target);
    b.term_return();
    b.ended = true;
    Ok(())
}

fn branch(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let link = inst.op & 1 != 0;
    let target = b.pc_operand(0, false).wrapping_add(inst.imm) & b.attrs.pc_mask();
    if link {
        let ret = b.pc.wrapping_add(b.insn_size());
        b.write_reg(14, Src::Imm(ret));
    }
    b.emit_discard(IrOp::SetReg, Src::Imm(15), Src::Imm(target));
    if !link && target == b.ir.start {
        b.term_loop();
    } else {
        b.term_link(target, b.attrs);
    }
    b.ended = true;
    Ok(())
}

/// Compose the full CPSR value from its split storage.
fn compose_cpsr(b: &mut BlockBuilder) -> Src {
    let mut acc = b.emit(IrOp::GetCpsrBase, Src::Imm(0), Src::Imm(0));
    for (flag, bit) in [(FLAG_N, 31), (FLAG_Z, 30), (FLAG_C, 29), (FLAG_V, 28)] {
        let f = b.get_flag(flag);
        let shifted = b.emit(IrOp::Shl, f, Src::Imm(bit));
        acc = b.emit(IrOp::Orr, acc, shifted);
    }
    acc
}

fn mrs(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let value = if inst.op & 1 != 0 {
        b.emit(IrOp::GetSpsr, Src::Imm(0), Src::Imm(0))
    } else {
        compose_cpsr(b)
    };
    b.write_reg(inst.rd, value);
    Ok(())
}

fn field_mask(bits: u8) -> u32 {
    let mut mask = 0u32;
    for i in 0..4 {
        if bits & (1 << i) != 0 {
            mask |= 0xFF << (i * 8);
        }
    }
    mask
}

fn msr(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let value = if inst.op2_imm {
        Src::Imm(inst.imm)
    } else {
        b.read_reg(inst.rm)
    };
    let mask = field_mask(inst.rs);

    if inst.op & 1 != 0 {
        // SPSR write: plain masked merge, flags included.
        let old = b.emit(IrOp::GetSpsr, Src::Imm(0), Src::Imm(0));
        let kept = b.emit(IrOp::And, old, Src::Imm(!mask));
        let fresh = b.emit(IrOp::And, value, Src::Imm(mask));
        let merged = b.emit(IrOp::Orr, kept, fresh);
        b.emit_discard(IrOp::SetSpsr, merged, Src::Imm(0));
        return Ok(());
    }

    if mask & 0xFF00_0000 != 0 {
        // Flag field.
        match value {
            Src::Imm(v) => {
                b.set_flag(FLAG_N, Src::Imm((v >> 31) & 1));
                b.set_flag(FLAG_Z, Src::Imm((v >> 30) & 1));
                b.set_flag(FLAG_C, Src::Imm((v >> 29) & 1));
                b.set_flag(FLAG_V, Src::Imm((v >> 28) & 1));
            }
            v => {
                for (flag, bit) in
                    [(FLAG_N, 31), (FLAG_Z, 30), (FLAG_C, 29), (FLAG_V, 28)]
                {
                    let s = b.emit(IrOp::Shr, v, Src::Imm(bit));
                    let f = if bit == 31 {
                        s
                    } else {
                        b.emit(IrOp::And, s, Src::Imm(1))
                    };
                    b.set_flag(flag, f);
                }
            }
        }
    }

    let control_mask = mask & 0x00FF_FFFF;
    if control_mask != 0 && b.attrs.contains(BlockAttrs::PRIVILEGED) {
        // Control fields go through the collaborator so it can re-bank;
        // the mode (and possibly the width) changes, so the block ends.
        let cur = compose_cpsr(b);
        let kept = b.emit(IrOp::And, cur, Src::Imm(!control_mask));
        let fresh = b.emit(IrOp::And, value, Src::Imm(control_mask));
        let merged = b.emit(IrOp::Orr, kept, fresh);
        b.invalidate_caches();
        b.emit_discard(IrOp::ModeSwitch, merged, Src::Imm(0));
        let next = b.pc.wrapping_add(b.insn_size());
        b.emit_discard(IrOp::SetReg, Src::Imm(15), Src::Imm(next));
        b.term_return();
        b.ended = true;
    }
    Ok(())
}

// ---------------------------------------------------------------
// Memory transfers
// ---------------------------------------------------------------

fn mem_single(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let load = inst.op & MEM_LOAD != 0;
    let byte = inst.op & MEM_BYTE != 0;
    let pre = inst.op & MEM_PRE != 0;
    let up = inst.op & MEM_UP != 0;
    let wb = inst.op & MEM_WB != 0 || !pre;

    let base = b.read_reg_pc(inst.rn, 0, true);
    let offset = if inst.op2_imm {
        Src::Imm(inst.imm)
    } else {
        let rm = b.read_reg(inst.rm);
        shift_value_imm(b, inst.shift, inst.shift_amount as u32, rm)
    };
    let eff = if up {
        b.add2(base, offset)
    } else {
        b.sub2(base, offset)
    };
    let addr = if pre { eff } else { base };

    if load {
        let value = b.emit(
            if byte { IrOp::Load8U } else { IrOp::Load32 },
            addr,
            Src::Imm(0),
        );
        if wb && inst.rn != inst.rd {
            b.write_reg(inst.rn, eff);
        }
        b.write_reg(inst.rd, value);
    } else {
        let extra = if b.compact() { 0 } else { 4 };
        let value = b.read_reg_pc(inst.rd, extra, false);
        b.emit_discard(
            if byte { IrOp::Store8 } else { IrOp::Store32 },
            addr,
            value,
        );
        if wb {
            b.write_reg(inst.rn, eff);
        }
    }
    Ok(())
}

fn mem_half(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let load = inst.op & MEM_LOAD != 0;
    let pre = inst.op & MEM_PRE != 0;
    let up = inst.op & MEM_UP != 0;
    let wb = inst.op & MEM_WB != 0 || !pre;
    let ty = inst.op >> HALF_TYPE_SHIFT;

    let base = b.read_reg_pc(inst.rn, 0, true);
    let offset = if inst.op2_imm {
        Src::Imm(inst.imm)
    } else {
        b.read_reg(inst.rm)
    };
    let eff = if up {
        b.add2(base, offset)
    } else {
        b.sub2(base, offset)
    };
    let addr = if pre { eff } else { base };

    if load {
        let op = match ty {
            1 => IrOp::Load16U,
            2 => IrOp::Load8S,
            _ => IrOp::Load16S,
        };
        let value = b.emit(op, addr, Src::Imm(0));
        if wb && inst.rn != inst.rd {
            b.write_reg(inst.rn, eff);
        }
        b.write_reg(inst.rd, value);
    } else {
        let extra = if b.compact() { 0 } else { 4 };
        let value = b.read_reg_pc(inst.rd, extra, false);
        b.emit_discard(IrOp::Store16, addr, value);
        if wb {
            b.write_reg(inst.rn, eff);
        }
    }
    Ok(())
}

fn mem_multi(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let load = inst.op & MEM_LOAD != 0;
    let pre = inst.op & MEM_PRE != 0;
    let up = inst.op & MEM_UP != 0;
    let wb = inst.op & MEM_WB != 0;
    let sbit = inst.op & MEM_SBIT != 0;
    let reglist = inst.reglist;
    let base = b.read_reg(inst.rn);

    if reglist == 0 {
        // Empty-list quirk on this core: nothing transfers, but the base
        // still steps a full 16 words.
        if wb {
            let stepped = if up {
                b.add2(base, Src::Imm(0x40))
            } else {
                b.sub2(base, Src::Imm(0x40))
            };
            b.write_reg(inst.rn, stepped);
        }
        return Ok(());
    }

    let n = reglist.count_ones();
    let start_off = match (pre, up) {
        (false, true) => 0i32,
        (true, true) => 4,
        (false, false) => -4 * (n as i32 - 1),
        (true, false) => -4 * n as i32,
    };
    let addr0 = b.add2(base, Src::Imm(start_off as u32));
    let stepped = if up {
        b.add2(base, Src::Imm(4 * n))
    } else {
        b.sub2(base, Src::Imm(4 * n))
    };

    let base_in_list = reglist & (1 << inst.rn) != 0;
    let pc_in_list = reglist & (1 << 15) != 0;
    if sbit && !(load && pc_in_list) {
        // User-bank transfer: register banking lives with the collaborator,
        // so this core transfers the current bank.
        log::warn!(
            "user-bank block transfer at {:#010x} uses the current bank",
            b.pc
        );
    }

    let mut loaded_pc = None;
    let mut k = 0u32;
    for r in 0..16u8 {
        if reglist & (1 << r) == 0 {
            continue;
        }
        let addr = b.add2(addr0, Src::Imm(4 * k));
        k += 1;
        if load {
            let value = b.emit(IrOp::Load32, addr, Src::Imm(0));
            if r == 15 {
                loaded_pc = Some(value);
            } else {
                b.write_reg(r, value);
            }
        } else {
            let extra = if b.compact() { 0 } else { 4 };
            let value = b.read_reg_pc(r, extra, false);
            b.emit_discard(IrOp::Store32, addr, value);
        }
    }

    // Base writeback; a loaded base wins over the written-back value.
    if wb && !(load && base_in_list) {
        b.write_reg(inst.rn, stepped);
    }

    if let Some(pc) = loaded_pc {
        if sbit {
            let sp = b.emit(IrOp::GetSpsr, Src::Imm(0), Src::Imm(0));
            b.invalidate_caches();
            b.emit_discard(IrOp::ModeSwitch, sp, Src::Imm(0));
            let masked = b.emit(IrOp::And, pc, Src::Imm(!1));
            b.emit_discard(IrOp::SetReg, Src::Imm(15), masked);
            b.term_return();
            b.ended = true;
        } else {
            b.write_reg(15, pc);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------
// Traps and coprocessors
// ---------------------------------------------------------------

fn svc(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    // The handler emulates the service and resumes at the next instruction.
    let next = b.pc.wrapping_add(b.insn_size());
    b.emit_discard(IrOp::SetReg, Src::Imm(15), Src::Imm(next));
    b.invalidate_caches();
    b.emit_discard(IrOp::Svc, Src::Imm(inst.imm), Src::Imm(0));
    b.term_return();
    b.ended = true;
    Ok(())
}

fn undefined(b: &mut BlockBuilder) {
    b.emit_discard(IrOp::SetReg, Src::Imm(15), Src::Imm(b.pc));
    b.invalidate_caches();
    b.emit_discard(IrOp::Undef, Src::Imm(b.encoding), Src::Imm(0));
    b.term_return();
    b.ended = true;
}

fn coprocessor(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    if !b.attrs.contains(BlockAttrs::CP_ENABLED) {
        // Access while disabled traps like any undefined encoding.
        undefined(b);
        return Ok(());
    }
    let cp = inst.rs as u32;
    if !matches!(cp, 10 | 11 | 14 | 15) {
        return Err(CompileError::UnsupportedCoprocessor {
            addr: b.pc,
            encoding: b.encoding,
            cp,
        });
    }
    if inst.class == InstClass::CpData {
        // Opaque data operation, forwarded whole.
        b.emit_discard(IrOp::CpWrite, Src::Imm(inst.imm), Src::Imm(0));
        return Ok(());
    }
    if inst.op & 1 != 0 {
        let value = b.emit(IrOp::CpRead, Src::Imm(inst.imm), Src::Imm(0));
        if inst.rd == 15 {
            // Transfer to r15 targets the flags.
            for (flag, bit) in [(FLAG_N, 31), (FLAG_Z, 30), (FLAG_C, 29), (FLAG_V, 28)] {
                let s = b.emit(IrOp::Shr, value, Src::Imm(bit));
                let f = if bit == 31 {
                    s
                } else {
                    b.emit(IrOp::And, s, Src::Imm(1))
                };
                b.set_flag(flag, f);
            }
        } else {
            b.write_reg(inst.rd, value);
        }
    } else {
        let value = b.read_reg_pc(inst.rd, if b.compact() { 0 } else { 4 }, false);
        b.emit_discard(IrOp::CpWrite, Src::Imm(inst.imm), value);
    }
    Ok(())
}

// ---------------------------------------------------------------
// Compact-form branch-with-link pair
// ---------------------------------------------------------------

fn bl_high(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let off = sign_extend(inst.imm, 11) << 12;
    let lr = b.pc_operand(0, false).wrapping_add(off);
    b.write_reg(14, Src::Imm(lr));
    Ok(())
}

fn bl_low(b: &mut BlockBuilder, inst: &ArmInst) -> Result<(), CompileError> {
    let lr = b.read_reg(14);
    let target = b.add2(lr, Src::Imm(inst.imm << 1));
    let ret = b.pc.wrapping_add(2) | 1;
    b.write_reg(14, Src::Imm(ret));
    match target {
        Src::Imm(t) => {
            let t = t & !1;
            b.emit_discard(IrOp::SetReg, Src::Imm(15), Src::Imm(t));
            b.term_link(t, b.attrs);
        }
        v => {
            // The prefix half was outside this block; the target is only
            // known at run time.
            let masked = b.emit(IrOp::And, v, Src::Imm(!1));
            b.emit_discard(IrOp::SetReg, Src::Imm(15), masked);
            b.term_return();
        }
    }
    b.ended = true;
    Ok(())
}
