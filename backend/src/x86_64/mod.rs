//! x86-64 code generator.
//!
//! Emission is single-pass over the IR. Operands are staged through rax/rcx
//! and results written back to the value's assigned location; rdx is the
//! third temporary (carry staging, flag capture, wide-multiply high half).
//! The guest state pointer lives in rbx for the whole function, so helper
//! calls are `call [rbx + hook_offset]` with arguments staged per the SysV
//! ABI.

pub mod emitter;

use armlet_core::ir::{IrBlock, IrInst, IrOp};
use armlet_core::state::{
    flag_offset, reg_offset, OFF_CF, OFF_CPSR_BASE, OFF_CYCLES, OFF_MODE_SWITCH, OFF_NF,
    OFF_READ16, OFF_READ32, OFF_READ8, OFF_SPSR, OFF_SVC, OFF_UNDEF, OFF_VF, OFF_WRITE16,
    OFF_WRITE32, OFF_WRITE8, OFF_ZF, OFF_CP_READ, OFF_CP_WRITE,
};

use crate::code_buffer::CodeBuffer;
use crate::regalloc::{Allocation, Loc, RegClassInfo};
use crate::{encode_link_exit, CodeBackend, CompiledCode, LinkRecord};

use emitter::*;

/// Pool handed to the allocator: caller-saved first.
const SCRATCH: [Reg; 6] = [Reg::Rsi, Reg::Rdi, Reg::R8, Reg::R9, Reg::R10, Reg::R11];
const PRESERVED: [Reg; 5] = [Reg::R12, Reg::R13, Reg::R14, Reg::R15, Reg::Rbp];

/// Guest state pointer for the whole function.
const STATE: Reg = Reg::Rbx;
/// Emission temporaries.
const T0: Reg = Reg::Rax;
const T1: Reg = Reg::Rcx;
const T2: Reg = Reg::Rdx;

pub struct X86_64Backend;

impl X86_64Backend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for X86_64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBackend for X86_64Backend {
    fn reg_classes(&self) -> RegClassInfo {
        RegClassInfo {
            scratch: SCRATCH.len() as u8,
            preserved: PRESERVED.len() as u8,
        }
    }

    fn compile(
        &self,
        buf: &mut CodeBuffer,
        block: &IrBlock,
        alloc: &Allocation,
        handle: u32,
    ) -> CompiledCode {
        let entry = buf.offset();
        let mut e = Emit::new(buf, alloc, handle);

        let ops = &block.ops;
        let mut i = 0;
        while i < ops.len() {
            e.resolve_skips(i as u32);
            let inst = &ops[i];
            // Widening multiplies come as an adjacent low/high pair over the
            // same operands; emit one wide multiply for both.
            if inst.op == IrOp::Mul && i + 1 < ops.len() {
                let next = &ops[i + 1];
                if matches!(next.op, IrOp::UMulHi | IrOp::SMulHi)
                    && next.a == inst.a
                    && next.b == inst.b
                    && next.a_imm == inst.a_imm
                    && next.b_imm == inst.b_imm
                {
                    e.load(inst.a, inst.a_imm, T0);
                    e.load(inst.b, inst.b_imm, T1);
                    mul_wide32(e.buf, T1, next.op == IrOp::SMulHi);
                    e.store(i as u32, T0);
                    e.store((i + 1) as u32, T2);
                    i += 2;
                    continue;
                }
            }
            e.op(i as u32, inst);
            i += 1;
        }
        debug_assert!(e.skips.is_empty(), "unresolved skip patches");

        CompiledCode {
            entry,
            len: e.buf.offset() - entry,
            links: e.links,
        }
    }

    fn patch_link(&self, buf: &mut CodeBuffer, patch_off: usize, target_off: usize) {
        let disp = (target_off as i64) - (patch_off as i64 + 5);
        assert!(
            (i32::MIN as i64..=i32::MAX as i64).contains(&disp),
            "jump displacement out of i32 range"
        );
        buf.patch_u32(patch_off + 1, disp as u32);
    }
}

struct Emit<'a> {
    buf: &'a mut CodeBuffer,
    alloc: &'a Allocation,
    handle: u32,
    frame: i32,
    saved: Vec<Reg>,
    loop_label: usize,
    /// (target IR index, offset of the rel32 field to patch).
    skips: Vec<(u32, usize)>,
    links: Vec<LinkRecord>,
}

impl<'a> Emit<'a> {
    fn new(buf: &'a mut CodeBuffer, alloc: &'a Allocation, handle: u32) -> Self {
        let mut saved = vec![STATE];
        saved.extend_from_slice(&PRESERVED[..alloc.preserved_used as usize]);
        // Keep rsp 16-aligned at helper-call sites: an odd push count means
        // the return address already misaligned us by 8.
        let mut frame = ((alloc.stack_slots as i32) * 4 + 15) & !15;
        if saved.len() % 2 == 0 {
            frame += 8;
        }
        Self {
            buf,
            alloc,
            handle,
            frame,
            saved,
            loop_label: 0,
            skips: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Patch forward skips that land on op `idx`.
    fn resolve_skips(&mut self, idx: u32) {
        let here = self.buf.offset();
        let buf = &mut *self.buf;
        self.skips.retain(|&(target, at)| {
            if target == idx {
                buf.patch_u32(at, (here as i64 - (at as i64 + 4)) as u32);
                false
            } else {
                true
            }
        });
    }

    /// Stage an operand into a temporary.
    fn load(&mut self, raw: u32, is_imm: bool, into: Reg) {
        if is_imm {
            mov_ri32(self.buf, into, raw);
            return;
        }
        match self.alloc.loc(raw) {
            Loc::Scratch(k) => mov_rr32(self.buf, into, SCRATCH[k as usize]),
            Loc::Preserved(k) => mov_rr32(self.buf, into, PRESERVED[k as usize]),
            Loc::Stack(s) => ld32(self.buf, into, Reg::Rsp, s as i32 * 4),
            Loc::None => unreachable!("operand references a non-value op"),
        }
    }

    /// Write a result to its assigned location.
    fn store(&mut self, value: u32, from: Reg) {
        match self.alloc.loc(value) {
            Loc::Scratch(k) => mov_rr32(self.buf, SCRATCH[k as usize], from),
            Loc::Preserved(k) => mov_rr32(self.buf, PRESERVED[k as usize], from),
            Loc::Stack(s) => st32(self.buf, from, Reg::Rsp, s as i32 * 4),
            Loc::None => unreachable!("storing a non-value op"),
        }
    }

    /// Capture one host condition flag into a guest flag field.
    fn capture_flag(&mut self, cc: Cc, off: usize) {
        setcc(self.buf, cc, T2);
        movzx_rb(self.buf, T2, T2);
        st32(self.buf, T2, STATE, off as i32);
    }

    /// NZCV capture after a flag-setting arithmetic op; `carry_cc` differs
    /// between add (carry set) and sub (borrow clear).
    fn capture_nzcv(&mut self, carry_cc: Cc) {
        self.capture_flag(carry_cc, OFF_CF);
        self.capture_flag(Cc::O, OFF_VF);
        self.capture_flag(Cc::S, OFF_NF);
        self.capture_flag(Cc::E, OFF_ZF);
    }

    /// Stage the guest carry into the host carry flag (bit 0 via shr).
    fn stage_carry_in(&mut self, invert: bool) {
        ld32(self.buf, T2, STATE, OFF_CF as i32);
        if invert {
            alu_ri32(self.buf, ArithOp::Xor, T2, 1);
        }
        shift_ri32(self.buf, ShiftOp::Shr, T2, 1);
    }

    fn epilogue_restore(&mut self) {
        if self.frame != 0 {
            lea_rsp(self.buf, self.frame);
        }
        for &r in self.saved.iter().rev() {
            pop(self.buf, r);
        }
    }

    /// Indirect helper call; args must already be staged in rsi/rdx.
    fn call_hook(&mut self, off: usize) {
        mov_rr64(self.buf, Reg::Rdi, STATE);
        call_mem(self.buf, STATE, off as i32);
    }

    fn op(&mut self, idx: u32, inst: &IrInst) {
        match inst.op {
            IrOp::BlockStart => {
                for &r in &self.saved.clone() {
                    push(self.buf, r);
                }
                if self.frame != 0 {
                    lea_rsp(self.buf, -self.frame);
                }
                mov_rr64(self.buf, STATE, Reg::Rdi);
                self.loop_label = self.buf.offset();
            }

            IrOp::Return => {
                sub_mem32_imm(self.buf, STATE, OFF_CYCLES as i32, inst.cycles as i32);
                self.epilogue_restore();
                alu_rr32(self.buf, ArithOp::Xor, T0, T0);
                ret(self.buf);
            }

            IrOp::Loop => {
                sub_mem32_imm(self.buf, STATE, OFF_CYCLES as i32, inst.cycles as i32);
                // Budget still positive: close the loop without leaving the
                // native function.
                let disp = self.loop_label as i64 - (self.buf.offset() as i64 + 6);
                jcc_rel32(self.buf, Cc::G, disp as i32);
                self.epilogue_restore();
                alu_rr32(self.buf, ArithOp::Xor, T0, T0);
                ret(self.buf);
            }

            IrOp::ReturnLink => {
                sub_mem32_imm(self.buf, STATE, OFF_CYCLES as i32, inst.cycles as i32);
                // The chain target's prologue reloads the state pointer from
                // the argument register.
                mov_rr64(self.buf, Reg::Rdi, STATE);
                self.epilogue_restore();
                // Exhausted budget returns instead of chaining; the target
                // pc is already stored. Layout below: jmp(5) mov(5) ret(1).
                jcc_rel32(self.buf, Cc::Le, 11);
                let patch_off = jmp_rel32(self.buf, 0);
                let slot = self.links.len();
                mov_ri32(self.buf, T0, encode_link_exit(self.handle, slot));
                ret(self.buf);
                alu_rr32(self.buf, ArithOp::Xor, T0, T0);
                ret(self.buf);
                self.links.push(LinkRecord {
                    patch_off,
                    fallback_off: patch_off + 5,
                    addr: inst.a,
                    attrs: inst.b as u8,
                });
            }

            IrOp::SkipIfZero => {
                self.load(inst.a, inst.a_imm, T0);
                test_rr32(self.buf, T0, T0);
                let at = jcc_rel32(self.buf, Cc::E, 0);
                self.skips.push((inst.b, at));
            }

            // -- Guest state moves --
            IrOp::GetReg => {
                ld32(self.buf, T0, STATE, reg_offset(inst.a) as i32);
                self.store(idx, T0);
            }
            IrOp::SetReg => {
                self.load(inst.b, inst.b_imm, T0);
                st32(self.buf, T0, STATE, reg_offset(inst.a) as i32);
            }
            IrOp::GetFlag => {
                ld32(self.buf, T0, STATE, flag_offset(inst.a) as i32);
                self.store(idx, T0);
            }
            IrOp::SetFlag => {
                self.load(inst.b, inst.b_imm, T0);
                st32(self.buf, T0, STATE, flag_offset(inst.a) as i32);
            }
            IrOp::GetCpsrBase => {
                ld32(self.buf, T0, STATE, OFF_CPSR_BASE as i32);
                self.store(idx, T0);
            }
            IrOp::SetCpsrBase => {
                self.load(inst.a, inst.a_imm, T0);
                st32(self.buf, T0, STATE, OFF_CPSR_BASE as i32);
            }
            IrOp::GetSpsr => {
                ld32(self.buf, T0, STATE, OFF_SPSR as i32);
                self.store(idx, T0);
            }
            IrOp::SetSpsr => {
                self.load(inst.a, inst.a_imm, T0);
                st32(self.buf, T0, STATE, OFF_SPSR as i32);
            }
            IrOp::SetNz => {
                self.load(inst.a, inst.a_imm, T0);
                mov_rr32(self.buf, T2, T0);
                shift_ri32(self.buf, ShiftOp::Shr, T2, 31);
                st32(self.buf, T2, STATE, OFF_NF as i32);
                test_rr32(self.buf, T0, T0);
                self.capture_flag(Cc::E, OFF_ZF);
            }

            // -- ALU --
            IrOp::Mov => {
                self.load(inst.a, inst.a_imm, T0);
                self.store(idx, T0);
            }
            IrOp::Mvn => {
                self.load(inst.a, inst.a_imm, T0);
                not32(self.buf, T0);
                self.store(idx, T0);
            }
            IrOp::Add | IrOp::Sub | IrOp::And | IrOp::Orr | IrOp::Eor => {
                let aop = match inst.op {
                    IrOp::Add => ArithOp::Add,
                    IrOp::Sub => ArithOp::Sub,
                    IrOp::And => ArithOp::And,
                    IrOp::Orr => ArithOp::Or,
                    _ => ArithOp::Xor,
                };
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                alu_rr32(self.buf, aop, T0, T1);
                self.store(idx, T0);
            }
            IrOp::Bic => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                not32(self.buf, T1);
                alu_rr32(self.buf, ArithOp::And, T0, T1);
                self.store(idx, T0);
            }
            IrOp::Mul => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                imul_rr32(self.buf, T0, T1);
                self.store(idx, T0);
            }
            IrOp::UMulHi | IrOp::SMulHi => {
                // Normally fused with the preceding Mul; standalone form
                // computes the wide product and keeps only the high half.
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                mul_wide32(self.buf, T1, inst.op == IrOp::SMulHi);
                self.store(idx, T2);
            }
            IrOp::Adc | IrOp::Sbc => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                self.stage_carry_in(inst.op == IrOp::Sbc);
                let aop = if inst.op == IrOp::Adc {
                    ArithOp::Adc
                } else {
                    ArithOp::Sbb
                };
                alu_rr32(self.buf, aop, T0, T1);
                self.store(idx, T0);
            }
            IrOp::AddFlags | IrOp::SubFlags | IrOp::AdcFlags | IrOp::SbcFlags => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                let (aop, carry_cc) = match inst.op {
                    IrOp::AddFlags => (ArithOp::Add, Cc::B),
                    IrOp::SubFlags => (ArithOp::Sub, Cc::Ae),
                    IrOp::AdcFlags => {
                        self.stage_carry_in(false);
                        (ArithOp::Adc, Cc::B)
                    }
                    _ => {
                        self.stage_carry_in(true);
                        (ArithOp::Sbb, Cc::Ae)
                    }
                };
                alu_rr32(self.buf, aop, T0, T1);
                self.capture_nzcv(carry_cc);
                self.store(idx, T0);
            }

            // -- Shifts with guest semantics --
            IrOp::Shl | IrOp::Shr => {
                let sop = if inst.op == IrOp::Shl {
                    ShiftOp::Shl
                } else {
                    ShiftOp::Shr
                };
                self.load(inst.a, inst.a_imm, T0);
                if inst.b_imm {
                    if inst.b >= 32 {
                        alu_rr32(self.buf, ArithOp::Xor, T0, T0);
                    } else if inst.b != 0 {
                        shift_ri32(self.buf, sop, T0, inst.b as u8);
                    }
                } else {
                    self.load(inst.b, inst.b_imm, T1);
                    shift_cl32(self.buf, sop, T0);
                    // Amounts of 32 and up produce zero, not the host's
                    // wrap-at-32 result.
                    alu_rr32(self.buf, ArithOp::Xor, T2, T2);
                    alu_ri32(self.buf, ArithOp::Cmp, T1, 32);
                    cmovcc32(self.buf, Cc::Ae, T0, T2);
                }
                self.store(idx, T0);
            }
            IrOp::Sar => {
                self.load(inst.a, inst.a_imm, T0);
                if inst.b_imm {
                    let n = inst.b.min(31);
                    if n != 0 {
                        shift_ri32(self.buf, ShiftOp::Sar, T0, n as u8);
                    }
                } else {
                    self.load(inst.b, inst.b_imm, T1);
                    shift_cl32(self.buf, ShiftOp::Sar, T0);
                    // Amounts of 32 and up fill with the sign bit: one more
                    // 31-step shift on top of the host's masked shift.
                    alu_ri32(self.buf, ArithOp::Cmp, T1, 32);
                    self.buf.emit_u8(0x72); // jb +3
                    self.buf.emit_u8(0x03);
                    shift_ri32(self.buf, ShiftOp::Sar, T0, 31);
                }
                self.store(idx, T0);
            }
            IrOp::Ror => {
                self.load(inst.a, inst.a_imm, T0);
                if inst.b_imm {
                    let n = inst.b & 31;
                    if n != 0 {
                        shift_ri32(self.buf, ShiftOp::Ror, T0, n as u8);
                    }
                } else {
                    self.load(inst.b, inst.b_imm, T1);
                    shift_cl32(self.buf, ShiftOp::Ror, T0);
                }
                self.store(idx, T0);
            }

            // -- Compares --
            IrOp::CmpLtU => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                alu_rr32(self.buf, ArithOp::Cmp, T0, T1);
                setcc(self.buf, Cc::B, T2);
                movzx_rb(self.buf, T2, T2);
                self.store(idx, T2);
            }
            IrOp::CmpEq0 => {
                self.load(inst.a, inst.a_imm, T0);
                test_rr32(self.buf, T0, T0);
                setcc(self.buf, Cc::E, T2);
                movzx_rb(self.buf, T2, T2);
                self.store(idx, T2);
            }

            // -- Collaborator calls --
            IrOp::Load8U | IrOp::Load8S | IrOp::Load16U | IrOp::Load16S | IrOp::Load32 => {
                let hook = match inst.op {
                    IrOp::Load8U | IrOp::Load8S => OFF_READ8,
                    IrOp::Load16U | IrOp::Load16S => OFF_READ16,
                    _ => OFF_READ32,
                };
                self.load(inst.a, inst.a_imm, T0);
                mov_rr32(self.buf, Reg::Rsi, T0);
                self.call_hook(hook);
                match inst.op {
                    IrOp::Load8S => movsx_b32(self.buf, T0),
                    IrOp::Load16S => movsx_w32(self.buf, T0),
                    _ => {}
                }
                self.store(idx, T0);
            }
            IrOp::Store8 | IrOp::Store16 | IrOp::Store32 => {
                let hook = match inst.op {
                    IrOp::Store8 => OFF_WRITE8,
                    IrOp::Store16 => OFF_WRITE16,
                    _ => OFF_WRITE32,
                };
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                mov_rr32(self.buf, Reg::Rsi, T0);
                mov_rr32(self.buf, Reg::Rdx, T1);
                self.call_hook(hook);
            }
            IrOp::CpRead => {
                mov_ri32(self.buf, Reg::Rsi, inst.a);
                self.call_hook(OFF_CP_READ);
                self.store(idx, T0);
            }
            IrOp::CpWrite => {
                self.load(inst.b, inst.b_imm, T0);
                mov_rr32(self.buf, Reg::Rdx, T0);
                mov_ri32(self.buf, Reg::Rsi, inst.a);
                self.call_hook(OFF_CP_WRITE);
            }
            IrOp::Svc => {
                mov_ri32(self.buf, Reg::Rsi, inst.a);
                self.call_hook(OFF_SVC);
            }
            IrOp::Undef => {
                mov_ri32(self.buf, Reg::Rsi, inst.a);
                self.call_hook(OFF_UNDEF);
            }
            IrOp::ModeSwitch => {
                self.load(inst.a, inst.a_imm, T0);
                mov_rr32(self.buf, Reg::Rsi, T0);
                self.call_hook(OFF_MODE_SWITCH);
            }
        }
    }
}
