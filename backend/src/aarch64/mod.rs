//! AArch64 code generator.
//!
//! Mirrors the x86-64 generator's structure: single pass over the IR,
//! operands staged through w16/w17 with w15 as the third temporary, results
//! written back to assigned locations. The guest state pointer lives in x19;
//! helper calls load the hook pointer from the state structure and `blr`
//! through it. Guest carry moves between the flag field and PSTATE.C via
//! `msr nzcv`, so adc/sbc and the flag captures use the real hardware flags.

pub mod emitter;

use armlet_core::ir::{IrBlock, IrInst, IrOp};
use armlet_core::state::{
    flag_offset, reg_offset, OFF_CF, OFF_CPSR_BASE, OFF_CYCLES, OFF_CP_READ, OFF_CP_WRITE,
    OFF_MODE_SWITCH, OFF_NF, OFF_READ16, OFF_READ32, OFF_READ8, OFF_SPSR, OFF_SVC, OFF_UNDEF,
    OFF_VF, OFF_WRITE16, OFF_WRITE32, OFF_WRITE8, OFF_ZF,
};

use crate::code_buffer::CodeBuffer;
use crate::regalloc::{Allocation, Loc, RegClassInfo};
use crate::{encode_link_exit, CodeBackend, CompiledCode, LinkRecord};

use emitter::*;

const SCRATCH: [u8; 6] = [9, 10, 11, 12, 13, 14];
const PRESERVED: [u8; 8] = [20, 21, 22, 23, 24, 25, 26, 27];

/// Guest state pointer.
const STATE: u8 = 19;
/// Emission temporaries (the intra-procedure-call registers plus x15).
const T0: u8 = 16;
const T1: u8 = 17;
const T2: u8 = 15;

pub struct Aarch64Backend;

impl Aarch64Backend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Aarch64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBackend for Aarch64Backend {
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
                    if next.op == IrOp::SMulHi {
                        smull_x(e.buf, T2, T0, T1);
                    } else {
                        umull_x(e.buf, T2, T0, T1);
                    }
                    e.store(i as u32, T2);
                    lsr_imm32_x(e.buf, T2, T2);
                    e.store((i + 1) as u32, T2);
                    i += 2;
                    continue;
                }
            }
            e.op(i as u32, inst);
            i += 1;
        }
        debug_assert!(e.skips.is_empty(), "unresolved skip patches");

        let len = e.buf.offset() - entry;
        let links = e.links;
        sync_icache(buf.ptr_at(entry), len);
        CompiledCode { entry, len, links }
    }

    fn patch_link(&self, buf: &mut CodeBuffer, patch_off: usize, target_off: usize) {
        let disp = (target_off as i64 - patch_off as i64) / 4;
        assert!((-(1 << 25)..(1 << 25)).contains(&disp), "branch out of range");
        buf.patch_u32(patch_off, 0x1400_0000 | (disp as u32 & 0x03FF_FFFF));
        sync_icache(buf.ptr_at(patch_off), 4);
    }
}

struct Emit<'a> {
    buf: &'a mut CodeBuffer,
    alloc: &'a Allocation,
    handle: u32,
    frame: u32,
    saved: Vec<u8>,
    loop_label: usize,
    skips: Vec<(u32, usize)>,
    links: Vec<LinkRecord>,
}

impl<'a> Emit<'a> {
    fn new(buf: &'a mut CodeBuffer, alloc: &'a Allocation, handle: u32) -> Self {
        let mut saved = vec![STATE];
        saved.extend_from_slice(&PRESERVED[..alloc.preserved_used as usize]);
        let frame = ((alloc.stack_slots as u32) * 4 + 15) & !15;
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

    fn resolve_skips(&mut self, idx: u32) {
        let here = self.buf.offset();
        let buf = &mut *self.buf;
        self.skips.retain(|&(target, at)| {
            if target == idx {
                patch_cbz(buf, at, ((here - at) / 4) as i32);
                false
            } else {
                true
            }
        });
    }

    fn load(&mut self, raw: u32, is_imm: bool, into: u8) {
        if is_imm {
            mov_imm32(self.buf, into, raw);
            return;
        }
        match self.alloc.loc(raw) {
            Loc::Scratch(k) => mov_w(self.buf, into, SCRATCH[k as usize]),
            Loc::Preserved(k) => mov_w(self.buf, into, PRESERVED[k as usize]),
            Loc::Stack(s) => ldr_w(self.buf, into, SP, s as u32 * 4),
            Loc::None => unreachable!("operand references a non-value op"),
        }
    }

    fn store(&mut self, value: u32, from: u8) {
        match self.alloc.loc(value) {
            Loc::Scratch(k) => mov_w(self.buf, SCRATCH[k as usize], from),
            Loc::Preserved(k) => mov_w(self.buf, PRESERVED[k as usize], from),
            Loc::Stack(s) => str_w(self.buf, from, SP, s as u32 * 4),
            Loc::None => unreachable!("storing a non-value op"),
        }
    }

    fn capture_flag(&mut self, cond: Cond, off: usize) {
        cset_w(self.buf, T2, cond);
        str_w(self.buf, T2, STATE, off as u32);
    }

    fn capture_nzcv(&mut self) {
        self.capture_flag(Cond::Hs, OFF_CF);
        self.capture_flag(Cond::Vs, OFF_VF);
        self.capture_flag(Cond::Mi, OFF_NF);
        self.capture_flag(Cond::Eq, OFF_ZF);
    }

    /// Move the guest carry into PSTATE.C (bit 29 of NZCV).
    fn stage_carry_in(&mut self) {
        ldr_w(self.buf, T2, STATE, OFF_CF as u32);
        lsl_imm_w(self.buf, T2, T2, 29);
        msr_nzcv(self.buf, T2);
    }

    fn prologue_saves(&mut self) {
        stp_x_pre(self.buf, 29, 30, SP, -16);
        add_imm_x(self.buf, 29, SP, 0);
        let saved = self.saved.clone();
        for chunk in saved.chunks(2) {
            if chunk.len() == 2 {
                stp_x_pre(self.buf, chunk[0], chunk[1], SP, -16);
            } else {
                str_x_pre(self.buf, chunk[0], SP, -16);
            }
        }
        if self.frame != 0 {
            sub_imm_x(self.buf, SP, SP, self.frame);
        }
    }

    fn epilogue_restore(&mut self) {
        if self.frame != 0 {
            add_imm_x(self.buf, SP, SP, self.frame);
        }
        let saved = self.saved.clone();
        for chunk in saved.chunks(2).rev() {
            if chunk.len() == 2 {
                ldp_x_post(self.buf, chunk[0], chunk[1], SP, 16);
            } else {
                ldr_x_post(self.buf, chunk[0], SP, 16);
            }
        }
        ldp_x_post(self.buf, 29, 30, SP, 16);
    }

    /// Indirect helper call; w1/w2 must already be staged.
    fn call_hook(&mut self, off: usize) {
        mov_x(self.buf, 0, STATE);
        ldr_x(self.buf, T0, STATE, off as u32);
        blr(self.buf, T0);
    }

    fn op(&mut self, idx: u32, inst: &IrInst) {
        match inst.op {
            IrOp::BlockStart => {
                self.prologue_saves();
                mov_x(self.buf, STATE, 0);
                self.loop_label = self.buf.offset();
            }

            IrOp::Return => {
                ldr_w(self.buf, T0, STATE, OFF_CYCLES as u32);
                sub_imm_w(self.buf, T0, T0, inst.cycles as u32);
                str_w(self.buf, T0, STATE, OFF_CYCLES as u32);
                self.epilogue_restore();
                mov_w(self.buf, 0, ZR);
                ret(self.buf);
            }

            IrOp::Loop => {
                ldr_w(self.buf, T0, STATE, OFF_CYCLES as u32);
                subs_imm_w(self.buf, T0, T0, inst.cycles as u32);
                str_w(self.buf, T0, STATE, OFF_CYCLES as u32);
                let disp = (self.loop_label as i64 - self.buf.offset() as i64) / 4;
                b_cond(self.buf, Cond::Gt, disp as i32);
                self.epilogue_restore();
                mov_w(self.buf, 0, ZR);
                ret(self.buf);
            }

            IrOp::ReturnLink => {
                ldr_w(self.buf, T0, STATE, OFF_CYCLES as u32);
                subs_imm_w(self.buf, T0, T0, inst.cycles as u32);
                str_w(self.buf, T0, STATE, OFF_CYCLES as u32);
                mov_x(self.buf, 0, STATE);
                self.epilogue_restore();
                // Layout after b.le: b(1), movz+movk+ret(3), exhausted path.
                b_cond(self.buf, Cond::Le, 5);
                let patch_off = b(self.buf, 1);
                let slot = self.links.len();
                mov_imm32_pair(self.buf, 0, encode_link_exit(self.handle, slot));
                ret(self.buf);
                mov_w(self.buf, 0, ZR);
                ret(self.buf);
                self.links.push(LinkRecord {
                    patch_off,
                    fallback_off: patch_off + 4,
                    addr: inst.a,
                    attrs: inst.b as u8,
                });
            }

            IrOp::SkipIfZero => {
                self.load(inst.a, inst.a_imm, T0);
                let at = cbz_w(self.buf, T0);
                self.skips.push((inst.b, at));
            }

            // -- Guest state moves --
            IrOp::GetReg => {
                ldr_w(self.buf, T0, STATE, reg_offset(inst.a) as u32);
                self.store(idx, T0);
            }
            IrOp::SetReg => {
                self.load(inst.b, inst.b_imm, T0);
                str_w(self.buf, T0, STATE, reg_offset(inst.a) as u32);
            }
            IrOp::GetFlag => {
                ldr_w(self.buf, T0, STATE, flag_offset(inst.a) as u32);
                self.store(idx, T0);
            }
            IrOp::SetFlag => {
                self.load(inst.b, inst.b_imm, T0);
                str_w(self.buf, T0, STATE, flag_offset(inst.a) as u32);
            }
            IrOp::GetCpsrBase => {
                ldr_w(self.buf, T0, STATE, OFF_CPSR_BASE as u32);
                self.store(idx, T0);
            }
            IrOp::SetCpsrBase => {
                self.load(inst.a, inst.a_imm, T0);
                str_w(self.buf, T0, STATE, OFF_CPSR_BASE as u32);
            }
            IrOp::GetSpsr => {
                ldr_w(self.buf, T0, STATE, OFF_SPSR as u32);
                self.store(idx, T0);
            }
            IrOp::SetSpsr => {
                self.load(inst.a, inst.a_imm, T0);
                str_w(self.buf, T0, STATE, OFF_SPSR as u32);
            }
            IrOp::SetNz => {
                self.load(inst.a, inst.a_imm, T0);
                lsr_imm_w(self.buf, T2, T0, 31);
                str_w(self.buf, T2, STATE, OFF_NF as u32);
                cmp_imm_w(self.buf, T0, 0);
                self.capture_flag(Cond::Eq, OFF_ZF);
            }

            // -- ALU --
            IrOp::Mov => {
                self.load(inst.a, inst.a_imm, T0);
                self.store(idx, T0);
            }
            IrOp::Mvn => {
                self.load(inst.a, inst.a_imm, T0);
                mvn_w(self.buf, T0, T0);
                self.store(idx, T0);
            }
            IrOp::Add | IrOp::Sub | IrOp::And | IrOp::Orr | IrOp::Eor | IrOp::Bic => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                match inst.op {
                    IrOp::Add => add_w(self.buf, T0, T0, T1),
                    IrOp::Sub => sub_w(self.buf, T0, T0, T1),
                    IrOp::And => and_w(self.buf, T0, T0, T1),
                    IrOp::Orr => orr_w(self.buf, T0, T0, T1),
                    IrOp::Eor => eor_w(self.buf, T0, T0, T1),
                    _ => bic_w(self.buf, T0, T0, T1),
                }
                self.store(idx, T0);
            }
            IrOp::Mul => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                mul_w(self.buf, T0, T0, T1);
                self.store(idx, T0);
            }
            IrOp::UMulHi | IrOp::SMulHi => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                if inst.op == IrOp::SMulHi {
                    smull_x(self.buf, T2, T0, T1);
                } else {
                    umull_x(self.buf, T2, T0, T1);
                }
                lsr_imm32_x(self.buf, T2, T2);
                self.store(idx, T2);
            }
            IrOp::Adc | IrOp::Sbc => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                self.stage_carry_in();
                if inst.op == IrOp::Adc {
                    adc_w(self.buf, T0, T0, T1);
                } else {
                    sbc_w(self.buf, T0, T0, T1);
                }
                self.store(idx, T0);
            }
            IrOp::AddFlags | IrOp::SubFlags | IrOp::AdcFlags | IrOp::SbcFlags => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                match inst.op {
                    IrOp::AddFlags => adds_w(self.buf, T0, T0, T1),
                    IrOp::SubFlags => subs_w(self.buf, T0, T0, T1),
                    IrOp::AdcFlags => {
                        self.stage_carry_in();
                        adcs_w(self.buf, T0, T0, T1);
                    }
                    _ => {
                        self.stage_carry_in();
                        sbcs_w(self.buf, T0, T0, T1);
                    }
                }
                self.capture_nzcv();
                self.store(idx, T0);
            }

            // -- Shifts with guest semantics --
            IrOp::Shl | IrOp::Shr => {
                self.load(inst.a, inst.a_imm, T0);
                if inst.b_imm {
                    if inst.b >= 32 {
                        mov_w(self.buf, T0, ZR);
                    } else if inst.b != 0 {
                        if inst.op == IrOp::Shl {
                            lsl_imm_w(self.buf, T0, T0, inst.b);
                        } else {
                            lsr_imm_w(self.buf, T0, T0, inst.b);
                        }
                    }
                } else {
                    self.load(inst.b, inst.b_imm, T1);
                    cmp_imm_w(self.buf, T1, 32);
                    if inst.op == IrOp::Shl {
                        lslv_w(self.buf, T0, T0, T1);
                    } else {
                        lsrv_w(self.buf, T0, T0, T1);
                    }
                    // Amounts of 32 and up produce zero.
                    csel_w(self.buf, T0, ZR, T0, Cond::Hs);
                }
                self.store(idx, T0);
            }
            IrOp::Sar => {
                self.load(inst.a, inst.a_imm, T0);
                if inst.b_imm {
                    let n = inst.b.min(31);
                    if n != 0 {
                        asr_imm_w(self.buf, T0, T0, n);
                    }
                } else {
                    self.load(inst.b, inst.b_imm, T1);
                    // Amounts of 32 and up fill with the sign bit.
                    asr_imm_w(self.buf, T2, T0, 31);
                    cmp_imm_w(self.buf, T1, 32);
                    asrv_w(self.buf, T0, T0, T1);
                    csel_w(self.buf, T0, T2, T0, Cond::Hs);
                }
                self.store(idx, T0);
            }
            IrOp::Ror => {
                self.load(inst.a, inst.a_imm, T0);
                if inst.b_imm {
                    let n = inst.b & 31;
                    if n != 0 {
                        ror_imm_w(self.buf, T0, T0, n);
                    }
                } else {
                    self.load(inst.b, inst.b_imm, T1);
                    rorv_w(self.buf, T0, T0, T1);
                }
                self.store(idx, T0);
            }

            // -- Compares --
            IrOp::CmpLtU => {
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                cmp_w(self.buf, T0, T1);
                cset_w(self.buf, T0, Cond::Lo);
                self.store(idx, T0);
            }
            IrOp::CmpEq0 => {
                self.load(inst.a, inst.a_imm, T0);
                cmp_imm_w(self.buf, T0, 0);
                cset_w(self.buf, T0, Cond::Eq);
                self.store(idx, T0);
            }

            // -- Collaborator calls --
            IrOp::Load8U | IrOp::Load8S | IrOp::Load16U | IrOp::Load16S | IrOp::Load32 => {
                let hook = match inst.op {
                    IrOp::Load8U | IrOp::Load8S => OFF_READ8,
                    IrOp::Load16U | IrOp::Load16S => OFF_READ16,
                    _ => OFF_READ32,
                };
                self.load(inst.a, inst.a_imm, T0);
                mov_w(self.buf, 1, T0);
                self.call_hook(hook);
                match inst.op {
                    IrOp::Load8S => sxtb_w(self.buf, 0, 0),
                    IrOp::Load16S => sxth_w(self.buf, 0, 0),
                    _ => {}
                }
                self.store(idx, 0);
            }
            IrOp::Store8 | IrOp::Store16 | IrOp::Store32 => {
                let hook = match inst.op {
                    IrOp::Store8 => OFF_WRITE8,
                    IrOp::Store16 => OFF_WRITE16,
                    _ => OFF_WRITE32,
                };
                self.load(inst.a, inst.a_imm, T0);
                self.load(inst.b, inst.b_imm, T1);
                mov_w(self.buf, 1, T0);
                mov_w(self.buf, 2, T1);
                self.call_hook(hook);
            }
            IrOp::CpRead => {
                mov_imm32(self.buf, 1, inst.a);
                self.call_hook(OFF_CP_READ);
                self.store(idx, 0);
            }
            IrOp::CpWrite => {
                self.load(inst.b, inst.b_imm, T0);
                mov_w(self.buf, 2, T0);
                mov_imm32(self.buf, 1, inst.a);
                self.call_hook(OFF_CP_WRITE);
            }
            IrOp::Svc => {
                mov_imm32(self.buf, 1, inst.a);
                self.call_hook(OFF_SVC);
            }
            IrOp::Undef => {
                mov_imm32(self.buf, 1, inst.a);
                self.call_hook(OFF_UNDEF);
            }
            IrOp::ModeSwitch => {
                self.load(inst.a, inst.a_imm, T0);
                mov_w(self.buf, 1, T0);
                self.call_hook(OFF_MODE_SWITCH);
            }
        }
    }
}
