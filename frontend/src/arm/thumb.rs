//! Compact-form (16-bit) instruction decoding.
//!
//! Every compact instruction is re-expressed as a classic-form record where
//! a structural equivalent exists, so the translator downstream sees one
//! instruction model. The handful of compact-only shapes (hi-register
//! branch/exchange, PC-relative load, the two-halfword branch-with-link
//! pair) synthesize the closest record shape directly.
//!
//! Since the whole instruction is sixteen bits, the decoder is a full
//! 65536-entry table of complete records, built once at startup.

use once_cell::sync::Lazy;

use super::decode::{
    aluop, ArmInst, Cond, InstClass, ShiftKind, HALF_TYPE_SHIFT, MEM_BYTE, MEM_LOAD, MEM_PRE,
    MEM_UP, MEM_WB,
};

static COMPACT_TABLE: Lazy<Vec<ArmInst>> =
    Lazy::new(|| (0..=0xFFFFu32).map(|h| decode_entry(h as u16)).collect());

/// Table lookup for steady-state decoding.
pub fn decode_compact(half: u16) -> ArmInst {
    COMPACT_TABLE[half as usize]
}

fn sign_extend(value: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}

fn dataproc(op: u8, s: bool, rd: u8, rn: u8) -> ArmInst {
    ArmInst {
        class: InstClass::DataProc,
        op,
        s,
        rd,
        rn,
        ..ArmInst::default()
    }
}

fn dataproc_imm(op: u8, s: bool, rd: u8, rn: u8, imm: u32) -> ArmInst {
    ArmInst {
        imm,
        op2_imm: true,
        ..dataproc(op, s, rd, rn)
    }
}

fn mem_single(op: u8, rd: u8, rn: u8) -> ArmInst {
    ArmInst {
        class: InstClass::MemSingle,
        op: op | MEM_PRE | MEM_UP,
        rd,
        rn,
        ..ArmInst::default()
    }
}

fn mem_half(ty: u8, load: bool, rd: u8, rn: u8) -> ArmInst {
    ArmInst {
        class: InstClass::MemHalf,
        op: (ty << HALF_TYPE_SHIFT) | MEM_PRE | MEM_UP | if load { MEM_LOAD } else { 0 },
        rd,
        rn,
        ..ArmInst::default()
    }
}

/// Combinational decode of one half-word; runs only while the table is
/// being built.
fn decode_entry(half: u16) -> ArmInst {
    let h = half as u32;
    let rd = (h & 7) as u8;
    let rb = ((h >> 3) & 7) as u8;

    match h >> 13 {
        0b000 => {
            if (h >> 11) & 3 != 3 {
                // Shift by immediate: MOVS rd, rb <shift> #imm.
                ArmInst {
                    rm: rb,
                    shift: ShiftKind::from_bits((h >> 11) & 3),
                    shift_amount: ((h >> 6) & 0x1F) as u8,
                    ..dataproc(aluop::MOV, true, rd, 0)
                }
            } else {
                // ADDS/SUBS rd, rb, rm-or-imm3.
                let op = if h & (1 << 9) != 0 { aluop::SUB } else { aluop::ADD };
                if h & (1 << 10) != 0 {
                    dataproc_imm(op, true, rd, rb, (h >> 6) & 7)
                } else {
                    ArmInst {
                        rm: ((h >> 6) & 7) as u8,
                        ..dataproc(op, true, rd, rb)
                    }
                }
            }
        }
        0b001 => {
            // MOV/CMP/ADD/SUB with 8-bit immediate.
            let r = ((h >> 8) & 7) as u8;
            let imm = h & 0xFF;
            match (h >> 11) & 3 {
                0 => dataproc_imm(aluop::MOV, true, r, 0, imm),
                1 => dataproc_imm(aluop::CMP, true, 0, r, imm),
                2 => dataproc_imm(aluop::ADD, true, r, r, imm),
                _ => dataproc_imm(aluop::SUB, true, r, r, imm),
            }
        }
        0b010 => decode_group_010(h, rd, rb),
        0b011 => {
            // Word/byte transfer, immediate offset.
            let byte = h & (1 << 12) != 0;
            let load = h & (1 << 11) != 0;
            let imm5 = (h >> 6) & 0x1F;
            ArmInst {
                imm: if byte { imm5 } else { imm5 * 4 },
                op2_imm: true,
                ..mem_single(
                    if load { MEM_LOAD } else { 0 } | if byte { MEM_BYTE } else { 0 },
                    rd,
                    rb,
                )
            }
        }
        0b100 => {
            let load = h & (1 << 11) != 0;
            if h & (1 << 12) == 0 {
                // Halfword transfer, immediate offset.
                ArmInst {
                    imm: ((h >> 6) & 0x1F) * 2,
                    op2_imm: true,
                    ..mem_half(1, load, rd, rb)
                }
            } else {
                // Stack-relative word transfer.
                ArmInst {
                    imm: (h & 0xFF) * 4,
                    op2_imm: true,
                    ..mem_single(if load { MEM_LOAD } else { 0 }, ((h >> 8) & 7) as u8, 13)
                }
            }
        }
        0b101 => decode_group_101(h),
        0b110 => {
            if h & (1 << 12) == 0 {
                // Multi-register transfer with base writeback.
                let load = h & (1 << 11) != 0;
                ArmInst {
                    class: InstClass::MemMulti,
                    op: if load { MEM_LOAD } else { 0 } | MEM_UP | MEM_WB,
                    rn: ((h >> 8) & 7) as u8,
                    reglist: (h & 0xFF) as u16,
                    ..ArmInst::default()
                }
            } else {
                match (h >> 8) & 0xF {
                    0xE => ArmInst::undefined(Cond::Al),
                    0xF => ArmInst {
                        class: InstClass::Svc,
                        imm: h & 0xFF,
                        ..ArmInst::default()
                    },
                    cond => ArmInst {
                        class: InstClass::Branch,
                        cond: Cond::from_bits(cond),
                        imm: sign_extend(h & 0xFF, 8) << 1,
                        ..ArmInst::default()
                    },
                }
            }
        }
        _ => match (h >> 11) & 3 {
            0 => ArmInst {
                class: InstClass::Branch,
                imm: sign_extend(h & 0x7FF, 11) << 1,
                ..ArmInst::default()
            },
            2 => ArmInst {
                class: InstClass::BlHigh,
                imm: h & 0x7FF,
                ..ArmInst::default()
            },
            3 => ArmInst {
                class: InstClass::BlLow,
                imm: h & 0x7FF,
                ..ArmInst::default()
            },
            _ => ArmInst::undefined(Cond::Al),
        },
    }
}

/// 010xxx: the register-ALU group, hi-register ops, PC-relative load and
/// register-offset transfers.
fn decode_group_010(h: u32, rd: u8, rb: u8) -> ArmInst {
    if h >> 10 == 0b010000 {
        // Register ALU group; rb is the second source.
        return match (h >> 6) & 0xF {
            0x0 => ArmInst { rm: rb, ..dataproc(aluop::AND, true, rd, rd) },
            0x1 => ArmInst { rm: rb, ..dataproc(aluop::EOR, true, rd, rd) },
            0x2 | 0x3 | 0x4 | 0x7 => {
                // Shift by register: MOVS rd, rd <shift> rb.
                let kind = match (h >> 6) & 0xF {
                    0x2 => ShiftKind::Lsl,
                    0x3 => ShiftKind::Lsr,
                    0x4 => ShiftKind::Asr,
                    _ => ShiftKind::Ror,
                };
                ArmInst {
                    rm: rd,
                    rs: rb,
                    shift: kind,
                    shift_reg: true,
                    ..dataproc(aluop::MOV, true, rd, 0)
                }
            }
            0x5 => ArmInst { rm: rb, ..dataproc(aluop::ADC, true, rd, rd) },
            0x6 => ArmInst { rm: rb, ..dataproc(aluop::SBC, true, rd, rd) },
            0x8 => ArmInst { rm: rb, ..dataproc(aluop::TST, true, 0, rd) },
            0x9 => dataproc_imm(aluop::RSB, true, rd, rb, 0),
            0xA => ArmInst { rm: rb, ..dataproc(aluop::CMP, true, 0, rd) },
            0xB => ArmInst { rm: rb, ..dataproc(aluop::CMN, true, 0, rd) },
            0xC => ArmInst { rm: rb, ..dataproc(aluop::ORR, true, rd, rd) },
            0xD => ArmInst {
                class: InstClass::Mul,
                s: true,
                rd,
                rm: rd,
                rs: rb,
                ..ArmInst::default()
            },
            0xE => ArmInst { rm: rb, ..dataproc(aluop::BIC, true, rd, rd) },
            _ => ArmInst { rm: rb, ..dataproc(aluop::MVN, true, rd, 0) },
        };
    }
    if h >> 10 == 0b010001 {
        // Hi-register operations and branch/exchange.
        let hd = (h & 7) as u8 | (((h >> 7) & 1) as u8) << 3;
        let hm = ((h >> 3) & 0xF) as u8;
        return match (h >> 8) & 3 {
            0 => ArmInst { rm: hm, ..dataproc(aluop::ADD, false, hd, hd) },
            1 => ArmInst { rm: hm, ..dataproc(aluop::CMP, true, 0, hd) },
            2 => ArmInst { rm: hm, ..dataproc(aluop::MOV, false, hd, 0) },
            _ => {
                if h & (1 << 7) == 0 {
                    ArmInst {
                        class: InstClass::BranchEx,
                        rm: hm,
                        ..ArmInst::default()
                    }
                } else {
                    ArmInst::undefined(Cond::Al)
                }
            }
        };
    }
    if h & (1 << 12) == 0 {
        // LDR rd, [pc, #imm8*4] — compact-only shape; the base reads
        // word-aligned.
        return ArmInst {
            imm: (h & 0xFF) * 4,
            op2_imm: true,
            align_base: true,
            ..mem_single(MEM_LOAD, ((h >> 8) & 7) as u8, 15)
        };
    }
    // Register-offset transfers.
    let rm = ((h >> 6) & 7) as u8;
    match (h >> 9) & 7 {
        0 => ArmInst { rm, ..mem_single(0, rd, rb) },
        1 => ArmInst { rm, ..mem_half(1, false, rd, rb) },
        2 => ArmInst { rm, ..mem_single(MEM_BYTE, rd, rb) },
        3 => ArmInst { rm, ..mem_half(2, true, rd, rb) },
        4 => ArmInst { rm, ..mem_single(MEM_LOAD, rd, rb) },
        5 => ArmInst { rm, ..mem_half(1, true, rd, rb) },
        6 => ArmInst { rm, ..mem_single(MEM_LOAD | MEM_BYTE, rd, rb) },
        _ => ArmInst { rm, ..mem_half(3, true, rd, rb) },
    }
}

/// 101xxx: address generation, stack adjustment, push/pop.
fn decode_group_101(h: u32) -> ArmInst {
    if h & (1 << 12) == 0 {
        // ADD rd, pc-or-sp, #imm8*4.
        let sp = h & (1 << 11) != 0;
        return ArmInst {
            align_base: !sp,
            ..dataproc_imm(
                aluop::ADD,
                false,
                ((h >> 8) & 7) as u8,
                if sp { 13 } else { 15 },
                (h & 0xFF) * 4,
            )
        };
    }
    match (h >> 9) & 7 {
        0 if (h >> 8) & 1 == 0 => {
            // ADD/SUB sp, #imm7*4.
            let op = if h & (1 << 7) != 0 { aluop::SUB } else { aluop::ADD };
            dataproc_imm(op, false, 13, 13, (h & 0x7F) * 4)
        }
        0b010 => ArmInst {
            // PUSH {rlist[, lr]} — store descending with writeback.
            class: InstClass::MemMulti,
            op: MEM_PRE | MEM_WB,
            rn: 13,
            reglist: ((h & 0xFF) | ((h >> 8) & 1) << 14) as u16,
            ..ArmInst::default()
        },
        0b110 => ArmInst {
            // POP {rlist[, pc]} — load ascending with writeback.
            class: InstClass::MemMulti,
            op: MEM_LOAD | MEM_UP | MEM_WB,
            rn: 13,
            reglist: ((h & 0xFF) | ((h >> 8) & 1) << 15) as u16,
            ..ArmInst::default()
        },
        _ => ArmInst::undefined(Cond::Al),
    }
}
