use armlet_frontend::arm::decode::{aluop, decode_classic, ArmInst, Cond, InstClass, ShiftKind};
use armlet_frontend::arm::thumb::decode_compact;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Every 16-bit pattern decodes to some record without failing.
#[test]
fn compact_decode_is_total() {
    for h in 0..=0xFFFFu32 {
        let inst = decode_compact(h as u16);
        // Only the conditional-branch format carries a condition.
        if inst.class != InstClass::Branch {
            assert_eq!(inst.cond, Cond::Al, "half {h:#06x}");
        }
    }
}

/// Every 32-bit pattern decodes to some record: sweep the whole dispatch
/// space with randomized don't-care bits.
#[test]
fn classic_decode_is_total() {
    let mut rng = StdRng::seed_from_u64(0x0dd0_91e5);
    for key in 0..4096u32 {
        for _ in 0..64 {
            let filler: u32 = rng.gen();
            let word = (filler & !0x0FF0_00F0) | ((key & 0xFF0) << 16) | ((key & 0xF) << 4);
            let inst = decode_classic(word);
            if word >> 28 == 0xF {
                assert_eq!(inst.class, InstClass::Undefined, "word {word:#010x}");
            }
        }
    }
}

#[test]
fn classic_dataproc_immediate() {
    // MOV r0, #5
    let inst = decode_classic(0xE3A0_0005);
    assert_eq!(inst.class, InstClass::DataProc);
    assert_eq!(inst.op, aluop::MOV);
    assert!(!inst.s);
    assert_eq!(inst.rd, 0);
    assert!(inst.op2_imm);
    assert_eq!(inst.imm, 5);

    // ADDS r0, r0, r1
    let inst = decode_classic(0xE090_0001);
    assert_eq!(inst.class, InstClass::DataProc);
    assert_eq!(inst.op, aluop::ADD);
    assert!(inst.s);
    assert_eq!((inst.rd, inst.rn, inst.rm), (0, 0, 1));
    assert!(!inst.op2_imm);
}

#[test]
fn classic_rotated_immediate() {
    // MOV r0, #0xFF000000 (0xFF ror 8)
    let inst = decode_classic(0xE3A0_04FF);
    assert_eq!(inst.imm, 0xFF00_0000);
    assert_eq!(inst.shift_amount, 8);
}

#[test]
fn classic_shifted_register() {
    // MOVS r0, r1, LSL #4
    let inst = decode_classic(0xE1B0_0201);
    assert_eq!(inst.class, InstClass::DataProc);
    assert_eq!(inst.op, aluop::MOV);
    assert!(inst.s);
    assert_eq!(inst.rm, 1);
    assert_eq!(inst.shift, ShiftKind::Lsl);
    assert_eq!(inst.shift_amount, 4);
    assert!(!inst.shift_reg);

    // ANDS r2, r3, r4, LSR r5
    let inst = decode_classic(0xE013_2534);
    assert_eq!(inst.op, aluop::AND);
    assert!(inst.shift_reg);
    assert_eq!(inst.shift, ShiftKind::Lsr);
    assert_eq!((inst.rd, inst.rn, inst.rm, inst.rs), (2, 3, 4, 5));
}

#[test]
fn classic_memory_and_block_transfer() {
    // LDR r1, [r2, #4]
    let inst = decode_classic(0xE592_1004);
    assert_eq!(inst.class, InstClass::MemSingle);
    assert_eq!((inst.rd, inst.rn), (1, 2));
    assert!(inst.op2_imm);
    assert_eq!(inst.imm, 4);

    // STMDB sp!, {r4, lr}
    let inst = decode_classic(0xE92D_4010);
    assert_eq!(inst.class, InstClass::MemMulti);
    assert_eq!(inst.rn, 13);
    assert_eq!(inst.reglist, 0x4010);

    // LDRH r0, [r1, #2]
    let inst = decode_classic(0xE1D1_00B2);
    assert_eq!(inst.class, InstClass::MemHalf);
    assert_eq!(inst.imm, 2);
}

#[test]
fn classic_branches_and_traps() {
    // BL +0x3C
    let inst = decode_classic(0xEB00_000F);
    assert_eq!(inst.class, InstClass::Branch);
    assert_eq!(inst.op & 1, 1);
    assert_eq!(inst.imm, 0x3C);

    // B backward
    let inst = decode_classic(0xEAFF_FFFE);
    assert_eq!(inst.imm, (-8i32) as u32);

    // BX r1
    let inst = decode_classic(0xE12F_FF11);
    assert_eq!(inst.class, InstClass::BranchEx);
    assert_eq!(inst.rm, 1);

    // SVC #0x123456
    let inst = decode_classic(0xEF12_3456);
    assert_eq!(inst.class, InstClass::Svc);
    assert_eq!(inst.imm, 0x0012_3456);
}

#[test]
fn classic_multiplies() {
    // MUL r0, r1, r2
    let inst = decode_classic(0xE000_0291);
    assert_eq!(inst.class, InstClass::Mul);
    assert_eq!((inst.rd, inst.rm, inst.rs), (0, 1, 2));

    // UMULLS r2, r3, r4, r5 (lo=r2 hi=r3)
    let inst = decode_classic(0xE093_2594);
    assert_eq!(inst.class, InstClass::MulLong);
    assert!(inst.s);
    assert_eq!(inst.op & 2, 0, "unsigned");
    assert_eq!((inst.rd, inst.rn), (3, 2));

    // SMULL
    let inst = decode_classic(0xE0D3_2594);
    assert_eq!(inst.class, InstClass::MulLong);
    assert_eq!(inst.op & 2, 2, "signed");
}

#[test]
fn classic_psr_and_coprocessor() {
    // MRS r0, CPSR
    let inst = decode_classic(0xE10F_0000);
    assert_eq!(inst.class, InstClass::Mrs);
    assert_eq!(inst.op & 1, 0);

    // MSR CPSR_f, r1
    let inst = decode_classic(0xE128_F001);
    assert_eq!(inst.class, InstClass::Msr);
    assert_eq!(inst.rs, 0b1000);
    assert_eq!(inst.rm, 1);

    // MRC p15, 0, r0, c1, c0, 0
    let inst = decode_classic(0xEE11_0F10);
    assert_eq!(inst.class, InstClass::CpTransfer);
    assert_eq!(inst.op & 1, 1);
    assert_eq!(inst.rs, 15);

    // LDC: no forwarding shape
    let inst = decode_classic(0xED93_5000);
    assert_eq!(inst.class, InstClass::CpMem);
}

/// Compact shapes with a structural classic equivalent come back as that
/// record.
#[test]
fn compact_reexpression() {
    // ADD r0, r0, r1 (always flag-setting)
    let inst = decode_compact(0x1840);
    assert_eq!(inst.class, InstClass::DataProc);
    assert_eq!(inst.op, aluop::ADD);
    assert!(inst.s);
    assert_eq!((inst.rd, inst.rn, inst.rm), (0, 0, 1));

    // MOV r1, #5
    let inst = decode_compact(0x2105);
    assert_eq!(inst.op, aluop::MOV);
    assert!(inst.s);
    assert_eq!(inst.rd, 1);
    assert_eq!(inst.imm, 5);

    // LSL r0, r1, #4 re-expresses as MOVS with a shift descriptor.
    let inst = decode_compact(0x0108);
    assert_eq!(inst.op, aluop::MOV);
    assert_eq!(inst.rm, 1);
    assert_eq!(inst.shift, ShiftKind::Lsl);
    assert_eq!(inst.shift_amount, 4);

    // NEG r2, r3 becomes RSBS r2, r3, #0.
    let inst = decode_compact(0x425A);
    assert_eq!(inst.op, aluop::RSB);
    assert_eq!((inst.rd, inst.rn), (2, 3));
    assert_eq!(inst.imm, 0);

    // STR r0, [r1, #4]
    let inst = decode_compact(0x6048);
    assert_eq!(inst.class, InstClass::MemSingle);
    assert_eq!((inst.rd, inst.rn), (0, 1));
    assert_eq!(inst.imm, 4);
}

/// Compact-only shapes synthesize the closest record directly.
#[test]
fn compact_only_shapes() {
    // BX lr
    let inst = decode_compact(0x4770);
    assert_eq!(inst.class, InstClass::BranchEx);
    assert_eq!(inst.rm, 14);

    // LDR r0, [pc, #16] keeps the aligned-base marker.
    let inst = decode_compact(0x4804);
    assert_eq!(inst.class, InstClass::MemSingle);
    assert_eq!(inst.rn, 15);
    assert_eq!(inst.imm, 16);
    assert!(inst.align_base);

    // PUSH {r4, lr} / POP {r4, pc}
    let inst = decode_compact(0xB510);
    assert_eq!(inst.class, InstClass::MemMulti);
    assert_eq!(inst.reglist, 0x4010);
    let inst = decode_compact(0xBD10);
    assert_eq!(inst.reglist, 0x8010);

    // Branch-with-link halves.
    assert_eq!(decode_compact(0xF000).class, InstClass::BlHigh);
    assert_eq!(decode_compact(0xF801).class, InstClass::BlLow);

    // Conditional branch carries its condition.
    let inst = decode_compact(0xD0FE);
    assert_eq!(inst.class, InstClass::Branch);
    assert_eq!(inst.cond, Cond::Eq);
    assert_eq!(inst.imm, (-4i32) as u32);

    // The permanently-undefined slot.
    assert_eq!(decode_compact(0xDE00).class, InstClass::Undefined);

    // SVC #1
    let inst = decode_compact(0xDF01);
    assert_eq!(inst.class, InstClass::Svc);
    assert_eq!(inst.imm, 1);
}

/// Records are plain data: the table entry equals a fresh decode.
#[test]
fn compact_table_matches_itself() {
    let a: ArmInst = decode_compact(0x1840);
    let b: ArmInst = decode_compact(0x1840);
    assert_eq!(a, b);
}
