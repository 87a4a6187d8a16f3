#![cfg(target_arch = "x86_64")]

use armlet_core::{BlockAttrs, BlockKey, GuestState, CPSR_THUMB};
use armlet_exec::Engine;
use pretty_assertions::assert_eq;

use crate::harness::{init_logging, state_with_mem, TestMem};

const SVC: u32 = 0xEF00_0000;
const SVC_T: u16 = 0xDF00;

fn new_engine() -> Engine {
    init_logging();
    Engine::new().unwrap()
}

fn run_until_trap(engine: &mut Engine, state: &mut GuestState, max_units: usize) -> u32 {
    let mut elapsed = 0;
    for _ in 0..max_units {
        let before = state.regs[15];
        elapsed += engine.execute_one_unit(state).unwrap();
        if state.regs[15] == before && elapsed > 0 {
            break;
        }
    }
    elapsed
}

/// MOV r0, #5; ADD r0, r0, #3 with flags untouched.
#[test]
fn straight_line_arithmetic() {
    let mut mem = TestMem::new(16 * 1024);
    mem.write_words(0, &[0xE3A0_0005, 0xE280_0003, SVC]);
    let mut state = state_with_mem(&mut mem);
    state.cf = 1;
    state.vf = 1;
    state.cycles = 100;

    let mut engine = new_engine();
    let elapsed = engine.execute_one_unit(&mut state).unwrap();

    assert_eq!(state.regs[0], 8);
    assert_eq!((state.nf, state.zf, state.cf, state.vf), (0, 0, 1, 1));
    assert_eq!(elapsed, 3);
}

/// Compact-form ADD always sets flags; 0xFFFFFFFF + 1 wraps with carry.
#[test]
fn flag_setting_compact_add() {
    let mut mem = TestMem::new(16 * 1024);
    mem.write_halves(0, &[0x1840, SVC_T]);
    let mut state = state_with_mem(&mut mem);
    state.cpsr_base |= CPSR_THUMB;
    state.regs[0] = 0xFFFF_FFFF;
    state.regs[1] = 1;
    state.cycles = 100;

    let mut engine = new_engine();
    engine.execute_one_unit(&mut state).unwrap();

    assert_eq!(state.regs[0], 0);
    assert_eq!((state.nf, state.zf, state.cf, state.vf), (0, 1, 1, 0));
}

/// CMP r0, #0; guarded effects execute only when their condition holds.
#[test]
fn conditional_skip() {
    let mut mem = TestMem::new(16 * 1024);
    // CMP r0, #0; ADDEQ r1, r1, #1; ADDNE r2, r2, #1; SVC
    mem.write_words(0, &[0xE350_0000, 0x0281_1001, 0x1282_2001, SVC]);

    for (r0, expect_r1, expect_r2) in [(0u32, 1u32, 0u32), (1, 0, 1)] {
        let mut state = state_with_mem(&mut mem);
        state.regs[0] = r0;
        state.cycles = 100;
        let mut engine = new_engine();
        engine.execute_one_unit(&mut state).unwrap();
        assert_eq!((state.regs[1], state.regs[2]), (expect_r1, expect_r2));
    }
}

/// Conditional branch: taken when equal skips the fallthrough effects.
#[test]
fn conditional_branch_taken_and_not() {
    let mut mem = TestMem::new(16 * 1024);
    // 0: CMP r0, #0
    // 4: BEQ 0x14
    // 8: ADD r1, r1, #1
    // c: SVC
    // 14: SVC
    mem.write_words(
        0,
        &[0xE350_0000, 0x0A00_0002, 0xE281_1001, SVC, 0, 0xEF00_0001],
    );

    let mut state = state_with_mem(&mut mem);
    state.regs[0] = 0;
    state.cycles = 100;
    let mut engine = new_engine();
    run_until_trap(&mut engine, &mut state, 8);
    assert_eq!(state.regs[1], 0, "taken branch skips the fallthrough");

    let mut state = state_with_mem(&mut mem);
    state.regs[0] = 1;
    state.cycles = 100;
    let mut engine = new_engine();
    run_until_trap(&mut engine, &mut state, 8);
    assert_eq!(state.regs[1], 1, "untaken branch falls through");
}

/// Two blocks whose only edge is a known branch chain directly after
/// linking and no longer return to the driver in between.
#[test]
fn linked_blocks_chain_without_driver() {
    let mut mem = TestMem::new(16 * 1024);
    // A: 0: MOV r0, #1; 4: B 0x10
    // C: 0x10: ADD r0, r0, #2; 0x14: SVC
    mem.write_words(0, &[0xE3A0_0001, 0xEA00_0001]);
    mem.write_words(0x10, &[0xE280_0002, SVC]);

    // Pass one: execute through the driver, linking as exits surface.
    let mut state = state_with_mem(&mut mem);
    state.cycles = 100;
    let mut engine = new_engine();
    let mut stepped_units = 0;
    while state.regs[15] != 0x18 && stepped_units < 8 {
        engine.execute_one_unit(&mut state).unwrap();
        stepped_units += 1;
    }
    let stepped_state = (state.regs, state.nf, state.zf, state.cf, state.vf);
    assert_eq!(state.regs[0], 3);

    // Pass two: same guest program from scratch; the first unit now chains
    // straight into the second, so one invocation covers both blocks.
    let mut state = state_with_mem(&mut mem);
    state.cycles = 100;
    state.regs[15] = 0;
    let elapsed = engine.execute_one_unit(&mut state).unwrap();
    assert_eq!(elapsed, 4, "both blocks ran inside one native invocation");
    assert_eq!(
        (state.regs, state.nf, state.zf, state.cf, state.vf),
        stepped_state
    );
}

/// A write into a cached block's range invalidates it before its next use.
#[test]
fn invalidation_on_guest_write() {
    let mut mem = TestMem::new(16 * 1024);
    mem.write_words(0, &[0xE3A0_0005, SVC]);
    let mut state = state_with_mem(&mut mem);
    state.cycles = 100;

    let mut engine = new_engine();
    engine.execute_one_unit(&mut state).unwrap();
    assert_eq!(state.regs[0], 5);

    // Overwrite the MOV with MOV r0, #7 and report the write.
    mem.write_words(0, &[0xE3A0_0007]);
    engine.invalidate_range(0, 4);

    state.regs[15] = 0;
    state.regs[0] = 0;
    state.cycles = 100;
    engine.execute_one_unit(&mut state).unwrap();
    assert_eq!(state.regs[0], 7, "stale native code must not be reused");
}

/// Invalidating a linked-to block eagerly un-patches its predecessors.
#[test]
fn invalidation_unlinks_predecessors() {
    let mut mem = TestMem::new(16 * 1024);
    mem.write_words(0, &[0xE3A0_0001, 0xEA00_0001]);
    mem.write_words(0x10, &[0xE280_0002, SVC]);
    let mut state = state_with_mem(&mut mem);
    state.cycles = 100;

    let mut engine = new_engine();
    // Drive until A -> C is linked.
    for _ in 0..4 {
        engine.execute_one_unit(&mut state).unwrap();
        if state.regs[15] == 0x18 {
            break;
        }
    }

    // Rewrite C: now it adds 9.
    mem.write_words(0x10, &[0xE280_0009, SVC]);
    engine.invalidate_range(0x10, 4);

    state.regs[15] = 0;
    state.regs[0] = 0;
    state.cycles = 100;
    let mut total = 0;
    for _ in 0..4 {
        total += engine.execute_one_unit(&mut state).unwrap();
        if state.regs[15] == 0x18 {
            break;
        }
    }
    assert_eq!(state.regs[0], 10, "predecessor fell back and re-linked");
    assert!(total >= 4);
}

/// Same address, different attribute bits: independent cache entries with
/// attribute-specific code.
#[test]
fn key_uniqueness_across_attrs() {
    let mut mem = TestMem::new(16 * 1024);
    // As classic code: MOV r0, #5; SVC.
    // As compact code the same bytes decode to entirely different
    // instructions (MOVS r5, r0; a forward branch).
    mem.write_words(0, &[0xE3A0_0005, SVC]);

    let mut engine = new_engine();

    let mut state = state_with_mem(&mut mem);
    state.cycles = 100;
    engine.execute_one_unit(&mut state).unwrap();
    assert_eq!(state.regs[0], 5);

    let mut state = state_with_mem(&mut mem);
    state.cpsr_base |= CPSR_THUMB;
    state.cycles = 100;
    engine.execute_one_unit(&mut state).unwrap();
    assert_eq!(state.regs[0], 0, "compact decode is not the classic one");
    assert_eq!(state.regs[5], 0);
    assert_eq!(state.zf, 1);

    let classic = engine
        .cache()
        .lookup(BlockKey::new(0, BlockAttrs::empty()))
        .expect("classic entry cached");
    let compact = engine
        .cache()
        .lookup(BlockKey::new(0, BlockAttrs::COMPACT))
        .expect("compact entry cached");
    assert_ne!(classic, compact);
}

/// Compiling and running the same block twice yields identical state and
/// cycle counts.
#[test]
fn determinism() {
    let mut mem = TestMem::new(16 * 1024);
    mem.write_words(0, &[0xE3A0_0005, 0xE090_0000, 0xE1B0_1000, SVC]);

    let mut run = || {
        let mut state = state_with_mem(&mut mem);
        state.cycles = 100;
        let mut engine = new_engine();
        let elapsed = engine.execute_one_unit(&mut state).unwrap();
        (state.regs, state.nf, state.zf, state.cf, state.vf, elapsed)
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
}

/// Curated instruction pairs with identical meaning in both encodings
/// produce identical final state.
#[test]
fn semantic_equivalence_across_encodings() {
    struct Case {
        classic: u32,
        compact: u16,
    }
    let cases = [
        // ADDS r0, r0, r1
        Case {
            classic: 0xE090_0001,
            compact: 0x1840,
        },
        // MOVS r1, #5
        Case {
            classic: 0xE3B0_1005,
            compact: 0x2105,
        },
        // MOVS r0, r1, LSL #4
        Case {
            classic: 0xE1B0_0201,
            compact: 0x0108,
        },
        // SUBS r0, r0, r1
        Case {
            classic: 0xE050_0001,
            compact: 0x1A40,
        },
    ];

    for case in &cases {
        let run = |compact: bool| {
            let mut mem = TestMem::new(16 * 1024);
            if compact {
                mem.write_halves(0, &[case.compact, SVC_T]);
            } else {
                mem.write_words(0, &[case.classic, SVC]);
            }
            let mut state = state_with_mem(&mut mem);
            if compact {
                state.cpsr_base |= CPSR_THUMB;
            }
            state.regs[0] = 0xFFFF_FFFF;
            state.regs[1] = 1;
            state.cf = 1;
            state.cycles = 100;
            let mut engine = new_engine();
            engine.execute_one_unit(&mut state).unwrap();
            (
                state.regs[..15].to_vec(),
                state.nf,
                state.zf,
                state.cf,
                state.vf,
            )
        };
        assert_eq!(
            run(false),
            run(true),
            "classic {:#010x} vs compact {:#06x}",
            case.classic,
            case.compact
        );
    }
}

/// A self-looping block spins inside one native invocation until the
/// condition falls through.
#[test]
fn self_loop_runs_inside_one_unit() {
    let mut mem = TestMem::new(16 * 1024);
    // 0: MOV r0, #5
    // 4: SUBS r0, r0, #1
    // 8: BNE 4
    // c: SVC
    mem.write_words(0, &[0xE3A0_0005, 0xE250_0001, 0x1AFF_FFFD, SVC]);
    let mut state = state_with_mem(&mut mem);
    state.cycles = 100;

    let mut engine = new_engine();
    let elapsed = run_until_trap(&mut engine, &mut state, 8);

    assert_eq!(state.regs[0], 0);
    assert_eq!(state.zf, 1);
    // Five loop iterations plus the entry block, far more cycles than
    // driver invocations.
    assert!(elapsed >= 11, "elapsed {elapsed}");
}

/// The budget is the only preemption: a looping block exits once cycles
/// run out, with the resume pc stored.
#[test]
fn budget_exhaustion_preempts_loop() {
    let mut mem = TestMem::new(16 * 1024);
    // 4: SUBS r0, r0, #1; 8: BNE 4 — effectively endless with a big r0.
    mem.write_words(4, &[0xE250_0001, 0x1AFF_FFFD, SVC]);
    let mut state = state_with_mem(&mut mem);
    state.regs[0] = 1_000_000;
    state.regs[15] = 4;
    state.cycles = 50;

    let mut engine = new_engine();
    let elapsed = engine.execute_one_unit(&mut state).unwrap();

    assert!(state.cycles <= 0, "budget exhausted");
    assert!(elapsed >= 50);
    assert!(state.regs[0] > 0, "loop was preempted, not finished");
    assert_eq!(state.regs[15], 4, "resume pc points back at the loop");
}

/// A halted guest consumes nothing.
#[test]
fn halted_guest_is_not_executed() {
    let mut mem = TestMem::new(16 * 1024);
    mem.write_words(0, &[0xE3A0_0005, SVC]);
    let mut state = state_with_mem(&mut mem);
    state.halted = 1;
    state.cycles = 100;

    let mut engine = new_engine();
    let elapsed = engine.execute_one_unit(&mut state).unwrap();
    assert_eq!(elapsed, 0);
    assert_eq!(state.regs[0], 0);
}

/// flush_all drops every cached entry.
#[test]
fn flush_all_empties_the_cache() {
    let mut mem = TestMem::new(16 * 1024);
    mem.write_words(0, &[0xE3A0_0005, SVC]);
    let mut state = state_with_mem(&mut mem);
    state.cycles = 100;

    let mut engine = new_engine();
    engine.execute_one_unit(&mut state).unwrap();
    assert!(!engine.cache().is_empty());
    engine.flush_all();
    assert!(engine.cache().is_empty());

    // And everything still works afterwards.
    state.regs[15] = 0;
    state.cycles = 100;
    engine.execute_one_unit(&mut state).unwrap();
    assert_eq!(state.regs[0], 5);
}
