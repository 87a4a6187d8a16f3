use armlet_backend::x86_64::emitter as x86;
use armlet_backend::aarch64::emitter as a64;
use armlet_backend::CodeBuffer;
use pretty_assertions::assert_eq;

fn buf() -> CodeBuffer {
    CodeBuffer::new(4096).unwrap()
}

// ---------------------------------------------------------------
// x86-64 encodings
// ---------------------------------------------------------------

#[test]
fn x86_moves() {
    let mut b = buf();
    x86::mov_ri32(&mut b, x86::Reg::Rax, 5);
    assert_eq!(b.as_slice(), &[0xB8, 5, 0, 0, 0]);

    let mut b = buf();
    x86::mov_rr64(&mut b, x86::Reg::Rbx, x86::Reg::Rdi);
    assert_eq!(b.as_slice(), &[0x48, 0x8B, 0xDF]);

    let mut b = buf();
    x86::mov_rr32(&mut b, x86::Reg::Rsi, x86::Reg::Rax);
    assert_eq!(b.as_slice(), &[0x8B, 0xF0]);
}

#[test]
fn x86_memory_operands() {
    // mov eax, [rbx + 8]
    let mut b = buf();
    x86::ld32(&mut b, x86::Reg::Rax, x86::Reg::Rbx, 8);
    assert_eq!(b.as_slice(), &[0x8B, 0x43, 0x08]);

    // mov [rbx + 0x200], ecx — disp32 form
    let mut b = buf();
    x86::st32(&mut b, x86::Reg::Rcx, x86::Reg::Rbx, 0x200);
    assert_eq!(b.as_slice(), &[0x89, 0x8B, 0x00, 0x02, 0x00, 0x00]);

    // rsp base forces a SIB byte: mov eax, [rsp + 4]
    let mut b = buf();
    x86::ld32(&mut b, x86::Reg::Rax, x86::Reg::Rsp, 4);
    assert_eq!(b.as_slice(), &[0x8B, 0x44, 0x24, 0x04]);
}

#[test]
fn x86_alu_and_shifts() {
    // add eax, ecx
    let mut b = buf();
    x86::alu_rr32(&mut b, x86::ArithOp::Add, x86::Reg::Rax, x86::Reg::Rcx);
    assert_eq!(b.as_slice(), &[0x03, 0xC1]);

    // cmp ecx, 32 — short immediate form
    let mut b = buf();
    x86::alu_ri32(&mut b, x86::ArithOp::Cmp, x86::Reg::Rcx, 32);
    assert_eq!(b.as_slice(), &[0x83, 0xF9, 0x20]);

    // shl eax, cl
    let mut b = buf();
    x86::shift_cl32(&mut b, x86::ShiftOp::Shl, x86::Reg::Rax);
    assert_eq!(b.as_slice(), &[0xD3, 0xE0]);

    // sar eax, 31
    let mut b = buf();
    x86::shift_ri32(&mut b, x86::ShiftOp::Sar, x86::Reg::Rax, 31);
    assert_eq!(b.as_slice(), &[0xC1, 0xF8, 0x1F]);
}

#[test]
fn x86_calls_and_stack() {
    // call [rbx + 0x78]
    let mut b = buf();
    x86::call_mem(&mut b, x86::Reg::Rbx, 0x78);
    assert_eq!(b.as_slice(), &[0xFF, 0x53, 0x78]);

    // sub dword [rbx + 92], 3 — the cycle decrement
    let mut b = buf();
    x86::sub_mem32_imm(&mut b, x86::Reg::Rbx, 92, 3);
    assert_eq!(b.as_slice(), &[0x83, 0x6B, 0x5C, 0x03]);

    let mut b = buf();
    x86::push(&mut b, x86::Reg::Rbx);
    x86::push(&mut b, x86::Reg::R12);
    x86::ret(&mut b);
    assert_eq!(b.as_slice(), &[0x53, 0x41, 0x54, 0xC3]);

    // lea rsp, [rsp + 16]
    let mut b = buf();
    x86::lea_rsp(&mut b, 16);
    assert_eq!(b.as_slice(), &[0x48, 0x8D, 0x64, 0x24, 0x10]);
}

#[test]
fn x86_flag_capture() {
    // setc dl; movzx edx, dl
    let mut b = buf();
    x86::setcc(&mut b, x86::Cc::B, x86::Reg::Rdx);
    x86::movzx_rb(&mut b, x86::Reg::Rdx, x86::Reg::Rdx);
    assert_eq!(b.as_slice(), &[0x0F, 0x92, 0xC2, 0x0F, 0xB6, 0xD2]);
}

#[test]
fn x86_link_patching() {
    use armlet_backend::{CodeBackend, x86_64::X86_64Backend};
    let backend = X86_64Backend::new();
    let mut b = buf();
    let patch_off = x86::jmp_rel32(&mut b, 0);
    // Redirect to offset 0x100.
    backend.patch_link(&mut b, patch_off, 0x100);
    let disp = b.read_u32(patch_off + 1) as i32;
    assert_eq!(patch_off as i32 + 5 + disp, 0x100);
}

// ---------------------------------------------------------------
// AArch64 encodings
// ---------------------------------------------------------------

#[test]
fn a64_basics() {
    let mut b = buf();
    a64::ret(&mut b);
    assert_eq!(b.read_u32(0), 0xD65F_03C0);

    let mut b = buf();
    a64::blr(&mut b, 16);
    assert_eq!(b.read_u32(0), 0xD63F_0200);

    let mut b = buf();
    a64::movz_w(&mut b, 0, 5, 0);
    assert_eq!(b.read_u32(0), 0x5280_00A0);

    // mov x19, x0
    let mut b = buf();
    a64::mov_x(&mut b, 19, 0);
    assert_eq!(b.read_u32(0), 0xAA00_03F3);
}

#[test]
fn a64_loads_and_stores() {
    // ldr w16, [x19, #92]
    let mut b = buf();
    a64::ldr_w(&mut b, 16, 19, 92);
    assert_eq!(b.read_u32(0), 0xB940_0000 | (23 << 10) | (19 << 5) | 16);

    // str w15, [x19, #64]
    let mut b = buf();
    a64::str_w(&mut b, 15, 19, 64);
    assert_eq!(b.read_u32(0), 0xB900_0000 | (16 << 10) | (19 << 5) | 15);

    // ldr x16, [x19, #120]
    let mut b = buf();
    a64::ldr_x(&mut b, 16, 19, 120);
    assert_eq!(b.read_u32(0), 0xF940_0000 | (15 << 10) | (19 << 5) | 16);
}

#[test]
fn a64_alu() {
    // add w16, w16, w17
    let mut b = buf();
    a64::add_w(&mut b, 16, 16, 17);
    assert_eq!(b.read_u32(0), 0x0B11_0210);

    // subs w16, w16, #3
    let mut b = buf();
    a64::subs_imm_w(&mut b, 16, 16, 3);
    assert_eq!(b.read_u32(0), 0x7100_0000 | (3 << 10) | (16 << 5) | 16);

    // cmp w17, #32
    let mut b = buf();
    a64::cmp_imm_w(&mut b, 17, 32);
    assert_eq!(b.read_u32(0), 0x7100_0000 | (32 << 10) | (17 << 5) | 31);
}

#[test]
fn a64_branch_patching() {
    use armlet_backend::{aarch64::Aarch64Backend, CodeBackend};
    let backend = Aarch64Backend::new();
    let mut b = buf();
    let patch_off = a64::b(&mut b, 1);
    // Forward 16 instructions.
    backend.patch_link(&mut b, patch_off, patch_off + 64);
    assert_eq!(b.read_u32(patch_off), 0x1400_0000 | 16);

    // And backward.
    let mut b = buf();
    b.emit_u32(0);
    b.emit_u32(0);
    let at = a64::b(&mut b, 1);
    backend.patch_link(&mut b, at, 0);
    assert_eq!(b.read_u32(at), 0x1400_0000 | (0x03FF_FFFF & (-2i32 as u32)));
}

#[test]
fn a64_skip_patching() {
    let mut b = buf();
    let at = a64::cbz_w(&mut b, 16);
    b.emit_u32(0);
    b.emit_u32(0);
    a64::patch_cbz(&mut b, at, 3);
    assert_eq!(b.read_u32(at), 0x3400_0000 | (3 << 5) | 16);
}

// ---------------------------------------------------------------
// Executing generated code (host backend only)
// ---------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod exec_smoke {
    use armlet_backend::{allocate, native_backend, CodeBuffer};
    use armlet_core::{GuestState, IrBlock, IrOp, Src};
    use pretty_assertions::assert_eq;

    unsafe fn run(buf: &CodeBuffer, entry: usize, state: &mut GuestState) -> u32 {
        let f: unsafe extern "C" fn(*mut GuestState) -> u32 =
            std::mem::transmute(buf.ptr_at(entry));
        f(state)
    }

    #[test]
    fn add_register_and_return() {
        let mut block = IrBlock::new();
        block.emit(IrOp::BlockStart, Src::Imm(0), Src::Imm(0));
        block.insn_count = 1;
        let a = block.emit(IrOp::GetReg, Src::Imm(1), Src::Imm(0));
        let sum = block.emit(IrOp::Add, Src::Val(a), Src::Imm(3));
        block.emit(IrOp::SetReg, Src::Imm(0), Src::Val(sum));
        block.emit(IrOp::Return, Src::Imm(0), Src::Imm(0));

        let backend = native_backend();
        let alloc = allocate(&block, backend.reg_classes());
        let mut buf = CodeBuffer::new(4096).unwrap();
        let code = backend.compile(&mut buf, &block, &alloc, 7);

        let mut state = GuestState::new();
        state.regs[1] = 39;
        state.cycles = 10;
        let exit = unsafe { run(&buf, code.entry, &mut state) };
        assert_eq!(exit, 0);
        assert_eq!(state.regs[0], 42);
        assert_eq!(state.cycles, 9);
    }

    #[test]
    fn flag_setting_add_matches_hardware() {
        let mut block = IrBlock::new();
        block.emit(IrOp::BlockStart, Src::Imm(0), Src::Imm(0));
        block.insn_count = 1;
        let a = block.emit(IrOp::GetReg, Src::Imm(0), Src::Imm(0));
        let b = block.emit(IrOp::GetReg, Src::Imm(1), Src::Imm(0));
        let sum = block.emit(IrOp::AddFlags, Src::Val(a), Src::Val(b));
        block.emit(IrOp::SetReg, Src::Imm(0), Src::Val(sum));
        block.emit(IrOp::Return, Src::Imm(0), Src::Imm(0));

        let backend = native_backend();
        let alloc = allocate(&block, backend.reg_classes());
        let mut buf = CodeBuffer::new(4096).unwrap();
        let code = backend.compile(&mut buf, &block, &alloc, 1);

        let mut state = GuestState::new();
        state.regs[0] = 0xFFFF_FFFF;
        state.regs[1] = 1;
        state.cycles = 10;
        unsafe { run(&buf, code.entry, &mut state) };
        assert_eq!(state.regs[0], 0);
        assert_eq!((state.nf, state.zf, state.cf, state.vf), (0, 1, 1, 0));

        // Signed overflow: 0x7FFFFFFF + 1.
        let mut state = GuestState::new();
        state.regs[0] = 0x7FFF_FFFF;
        state.regs[1] = 1;
        state.cycles = 10;
        unsafe { run(&buf, code.entry, &mut state) };
        assert_eq!((state.nf, state.zf, state.cf, state.vf), (1, 0, 0, 1));
    }

    #[test]
    fn oversize_shift_amounts_are_defined() {
        // r0 = r1 << r2, r3 = r4 >> r5 (arithmetic)
        let mut block = IrBlock::new();
        block.emit(IrOp::BlockStart, Src::Imm(0), Src::Imm(0));
        block.insn_count = 1;
        let v1 = block.emit(IrOp::GetReg, Src::Imm(1), Src::Imm(0));
        let v2 = block.emit(IrOp::GetReg, Src::Imm(2), Src::Imm(0));
        let shl = block.emit(IrOp::Shl, Src::Val(v1), Src::Val(v2));
        block.emit(IrOp::SetReg, Src::Imm(0), Src::Val(shl));
        let v4 = block.emit(IrOp::GetReg, Src::Imm(4), Src::Imm(0));
        let v5 = block.emit(IrOp::GetReg, Src::Imm(5), Src::Imm(0));
        let sar = block.emit(IrOp::Sar, Src::Val(v4), Src::Val(v5));
        block.emit(IrOp::SetReg, Src::Imm(3), Src::Val(sar));
        block.emit(IrOp::Return, Src::Imm(0), Src::Imm(0));

        let backend = native_backend();
        let alloc = allocate(&block, backend.reg_classes());
        let mut buf = CodeBuffer::new(4096).unwrap();
        let code = backend.compile(&mut buf, &block, &alloc, 1);

        let mut state = GuestState::new();
        state.regs[1] = 0xFFFF_FFFF;
        state.regs[2] = 33; // host would wrap to 1
        state.regs[4] = 0x8000_0000;
        state.regs[5] = 40; // host would wrap to 8
        state.cycles = 10;
        unsafe { run(&buf, code.entry, &mut state) };
        assert_eq!(state.regs[0], 0);
        assert_eq!(state.regs[3], 0xFFFF_FFFF);
    }

    #[test]
    fn widening_multiply_pair_is_fused() {
        let mut block = IrBlock::new();
        block.emit(IrOp::BlockStart, Src::Imm(0), Src::Imm(0));
        block.insn_count = 1;
        let a = block.emit(IrOp::GetReg, Src::Imm(0), Src::Imm(0));
        let b = block.emit(IrOp::GetReg, Src::Imm(1), Src::Imm(0));
        let lo = block.emit(IrOp::Mul, Src::Val(a), Src::Val(b));
        let hi = block.emit(IrOp::UMulHi, Src::Val(a), Src::Val(b));
        block.emit(IrOp::SetReg, Src::Imm(2), Src::Val(lo));
        block.emit(IrOp::SetReg, Src::Imm(3), Src::Val(hi));
        block.emit(IrOp::Return, Src::Imm(0), Src::Imm(0));

        let backend = native_backend();
        let alloc = allocate(&block, backend.reg_classes());
        let mut buf = CodeBuffer::new(4096).unwrap();
        let code = backend.compile(&mut buf, &block, &alloc, 1);

        let mut state = GuestState::new();
        state.regs[0] = 0x8000_0001;
        state.regs[1] = 0x1_0000 + 3;
        state.cycles = 10;
        unsafe { run(&buf, code.entry, &mut state) };
        let wide = (0x8000_0001u64) * 0x1_0003u64;
        assert_eq!(state.regs[2], wide as u32);
        assert_eq!(state.regs[3], (wide >> 32) as u32);
    }
}
