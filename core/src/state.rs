//! Guest CPU state.
//!
//! `GuestState` is the one structure generated code touches directly: the
//! register file, the four condition flags, the cycle budget, and the
//! collaborator hooks for everything this core does not emulate itself
//! (memory, coprocessors, the guest kernel). The layout is `repr(C)` and the
//! backends address fields through the `OFF_*` constants below.

use std::ffi::c_void;
use std::mem::offset_of;

pub const REG_SP: u32 = 13;
pub const REG_LR: u32 = 14;
pub const REG_PC: u32 = 15;

/// Width bit of `cpsr_base`: set while executing the compact encoding.
pub const CPSR_THUMB: u32 = 1 << 5;
/// Privilege mode field of `cpsr_base`.
pub const CPSR_MODE_MASK: u32 = 0x1F;
pub const MODE_USER: u32 = 0x10;

pub type MemReadFn = unsafe extern "C" fn(*mut GuestState, u32) -> u32;
pub type MemWriteFn = unsafe extern "C" fn(*mut GuestState, u32, u32);
pub type FetchFn = unsafe extern "C" fn(*mut GuestState, u32) -> u32;
pub type SvcFn = unsafe extern "C" fn(*mut GuestState, u32);
pub type UndefFn = unsafe extern "C" fn(*mut GuestState, u32);
pub type CpReadFn = unsafe extern "C" fn(*mut GuestState, u32) -> u32;
pub type CpWriteFn = unsafe extern "C" fn(*mut GuestState, u32, u32);
pub type ModeSwitchFn = unsafe extern "C" fn(*mut GuestState, u32);

/// Guest CPU state shared between the translator and its generated code.
#[repr(C)]
pub struct GuestState {
    /// r0-r15; r15 is the program counter.
    pub regs: [u32; 16],
    /// Condition flags, stored as 0 or 1 each.
    pub nf: u32,
    pub zf: u32,
    pub cf: u32,
    pub vf: u32,
    /// CPSR bits other than the condition flags (mode, masks, width bit).
    pub cpsr_base: u32,
    /// Saved program status of the current mode; banked by the collaborator.
    pub spsr: u32,
    /// Nonzero while coprocessor access is architecturally permitted.
    pub cp_enabled: u32,
    /// Cooperative cycle budget; generated code decrements at terminals.
    pub cycles: i32,
    /// Wait-for-event flag, checked by the driver between blocks.
    pub halted: u32,
    _pad: u32,
    /// Opaque pointer to the block cache, for synchronous invalidation from
    /// the shell's write path. Owned by the execution driver.
    pub jit: *mut c_void,
    /// Opaque collaborator pointer (guest memory, kernel state).
    pub user: *mut c_void,

    // -- Collaborator hooks --
    pub read8: MemReadFn,
    pub read16: MemReadFn,
    pub read32: MemReadFn,
    pub write8: MemWriteFn,
    pub write16: MemWriteFn,
    pub write32: MemWriteFn,
    pub fetch16: FetchFn,
    pub fetch32: FetchFn,
    pub svc: SvcFn,
    pub undef: UndefFn,
    pub cp_read: CpReadFn,
    pub cp_write: CpWriteFn,
    pub mode_switch: ModeSwitchFn,
}

// Field offsets used by the code backends.
pub const OFF_REGS: usize = offset_of!(GuestState, regs);
pub const OFF_NF: usize = offset_of!(GuestState, nf);
pub const OFF_ZF: usize = offset_of!(GuestState, zf);
pub const OFF_CF: usize = offset_of!(GuestState, cf);
pub const OFF_VF: usize = offset_of!(GuestState, vf);
pub const OFF_CPSR_BASE: usize = offset_of!(GuestState, cpsr_base);
pub const OFF_SPSR: usize = offset_of!(GuestState, spsr);
pub const OFF_CYCLES: usize = offset_of!(GuestState, cycles);
pub const OFF_READ8: usize = offset_of!(GuestState, read8);
pub const OFF_READ16: usize = offset_of!(GuestState, read16);
pub const OFF_READ32: usize = offset_of!(GuestState, read32);
pub const OFF_WRITE8: usize = offset_of!(GuestState, write8);
pub const OFF_WRITE16: usize = offset_of!(GuestState, write16);
pub const OFF_WRITE32: usize = offset_of!(GuestState, write32);
pub const OFF_SVC: usize = offset_of!(GuestState, svc);
pub const OFF_UNDEF: usize = offset_of!(GuestState, undef);
pub const OFF_CP_READ: usize = offset_of!(GuestState, cp_read);
pub const OFF_CP_WRITE: usize = offset_of!(GuestState, cp_write);
pub const OFF_MODE_SWITCH: usize = offset_of!(GuestState, mode_switch);

/// Offset of `regs[r]`.
pub fn reg_offset(r: u32) -> usize {
    OFF_REGS + (r as usize) * 4
}

/// Offset of the flag field for a `FLAG_*` id.
pub fn flag_offset(flag: u32) -> usize {
    match flag {
        crate::ir::FLAG_N => OFF_NF,
        crate::ir::FLAG_Z => OFF_ZF,
        crate::ir::FLAG_C => OFF_CF,
        crate::ir::FLAG_V => OFF_VF,
        _ => unreachable!("bad flag id {flag}"),
    }
}

// Default hooks so a GuestState is constructible without a shell. Reads
// return zero, writes and traps are ignored.
unsafe extern "C" fn null_read(_: *mut GuestState, _: u32) -> u32 {
    0
}
unsafe extern "C" fn null_write(_: *mut GuestState, _: u32, _: u32) {}
unsafe extern "C" fn null_notify(_: *mut GuestState, _: u32) {}

impl GuestState {
    pub fn new() -> Self {
        Self {
            regs: [0; 16],
            nf: 0,
            zf: 0,
            cf: 0,
            vf: 0,
            cpsr_base: MODE_USER,
            spsr: 0,
            cp_enabled: 0,
            cycles: 0,
            halted: 0,
            _pad: 0,
            jit: std::ptr::null_mut(),
            user: std::ptr::null_mut(),
            read8: null_read,
            read16: null_read,
            read32: null_read,
            write8: null_write,
            write16: null_write,
            write32: null_write,
            fetch16: null_read,
            fetch32: null_read,
            svc: null_notify,
            undef: null_notify,
            cp_read: null_read,
            cp_write: null_write,
            mode_switch: null_notify,
        }
    }

    /// Whether the compact (16-bit) encoding is selected.
    pub fn is_compact(&self) -> bool {
        self.cpsr_base & CPSR_THUMB != 0
    }

    /// Current privilege mode field.
    pub fn mode(&self) -> u32 {
        self.cpsr_base & CPSR_MODE_MASK
    }
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}
