pub mod attrs;
pub mod error;
pub mod ir;
pub mod state;

pub use attrs::{BlockAttrs, BlockKey};
pub use error::CompileError;
pub use ir::{IrBlock, IrInst, IrOp, Src, FLAG_C, FLAG_N, FLAG_V, FLAG_Z, MAX_BLOCK_OPS};
pub use state::{GuestState, CPSR_MODE_MASK, CPSR_THUMB, MODE_USER, REG_LR, REG_PC, REG_SP};
