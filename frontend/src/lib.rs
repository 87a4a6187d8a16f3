//! armlet frontend — guest instruction decoding and IR construction.

pub mod arm;

pub use arm::{compile_block, decode_classic, decode_compact, ArmInst, Cond, InstClass, PAGE_SIZE};
