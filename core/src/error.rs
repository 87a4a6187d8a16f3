//! Pipeline errors.
//!
//! Only instruction-coverage gaps are errors here: they are fatal to the
//! block being compiled and propagate out of the driver for the surrounding
//! shell to abort on. Anything the guest itself can trigger — including
//! architecturally undefined encodings — is guest-visible behavior routed
//! through the collaborator hooks, never an `Err`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("unsupported coprocessor {cp} at {addr:#010x} (encoding {encoding:#010x})")]
    UnsupportedCoprocessor { addr: u32, encoding: u32, cp: u32 },

    #[error("no translation for instruction at {addr:#010x} (encoding {encoding:#010x})")]
    UnhandledInstruction { addr: u32, encoding: u32 },

    #[error("IR block overflow while translating {addr:#010x}")]
    BlockTooLarge { addr: u32 },
}
