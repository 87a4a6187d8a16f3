//! armlet execution engine — block cache, linker and execution driver.
//!
//! Drives the lookup → translate → execute cycle with direct block-to-block
//! linking and synchronous invalidation on guest writes.

pub mod cache;
pub mod driver;

pub use cache::{BlockCache, CompiledBlock, Handle, MAX_BLOCKS};
pub use driver::{jit_invalidate, Engine};
