//! libsplice
//! Live code splicing for a running program image: proves that reference
//! ("pre") code is what is actually executing, resolves symbols against the
//! live image, and swaps functions in under a stop-the-world pause.

// Instruction decoding and redirect stubs are x86 only for now
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("Unsupported architecture - only x86/x64 supported");

pub mod common;
pub mod config;
pub mod errors;
pub mod host;
pub mod image;
pub mod matcher;
pub mod metadata;
pub mod reloc;
pub mod resolver;
pub mod safety;
pub mod update;

#[cfg(test)]
mod fixtures;

pub use config::SpliceConfig;
pub use errors::{AbortCause, MemoryError};
pub use host::{Host, SimHost};
pub use metadata::ModChange;
pub use update::{Registry, Stage, UpdateStatus, REGISTRY};

pub type Result<T> = core::result::Result<T, errors::AbortCause>;
