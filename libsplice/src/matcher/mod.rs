//! Run-pre matching: proving a live region is the compiled form of a
//! reference region.

mod context;
mod decoder;
mod runpre;
mod search;
mod x86;

pub(crate) use context::*;
pub use decoder::*;
pub use runpre::{MatchMap, RunPreMode};
pub(crate) use search::*;
pub use x86::*;
