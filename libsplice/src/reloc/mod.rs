//! Relocated fields: encoding, canary detection, and the handlers the matcher
//! calls when an operand turns out to be relocated.

mod engine;
mod howto;
mod index;

pub(crate) use engine::*;
pub use howto::*;
pub use index::*;
