//! Narrowing symbolic references down to a single live address.

mod candidates;
mod labels;
mod lookup;

pub use candidates::*;
pub use labels::*;
pub(crate) use lookup::*;
