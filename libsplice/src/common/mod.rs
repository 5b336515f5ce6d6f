mod debug;
mod helpers;

pub use debug::*;
pub use helpers::*;
