//! Update sessions: preparing, applying and reversing a set of changes.

mod patch;
mod registry;
mod session;
mod stage;
mod trampoline;

pub use patch::*;
pub use registry::*;
pub use session::*;
pub use stage::*;
pub use trampoline::*;
