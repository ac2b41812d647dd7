//! Workspace data model: lifecycle states, the registry row, per-workspace
//! container settings and the transitions between states.

mod disk;
mod types;

pub use disk::dir_size;
pub use types::*;
