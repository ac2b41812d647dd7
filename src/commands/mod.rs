mod prune;
mod serve;
mod status;
mod validate;

pub use prune::run_prune;
pub use serve::run_serve;
pub use status::{run_history, run_status};
pub use validate::run_validate;
