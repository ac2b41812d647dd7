//! Host configuration.
//!
//! - `types` - [`HostConfig`] and its sections
//! - `resources` - container resource quotas ([`ResourceLimits`])
//! - `duration` - "30s"-style duration parsing
//! - `parser` - YAML loading
//! - `validation` - sanity checks run on load

mod duration;
mod parser;
mod resources;
mod types;
mod validation;

pub use duration::*;
pub use parser::*;
pub use resources::*;
pub use types::*;
