//! Host port allocation for workspace containers.
//!
//! Each running container publishes its service on one host port taken from
//! the configured range. The [`PortAllocator`] is the single owner of that
//! range inside the process; the registry's unique index on `assigned_port`
//! backs it up on disk.

mod allocator;

pub use allocator::PortAllocator;
