//! Archiving of container logs.
//!
//! The [`LogForwarder`] periodically copies each live container's logs into
//! a [`BlobStore`], one object per flush window. Windows are contiguous: each
//! starts where the previous one ended, tracked by the durable
//! `logs_flushed_at` watermark in the registry.

mod blob;
mod forwarder;

pub use blob::{blob_key, from_config, BlobStore, FsBlobStore, HttpBlobStore};
pub use forwarder::{FlushOutcome, LogForwarder};
