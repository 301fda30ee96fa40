//! Transport-side collaborators for the stream gateway.
//!
//! Provides:
//! - Loopback upstream backend (feature: memory)
//! - File-backed attachment store for base64 QR images

pub mod attachment;

#[cfg(feature = "memory")]
pub mod memory;

pub use attachment::FileAttachmentStore;

#[cfg(feature = "memory")]
pub use memory::{AckPolicy, MemoryBackend};
