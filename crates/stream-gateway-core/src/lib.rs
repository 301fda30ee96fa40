//! Core types for the stream gateway.
//!
//! This crate provides the fundamental building blocks:
//! - Wire types (`RequestObject`, `StreamResponse`, `ApiType`, `ResponseType`)
//! - `Identity` - Partially-known backend identity of a session
//! - `InboundMessage` - Tagged classification of inbound frames
//! - Upstream, token refresh and attachment traits

pub mod identity;
pub mod message;
pub mod protocol;
pub mod traits;

pub use identity::{Identity, IdentityKey, IdentityUpdate};
pub use message::{Attachment, DecodeError, Delivery, InboundMessage};
pub use protocol::{
    ApiType, InitConfig, RequestId, RequestObject, ResponseObject, ResponseType, StreamResponse,
};
pub use traits::{
    AttachmentError, AttachmentStore, FrameStream, RefreshError, TokenRefresher, TransportError,
    UpstreamClient, UpstreamConnector,
};
