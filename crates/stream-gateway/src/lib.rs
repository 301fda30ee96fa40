//! Request correlation and push demultiplexing over one shared upstream stream.
//!
//! This crate provides:
//! - `Gateway` - Attaches sessions and issues correlated requests
//! - `CorrelationPool` - Pending replies keyed by request id
//! - `Dispatcher` - Reads the stream and routes every frame
//! - `GatewayConfig` / `Credentials` - Policy knobs and environment loading

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod pool;

pub use config::{ConfigError, Credentials, GatewayConfig};
pub use dispatcher::{ConnectionEvent, DispatchOutcome, Dispatcher};
pub use error::GatewayError;
pub use gateway::{Gateway, SessionHandle};
pub use pool::{CorrelationPool, PendingReply, PoolError, Resolution};
