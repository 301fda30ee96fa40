//! Session registry and push routing for the stream gateway.
//!
//! Provides:
//! - `SessionRegistry` - Named sessions and the push routing policy
//! - `Session` - Partially-known identity plus its event channel
//! - `SessionEvents` / `DeliveryFailure` - Subscriber side and failure reporting

pub mod registry;
pub mod session;
pub mod sink;

pub use registry::{RegistryConfig, RegistryError, RouteOutcome, SessionRegistry};
pub use session::Session;
pub use sink::{DeliveryFailure, SessionEvents, SinkError};
