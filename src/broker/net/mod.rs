//! QUIC binding of the broker interfaces.
//!
//! One request and one response travel on each bidirectional stream, both
//! framed as `len | zstd(rkyv(msg))`. Broker errors cross the wire as their
//! [`ErrorKind`](crate::broker::error::ErrorKind) and detail string.

pub mod client;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod wire;

pub use client::{QuicAggregateClient, QuicRegistryClient};
pub use dispatch::Dispatcher;
pub use endpoint::{Endpoint, TlsSettings};
pub use error::TransportError;
