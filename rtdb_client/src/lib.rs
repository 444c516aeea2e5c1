//! Client-side runtime for a real-time database service streaming table
//! deltas over a persistent duplex connection.
//!
//! The four CORE subsystems (spec §1-§2) live in their own modules:
//!
//! - [`codec`] — the tagged-value wire format and client/server message
//!   framing, plus gzip/brotli [`compression`] negotiation.
//! - [`connection`] — the duplex connection state machine, identity,
//!   request/response correlation ([`request_tracker`]), and lifecycle
//!   [`events`].
//! - [`subscription`] and [`table`] — per-query subscription tracking,
//!   delta diffing, and typed table caches.
//! - [`pool`] — a multi-connection pool with health telemetry, circuit
//!   breaking, load balancing, and retries.
//!
//! [`scheduler`] and [`energy`] round out the connection runtime's
//! deferred-invocation and budget-accounting responsibilities (spec §4.8,
//! §4.9).

pub mod codec;
pub mod compression;
pub mod config;
pub mod connection;
pub mod energy;
pub mod error;
pub mod events;
pub mod identity;
pub mod ids;
pub mod pool;
pub mod request_tracker;
pub mod scheduler;
pub mod subscription;
pub mod table;
pub mod time;
pub mod transport;

#[cfg(feature = "derive")]
pub use rtdb_client_derive::Row;

pub use codec::{AlgebraicType, AlgebraicTyped, AlgebraicValue, ProductField, Row, SumVariant};
pub use config::{ClientConfig, ClientConfigBuilder, Protocol};
pub use connection::Connection;
pub use error::{Result, RtdbError};
pub use identity::{ConnectionId, Identity, IdentityToken};
pub use ids::{QueryId, RequestId};
pub use pool::{ConnectionFactory, ConnectionPool, PoolGuard, PoolMetrics};
pub use table::{EventContext, TableCache, TableSchema};
