//! In-memory metrics: ring-buffer percentiles plus outgoing and incoming
//! collectors. Snapshots are deep copies safe to serialize.

mod domain;
mod endpoint;
mod incoming;
mod outgoing;
mod ring;

pub use domain::{DomainMetrics, DomainSnapshot};
pub use endpoint::{EndpointMetrics, EndpointSnapshot};
pub use incoming::{IncomingCollector, IncomingSnapshot, RouteMetrics, RouteSnapshot};
pub use outgoing::{MetricsSnapshot, OutgoingCollector};
pub use ring::RingBuffer;
