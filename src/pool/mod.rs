mod blocking;
mod connection;
mod factory;
#[cfg(feature = "metrics")]
mod metrics;

pub use blocking::{Pool, PoolStatus};
pub use connection::PooledConnection;
pub use factory::{connect_tcp, factory_fn, tcp_factory, Factory, Transport};
#[cfg(feature = "metrics")]
pub use metrics::PoolMetrics;
