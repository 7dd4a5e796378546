// netpool - bounded pool of reusable network connections

pub mod config;
pub mod pool;
pub mod queue;
pub mod utils;

// Re-export commonly used types
pub use config::{PoolConfig, ReturnPolicy};
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use utils::error::{PoolError, Result};
