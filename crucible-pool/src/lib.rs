pub mod error;
pub mod pool;
pub mod worker;

pub use error::PoolError;
pub use pool::{Pool, PoolConfig, PoolStats};
pub use worker::WorkerState;
