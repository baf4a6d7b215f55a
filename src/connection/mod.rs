// src/connection/mod.rs
mod pool;

pub use pool::{ConnectionPool, ConnectionPoolManager, PoolStats, PooledConnection};
