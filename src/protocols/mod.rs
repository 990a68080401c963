//! Wire protocol implementations.

pub mod http;
