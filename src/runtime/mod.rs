//! Networking runtime.
//!
//! - `connection`: per-connection buffering and framing state machine
//! - `dispatch`: request to response (or CGI job) decisions
//! - `mio`: the readiness loop that owns every socket

pub mod connection;
pub mod dispatch;
pub mod mio;

pub use self::connection::{ConnState, Connection, ConnectionRegistry};
pub use self::dispatch::{Dispatch, Dispatcher};
pub use self::mio::{run, Reactor, ShutdownHandle};
