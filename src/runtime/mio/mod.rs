//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod event_loop;

pub use event_loop::{Reactor, ShutdownHandle};

use crate::cgi::ProcessExecutor;
use crate::config::Config;
use std::sync::Arc;

/// Run the server using the mio backend, executing CGI scripts as child
/// processes.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut reactor = Reactor::bind(config, Arc::new(ProcessExecutor))?;
    reactor.run()
}
