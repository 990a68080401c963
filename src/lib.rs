//! webserv: a single-reactor HTTP/1.1 server
//!
//! Serves static files from configured document roots, issues redirects,
//! lists directories and delegates scripts to CGI workers. All sockets are
//! driven from one mio event loop.
//!
//! Layout:
//! - `config`: CLI arguments, TOML file, defaults and validation
//! - `protocols::http`: request decoding and response encoding
//! - `router`: route matching and file resolution
//! - `cgi`: script execution off the event loop
//! - `runtime`: connection state machine, dispatcher and reactor

pub mod cgi;
pub mod config;
pub mod protocols;
pub mod router;
pub mod runtime;
