//! webserv: a single-reactor HTTP/1.1 server
//!
//! Features:
//! - Static files with default documents and directory listings
//! - Per-route method restrictions and redirects
//! - CGI scripts executed off the event loop
//! - Keep-alive, chunked request bodies and idle timeouts
//! - Configuration via CLI arguments or TOML file

use tracing::info;
use tracing_subscriber::EnvFilter;
use webserv::config::Config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        ports = ?config.ports,
        routes = config.routes.len(),
        body_limit_kb = config.client_body_size_limit / 1024,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        "Starting webserv"
    );
    for route in &config.routes {
        info!(
            path = %route.path,
            methods = ?route.methods,
            root = ?route.root,
            redirect = ?route.redirect,
            cgi = ?route.cgi_extension,
            "Route"
        );
    }

    webserv::runtime::run(config)?;
    Ok(())
}
