//! Configuration module for the webserv HTTP server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The result is a
//! single immutable [`Config`] handed to the reactor by reference.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for the HTTP server
#[derive(Parser, Debug)]
#[command(name = "webserv")]
#[command(author = "webserv authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-reactor HTTP/1.1 server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on, may be repeated (replaces the configured ports)
    #[arg(short, long = "port")]
    pub ports: Vec<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cgi: CgiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Status code (as a string key) to error page path.
    #[serde(default)]
    pub error_pages: HashMap<String, PathBuf>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Kept wider than `u16` so out-of-range ports are reported, not rejected by the parser.
    #[serde(default = "default_ports")]
    pub ports: Vec<u32>,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_body_limit")]
    pub client_body_size_limit: usize,
    /// Idle timeout for a connection, also the poll timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: default_ports(),
            client_body_size_limit: default_body_limit(),
            request_timeout_ms: default_request_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

/// CGI worker pool configuration
#[derive(Debug, Deserialize)]
pub struct CgiConfig {
    #[serde(default = "default_cgi_timeout_ms")]
    pub timeout_ms: u64,
    /// Worker threads for the CGI pool (defaults to number of CPU cores)
    pub workers: Option<usize>,
}

impl Default for CgiConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_cgi_timeout_ms(),
            workers: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A route as written in the configuration file.
#[derive(Debug, Deserialize, Default)]
pub struct RouteConfig {
    pub path: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    pub root: Option<PathBuf>,
    pub default_file: Option<String>,
    pub cgi_extension: Option<String>,
    pub cgi_interpreter: Option<PathBuf>,
    #[serde(default)]
    pub directory_listing: bool,
    pub redirect: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_ports() -> Vec<u32> {
    vec![8080]
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    10_240
}

fn default_cgi_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Status codes that get an error page when none are configured.
const DEFAULT_ERROR_PAGES: [u16; 6] = [400, 403, 404, 405, 413, 500];

/// A validated routing rule. Routes are matched in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Path prefix, always starting with `/`.
    pub path: String,
    pub methods: Vec<String>,
    pub root: Option<PathBuf>,
    pub default_file: Option<String>,
    pub cgi_extension: Option<String>,
    pub cgi_interpreter: Option<PathBuf>,
    pub directory_listing: bool,
    pub redirect: Option<String>,
}

impl Route {
    /// Create a static route serving `root` under `path` for GET.
    pub fn new(path: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.to_string(),
            methods: vec!["GET".to_string()],
            root: Some(root.into()),
            default_file: None,
            cgi_extension: None,
            cgi_interpreter: None,
            directory_listing: false,
            redirect: None,
        }
    }

    /// Create a redirect route.
    pub fn redirect(path: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            methods: vec!["GET".to_string()],
            root: None,
            default_file: None,
            cgi_extension: None,
            cgi_interpreter: None,
            directory_listing: false,
            redirect: Some(target.to_string()),
        }
    }

    /// Replace the allowed methods.
    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_default_file(mut self, file: &str) -> Self {
        self.default_file = Some(file.to_string());
        self
    }

    pub fn with_directory_listing(mut self, enabled: bool) -> Self {
        self.directory_listing = enabled;
        self
    }

    pub fn with_cgi(mut self, extension: &str, interpreter: Option<PathBuf>) -> Self {
        self.cgi_extension = Some(extension.to_string());
        self.cgi_interpreter = interpreter;
        self
    }

    /// Whether `method` is permitted on this route (exact, case-sensitive).
    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub ports: Vec<u16>,
    pub client_body_size_limit: usize,
    pub request_timeout: Duration,
    pub cgi_timeout: Duration,
    pub cgi_workers: Option<usize>,
    pub max_connections: usize,
    pub error_pages: HashMap<u16, PathBuf>,
    pub routes: Vec<Route>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: vec![8080],
            client_body_size_limit: default_body_limit(),
            request_timeout: Duration::from_millis(default_request_timeout_ms()),
            cgi_timeout: Duration::from_millis(default_cgi_timeout_ms()),
            cgi_workers: None,
            max_connections: default_max_connections(),
            error_pages: HashMap::new(),
            routes: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Self::resolve(toml_config)?;

        // Merge CLI args (CLI takes precedence)
        if let Some(host) = cli.host {
            config.host = host;
        }
        if !cli.ports.is_empty() {
            if let Some(port) = cli.ports.iter().find(|&&p| p == 0) {
                return Err(ConfigError::InvalidPort(u32::from(*port)));
            }
            config.ports = cli.ports;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let toml_config: TomlConfig = toml::from_str(contents)
            .map_err(|e| ConfigError::TomlParse(PathBuf::from("<inline>"), e))?;
        Self::resolve(toml_config)
    }

    /// Apply defaults and validate a parsed file.
    fn resolve(toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            cgi,
            logging,
            error_pages,
            routes,
        } = toml_config;

        if server.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        let ports = server
            .ports
            .iter()
            .map(|&port| match u16::try_from(port) {
                Ok(p) if p > 0 => Ok(p),
                _ => Err(ConfigError::InvalidPort(port)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let host = if server.host.trim().is_empty() {
            default_host()
        } else {
            server.host
        };

        let error_pages = if error_pages.is_empty() {
            DEFAULT_ERROR_PAGES
                .iter()
                .map(|&code| (code, PathBuf::from(format!("error_pages/{code}.html"))))
                .collect()
        } else {
            error_pages
                .into_iter()
                .map(|(key, path)| match key.parse::<u16>() {
                    Ok(code) if (100..=599).contains(&code) => Ok((code, path)),
                    _ => Err(ConfigError::InvalidErrorPage(key)),
                })
                .collect::<Result<HashMap<_, _>, _>>()?
        };

        let routes = routes
            .into_iter()
            .map(resolve_route)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            host,
            ports,
            client_body_size_limit: if server.client_body_size_limit == 0 {
                default_body_limit()
            } else {
                server.client_body_size_limit
            },
            request_timeout: Duration::from_millis(if server.request_timeout_ms == 0 {
                default_request_timeout_ms()
            } else {
                server.request_timeout_ms
            }),
            cgi_timeout: Duration::from_millis(cgi.timeout_ms.max(1)),
            cgi_workers: cgi.workers.filter(|&w| w > 0),
            max_connections: server.max_connections.max(1),
            error_pages,
            routes,
            log_level: logging.level,
        })
    }

    /// Configured error page for a status code, if any.
    pub fn error_page(&self, code: u16) -> Option<&Path> {
        self.error_pages.get(&code).map(PathBuf::as_path)
    }
}

fn resolve_route(route: RouteConfig) -> Result<Route, ConfigError> {
    let path = match route.path.as_deref().map(str::trim) {
        None | Some("") => "/".to_string(),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{p}"),
    };

    let methods = if route.methods.is_empty() {
        vec!["GET".to_string()]
    } else {
        route.methods
    };
    if methods.iter().any(|m| m.trim().is_empty()) {
        return Err(ConfigError::InvalidRoute {
            path,
            reason: "allowed methods must not be empty",
        });
    }

    let root = route.root.filter(|r| !r.as_os_str().is_empty());
    if route.redirect.is_none() && root.is_none() {
        return Err(ConfigError::InvalidRoute {
            path,
            reason: "route must have a root directory or a redirect",
        });
    }

    Ok(Route {
        path,
        methods,
        root,
        default_file: route.default_file.filter(|f| !f.is_empty()),
        cgi_extension: route.cgi_extension.filter(|e| !e.is_empty()),
        cgi_interpreter: route.cgi_interpreter,
        directory_listing: route.directory_listing,
        redirect: route.redirect,
    })
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    NoPorts,
    InvalidPort(u32),
    InvalidErrorPage(String),
    InvalidRoute { path: String, reason: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::NoPorts => write!(f, "At least one port must be configured"),
            ConfigError::InvalidPort(port) => write!(f, "Invalid port: {port}"),
            ConfigError::InvalidErrorPage(key) => {
                write!(f, "Invalid error page status code: '{key}'")
            }
            ConfigError::InvalidRoute { path, reason } => {
                write!(f, "Route {path}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
