//! Turns a decoded request into a response or a CGI job.
//!
//! Runs on the reactor thread. Static files are read synchronously; scripts
//! are handed back to the caller as a [`CgiJob`] for the worker pool.

use crate::cgi::{self, CgiError, CgiJob, CgiOutput};
use crate::config::{Config, Route};
use crate::protocols::http::{error_response, Request, Response, Status};
use crate::router::{self, confine, resolve_file_path, Confinement, MatchKind, Router};
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Outcome of dispatching one request.
#[derive(Debug)]
pub enum Dispatch {
    /// An encoded response ready to write.
    Respond { bytes: Vec<u8>, keep_alive: bool },
    /// The request must be finished by a CGI script.
    Cgi { job: CgiJob, keep_alive: bool },
}

/// Request processing against the route table and error pages.
pub struct Dispatcher {
    config: Config,
    router: Router,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        let router = Router::new(config.routes.clone());
        Self { config, router }
    }

    /// Decide how to answer `request`.
    ///
    /// Malformed and oversized requests always close the connection.
    pub fn dispatch(&self, request: &Request) -> Dispatch {
        if request.leniency.malformed_request_line {
            return self.respond(self.error(Status::BadRequest), false);
        }
        if request.body.len() > self.config.client_body_size_limit {
            return self.respond(self.error(Status::PayloadTooLarge), false);
        }

        let keep_alive = request.wants_keep_alive();
        let Some(matched) = self.router.match_request(request) else {
            debug!(path = %request.path, "No route");
            return self.respond(self.error(Status::NotFound), keep_alive);
        };

        let response = match matched.kind {
            MatchKind::Redirect => redirect(matched.route),
            MatchKind::MethodNotAllowed => {
                let mut response = self.error(Status::MethodNotAllowed);
                response.set_header("Allow", matched.route.methods.join(", "));
                response
            }
            MatchKind::Static => self.serve_static(matched.route, request),
            MatchKind::Cgi => match self.locate(matched.route, &request.path) {
                Ok(script) if script.is_dir() => self.error(Status::Forbidden),
                Ok(script) => {
                    return Dispatch::Cgi {
                        job: CgiJob::new(matched.route, request, script),
                        keep_alive,
                    }
                }
                Err(status) => self.error(status),
            },
        };
        self.respond(response, keep_alive)
    }

    /// Response for a request rejected before it was fully read.
    pub fn reject(&self, status: Status) -> Vec<u8> {
        let mut response = self.error(status);
        response.set_keep_alive(false);
        response.encode()
    }

    /// Encode the outcome of a CGI job. Returns the bytes and whether the
    /// connection may stay open.
    pub fn cgi_response(
        &self,
        result: Result<Vec<u8>, CgiError>,
        keep_alive: bool,
    ) -> (Vec<u8>, bool) {
        let mut response = match result {
            Ok(output) => match cgi::into_response(output) {
                // Framing of relayed output is the script's business
                CgiOutput::Raw(bytes) => return (bytes, false),
                CgiOutput::Response(response) => response,
            },
            Err(CgiError::Timeout) => {
                warn!("CGI script timed out");
                self.error(Status::GatewayTimeout)
            }
            Err(e) => {
                warn!("CGI script failed: {}", e);
                self.error(Status::InternalServerError)
            }
        };
        response.set_keep_alive(keep_alive);
        (response.encode(), keep_alive)
    }

    fn serve_static(&self, route: &Route, request: &Request) -> Response {
        let path = match self.locate(route, &request.path) {
            Ok(path) => path,
            Err(status) => return self.error(status),
        };

        if path.is_dir() {
            if !route.directory_listing {
                return self.error(Status::Forbidden);
            }
            return match router::directory_listing(&path, &request.path) {
                Some(listing) => {
                    let mut response = Response::new();
                    response.set_body(listing);
                    response.set_header("Content-Type", "text/html; charset=utf-8");
                    response
                }
                None => self.error(Status::Forbidden),
            };
        }

        match std::fs::read(&path) {
            Ok(contents) => {
                let mut response = Response::new();
                response.set_body(contents);
                response.set_header("Content-Type", router::mime_type(&path));
                response
            }
            Err(e) => {
                warn!(path = %path.display(), "Failed to read file: {}", e);
                self.error(io_status(&e))
            }
        }
    }

    /// Resolve the request path to an existing file or directory under the
    /// route's root.
    fn locate(&self, route: &Route, request_path: &str) -> Result<PathBuf, Status> {
        let Some(root) = route.root.as_deref() else {
            return Err(Status::NotFound);
        };
        let Some(candidate) = resolve_file_path(route, request_path) else {
            return Err(Status::NotFound);
        };

        match confine(root, &candidate) {
            Ok(path) => Ok(path),
            Err(Confinement::NotFound) => Err(Status::NotFound),
            Err(Confinement::Escapes) => {
                warn!(path = request_path, "Request escapes document root");
                Err(Status::Forbidden)
            }
            Err(Confinement::Io(e)) => {
                warn!(path = %candidate.display(), "Failed to resolve path: {}", e);
                Err(io_status(&e))
            }
        }
    }

    fn error(&self, status: Status) -> Response {
        error_response(
            status.code(),
            status.reason(),
            self.config.error_page(status.code()),
        )
    }

    fn respond(&self, mut response: Response, keep_alive: bool) -> Dispatch {
        response.set_keep_alive(keep_alive);
        Dispatch::Respond {
            bytes: response.encode(),
            keep_alive,
        }
    }
}

fn redirect(route: &Route) -> Response {
    let mut response = Response::with_status(Status::MovedPermanently);
    response.set_header("Location", route.redirect.as_deref().unwrap_or("/"));
    response.set_body(Vec::<u8>::new());
    response
}

fn io_status(e: &io::Error) -> Status {
    match e.kind() {
        io::ErrorKind::NotFound => Status::NotFound,
        io::ErrorKind::PermissionDenied => Status::Forbidden,
        _ => Status::InternalServerError,
    }
}
