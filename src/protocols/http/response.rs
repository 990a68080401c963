//! HTTP response building and encoding.

use super::Headers;
use bytes::Bytes;
use std::path::Path;

/// Value of the `Server` header.
pub const SERVER_NAME: &str = "webserv/0.1";

/// Status codes emitted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 200,
    MovedPermanently = 301,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    PayloadTooLarge = 413,
    InternalServerError = 500,
    BadGateway = 502,
    GatewayTimeout = 504,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Reason phrase for the status line.
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::MovedPermanently => "Moved Permanently",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::PayloadTooLarge => "Payload Too Large",
            Status::InternalServerError => "Internal Server Error",
            Status::BadGateway => "Bad Gateway",
            Status::GatewayTimeout => "Gateway Timeout",
        }
    }
}

/// An HTTP response under construction.
///
/// `Server`, `Date` and `Connection: close` are set on creation. Setting a body
/// always rewrites `Content-Length` to match it.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    reason: String,
    headers: Headers,
    body: Option<Bytes>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// A `200 OK` response with the default headers and no body.
    pub fn new() -> Self {
        let mut headers = Headers::new();
        headers.insert("Server", SERVER_NAME);
        headers.insert("Date", http_date());
        headers.insert("Connection", "close");

        Self {
            status: 200,
            reason: "OK".to_string(),
            headers,
            body: None,
        }
    }

    pub fn with_status(status: Status) -> Self {
        let mut response = Self::new();
        response.set_status(status.code(), status.reason());
        response
    }

    pub fn set_status(&mut self, code: u16, reason: impl Into<String>) {
        self.status = code;
        self.reason = reason.into();
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Set the body and its `Content-Length`.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.headers
            .insert("Content-Length", body.len().to_string());
        self.body = Some(body);
    }

    /// Set an HTML body, defaulting the content type to UTF-8 HTML.
    pub fn set_html(&mut self, body: impl Into<String>) {
        let body: String = body.into();
        self.set_body(body);
        self.headers
            .insert("Content-Type", "text/html; charset=utf-8");
    }

    /// Record the keep-alive decision in the `Connection` header.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.headers.insert(
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Serialize status line, headers and body.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body.as_ref().map_or(0, Bytes::len);
        let mut out = Vec::with_capacity(128 + self.headers.len() * 32 + body_len);

        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

/// Build an error response, preferring the configured error page.
///
/// A missing or unreadable page silently falls back to a generated one.
pub fn error_response(code: u16, reason: &str, error_page: Option<&Path>) -> Response {
    let mut response = Response::new();
    response.set_status(code, reason);

    match error_page.and_then(|path| std::fs::read(path).ok()) {
        Some(page) => {
            response.set_body(page);
            response.set_header("Content-Type", "text/html");
        }
        None => response.set_html(default_error_page(code, reason)),
    }
    response
}

fn default_error_page(code: u16, reason: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>{code} {reason}</title>\n</head>\n\
         <body>\n<h1>{code} {reason}</h1>\n\
         <p>The server encountered an error while processing your request.</p>\n\
         </body>\n</html>"
    )
}

/// Current time as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
