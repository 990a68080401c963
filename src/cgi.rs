//! CGI delegation.
//!
//! Script execution is behind the [`CgiExecutor`] trait so the reactor never
//! blocks on a child process. Jobs run on a small tokio pool; each result is
//! sent back over a channel tagged with the connection slot and serial, and
//! the reactor is woken through its [`mio::Waker`].

use crate::config::Route;
use crate::protocols::http::response::SERVER_NAME;
use crate::protocols::http::{Request, Response};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Everything needed to run one CGI script.
#[derive(Debug, Clone)]
pub struct CgiJob {
    /// Canonical path of the script.
    pub script: PathBuf,
    pub interpreter: Option<PathBuf>,
    /// CGI/1.1 meta-variables.
    pub env: Vec<(String, String)>,
    /// Decoded request body, fed to the script's stdin.
    pub body: Bytes,
}

impl CgiJob {
    pub fn new(route: &Route, request: &Request, script: PathBuf) -> Self {
        let version = if request.version.is_empty() {
            "HTTP/1.1"
        } else {
            request.version.as_str()
        };

        let mut env = vec![
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("SERVER_PROTOCOL".to_string(), version.to_string()),
            ("SERVER_SOFTWARE".to_string(), SERVER_NAME.to_string()),
            ("REQUEST_METHOD".to_string(), request.method.clone()),
            ("QUERY_STRING".to_string(), request.query.clone()),
            ("CONTENT_LENGTH".to_string(), request.body.len().to_string()),
            ("SCRIPT_NAME".to_string(), request.path.clone()),
            (
                "SCRIPT_FILENAME".to_string(),
                script.to_string_lossy().into_owned(),
            ),
            ("PATH_INFO".to_string(), request.path.clone()),
        ];
        if let Some(content_type) = request.header("Content-Type") {
            env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
        }
        for (name, value) in request.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Type")
                || name.eq_ignore_ascii_case("Content-Length")
            {
                continue;
            }
            env.push((meta_variable(name), value.to_string()));
        }

        Self {
            script,
            interpreter: route.cgi_interpreter.clone(),
            env,
            body: request.body.clone(),
        }
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// `User-Agent` becomes `HTTP_USER_AGENT`.
fn meta_variable(header: &str) -> String {
    let mut name = String::with_capacity(header.len() + 5);
    name.push_str("HTTP_");
    for c in header.chars() {
        name.push(if c == '-' { '_' } else { c.to_ascii_uppercase() });
    }
    name
}

/// Why a CGI job produced no output.
#[derive(Debug)]
pub enum CgiError {
    Spawn(io::Error),
    Io(io::Error),
    /// The script exited unsuccessfully.
    Failed { code: Option<i32>, stderr: String },
    Timeout,
}

impl std::fmt::Display for CgiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CgiError::Spawn(e) => write!(f, "failed to start CGI script: {}", e),
            CgiError::Io(e) => write!(f, "CGI pipe error: {}", e),
            CgiError::Failed { code: Some(code), .. } => {
                write!(f, "CGI script exited with status {}", code)
            }
            CgiError::Failed { code: None, .. } => write!(f, "CGI script killed by signal"),
            CgiError::Timeout => write!(f, "CGI script timed out"),
        }
    }
}

impl std::error::Error for CgiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CgiError::Spawn(e) | CgiError::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type CgiFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, CgiError>> + Send>>;

/// Runs CGI jobs to completion and returns the script's raw stdout.
pub trait CgiExecutor: Send + Sync + 'static {
    fn execute(&self, job: CgiJob) -> CgiFuture;
}

/// Spawns the script as a child process.
///
/// The working directory is the script's directory. The child inherits only
/// `PATH` plus the CGI meta-variables, and is killed if the job is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl CgiExecutor for ProcessExecutor {
    fn execute(&self, job: CgiJob) -> CgiFuture {
        Box::pin(async move {
            let mut command = match &job.interpreter {
                Some(interpreter) => {
                    let mut command = tokio::process::Command::new(interpreter);
                    command.arg(&job.script);
                    command
                }
                None => tokio::process::Command::new(&job.script),
            };
            if let Some(dir) = job.script.parent() {
                command.current_dir(dir);
            }
            command.env_clear();
            if let Some(path) = std::env::var_os("PATH") {
                command.env("PATH", path);
            }
            command
                .envs(job.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = command.spawn().map_err(CgiError::Spawn)?;

            let stdin = child.stdin.take();
            let body = job.body;
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    match stdin.write_all(&body).await {
                        // Scripts that ignore stdin close it early
                        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
                        _ => {}
                    }
                }
                Ok(())
            };

            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output.map_err(CgiError::Io)?;
            fed.map_err(CgiError::Io)?;

            if !output.status.success() {
                return Err(CgiError::Failed {
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            Ok(output.stdout)
        })
    }
}

/// A finished CGI job, addressed to the connection that submitted it.
#[derive(Debug)]
pub struct CgiCompletion {
    pub conn_id: usize,
    pub serial: u64,
    pub result: Result<Vec<u8>, CgiError>,
}

/// Worker pool that runs CGI jobs off the reactor thread.
pub struct CgiPool {
    runtime: tokio::runtime::Runtime,
    executor: Arc<dyn CgiExecutor>,
    timeout: Duration,
    tx: mpsc::Sender<CgiCompletion>,
    rx: mpsc::Receiver<CgiCompletion>,
    waker: Arc<mio::Waker>,
}

impl CgiPool {
    /// Start the pool. `workers` defaults to one thread per core.
    pub fn new(
        executor: Arc<dyn CgiExecutor>,
        workers: Option<usize>,
        timeout: Duration,
        waker: Arc<mio::Waker>,
    ) -> io::Result<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.thread_name("cgi-worker").enable_all();
        if let Some(workers) = workers {
            builder.worker_threads(workers.max(1));
        }
        let runtime = builder.build()?;
        let (tx, rx) = mpsc::channel();

        Ok(Self {
            runtime,
            executor,
            timeout,
            tx,
            rx,
            waker,
        })
    }

    /// Run `job` in the background. The completion is delivered through
    /// [`CgiPool::try_recv`] after the reactor is woken.
    pub fn submit(&self, conn_id: usize, serial: u64, job: CgiJob) {
        let executor = Arc::clone(&self.executor);
        let waker = Arc::clone(&self.waker);
        let tx = self.tx.clone();
        let timeout = self.timeout;

        debug!(conn_id, script = %job.script.display(), "Submitting CGI job");
        self.runtime.spawn(async move {
            let result = match tokio::time::timeout(timeout, executor.execute(job)).await {
                Ok(result) => result,
                Err(_) => Err(CgiError::Timeout),
            };
            if tx
                .send(CgiCompletion {
                    conn_id,
                    serial,
                    result,
                })
                .is_err()
            {
                // Reactor is gone
                return;
            }
            if let Err(e) = waker.wake() {
                warn!("Failed to wake reactor: {}", e);
            }
        });
    }

    /// Next finished job, if any.
    pub fn try_recv(&self) -> Option<CgiCompletion> {
        self.rx.try_recv().ok()
    }
}

/// What to send back for a script's output.
#[derive(Debug)]
pub enum CgiOutput {
    /// Output that is already a full HTTP response, relayed as is.
    Raw(Vec<u8>),
    Response(Response),
}

/// Turn CGI output into a response.
///
/// The header block is separated from the body by a blank line. `Status`
/// sets the status line, `Location` without `Status` means 302, and the
/// content type defaults to `text/plain`. `Content-Length` is always
/// recomputed from the body.
pub fn into_response(output: Vec<u8>) -> CgiOutput {
    if output.starts_with(b"HTTP/") {
        return CgiOutput::Raw(output);
    }

    let (head, body) = split_head(&output);
    let mut response = Response::new();
    let mut status = None;

    for line in head.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("Status") {
            status = parse_status(value);
        } else if !name.is_empty() {
            response.set_header(name, value);
        }
    }

    match status {
        Some((code, reason)) => response.set_status(code, reason),
        None if response.header("Location").is_some() => response.set_status(302, "Found"),
        None => {}
    }
    if response.header("Content-Type").is_none() {
        response.set_header("Content-Type", "text/plain");
    }
    response.set_body(body.to_vec());

    CgiOutput::Response(response)
}

/// Split at the first blank line. Output without one is all body.
fn split_head(output: &[u8]) -> (&[u8], &[u8]) {
    let crlf = output.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = output.windows(2).position(|w| w == b"\n\n");

    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => (&output[..l], &output[l + 2..]),
        (Some(c), _) => (&output[..c], &output[c + 4..]),
        (None, Some(l)) => (&output[..l], &output[l + 2..]),
        (None, None) => (&output[..0], output),
    }
}

/// `404 Not Found` or a bare `404`.
fn parse_status(value: &str) -> Option<(u16, String)> {
    let (code, reason) = value.split_once(' ').unwrap_or((value, ""));
    let code: u16 = code.trim().parse().ok()?;
    if !(100..=999).contains(&code) {
        return None;
    }
    let reason = match reason.trim() {
        "" => default_reason(code),
        reason => reason,
    };
    Some((code, reason.to_string()))
}

fn default_reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
