//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//!
//! One thread owns every listener and connection. CGI jobs run on the worker
//! pool and report back through a channel; the pool wakes the loop with a
//! `Waker` registered under its own token. After every poll, connections idle
//! for longer than the request timeout are closed regardless of state.

use crate::cgi::{CgiExecutor, CgiPool};
use crate::config::Config;
use crate::protocols::http::Status;
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::dispatch::{Dispatch, Dispatcher};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Size of the scratch buffer each read lands in.
const READ_BUFFER_SIZE: usize = 8 * 1024;

const EVENTS_CAPACITY: usize = 1024;

/// Listeners count down from just below the waker token.
fn listener_token(index: usize) -> Token {
    Token(usize::MAX - 1 - index)
}

/// Per-connection state for the mio backend.
///
/// Wraps the mio `TcpStream` together with the protocol-level
/// [`Connection`] that owns the buffers.
struct MioConnection {
    stream: TcpStream,
    peer: SocketAddr,
    conn: Connection,
}

/// Stops a running [`Reactor`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Single-threaded HTTP reactor.
pub struct Reactor {
    poll: Poll,
    listeners: Vec<TcpListener>,
    connections: ConnectionRegistry<MioConnection>,
    dispatcher: Dispatcher,
    cgi: CgiPool,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    body_limit: usize,
    request_timeout: Duration,
    next_serial: u64,
}

impl Reactor {
    /// Bind a listener per configured port and start the CGI pool.
    pub fn bind(config: Config, executor: Arc<dyn CgiExecutor>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listeners = Vec::with_capacity(config.ports.len());
        for (index, &port) in config.ports.iter().enumerate() {
            let addr = resolve(&config.host, port)?;
            let mut listener = TcpListener::from_std(create_listener(addr)?);
            poll.registry()
                .register(&mut listener, listener_token(index), Interest::READABLE)?;

            info!(addr = %listener.local_addr()?, "Listening");
            listeners.push(listener);
        }

        let cgi = CgiPool::new(
            executor,
            config.cgi_workers,
            config.cgi_timeout,
            Arc::clone(&waker),
        )?;

        Ok(Self {
            poll,
            listeners,
            connections: ConnectionRegistry::new(config.max_connections),
            body_limit: config.client_body_size_limit,
            request_timeout: config.request_timeout,
            dispatcher: Dispatcher::new(config),
            cgi,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_serial: 0,
        })
    }

    /// Bound addresses, in port order. Useful when binding port 0.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(TcpListener::local_addr).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Serve until shut down. Returns early only if polling itself fails.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        info!(
            listeners = self.listeners.len(),
            max_connections = self.connections.capacity(),
            request_timeout_ms = self.request_timeout.as_millis() as u64,
            "Starting mio runtime"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.request_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.drain_cgi_completions(),
                    token => match self.listener_index(token) {
                        Some(index) => self.accept_connections(index),
                        None => {
                            let conn_id = token.0;
                            if let Err(e) = self.handle_connection_event(conn_id, event) {
                                debug!(conn_id, error = %e, "Connection error");
                                self.close_connection(conn_id);
                            }
                        }
                    },
                }
            }

            self.sweep_idle(Instant::now());
        }

        info!(connections = self.connections.len(), "Shutting down");
        Ok(())
    }

    fn listener_index(&self, token: Token) -> Option<usize> {
        let index = (usize::MAX - 1).checked_sub(token.0)?;
        (index < self.listeners.len()).then_some(index)
    }

    fn accept_connections(&mut self, index: usize) {
        loop {
            match self.listeners[index].accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let serial = self.next_serial;
                    self.next_serial += 1;

                    let Some(conn_id) = self.connections.insert(MioConnection {
                        stream,
                        peer,
                        conn: Connection::new(serial),
                    }) else {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    };

                    let Some(entry) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) = self.poll.registry().register(
                        &mut entry.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        warn!(conn_id, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        event: &mio::event::Event,
    ) -> io::Result<()> {
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.is_readable() {
            self.handle_readable(conn_id)?;
        }

        // Re-check connection exists (may have been removed)
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.is_writable() {
            self.handle_writable(conn_id)?;
        }

        Ok(())
    }

    /// Drain the socket, dispatching once a full request is buffered.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let mut scratch = [0u8; READ_BUFFER_SIZE];

        loop {
            let entry = self.connections.get_mut(conn_id).ok_or_else(not_found)?;
            if entry.conn.state() != ConnState::Reading {
                return Ok(());
            }

            let n = match entry.stream.read(&mut scratch) {
                Ok(0) => {
                    // EOF
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF"));
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            entry.conn.append(&scratch[..n]);

            if entry.conn.header_too_large() {
                debug!(conn_id, buffered = entry.conn.buffered(), "Header section over limit");
                let bytes = self.dispatcher.reject(Status::BadRequest);
                return self.start_response(conn_id, bytes, false);
            }
            if entry.conn.exceeds_body_limit(self.body_limit) {
                debug!(conn_id, buffered = entry.conn.buffered(), "Request body over limit");
                let bytes = self.dispatcher.reject(Status::PayloadTooLarge);
                return self.start_response(conn_id, bytes, false);
            }
            if entry.conn.has_complete_request() {
                return self.process_request(conn_id);
            }
        }
    }

    fn process_request(&mut self, conn_id: usize) -> io::Result<()> {
        let entry = self.connections.get_mut(conn_id).ok_or_else(not_found)?;
        let request = entry.conn.request();
        debug!(
            conn_id,
            method = %request.method,
            path = %request.path,
            "Request"
        );

        match self.dispatcher.dispatch(&request) {
            Dispatch::Respond { bytes, keep_alive } => {
                self.start_response(conn_id, bytes, keep_alive)
            }
            Dispatch::Cgi { job, keep_alive } => {
                // Parked until the pool reports back
                entry.conn.start_cgi(keep_alive);
                self.poll.registry().deregister(&mut entry.stream)?;
                self.cgi.submit(conn_id, entry.conn.serial(), job);
                Ok(())
            }
        }
    }

    fn start_response(&mut self, conn_id: usize, bytes: Vec<u8>, keep_alive: bool) -> io::Result<()> {
        let entry = self.connections.get_mut(conn_id).ok_or_else(not_found)?;
        entry.conn.start_writing(bytes, keep_alive);
        self.poll
            .registry()
            .reregister(&mut entry.stream, Token(conn_id), Interest::WRITABLE)
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let entry = self.connections.get_mut(conn_id).ok_or_else(not_found)?;
        if entry.conn.state() != ConnState::Writing {
            return Ok(());
        }

        loop {
            let pending = entry.conn.pending_output();
            if pending.is_empty() {
                break;
            }
            let n = match entry.stream.write(pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if entry.conn.advance_output(n) {
                break;
            }
        }

        if entry.conn.keep_alive() {
            // Go back to reading
            entry.conn.reset();
            self.poll
                .registry()
                .reregister(&mut entry.stream, Token(conn_id), Interest::READABLE)?;
        } else {
            self.close_connection(conn_id);
        }
        Ok(())
    }

    fn drain_cgi_completions(&mut self) {
        while let Some(done) = self.cgi.try_recv() {
            let conn_id = done.conn_id;
            let Some(entry) = self.connections.get_mut(conn_id) else {
                debug!(conn_id, "CGI completion for closed connection");
                continue;
            };
            if !entry.conn.accepts_completion(done.serial) {
                debug!(conn_id, serial = done.serial, "Dropping stale CGI completion");
                continue;
            }

            let (bytes, keep_alive) = self
                .dispatcher
                .cgi_response(done.result, entry.conn.keep_alive());
            entry.conn.start_writing(bytes, keep_alive);

            if let Err(e) =
                self.poll
                    .registry()
                    .register(&mut entry.stream, Token(conn_id), Interest::WRITABLE)
            {
                debug!(conn_id, error = %e, "Failed to resume connection");
                self.close_connection(conn_id);
            }
        }
    }

    fn sweep_idle(&mut self, now: Instant) {
        let timeout = self.request_timeout;
        let expired: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.is_idle(now, timeout))
            .map(|(conn_id, _)| conn_id)
            .collect();

        for conn_id in expired {
            debug!(conn_id, "Connection timed out");
            self.close_connection(conn_id);
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut entry) = self.connections.remove(conn_id) {
            // Already deregistered while a CGI job was running
            let _ = self.poll.registry().deregister(&mut entry.stream);
            debug!(
                conn_id,
                peer = %entry.peer,
                state = ?entry.conn.state(),
                lifetime_ms = entry.conn.created_at().elapsed().as_millis() as u64,
                "Connection closed"
            );
        }
    }
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "connection not found")
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for {}:{}", host, port),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
