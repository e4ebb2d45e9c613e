//! Poll-based network front end.
//!
//! One reactor owns the listener and every accepted connection. Sockets
//! only ever exchange raw bytes with the app; framing, execution and
//! reply serialization happen behind `ServerApp::ingest_bytes`. The run
//! loop wraps each poll in the sleep hooks and drives the cron off the
//! poll timeout, so maintenance interleaves with traffic exactly once per
//! tick.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use ember_common::config::RuntimeConfig;
use ember_common::error::{EmberError, EmberResult};
use ember_common::ids::ClientId;
use ember_core::containers::HotMap;

use crate::app::ServerApp;
use crate::cron::{server_cron, CronAction};
use crate::hooks::{after_sleep, before_sleep};

const LISTENER_TOKEN: Token = Token(0);
const CONNECTION_TOKEN_START: usize = 1;
const READ_CHUNK_BYTES: usize = 16 * 1024;
const MAX_EVENTS: usize = 1024;
/// Write-buffer size at which a connection stops reading new input.
const WRITE_HIGH_WATERMARK: usize = 1024 * 1024;
/// Write-buffer size at which a paused connection resumes reading.
const WRITE_LOW_WATERMARK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionLifecycle {
    Active,
    Draining,
    Closing,
}

#[derive(Debug)]
struct ReactorConnection {
    socket: TcpStream,
    client: ClientId,
    write_buffer: Vec<u8>,
    lifecycle: ConnectionLifecycle,
    interest: Interest,
    read_paused: bool,
}

impl ReactorConnection {
    fn mark_draining(&mut self) {
        if self.lifecycle == ConnectionLifecycle::Active {
            self.lifecycle = ConnectionLifecycle::Draining;
        }
    }

    fn should_close_now(&self) -> bool {
        self.lifecycle == ConnectionLifecycle::Closing
            || (self.lifecycle == ConnectionLifecycle::Draining && self.write_buffer.is_empty())
    }

    fn update_backpressure(&mut self) {
        if self.read_paused {
            if self.write_buffer.len() <= WRITE_LOW_WATERMARK {
                self.read_paused = false;
            }
            return;
        }
        if self.write_buffer.len() >= WRITE_HIGH_WATERMARK {
            self.read_paused = true;
        }
    }
}

/// The single poll reactor.
#[derive(Debug)]
pub struct ServerReactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    next_token: usize,
    connections: HotMap<Token, ReactorConnection>,
    tokens_by_client: HotMap<ClientId, Token>,
}

impl ServerReactor {
    /// Binds the listener and registers it with the poller.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::Io` when binding or registration fails.
    pub fn bind(addr: SocketAddr) -> EmberResult<Self> {
        let poll =
            Poll::new().map_err(|error| EmberError::Io(format!("create poll failed: {error}")))?;
        let mut listener = TcpListener::bind(addr)
            .map_err(|error| EmberError::Io(format!("bind listener failed: {error}")))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|error| EmberError::Io(format!("register listener failed: {error}")))?;

        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            listener,
            next_token: CONNECTION_TOKEN_START,
            connections: HotMap::new(),
            tokens_by_client: HotMap::new(),
        })
    }

    /// Bound listener address.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::Io` when the socket cannot report its address.
    pub fn local_addr(&self) -> EmberResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|error| EmberError::Io(format!("query local address failed: {error}")))
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// One readiness cycle wrapped by the sleep hooks.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::Io` when polling or socket registration fails.
    pub fn poll_once(&mut self, app: &mut ServerApp, timeout: Option<Duration>) -> EmberResult<usize> {
        before_sleep(app);
        self.route_app_output(app)?;

        self.poll
            .poll(&mut self.events, timeout)
            .map_err(|error| EmberError::Io(format!("poll wait failed: {error}")))?;
        after_sleep(app);

        let ready: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable(),
                    event.is_writable(),
                    event.is_read_closed() || event.is_write_closed() || event.is_error(),
                )
            })
            .collect();

        for (token, readable, writable, closed) in &ready {
            if *token == LISTENER_TOKEN {
                self.accept_connections(app)?;
                continue;
            }
            self.handle_connection_event(app, *token, *readable, *writable, *closed)?;
        }

        self.route_app_output(app)?;
        self.drop_orphaned_connections(app)?;
        Ok(ready.len())
    }

    /// Serves until a clean shutdown completes.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::Io` when the poller fails unrecoverably.
    pub fn run(&mut self, app: &mut ServerApp) -> EmberResult<()> {
        loop {
            let tick = Duration::from_millis(RuntimeConfig::tick_period_ms(app.state.hz));
            let _ = self.poll_once(app, Some(tick))?;
            if server_cron(app) == CronAction::Shutdown {
                tracing::info!("clean shutdown complete");
                return Ok(());
            }
        }
    }

    fn accept_connections(&mut self, app: &mut ServerApp) -> EmberResult<()> {
        loop {
            match self.listener.accept() {
                Ok((mut socket, _peer)) => {
                    let token = Token(self.next_token);
                    self.next_token = self.next_token.saturating_add(1);
                    self.poll
                        .registry()
                        .register(&mut socket, token, Interest::READABLE)
                        .map_err(|error| {
                            EmberError::Io(format!("register connection failed: {error}"))
                        })?;
                    let _ = socket.set_nodelay(true);
                    let client = app.create_session();
                    let _ = self.tokens_by_client.insert(client, token);
                    let _ = self.connections.insert(
                        token,
                        ReactorConnection {
                            socket,
                            client,
                            write_buffer: Vec::new(),
                            lifecycle: ConnectionLifecycle::Active,
                            interest: Interest::READABLE,
                            read_paused: false,
                        },
                    );
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) => {
                    return Err(EmberError::Io(format!("accept failed: {error}")));
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        app: &mut ServerApp,
        token: Token,
        readable: bool,
        writable: bool,
        closed: bool,
    ) -> EmberResult<()> {
        let Some(mut connection) = self.connections.remove(&token) else {
            return Ok(());
        };

        if closed {
            connection.mark_draining();
        }
        if readable && connection.lifecycle == ConnectionLifecycle::Active && !connection.read_paused
        {
            Self::read_socket_bytes(app, &mut connection);
        }
        if writable && !connection.write_buffer.is_empty() {
            Self::flush_socket_writes(&mut connection);
        }
        connection.update_backpressure();

        if connection.should_close_now() {
            self.close_connection(app, connection)?;
            return Ok(());
        }
        self.refresh_interest(token, &mut connection)?;
        let _ = self.connections.insert(token, connection);
        Ok(())
    }

    fn read_socket_bytes(app: &mut ServerApp, connection: &mut ReactorConnection) {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            match connection.socket.read(&mut chunk) {
                Ok(0) => {
                    connection.mark_draining();
                    return;
                }
                Ok(read_len) => match app.ingest_bytes(connection.client, &chunk[..read_len]) {
                    Ok(reply_bytes) => {
                        connection.write_buffer.extend_from_slice(&reply_bytes);
                        connection.update_backpressure();
                        if connection.read_paused {
                            // Leave the remaining input in kernel buffers
                            // until the peer drains some replies.
                            return;
                        }
                    }
                    Err(error) => {
                        let message = format!("-ERR protocol error: {error}\r\n");
                        connection.write_buffer.extend_from_slice(message.as_bytes());
                        connection.mark_draining();
                        return;
                    }
                },
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_error) => {
                    connection.lifecycle = ConnectionLifecycle::Closing;
                    return;
                }
            }
        }
    }

    fn flush_socket_writes(connection: &mut ReactorConnection) {
        while !connection.write_buffer.is_empty() {
            match connection.socket.write(connection.write_buffer.as_slice()) {
                Ok(0) => {
                    connection.lifecycle = ConnectionLifecycle::Closing;
                    return;
                }
                Ok(written) => {
                    let _ = connection.write_buffer.drain(..written);
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_error) => {
                    connection.lifecycle = ConnectionLifecycle::Closing;
                    return;
                }
            }
        }
    }

    /// Moves serialized reply bytes produced outside the read path (worker
    /// results, deferred unblocks) into their connection buffers.
    fn route_app_output(&mut self, app: &mut ServerApp) -> EmberResult<()> {
        for (client, bytes) in app.take_encoded_output() {
            let Some(token) = self.tokens_by_client.get(&client).copied() else {
                continue;
            };
            let Some(connection) = self.connections.get_mut(&token) else {
                continue;
            };
            connection.write_buffer.extend_from_slice(&bytes);
            Self::flush_socket_writes(connection);
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            if let Some(mut connection) = self.connections.remove(&token) {
                if connection.should_close_now() {
                    self.close_connection(app, connection)?;
                } else {
                    self.refresh_interest(token, &mut connection)?;
                    let _ = self.connections.insert(token, connection);
                }
            }
        }
        Ok(())
    }

    /// Closes sockets whose logical session the app already released
    /// (QUIT, idle timeout) once their output drained.
    fn drop_orphaned_connections(&mut self, app: &mut ServerApp) -> EmberResult<()> {
        let orphaned: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, connection)| app.session(connection.client).is_none())
            .map(|(token, _)| *token)
            .collect();
        for token in orphaned {
            if let Some(mut connection) = self.connections.remove(&token) {
                connection.mark_draining();
                if connection.should_close_now() {
                    self.close_connection(app, connection)?;
                } else {
                    let _ = self.connections.insert(token, connection);
                }
            }
        }
        Ok(())
    }

    fn refresh_interest(
        &self,
        token: Token,
        connection: &mut ReactorConnection,
    ) -> EmberResult<()> {
        let mut wanted = if connection.read_paused {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if !connection.write_buffer.is_empty() {
            wanted = wanted.add(Interest::WRITABLE);
        }
        if wanted == connection.interest {
            return Ok(());
        }
        self.poll
            .registry()
            .reregister(&mut connection.socket, token, wanted)
            .map_err(|error| EmberError::Io(format!("refresh interest failed: {error}")))?;
        connection.interest = wanted;
        Ok(())
    }

    fn close_connection(
        &mut self,
        app: &mut ServerApp,
        mut connection: ReactorConnection,
    ) -> EmberResult<()> {
        self.poll
            .registry()
            .deregister(&mut connection.socket)
            .map_err(|error| EmberError::Io(format!("deregister connection failed: {error}")))?;
        let _ = self.tokens_by_client.remove(&connection.client);
        app.disconnect_session(connection.client);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ServerReactor;
    use crate::app::ServerApp;
    use ember_common::config::RuntimeConfig;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn read_until(stream: &mut TcpStream, expected: &[u8], deadline: Instant) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut chunk = [0_u8; 1024];
        while collected.len() < expected.len() && Instant::now() < deadline {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(read_len) => collected.extend_from_slice(&chunk[..read_len]),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) if error.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => break,
            }
        }
        collected
    }

    #[rstest]
    fn reactor_serves_a_set_get_round_trip() {
        let mut app = ServerApp::new(RuntimeConfig::default()).expect("valid config");
        let mut reactor =
            ServerReactor::bind("127.0.0.1:0".parse().expect("loopback address")).expect("bind");
        let addr = reactor.local_addr().expect("bound address");

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("read timeout");
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
            .expect("send commands");

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut received = Vec::new();
        let expected = b"+OK\r\n$3\r\nbar\r\n";
        while received.len() < expected.len() && Instant::now() < deadline {
            let _ = reactor
                .poll_once(&mut app, Some(Duration::from_millis(10)))
                .expect("poll");
            received.extend_from_slice(&read_until(&mut client, &expected[received.len()..], Instant::now() + Duration::from_millis(30)));
        }
        assert_that!(&received, eq(&expected.to_vec()));
        assert_that!(reactor.connection_count(), eq(1_usize));
    }

    #[rstest]
    fn quit_closes_the_connection_after_the_reply() {
        let mut app = ServerApp::new(RuntimeConfig::default()).expect("valid config");
        let mut reactor =
            ServerReactor::bind("127.0.0.1:0".parse().expect("loopback address")).expect("bind");
        let addr = reactor.local_addr().expect("bound address");

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("read timeout");
        client
            .write_all(b"*1\r\n$4\r\nQUIT\r\n")
            .expect("send quit");

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut received = Vec::new();
        while received.len() < 5 && Instant::now() < deadline {
            let _ = reactor
                .poll_once(&mut app, Some(Duration::from_millis(10)))
                .expect("poll");
            received.extend_from_slice(&read_until(&mut client, b"+OK\r\n", Instant::now() + Duration::from_millis(30)));
        }
        assert_that!(&received, eq(&b"+OK\r\n".to_vec()));

        let deadline = Instant::now() + Duration::from_secs(3);
        while reactor.connection_count() > 0 && Instant::now() < deadline {
            let _ = reactor
                .poll_once(&mut app, Some(Duration::from_millis(10)))
                .expect("poll");
        }
        assert_that!(reactor.connection_count(), eq(0_usize));
        assert_that!(app.sessions.is_empty(), eq(true));
    }
}
