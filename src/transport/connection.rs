//! Client WebSocket connection.
//!
//! Owns the TCP socket, runs the [`Handshake`] once, and moves every later
//! byte through a [`FrameCodec`]. Control frames are answered here and never
//! reach the caller:
//!
//! | Inbound | Action |
//! |---------|--------|
//! | ping | reply pong with the same payload |
//! | pong | discard |
//! | close | reply close-ack, state becomes `Closed` |
//! | text / binary | returned as a [`Message`] (fragments reassembled) |
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect──► Handshaking ──101 + valid accept──► Open
//!                                │                               │
//!                                └──── any failure ──► Closed ◄──┴── close exchange (via Closing)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::frame::{CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, Frame, FrameCodec, OpCode};
use super::handshake::Handshake;

// ============================================================================
// Constants
// ============================================================================

/// Longest single read attempt; deadlines are rechecked between slices.
pub const READ_SLICE: Duration = Duration::from_millis(50);

/// How long `close()` waits for the peer's close-ack.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Write bound for [`Connection::send`] when the caller gives no deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Write bound for pong, close and close-ack frames.
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 16 * 1024;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not yet connected.
    Disconnected,
    /// TCP connected, upgrade in progress.
    Handshaking,
    /// Ready for messages.
    Open,
    /// Close frame sent or received, awaiting completion.
    Closing,
    /// Terminal.
    Closed,
}

// ============================================================================
// Message
// ============================================================================

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
}

impl Message {
    /// Returns the text content, if this is a text message.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

/// Outcome of processing the frames already buffered.
enum Inbound {
    /// A full data message.
    Message(Message),
    /// The peer closed the connection.
    Closed,
    /// Nothing complete yet.
    Pending,
}

// ============================================================================
// Connection
// ============================================================================

/// A client WebSocket connection to the remote debugging endpoint.
///
/// All methods take `&mut self`; callers sharing a connection serialize
/// access (the session keeps it behind an async mutex).
pub struct Connection {
    host: String,
    port: u16,
    path: String,
    stream: Option<TcpStream>,
    codec: FrameCodec,
    state: ConnectionState,
    /// Opcode and payload of a fragmented message in progress.
    fragments: Option<(OpCode, Vec<u8>)>,
    read_buf: Box<[u8]>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection - Constructors
// ============================================================================

impl Connection {
    /// Creates a disconnected connection to `ws://host:port/path`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            host: host.into(),
            port,
            path: if path.is_empty() { "/".to_string() } else { path },
            stream: None,
            codec: FrameCodec::new(),
            state: ConnectionState::Disconnected,
            fragments: None,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Creates a disconnected connection from a `ws://` URL.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the URL does not parse
    /// - [`Error::Config`] for non-`ws` schemes or a missing host
    pub fn from_url(ws_url: &str) -> Result<Self> {
        let url = Url::parse(ws_url)?;
        if url.scheme() != "ws" {
            return Err(Error::config(format!(
                "unsupported WebSocket scheme {:?} (only ws:// is supported)",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("WebSocket URL has no host: {ws_url}")))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self::new(host.trim_matches(['[', ']']), port, path))
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns `true` while the connection is `Open`.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Returns the remote host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the remote port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the request path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

// ============================================================================
// Connection - Lifecycle
// ============================================================================

impl Connection {
    /// Opens the socket and performs the upgrade handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if called on a connection that is not `Disconnected`
    /// - [`Error::Connection`] if the socket cannot be opened
    /// - [`Error::Handshake`] if the upgrade is rejected or invalid
    /// - [`Error::Timeout`] if `connect_timeout` elapses
    ///
    /// Any failure leaves the connection `Closed`.
    pub async fn connect(&mut self, connect_timeout: Duration) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::config(format!(
                "connect() called in state {:?}",
                self.state
            )));
        }

        let deadline = Instant::now() + connect_timeout;
        self.state = ConnectionState::Handshaking;
        debug!(host = %self.host, port = self.port, path = %self.path, "Connecting");

        match self.open_and_upgrade(deadline, connect_timeout).await {
            Ok((stream, leftover)) => {
                self.codec.feed(&leftover);
                self.stream = Some(stream);
                self.state = ConnectionState::Open;
                info!(host = %self.host, port = self.port, path = %self.path, "WebSocket connection established");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                debug!(error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    async fn open_and_upgrade(
        &self,
        deadline: Instant,
        connect_timeout: Duration,
    ) -> Result<(TcpStream, Vec<u8>)> {
        let address = (self.host.as_str(), self.port);
        let mut stream = timeout_at(deadline, TcpStream::connect(address))
            .await
            .map_err(|_| Error::timeout("tcp connect", connect_timeout.as_millis() as u64))?
            .map_err(|e| {
                Error::connection(format!("connect to {}:{} failed: {e}", self.host, self.port))
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "set_nodelay failed");
        }

        let leftover = Handshake::new()
            .perform(&mut stream, &self.host, self.port, &self.path, deadline)
            .await?;

        Ok((stream, leftover))
    }

    /// Sends a close frame, waits briefly for the close-ack and shuts the
    /// socket down. Safe to call in any state.
    ///
    /// # Errors
    ///
    /// Never fails in practice; write errors during close are logged.
    pub async fn close(&mut self) -> Result<()> {
        if self.state != ConnectionState::Open {
            self.state = ConnectionState::Closed;
            self.stream = None;
            return Ok(());
        }

        self.state = ConnectionState::Closing;
        let deadline = Instant::now() + CONTROL_WRITE_TIMEOUT;
        if let Err(e) = self.write_frame(&Frame::close(CLOSE_NORMAL, ""), deadline).await {
            debug!(error = %e, "Failed to send close frame");
        }

        let deadline = Instant::now() + CLOSE_ACK_TIMEOUT;
        while self.stream.is_some() && Instant::now() < deadline {
            match self.await_close_ack(deadline).await {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    debug!(error = %e, "Error while waiting for close-ack");
                    break;
                }
            }
        }

        self.shutdown_stream().await;
        self.state = ConnectionState::Closed;
        debug!("Connection closed");
        Ok(())
    }

    /// Reads one slice while closing; returns `true` once the ack arrived.
    async fn await_close_ack(&mut self, deadline: Instant) -> Result<bool> {
        while let Some(frame) = self.codec.decode(&[])? {
            if frame.opcode == OpCode::Close {
                return Ok(true);
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.read_slice(remaining.min(READ_SLICE)).await? {
            Some(0) => Ok(true),
            _ => Ok(false),
        }
    }

    async fn shutdown_stream(&mut self) {
        if let Some(mut stream) = self.stream.take()
            && let Err(e) = stream.shutdown().await
        {
            trace!(error = %e, "Socket shutdown failed");
        }
    }
}

// ============================================================================
// Connection - I/O
// ============================================================================

impl Connection {
    /// Sends a text message, bounded by [`DEFAULT_WRITE_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// See [`Connection::send_until`].
    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.send_until(text, Instant::now() + DEFAULT_WRITE_TIMEOUT).await
    }

    /// Sends a text message, giving up at `deadline`.
    ///
    /// A write cut short leaves a partial frame on the wire, so the
    /// connection is closed in that case.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is not open
    /// - [`Error::Connection`] if the write fails (state becomes `Closed`)
    /// - [`Error::Timeout`] if `deadline` passes mid-write (state becomes `Closed`)
    pub async fn send_until(&mut self, text: &str, deadline: Instant) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }
        trace!(len = text.len(), "Sending text frame");
        self.write_frame(&Frame::text(text), deadline).await
    }

    /// Waits up to `wait` for the next data message.
    ///
    /// Returns `Ok(None)` if the deadline passes without a message, or if
    /// the peer's close frame was processed (the state is then `Closed`).
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if already closed or the socket hit EOF
    /// - [`Error::Connection`] on socket failure
    /// - [`Error::Protocol`] on a malformed frame (state becomes `Closed`)
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + wait;

        loop {
            match self.process_buffered().await? {
                Inbound::Message(message) => return Ok(Some(message)),
                Inbound::Closed => return Ok(None),
                Inbound::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            match self.read_slice((deadline - now).min(READ_SLICE)).await? {
                Some(0) => return Err(self.fail_eof()),
                Some(_) | None => {}
            }
        }
    }

    /// Returns the next data message if one can be assembled from bytes
    /// already available on the socket, without waiting for more.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::recv`].
    pub async fn recv_nonblocking(&mut self) -> Result<Option<Message>> {
        loop {
            match self.process_buffered().await? {
                Inbound::Message(message) => return Ok(Some(message)),
                Inbound::Closed => return Ok(None),
                Inbound::Pending => {}
            }

            match self.try_read()? {
                Some(0) => return Err(self.fail_eof()),
                Some(_) => {}
                None => return Ok(None),
            }
        }
    }

    /// Reads once with a bounded wait. `Ok(None)` means the slice elapsed,
    /// `Ok(Some(0))` means EOF.
    async fn read_slice(&mut self, wait: Duration) -> Result<Option<usize>> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;

        match timeout(wait, stream.read(&mut self.read_buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(n)) => {
                self.codec.feed(&self.read_buf[..n]);
                Ok(Some(n))
            }
            Ok(Err(e)) => {
                self.mark_closed();
                Err(Error::connection(format!("read failed: {e}")))
            }
        }
    }

    /// Reads whatever is immediately available. `Ok(None)` means nothing.
    fn try_read(&mut self) -> Result<Option<usize>> {
        let stream = self.stream.as_ref().ok_or(Error::ConnectionClosed)?;

        match stream.try_read(&mut self.read_buf) {
            Ok(n) => {
                self.codec.feed(&self.read_buf[..n]);
                Ok(Some(n))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                self.mark_closed();
                Err(Error::connection(format!("read failed: {e}")))
            }
        }
    }

    /// Drains complete frames from the codec, answering control frames.
    async fn process_buffered(&mut self) -> Result<Inbound> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }

        loop {
            let frame = match self.codec.decode(&[]) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(Inbound::Pending),
                Err(e) => return Err(self.fail_protocol(e).await),
            };

            trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "Frame received");

            match frame.opcode {
                OpCode::Ping => {
                    let deadline = Instant::now() + CONTROL_WRITE_TIMEOUT;
                    self.write_frame(&Frame::new(OpCode::Pong, frame.payload), deadline)
                        .await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    self.handle_close(&frame).await;
                    return Ok(Inbound::Closed);
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    match self.assemble(frame) {
                        Ok(Some(message)) => return Ok(Inbound::Message(message)),
                        Ok(None) => {}
                        Err(e) => return Err(self.fail_protocol(e).await),
                    }
                }
            }
        }
    }

    /// Folds a data frame into the message in progress.
    fn assemble(&mut self, frame: Frame) -> Result<Option<Message>> {
        let (opcode, payload) = match (frame.opcode, self.fragments.take()) {
            (OpCode::Continuation, None) => {
                return Err(Error::protocol("continuation frame without a started message"));
            }
            (OpCode::Continuation, Some((opcode, mut data))) => {
                data.extend_from_slice(&frame.payload);
                (opcode, data)
            }
            (_, Some(_)) => {
                return Err(Error::protocol("new data frame while a fragmented message is in progress"));
            }
            (opcode, None) => (opcode, frame.payload),
        };

        if !frame.fin {
            self.fragments = Some((opcode, payload));
            return Ok(None);
        }

        match opcode {
            OpCode::Text => String::from_utf8(payload)
                .map(|text| Some(Message::Text(text)))
                .map_err(|_| Error::protocol("text message is not valid UTF-8")),
            _ => Ok(Some(Message::Binary(payload))),
        }
    }

    async fn handle_close(&mut self, frame: &Frame) {
        debug!(code = ?frame.close_code(), "Close frame received");
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Closing;
            let ack = match frame.close_code() {
                Some(code) => Frame::close(code, ""),
                None => Frame::new(OpCode::Close, Vec::new()),
            };
            let deadline = Instant::now() + CONTROL_WRITE_TIMEOUT;
            if let Err(e) = self.write_frame(&ack, deadline).await {
                debug!(error = %e, "Failed to send close-ack");
            }
        }
        self.shutdown_stream().await;
        self.state = ConnectionState::Closed;
    }

    /// Encodes and writes a frame before `deadline`; a failed or unfinished
    /// write closes the connection.
    async fn write_frame(&mut self, frame: &Frame, deadline: Instant) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let bytes = frame.to_client_bytes();
        let started = Instant::now();

        match timeout_at(deadline, stream.write_all(&bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(error = %e, opcode = ?frame.opcode, "Write failed, closing connection");
                self.mark_closed();
                Err(Error::connection(format!("write failed: {e}")))
            }
            Err(_) => {
                warn!(
                    opcode = ?frame.opcode,
                    len = bytes.len(),
                    "Write did not finish before its deadline, closing connection"
                );
                self.mark_closed();
                Err(Error::timeout(
                    "websocket write",
                    started.elapsed().as_millis() as u64,
                ))
            }
        }
    }

    async fn fail_protocol(&mut self, error: Error) -> Error {
        warn!(error = %error, "Protocol violation, closing connection");
        if self.state == ConnectionState::Open
            && let Some(stream) = self.stream.as_mut()
        {
            let bytes = Frame::close(CLOSE_PROTOCOL_ERROR, "").to_client_bytes();
            match timeout(CONTROL_WRITE_TIMEOUT, stream.write_all(&bytes)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => trace!(error = %e, "Failed to send protocol-error close frame"),
                Err(_) => trace!("Protocol-error close frame write timed out"),
            }
        }
        self.mark_closed();
        error
    }

    fn fail_eof(&mut self) -> Error {
        debug!("Socket closed by peer without close frame");
        self.mark_closed();
        Error::ConnectionClosed
    }

    fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.stream = None;
        self.fragments = None;
    }
}

// ============================================================================
// Tests
// ============================================================================
