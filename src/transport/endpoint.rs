//! Endpoint state machines for the two pipe roles.
//!
//! - [`InboundEndpoint`]: acceptor. Listens on a pipe, accepts one peer at a
//!   time and reads line frames from it.
//! - [`OutboundEndpoint`]: connector. Connects lazily on first send, writes
//!   line frames and waits for each one to drain.
//!
//! ```text
//! Inbound:  Disconnected ─► Accepting ─► Connected ─(EOF)─► Disconnected ...
//! Outbound: Disconnected ─► Connecting ─► Connected ─(broken pipe)─► Disconnected ...
//! Both:     any ─(close)─► Closed
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::pipe::{
    connect_pipe, is_retryable_connect_error, wait_for_drain, PipeAddress, PipeListener,
    PipeReader, PipeWriter,
};
use crate::error::{PipeLinkError, Result};
use crate::protocol::{write_frame, FrameReader};

/// Delay between connect attempts while the peer pipe does not exist yet.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Pause before a receive loop retries after an accept or read failure.
pub const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection state of one pipe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    /// No peer and not waiting for one.
    Disconnected = 0,
    /// Listening for a peer to connect.
    Accepting = 1,
    /// Trying to reach the peer's listener.
    Connecting = 2,
    /// Exactly one live peer.
    Connected = 3,
    /// Handle released; the endpoint is unusable.
    Closed = 4,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EndpointState::Accepting,
            2 => EndpointState::Connecting,
            3 => EndpointState::Connected,
            4 => EndpointState::Closed,
            _ => EndpointState::Disconnected,
        }
    }
}

/// Shared, lock-free view of an endpoint's state.
///
/// The endpoint itself lives inside a receive loop; clones of this cell let
/// the owning component report the state without touching the endpoint.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    /// New cell in `Disconnected`.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(EndpointState::Disconnected as u8)))
    }

    /// Current state.
    #[inline]
    pub fn get(&self) -> EndpointState {
        EndpointState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn set(&self, state: EndpointState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one [`InboundEndpoint::recv`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// One complete frame.
    Line(String),
    /// The peer closed its end.
    PeerClosed,
}

/// Listening endpoint that reads frames from one peer at a time.
pub struct InboundEndpoint {
    address: PipeAddress,
    listener: Option<PipeListener>,
    reader: Option<FrameReader<PipeReader>>,
    state: StateCell,
    max_line_length: usize,
}

impl InboundEndpoint {
    /// Create the listener for `address`.
    pub async fn bind(address: PipeAddress, max_line_length: usize) -> Result<Self> {
        let listener = PipeListener::bind(&address).await?;
        tracing::debug!(pipe = %address, "Listening");

        Ok(Self {
            address,
            listener: Some(listener),
            reader: None,
            state: StateCell::new(),
            max_line_length,
        })
    }

    /// Accept a peer if none is connected, then read one frame.
    pub async fn recv(&mut self) -> Result<Inbound> {
        if self.reader.is_none() {
            let listener = self.listener.as_mut().ok_or(PipeLinkError::Disposed)?;

            self.state.set(EndpointState::Accepting);
            let reader = listener.accept().await?;
            tracing::debug!(pipe = %self.address, "Peer connected");

            self.reader = Some(FrameReader::with_max_line_length(reader, self.max_line_length));
            self.state.set(EndpointState::Connected);
        }

        let reader = self.reader.as_mut().ok_or(PipeLinkError::NotConnected)?;
        match reader.next_line().await? {
            Some(line) => Ok(Inbound::Line(line)),
            None => Ok(Inbound::PeerClosed),
        }
    }

    /// Drop the current peer; the next `recv` waits for a new one.
    pub fn disconnect(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(pipe = %self.address, "Peer disconnected");
        }
        if self.listener.is_some() {
            self.state.set(EndpointState::Disconnected);
        }
    }

    /// Release the peer connection and the listener.
    pub fn close(&mut self) {
        self.reader = None;
        if self.listener.take().is_some() {
            tracing::debug!(pipe = %self.address, "Listener closed");
        }
        self.state.set(EndpointState::Closed);
    }

    /// Address this endpoint listens on.
    pub fn address(&self) -> &PipeAddress {
        &self.address
    }

    /// Current state.
    pub fn state(&self) -> EndpointState {
        self.state.get()
    }

    /// Shared state cell for observers outside the receive loop.
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }
}

/// Connecting endpoint that writes frames with drain-wait.
pub struct OutboundEndpoint {
    address: PipeAddress,
    writer: Option<PipeWriter>,
    state: StateCell,
    connect_timeout: Duration,
    drain_timeout: Duration,
}

impl OutboundEndpoint {
    /// Create a disconnected endpoint; nothing is opened until the first send.
    pub fn new(address: PipeAddress, connect_timeout: Duration, drain_timeout: Duration) -> Self {
        Self {
            address,
            writer: None,
            state: StateCell::new(),
            connect_timeout,
            drain_timeout,
        }
    }

    /// Write one frame, connecting first if needed, and wait until the peer
    /// has read it.
    ///
    /// A write that fails on a previously established connection because the
    /// peer went away is retried once on a fresh connection.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        if self.state.get() == EndpointState::Closed {
            return Err(PipeLinkError::Disposed);
        }

        let reused = self.writer.is_some();
        match self.try_send(line).await {
            Err(e) if reused && e.is_disconnect() => {
                tracing::debug!(pipe = %self.address, error = %e, "Stale connection, reconnecting");
                self.try_send(line).await
            }
            result => result,
        }
    }

    async fn try_send(&mut self, line: &str) -> Result<()> {
        if self.writer.is_none() {
            let writer = self.connect().await?;
            self.writer = Some(writer);
        }
        let writer = self.writer.as_mut().ok_or(PipeLinkError::NotConnected)?;

        let drained = async {
            write_frame(writer, line).await?;
            wait_for_drain(writer).await?;
            Ok::<_, PipeLinkError>(())
        };

        match tokio::time::timeout(self.drain_timeout, drained).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.disconnect();
                Err(e)
            }
            Err(_) => {
                self.disconnect();
                Err(PipeLinkError::DrainTimeout(self.address.to_string()))
            }
        }
    }

    /// Connect, retrying while the peer's listener does not exist yet.
    async fn connect(&mut self) -> Result<PipeWriter> {
        self.state.set(EndpointState::Connecting);
        let deadline = Instant::now().checked_add(self.connect_timeout);

        loop {
            match connect_pipe(&self.address).await {
                Ok(writer) => {
                    tracing::debug!(pipe = %self.address, "Connected");
                    self.state.set(EndpointState::Connected);
                    return Ok(writer);
                }
                Err(e) if is_retryable_connect_error(&e) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        self.state.set(EndpointState::Disconnected);
                        return Err(PipeLinkError::ConnectTimeout(self.address.to_string()));
                    }
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    self.state.set(EndpointState::Disconnected);
                    return Err(e.into());
                }
            }
        }
    }

    /// Drop the current connection; the next send reconnects.
    pub fn disconnect(&mut self) {
        if self.writer.take().is_some() {
            tracing::debug!(pipe = %self.address, "Disconnected");
        }
        if self.state.get() != EndpointState::Closed {
            self.state.set(EndpointState::Disconnected);
        }
    }

    /// Release the connection; further sends fail with `Disposed`.
    pub fn close(&mut self) {
        self.writer = None;
        self.state.set(EndpointState::Closed);
    }

    /// Whether a peer connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Address this endpoint connects to.
    pub fn address(&self) -> &PipeAddress {
        &self.address
    }

    /// Current state.
    pub fn state(&self) -> EndpointState {
        self.state.get()
    }

    /// Shared state cell for observers outside the owning task.
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }
}
