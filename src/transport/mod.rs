//! Transport module - platform-specific pipe handling.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//!
//! On top of the raw pipes sit the two endpoint roles used by a link:
//! an [`InboundEndpoint`] that accepts and reads, and an
//! [`OutboundEndpoint`] that connects and writes.

mod endpoint;
mod pipe;

pub use endpoint::{
    EndpointState, Inbound, InboundEndpoint, OutboundEndpoint, StateCell, CONNECT_RETRY_INTERVAL,
    RECV_RETRY_DELAY,
};
pub use pipe::{
    connect_pipe, generate_pipe_token, is_retryable_connect_error, wait_for_drain, PipeAddress,
    PipeListener, PipeReader, PipeWriter, LOCAL_HOST,
};
