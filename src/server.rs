//! Server builder and runtime loops.
//!
//! The [`ServerBuilder`] collects pipe names, timeouts and the optional idle
//! action. The [`Server`] then runs:
//! 1. Request loop: accept the client's request pipe, read one batch per
//!    line, call [`Service::process`] per item and send each response back
//!    over the callback pipe
//! 2. Idle watchdog (only with an idle action): runs the action after a quiet
//!    period, never while an item is being processed
//!
//! # Example
//!
//! ```ignore
//! use pipelink::{ServerBuilder, Service};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     type Request = String;
//!     type Response = String;
//!
//!     fn process(&self, request: String) -> String {
//!         format!("echo:{}", request)
//!     }
//! }
//!
//! let mut server = ServerBuilder::new("EchoService")
//!     .idle_seconds(30)
//!     .on_idle(|| println!("still here"))
//!     .build(Echo);
//! server.start().await?;
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::{JsonLineCodec, LineCodec};
use crate::config::{duration_to_millis, ServerConfig};
use crate::error::{PipeLinkError, Result};
use crate::protocol::FAILED_ITEM_FRAME;
use crate::transport::{
    EndpointState, Inbound, InboundEndpoint, OutboundEndpoint, StateCell, RECV_RETRY_DELAY,
};
use crate::watchdog::{run_watchdog, IdleHook, IdleState};

/// Application logic run by a server.
pub trait Service: Send + Sync + 'static {
    /// One item of a request batch.
    type Request: DeserializeOwned + Send + 'static;
    /// Reply to one request item.
    type Response: Serialize + Send + 'static;

    /// Called by [`Server::start`] before anything is bound.
    fn before_start(&self) {}

    /// Handle one request item.
    ///
    /// Runs on the blocking thread pool, one item at a time. A panic is
    /// reported to the client as a failed item.
    fn process(&self, request: Self::Request) -> Self::Response;
}

/// Builder for configuring and creating a server.
pub struct ServerBuilder {
    config: ServerConfig,
    on_idle: Option<IdleHook>,
}

impl ServerBuilder {
    /// Builder for service `name` with default pipe names and timeouts.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(ServerConfig::new(name))
    }

    /// Builder starting from a loaded configuration.
    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            on_idle: None,
        }
    }

    /// Override the request pipe name (default `<name>_SERVER_PIPE`).
    pub fn request_pipe_name(mut self, name: impl Into<String>) -> Self {
        self.config.request_pipe = Some(name.into());
        self
    }

    /// Override the callback pipe name (default `<name>_CALLBACK_PIPE`).
    pub fn callback_pipe_name(mut self, name: impl Into<String>) -> Self {
        self.config.callback_pipe = Some(name.into());
        self
    }

    /// Host of the client's callback pipe.
    pub fn callback_host(mut self, host: impl Into<String>) -> Self {
        self.config.callback_host = host.into();
        self
    }

    /// Quiet period before the idle action runs, in seconds.
    pub fn idle_seconds(mut self, seconds: u64) -> Self {
        self.config.idle_seconds = seconds;
        self.config.idle_threshold_override = None;
        self
    }

    /// Quiet period before the idle action runs.
    pub fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.config.idle_threshold_override = Some(threshold);
        self
    }

    /// Register the idle action. Without one the watchdog is not started.
    pub fn on_idle<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_idle = Some(Arc::new(action));
        self
    }

    /// How long to keep retrying the client's callback pipe.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = duration_to_millis(timeout);
        self
    }

    /// How long one callback frame may take to drain.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout_ms = duration_to_millis(timeout);
        self
    }

    /// Maximum accepted request line length.
    pub fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Build a server speaking JSON lines.
    pub fn build<S: Service>(self, service: S) -> Server<S> {
        self.build_with_codec(service)
    }

    /// Build a server using codec `C`.
    pub fn build_with_codec<S: Service, C: LineCodec>(self, service: S) -> Server<S, C> {
        let (shutdown_tx, _) = watch::channel(false);

        Server {
            config: self.config,
            service: Arc::new(service),
            on_idle: self.on_idle,
            idle: Arc::new(IdleState::new()),
            request_state: None,
            callback_state: None,
            shutdown_tx,
            tasks: Vec::new(),
            started: false,
            _codec: PhantomData,
        }
    }
}

/// A server bound to one request pipe.
pub struct Server<S: Service, C: LineCodec = JsonLineCodec> {
    config: ServerConfig,
    service: Arc<S>,
    on_idle: Option<IdleHook>,
    idle: Arc<IdleState>,
    request_state: Option<StateCell>,
    callback_state: Option<StateCell>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    _codec: PhantomData<fn() -> C>,
}

impl<S: Service, C: LineCodec> Server<S, C> {
    /// Bind the request pipe and start the loops.
    ///
    /// Runs [`Service::before_start`] first. Fails with `AlreadyStarted` once
    /// a previous call has succeeded; a failed bind leaves the server
    /// startable.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(PipeLinkError::AlreadyStarted);
        }

        self.service.before_start();

        let inbound =
            InboundEndpoint::bind(self.config.request_address(), self.config.max_line_length)
                .await?;
        self.started = true;
        let outbound = OutboundEndpoint::new(
            self.config.callback_address(),
            self.config.connect_timeout(),
            self.config.drain_timeout(),
        );
        self.request_state = Some(inbound.state_cell());
        self.callback_state = Some(outbound.state_cell());

        self.idle.touch();

        if let Some(hook) = &self.on_idle {
            self.tasks.push(tokio::spawn(run_watchdog(
                self.idle.clone(),
                self.config.idle_threshold(),
                hook.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        self.tasks.push(tokio::spawn(run_requests::<S, C>(
            self.service.clone(),
            inbound,
            outbound,
            self.idle.clone(),
            self.shutdown_tx.subscribe(),
        )));

        tracing::info!(
            request_pipe = %self.config.request_pipe_name(),
            callback_pipe = %self.config.callback_pipe_name(),
            "Server started"
        );
        Ok(())
    }

    /// Stop both loops, close both pipes and wait for the tasks to finish.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Server task ended abnormally");
            }
        }
        tracing::debug!(request_pipe = %self.config.request_pipe_name(), "Server stopped");
    }

    /// Whether the idle action is running right now.
    pub fn is_idle_action_running(&self) -> bool {
        self.idle.is_busy()
    }

    /// Time since the last processed item (or the last idle action).
    pub fn idle_for(&self) -> Duration {
        self.idle.idle_for()
    }

    /// State of the request pipe (acceptor).
    pub fn request_state(&self) -> EndpointState {
        self.request_state
            .as_ref()
            .map(StateCell::get)
            .unwrap_or(EndpointState::Disconnected)
    }

    /// State of the callback pipe (connector).
    pub fn callback_state(&self) -> EndpointState {
        self.callback_state
            .as_ref()
            .map(StateCell::get)
            .unwrap_or(EndpointState::Disconnected)
    }

    /// Effective configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<S: Service, C: LineCodec> Drop for Server<S, C> {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Request loop: one batch per line, one callback per item.
async fn run_requests<S: Service, C: LineCodec>(
    service: Arc<S>,
    mut inbound: InboundEndpoint,
    mut outbound: OutboundEndpoint,
    idle: Arc<IdleState>,
    mut shutdown: watch::Receiver<bool>,
) {
    'serve: loop {
        let received = tokio::select! {
            result = inbound.recv() => result,
            _ = shutdown.changed() => break,
        };

        let line = match received {
            Ok(Inbound::Line(line)) => line,
            Ok(Inbound::PeerClosed) => {
                inbound.disconnect();
                continue;
            }
            Err(e) => {
                tracing::warn!(pipe = %inbound.address(), error = %e, "Request pipe failed");
                inbound.disconnect();
                tokio::select! {
                    _ = tokio::time::sleep(RECV_RETRY_DELAY) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        let batch: Vec<S::Request> = match C::decode(&line) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed request batch");
                continue;
            }
        };
        tracing::debug!(items = batch.len(), "Request batch received");

        for request in batch {
            let processed = {
                let _activity = tokio::select! {
                    guard = idle.begin_activity() => guard,
                    _ = shutdown.changed() => break 'serve,
                };

                let service = service.clone();
                let result = tokio::task::spawn_blocking(move || service.process(request)).await;
                idle.touch();
                result
            };

            // One callback line per item, failed ones included
            let line = match processed {
                Ok(response) => match C::encode(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode response");
                        FAILED_ITEM_FRAME.to_string()
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Request processing failed");
                    FAILED_ITEM_FRAME.to_string()
                }
            };

            let sent = tokio::select! {
                result = outbound.send_line(&line) => result,
                _ = shutdown.changed() => break 'serve,
            };
            if let Err(e) = sent {
                tracing::warn!(pipe = %outbound.address(), error = %e, "Failed to deliver callback");
            }
        }
    }

    inbound.close();
    outbound.close();
    tracing::debug!("Request loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Service for Upper {
        type Request = String;
        type Response = String;

        fn process(&self, request: String) -> String {
            request.to_uppercase()
        }
    }

    #[test]
    fn test_builder_applies_overrides() {
        let server = ServerBuilder::new("Svc")
            .request_pipe_name("in")
            .callback_pipe_name("out")
            .callback_host("/run/svc")
            .idle_threshold(Duration::from_millis(250))
            .drain_timeout(Duration::from_secs(2))
            .build(Upper);

        let config = server.config();
        assert_eq!(config.request_pipe_name(), "in");
        assert_eq!(config.callback_address().host(), "/run/svc");
        assert_eq!(config.idle_threshold(), Duration::from_millis(250));
        assert_eq!(config.drain_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_builder_timeouts_saturate() {
        let server = ServerBuilder::new("Svc")
            .connect_timeout(Duration::MAX)
            .drain_timeout(Duration::MAX)
            .build(Upper);

        assert_eq!(server.config().connect_timeout_ms, u64::MAX);
        assert_eq!(server.config().drain_timeout_ms, u64::MAX);
    }

    #[test]
    fn test_idle_seconds_replaces_threshold_override() {
        let server = ServerBuilder::new("Svc")
            .idle_threshold(Duration::from_millis(250))
            .idle_seconds(3)
            .build(Upper);

        assert_eq!(server.config().idle_threshold(), Duration::from_secs(3));
    }

    #[test]
    fn test_states_before_start() {
        let server = ServerBuilder::new("Svc").build(Upper);

        assert_eq!(server.request_state(), EndpointState::Disconnected);
        assert_eq!(server.callback_state(), EndpointState::Disconnected);
        assert!(!server.is_idle_action_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_twice_fails_and_shutdown_closes() {
        let name = format!("pipelink-server-{}", crate::transport::generate_pipe_token());
        let mut server = ServerBuilder::new(name).build(Upper);

        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(PipeLinkError::AlreadyStarted)
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.request_state(), EndpointState::Accepting);

        server.shutdown().await;
        assert_eq!(server.request_state(), EndpointState::Closed);
        assert_eq!(server.callback_state(), EndpointState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_bind_leaves_server_startable() {
        let dir_name = format!("pipelink-dir-{}", crate::transport::generate_pipe_token());
        let dir = std::env::temp_dir().join(&dir_name);
        let mut server = ServerBuilder::new("Svc")
            .request_pipe_name(format!("{}/svc", dir_name))
            .build(Upper);

        assert!(matches!(server.start().await, Err(PipeLinkError::Io(_))));
        assert_eq!(server.request_state(), EndpointState::Disconnected);

        std::fs::create_dir(&dir).unwrap();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(PipeLinkError::AlreadyStarted)
        ));

        server.shutdown().await;
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_before_start_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counted(Arc<AtomicUsize>);
        impl Service for Counted {
            type Request = u32;
            type Response = u32;

            fn before_start(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }

            fn process(&self, request: u32) -> u32 {
                request
            }
        }

        let starts = Arc::new(AtomicUsize::new(0));
        let name = format!("pipelink-hook-{}", crate::transport::generate_pipe_token());
        let mut server = ServerBuilder::new(name).build(Counted(starts.clone()));

        server.start().await.unwrap();
        let _ = server.start().await;
        server.shutdown().await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }
}
