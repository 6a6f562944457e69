//! Client builder and callback loop.
//!
//! The [`ClientBuilder`] collects pipe names, timeouts, lifecycle hooks and
//! an optional [`ServerBootstrap`]. The [`Client`] manages the lifecycle:
//! 1. Run the pre-connect hook and make sure the server process is up
//! 2. Listen on the callback pipe and start the callback loop
//! 3. Send request batches, connecting the request pipe on first use
//! 4. Fan every response out to the subscribed observers
//!
//! # Example
//!
//! ```ignore
//! use pipelink::subscription::Notification;
//! use pipelink::ClientBuilder;
//!
//! let mut client = ClientBuilder::new("EchoService").build::<String, String>();
//! client.connect().await?;
//!
//! let (_subscription, mut events) = client.subscribe_channel();
//! client.send_request(&["hello".to_string()]).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if event == Notification::Completed {
//!         break;
//!     }
//! }
//! client.dispose().await?;
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::batch::{BatchProgress, BatchTracker};
use crate::bootstrap::ServerBootstrap;
use crate::codec::{JsonLineCodec, LineCodec};
use crate::config::{duration_to_millis, random_callback_pipe_name, ClientConfig};
use crate::error::{PipeLinkError, Result};
use crate::protocol::FAILED_ITEM_FRAME;
use crate::subscription::{ChannelObserver, Notification, Observer, Subscription, SubscriptionRegistry};
use crate::transport::{
    EndpointState, Inbound, InboundEndpoint, OutboundEndpoint, StateCell, RECV_RETRY_DELAY,
};

/// Hook run at a lifecycle boundary.
pub type LifecycleHook = Box<dyn Fn() + Send + Sync>;

/// Builder for configuring and creating a client.
pub struct ClientBuilder {
    config: ClientConfig,
    before_connect: Option<LifecycleHook>,
    after_end: Option<LifecycleHook>,
    bootstrap: Option<ServerBootstrap>,
}

impl ClientBuilder {
    /// Builder for service `name` with default pipe names and timeouts.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(name))
    }

    /// Builder starting from a loaded configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            before_connect: None,
            after_end: None,
            bootstrap: None,
        }
    }

    /// Override the request pipe name (default `<name>_SERVER_PIPE`).
    pub fn server_pipe_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_pipe = Some(name.into());
        self
    }

    /// Override the callback pipe name (default `<name>_CALLBACK_PIPE`).
    pub fn callback_pipe_name(mut self, name: impl Into<String>) -> Self {
        self.config.callback_pipe = Some(name.into());
        self
    }

    /// Listen for callbacks on a fresh `<random>_CALLBACK_PIPE`.
    ///
    /// The server must then be told this name explicitly.
    pub fn random_callback_pipe(mut self) -> Self {
        self.config.callback_pipe = Some(random_callback_pipe_name());
        self
    }

    /// Host of the server's request pipe.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// How long to keep retrying the server's request pipe.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = duration_to_millis(timeout);
        self
    }

    /// How long one request frame may take to drain.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout_ms = duration_to_millis(timeout);
        self
    }

    /// Maximum accepted callback line length.
    pub fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Hook run at the start of [`Client::connect`].
    pub fn before_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_connect = Some(Box::new(hook));
        self
    }

    /// Hook run at the end of [`Client::dispose`].
    pub fn after_end<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.after_end = Some(Box::new(hook));
        self
    }

    /// Launch the server on connect and terminate it on dispose.
    pub fn bootstrap(mut self, bootstrap: ServerBootstrap) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Build a client speaking JSON lines.
    pub fn build<Req, Resp>(self) -> Client<Req, Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + Sync + 'static,
    {
        self.build_with_codec()
    }

    /// Build a client using codec `C`.
    pub fn build_with_codec<Req, Resp, C>(self) -> Client<Req, Resp, C>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + Sync + 'static,
        C: LineCodec,
    {
        let outbound = OutboundEndpoint::new(
            self.config.server_address(),
            self.config.connect_timeout(),
            self.config.drain_timeout(),
        );
        let request_state = outbound.state_cell();
        let (shutdown_tx, _) = watch::channel(false);

        Client {
            config: self.config,
            registry: Arc::new(SubscriptionRegistry::new()),
            batches: Arc::new(BatchTracker::new()),
            outbound: Mutex::new(outbound),
            request_state,
            callback_state: StateCell::new(),
            shutdown_tx,
            callback_task: None,
            bootstrap: self.bootstrap.map(Arc::new),
            before_connect: self.before_connect,
            after_end: self.after_end,
            disposed: false,
            _marker: PhantomData,
        }
    }
}

/// A client that sends request batches and receives per-item callbacks.
pub struct Client<Req, Resp, C = JsonLineCodec> {
    config: ClientConfig,
    registry: Arc<SubscriptionRegistry<Resp>>,
    batches: Arc<BatchTracker>,
    outbound: Mutex<OutboundEndpoint>,
    request_state: StateCell,
    callback_state: StateCell,
    shutdown_tx: watch::Sender<bool>,
    callback_task: Option<JoinHandle<()>>,
    bootstrap: Option<Arc<ServerBootstrap>>,
    before_connect: Option<LifecycleHook>,
    after_end: Option<LifecycleHook>,
    disposed: bool,
    _marker: PhantomData<fn(Req) -> C>,
}

impl<Req, Resp, C> Client<Req, Resp, C>
where
    Req: Serialize,
    Resp: DeserializeOwned + Send + Sync + 'static,
    C: LineCodec,
{
    /// Start listening for callbacks.
    ///
    /// Runs the pre-connect hook, launches the bootstrapped server if it is
    /// not running, binds the callback pipe and starts the callback loop.
    /// The request pipe is connected lazily by the first send.
    pub async fn connect(&mut self) -> Result<()> {
        if self.disposed {
            return Err(PipeLinkError::Disposed);
        }
        if self.callback_task.is_some() {
            return Err(PipeLinkError::AlreadyStarted);
        }

        if let Some(hook) = &self.before_connect {
            hook();
        }

        if let Some(bootstrap) = &self.bootstrap {
            let bootstrap = bootstrap.clone();
            tokio::task::spawn_blocking(move || bootstrap.ensure_running())
                .await
                .map_err(|e| PipeLinkError::Bootstrap(e.to_string()))??;
        }

        let inbound =
            InboundEndpoint::bind(self.config.callback_address(), self.config.max_line_length)
                .await?;
        self.callback_state = inbound.state_cell();

        self.callback_task = Some(tokio::spawn(run_callbacks::<Resp, C>(
            inbound,
            self.registry.clone(),
            self.batches.clone(),
            self.shutdown_tx.subscribe(),
        )));

        tracing::info!(
            server_pipe = %self.config.server_pipe_name(),
            callback_pipe = %self.config.callback_pipe_name(),
            "Client connected"
        );
        Ok(())
    }

    /// Register an observer for responses.
    ///
    /// Subscribing the same `Arc` twice returns a handle to the existing
    /// registration; responses are never delivered twice. The observer stays
    /// registered while a handle to it is alive.
    pub fn subscribe<O: Observer<Resp>>(&self, observer: Arc<O>) -> Subscription {
        self.registry.subscribe(observer)
    }

    /// Register a channel-backed observer and return its receiver.
    pub fn subscribe_channel(
        &self,
    ) -> (Subscription, mpsc::UnboundedReceiver<Notification<Resp>>)
    where
        Resp: Clone,
    {
        let (observer, rx) = ChannelObserver::new();
        (self.registry.subscribe(Arc::new(observer)), rx)
    }

    /// Send one batch and wait until the server pipe has taken it.
    ///
    /// Observers then receive one `on_next` per item followed by a single
    /// `on_completed`. An empty batch completes right away.
    pub async fn send_request(&self, batch: &[Req]) -> Result<()> {
        if self.disposed {
            return Err(PipeLinkError::Disposed);
        }
        if self.callback_task.is_none() {
            return Err(PipeLinkError::NotConnected);
        }

        let line = C::encode(&batch)?;

        let mut outbound = self.outbound.lock().await;
        let armed = self.batches.arm(batch.len());

        match outbound.send_line(&line).await {
            Ok(()) => {
                tracing::debug!(items = batch.len(), "Request batch sent");
                if !armed {
                    self.registry.notify_completed();
                }
                Ok(())
            }
            Err(e) => {
                if armed {
                    self.batches.abandon_last();
                }
                Err(e)
            }
        }
    }

    /// Tear the client down.
    ///
    /// Every step is attempted even if an earlier one fails: observers are
    /// cleared, the callback loop stopped, both pipes closed, the
    /// bootstrapped server terminated and the post-teardown hook run. The
    /// first failure is returned.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        self.registry.clear();
        self.shutdown_tx.send_replace(true);

        let mut first_error: Option<PipeLinkError> = None;

        self.outbound.lock().await.close();

        // The loop closes the callback pipe on its way out
        if let Some(task) = self.callback_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Callback loop ended abnormally");
                first_error.get_or_insert(PipeLinkError::Io(std::io::Error::other(e)));
            }
        }

        if let Some(bootstrap) = self.bootstrap.take() {
            match tokio::task::spawn_blocking(move || bootstrap.terminate()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to terminate server");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(PipeLinkError::Bootstrap(e.to_string()));
                }
            }
        }

        let abandoned = self.batches.reset();
        if abandoned > 0 {
            tracing::debug!(responses = abandoned, "Disposed with responses outstanding");
        }

        if let Some(hook) = &self.after_end {
            hook();
        }

        tracing::debug!(callback_pipe = %self.config.callback_pipe_name(), "Client disposed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// State of the callback pipe (acceptor).
    pub fn callback_state(&self) -> EndpointState {
        self.callback_state.get()
    }

    /// State of the request pipe (connector).
    pub fn request_state(&self) -> EndpointState {
        self.request_state.get()
    }

    /// Responses still expected across all in-flight batches.
    pub fn pending_responses(&self) -> usize {
        self.batches.pending_responses()
    }

    /// Effective request pipe name.
    pub fn server_pipe(&self) -> String {
        self.config.server_pipe_name()
    }

    /// Effective callback pipe name.
    pub fn callback_pipe(&self) -> String {
        self.config.callback_pipe_name()
    }

    /// Number of registered observers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }
}

impl<Req, Resp, C> Drop for Client<Req, Resp, C> {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Callback loop: decode each line, fan it out and count it against the batch.
async fn run_callbacks<Resp, C>(
    mut inbound: InboundEndpoint,
    registry: Arc<SubscriptionRegistry<Resp>>,
    batches: Arc<BatchTracker>,
    mut shutdown: watch::Receiver<bool>,
) where
    Resp: DeserializeOwned + Send + Sync + 'static,
    C: LineCodec,
{
    loop {
        let received = tokio::select! {
            result = inbound.recv() => result,
            _ = shutdown.changed() => break,
        };

        match received {
            Ok(Inbound::Line(line)) => {
                if line == FAILED_ITEM_FRAME {
                    tracing::debug!("Server reported a failed item");
                    registry.notify_error(&PipeLinkError::ItemFailed);
                } else {
                    match C::decode::<Resp>(&line) {
                        Ok(response) => registry.notify_next(&response),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to decode callback");
                            registry.notify_error(&e);
                        }
                    }
                }

                match batches.record() {
                    BatchProgress::Completed => registry.notify_completed(),
                    BatchProgress::Pending { .. } => {}
                    BatchProgress::Unexpected => {
                        tracing::warn!("Callback received with no batch in flight");
                    }
                }
            }
            Ok(Inbound::PeerClosed) => {
                inbound.disconnect();
                abandon_batches(
                    &batches,
                    &registry,
                    "Server disconnected with responses outstanding",
                );
            }
            Err(e) => {
                tracing::warn!(pipe = %inbound.address(), error = %e, "Callback pipe failed");
                inbound.disconnect();
                abandon_batches(
                    &batches,
                    &registry,
                    "Callback pipe dropped with responses outstanding",
                );
                tokio::select! {
                    _ = tokio::time::sleep(RECV_RETRY_DELAY) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    inbound.close();
    tracing::debug!("Callback loop stopped");
}

/// Drop every outstanding countdown after the callback peer went away.
///
/// The responses will never arrive, so observers get one `on_error` instead
/// of an `on_completed`.
fn abandon_batches<Resp: 'static>(
    batches: &BatchTracker,
    registry: &SubscriptionRegistry<Resp>,
    reason: &'static str,
) {
    let abandoned = batches.reset();
    if abandoned > 0 {
        tracing::warn!(responses = abandoned, "{}", reason);
        registry.notify_error(&PipeLinkError::ConnectionClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::generate_pipe_token;

    fn unique_name(tag: &str) -> String {
        format!("pipelink-{}-{}", tag, generate_pipe_token())
    }

    #[test]
    fn test_builder_pipe_names() {
        let client = ClientBuilder::new("EchoService").build::<String, String>();

        assert_eq!(client.server_pipe(), "EchoService_SERVER_PIPE");
        assert_eq!(client.callback_pipe(), "EchoService_CALLBACK_PIPE");
    }

    #[test]
    fn test_builder_timeouts_saturate() {
        let client = ClientBuilder::new("EchoService")
            .connect_timeout(Duration::MAX)
            .drain_timeout(Duration::from_millis(250))
            .build::<String, String>();

        assert_eq!(client.config.connect_timeout_ms, u64::MAX);
        assert_eq!(client.config.drain_timeout_ms, 250);
    }

    #[test]
    fn test_builder_random_callback_pipe() {
        let a = ClientBuilder::new("EchoService")
            .random_callback_pipe()
            .build::<String, String>();
        let b = ClientBuilder::new("EchoService")
            .random_callback_pipe()
            .build::<String, String>();

        assert!(a.callback_pipe().ends_with("_CALLBACK_PIPE"));
        assert_ne!(a.callback_pipe(), b.callback_pipe());
        assert_eq!(a.server_pipe(), "EchoService_SERVER_PIPE");
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = ClientBuilder::new(unique_name("early")).build::<String, String>();

        let result = client.send_request(&["x".to_string()]).await;

        assert!(matches!(result, Err(PipeLinkError::NotConnected)));
        assert_eq!(client.pending_responses(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_dispose_lifecycle() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let (b, a) = (before.clone(), after.clone());

        let mut client = ClientBuilder::new(unique_name("lifecycle"))
            .before_connect(move || {
                b.fetch_add(1, Ordering::SeqCst);
            })
            .after_end(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .build::<String, String>();

        client.connect().await.unwrap();
        assert!(matches!(
            client.connect().await,
            Err(PipeLinkError::AlreadyStarted)
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.callback_state(), EndpointState::Accepting);
        assert_eq!(client.request_state(), EndpointState::Disconnected);

        let (_subscription, _rx) = client.subscribe_channel();
        assert_eq!(client.subscriber_count(), 1);

        client.dispose().await.unwrap();
        client.dispose().await.unwrap();

        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(client.subscriber_count(), 0);
        assert_eq!(client.callback_state(), EndpointState::Closed);
        assert_eq!(client.request_state(), EndpointState::Closed);
        assert!(matches!(
            client.send_request(&["late".to_string()]).await,
            Err(PipeLinkError::Disposed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        use crate::transport::Inbound;

        let name = unique_name("empty");
        let mut server_side = InboundEndpoint::bind(
            crate::transport::PipeAddress::local(crate::config::server_pipe_name(&name)),
            crate::protocol::DEFAULT_MAX_LINE_LENGTH,
        )
        .await
        .unwrap();

        let mut client = ClientBuilder::new(name).build::<String, String>();
        client.connect().await.unwrap();
        let (_subscription, mut rx) = client.subscribe_channel();

        let (received, sent) = tokio::join!(server_side.recv(), client.send_request(&[]));
        sent.unwrap();

        assert_eq!(received.unwrap(), Inbound::Line("[]".into()));
        assert_eq!(rx.recv().await, Some(Notification::Completed));
        assert_eq!(client.pending_responses(), 0);

        client.dispose().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_send_rolls_back_batch() {
        let mut client = ClientBuilder::new(unique_name("nobody"))
            .connect_timeout(Duration::from_millis(100))
            .build::<String, String>();
        client.connect().await.unwrap();

        let result = client.send_request(&["a".to_string(), "b".to_string()]).await;

        assert!(matches!(result, Err(PipeLinkError::ConnectTimeout(_))));
        assert_eq!(client.pending_responses(), 0);

        client.dispose().await.unwrap();
    }
}
