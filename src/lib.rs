//! # pipelink
//!
//! Duplex IPC over two one-way named pipes.
//!
//! A client sends batches of requests to a server over the request pipe; the
//! server processes each item and answers with one callback per item over the
//! callback pipe. Clients fan responses out to subscribed observers and signal
//! the end of each batch.
//!
//! ## Architecture
//!
//! - **Request pipe** (`<name>_SERVER_PIPE`): client connects, server accepts.
//!   One line per batch.
//! - **Callback pipe** (`<name>_CALLBACK_PIPE`): server connects, client
//!   accepts. One line per response.
//! - Every frame is one line produced by a [`LineCodec`](codec::LineCodec)
//!   (JSON by default).
//!
//! ## Example
//!
//! ```ignore
//! use pipelink::{ClientBuilder, ServerBuilder, Service};
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
//! #[tokio::main]
//! async fn main() -> pipelink::Result<()> {
//!     let mut server = ServerBuilder::new("EchoService").build(Echo);
//!     server.start().await?;
//!
//!     let mut client = ClientBuilder::new("EchoService").build::<String, String>();
//!     client.connect().await?;
//!     let (_subscription, mut events) = client.subscribe_channel();
//!
//!     client.send_request(&["hello".to_string()]).await?;
//!     println!("{:?}", events.recv().await);
//!
//!     client.dispose().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod subscription;
pub mod transport;
pub mod watchdog;

mod client;
mod server;

pub use client::{Client, ClientBuilder, LifecycleHook};
pub use error::{PipeLinkError, Result};
pub use server::{Server, ServerBuilder, Service};
pub use subscription::{Notification, Observer, Subscription};
