//! Subscription module - response fan-out.
//!
//! Provides:
//! - [`Observer`] - receives responses, decode errors and batch completion
//! - [`SubscriptionRegistry`] - ordered set of observers with fan-out notify
//! - [`Subscription`] - handle that revokes one registration
//! - [`ChannelObserver`] - observer backed by an mpsc channel

mod observer;
mod registry;

pub use observer::{ChannelObserver, Notification, Observer};
pub use registry::{Subscription, SubscriptionRegistry};
