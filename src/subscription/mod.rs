//! Changefeed subscriptions.
//!
//! A [`SubscriptionManager`] opens one channel per [`Subscription`], decodes
//! every payload into a [`ChangeEvent`](crate::event::ChangeEvent) and hands it
//! to the matching [`ChangeHandlers`] callback. Decoding failures, handler
//! failures and channel failures all end up in the error handler.

mod group;
mod handlers;
mod manager;

pub use group::SubscriptionGroup;
pub use handlers::{ChangeHandlers, HandlerError, HandlerResult, MissingHandler};
pub use manager::{Subscription, SubscriptionConfig, SubscriptionManager};
