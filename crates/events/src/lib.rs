//! Rigger change publishing.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, carrying [`ChangeEvent`]s.
//! - [`ChannelSubscription`]: a receiver filtered to one entity channel.
//! - [`WebhookRelay`]: forwards every bus event to an external HTTP
//!   endpoint.
//!
//! Publishing is fire-and-forget. Nothing here ever reports a delivery
//! failure back to the publisher.

pub mod bus;
pub mod relay;

pub use bus::{ChangeEvent, ChannelSubscription, EventBus};
pub use relay::{RelayError, WebhookRelay};
