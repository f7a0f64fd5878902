//! Moderation events and notification delivery.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`ModerationEvent`]: what happened to a change, and to which record.
//! - [`delivery`]: the [`Notifier`] contract and its SMTP implementation.
//! - [`recipients`]: who gets told.

pub mod bus;
pub mod delivery;
pub mod recipients;

pub use bus::{EventBus, ModerationEvent};
pub use delivery::email::{EmailConfig, EmailDelivery};
pub use delivery::{DeliveryError, Notification, Notifier};
pub use recipients::{RecipientDirectory, StaticDirectory};
