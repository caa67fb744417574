//! Webhook delivery: signatures, the HTTP client, and the dispatcher.

pub mod delivery;
pub mod dispatcher;
pub mod signature;

pub use delivery::{DeliveryClient, DeliveryOutcome, DeliveryRequest};
pub use dispatcher::WebhookDispatcher;
pub use signature::{sign, verify};
