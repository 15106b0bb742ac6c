//! Signed webhook delivery: event payloads, HMAC signatures, and the
//! retrying deliverer.
//!
//! Delivery is at-least-once; receivers dedupe on `eventId`. There is no
//! dead-letter queue: an event that survives every retry is logged and
//! dropped, and polling covers the gap.

pub mod deliverer;
pub mod event;
pub mod signature;

pub use deliverer::{DelivererConfig, WebhookDeliverer, WebhookSender};
pub use event::{WebhookEvent, WebhookEventError};
pub use signature::{sign, verify, verify_with_max_age, SIGNATURE_HEADER};
