//! lnchat node runtime.
//!
//! Ties the channel client, the store and an in-process event bus together:
//!
//! - **MessageService**: the consumer API, including the send path that turns
//!   a message into one payment per recipient
//! - **Supervisor**: two long-lived loops tailing invoice and payment updates,
//!   resuming from the last stored index with a sigmoid backoff
//! - **Bus**: fan-out of message, invoice and payment events to subscribers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lnchat_node::{Bus, MessageService, SendRequest, ServiceConfig, Supervisor};
//!
//! let service = Arc::new(MessageService::new(client, store, Arc::new(Bus::new()), ServiceConfig::default()).await?);
//! let supervisor = Supervisor::init(Arc::clone(&service));
//!
//! let mut incoming = service.subscribe_messages();
//! service.send_pay(SendRequest::to_discussion(1, "hi", Amount(1000))).await?;
//!
//! supervisor.shutdown(Duration::from_secs(5)).await?;
//! ```

pub mod backoff;
pub mod bus;
pub mod payload;
pub mod service;
pub mod supervisor;

pub use backoff::{backoff, Backoff, BACKOFF_BASE, BACKOFF_CEILING};
pub use bus::{Bus, Event, Subscription, Topic, SUBSCRIBER_BUFFER};
pub use payload::{MessageEnvelope, MessagePayload, PAYLOAD_RECORD, SENDER_RECORD, SIGNATURE_RECORD};
pub use service::{
    Message, MessageService, MessageSubscription, SendRequest, ServiceConfig, DEFAULT_VERIFY_TIMEOUT,
};
pub use supervisor::Supervisor;
