//! LND REST gateway client.
//!
//! Implements [`LightningClient`](crate::LightningClient) over LND's REST
//! proxy. Server streams are newline-delimited JSON frames and are exposed as
//! bounded channels fed by a background task; dropping the receiver stops the
//! task.
//!
//! Signatures returned by [`sign_message`](crate::LightningClient::sign_message)
//! are the node's zbase32 signature strings as bytes.

mod config;
mod json;
mod rest;

pub use config::LndConfig;
pub use rest::{LndRestClient, KEYSEND_PREIMAGE_RECORD};
