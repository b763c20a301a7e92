//! Test utilities for lnchat.
//!
//! This module provides:
//! - A scripted in-memory channel client
//! - Deterministic signer and verifier doubles
//! - Fixtures for addresses, invoices and payments
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lnchat_lib::test_utils::{address, MockLightningClient, PaymentOutcome};
//!
//! let client = MockLightningClient::new(address(1));
//! client.set_payment_outcome(address(2), PaymentOutcome::Fail("no route".into()));
//! ```

mod fixtures;
mod mock_client;

pub use fixtures::{address, invoice, mock_signature, payment, recover_mock_signature, settled_invoice_with_records};
pub use mock_client::{MockLightningClient, MockSigner, MockVerifier, PaymentOutcome};
