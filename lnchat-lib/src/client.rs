//! Payment-channel client interface.
//!
//! The messaging core consumes a remote node through [`LightningClient`]:
//! settlement streams, payments, message signing and route queries. Concrete
//! backends (the LND REST client, test mocks) translate their own failures
//! into [`LnchatError`](crate::LnchatError) kinds before returning.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::wire::{Signer, TlvRecords, Verifier};
use crate::{Address, Amount, Result};

/// Stream of updates from a live subscription. Closed when the remote ends
/// the stream; an `Err` item reports a broken stream.
pub type Updates<T> = mpsc::Receiver<Result<T>>;

/// Identity of the local node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub alias: String,
    pub address: Address,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    #[default]
    Open,
    Accepted,
    Settled,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceHtlcState {
    #[default]
    Accepted,
    Settled,
    Cancelled,
}

/// One HTLC paying an invoice.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceHtlc {
    pub state: InvoiceHtlcState,
    pub amount: Amount,
    #[serde(default)]
    pub custom_records: TlvRecords,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub creator_address: Address,
    pub memo: String,
    /// Hex payment hash.
    pub preimage_hash: String,
    /// Hex preimage; empty until settled.
    pub preimage: String,
    pub payment_request: String,
    pub value: Amount,
    pub amt_paid: Amount,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub expiry_secs: i64,
    pub private: bool,
    pub state: InvoiceState,
    pub add_index: u64,
    pub settle_index: u64,
    pub htlcs: Vec<InvoiceHtlc>,
}

impl Invoice {
    /// Custom records of the first settled HTLC that carries any.
    pub fn settled_custom_records(&self) -> Option<&TlvRecords> {
        self.htlcs
            .iter()
            .filter(|h| h.state == InvoiceHtlcState::Settled)
            .map(|h| &h.custom_records)
            .find(|r| !r.is_empty())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unknown,
    InFlight,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    /// No further updates follow a final status.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HtlcStatus {
    #[default]
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub chan_id: u64,
    pub pub_key: Option<Address>,
    pub amt_to_forward: Amount,
    pub fee: Amount,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub total_amt: Amount,
    pub total_fees: Amount,
    pub hops: Vec<Hop>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentHtlc {
    pub status: HtlcStatus,
    pub route: Route,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payer: Address,
    pub payee: Address,
    /// Hex payment hash.
    pub hash: String,
    /// Hex preimage; empty unless succeeded.
    pub preimage: String,
    pub value: Amount,
    pub fee: Amount,
    pub status: PaymentStatus,
    #[serde(default)]
    pub failure_reason: String,
    pub payment_index: u64,
    pub created_at: DateTime<Utc>,
    pub htlcs: Vec<PaymentHtlc>,
}

impl Payment {
    /// Route of the first succeeded HTLC.
    pub fn succeeded_route(&self) -> Option<&Route> {
        self.htlcs
            .iter()
            .find(|h| h.status == HtlcStatus::Succeeded)
            .map(|h| &h.route)
    }
}

/// Decoded payment request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayReq {
    pub destination: Address,
    pub payment_hash: String,
    pub amount: Amount,
    pub description: String,
    pub expiry_secs: i64,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub memo: String,
    pub amount: Amount,
    pub expiry_secs: i64,
    pub private: bool,
}

/// Outgoing payment: keysend to `destination`, or a payment request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymentRequest {
    pub destination: Option<Address>,
    pub payment_request: Option<String>,
    pub amount: Amount,
    pub fee_limit: Amount,
    pub custom_records: TlvRecords,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteQuery {
    pub destination: Option<Address>,
    pub amount: Amount,
    pub fee_limit: Amount,
    pub custom_records: TlvRecords,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub route: Route,
    pub success_prob: f64,
}

/// Invoice states a subscription delivers; empty means all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub states: Vec<InvoiceState>,
}

impl InvoiceFilter {
    /// Final invoice states.
    pub fn resolved() -> Self {
        Self {
            states: vec![InvoiceState::Settled, InvoiceState::Cancelled],
        }
    }

    pub fn accepts(&self, invoice: &Invoice) -> bool {
        self.states.is_empty() || self.states.contains(&invoice.state)
    }
}

/// Payment statuses a subscription delivers; empty means all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymentFilter {
    pub statuses: Vec<PaymentStatus>,
}

impl PaymentFilter {
    /// Final payment statuses.
    pub fn resolved() -> Self {
        Self {
            statuses: vec![PaymentStatus::Succeeded, PaymentStatus::Failed],
        }
    }

    pub fn accepts(&self, payment: &Payment) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&payment.status)
    }
}

/// Control and data surface of a remote payment-channel node.
#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn get_info(&self) -> Result<NodeInfo>;

    /// Sign with the node's identity key.
    async fn sign_message(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Recover the signer of `data`. `None` when the signature is invalid.
    async fn verify_signature_extract_pubkey(
        &self,
        data: &[u8],
        signature: &[u8],
    ) -> Result<Option<Address>>;

    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice>;

    async fn lookup_invoice(&self, payment_request: &str) -> Result<Invoice>;

    async fn decode_payment_request(&self, payment_request: &str) -> Result<PayReq>;

    /// Invoice updates with settle index strictly above `settle_index`.
    async fn subscribe_invoice_updates(
        &self,
        settle_index: u64,
        filter: InvoiceFilter,
    ) -> Result<Updates<Invoice>>;

    /// Payment updates with payment index strictly above `payment_index`.
    async fn subscribe_payment_updates(
        &self,
        payment_index: u64,
        filter: PaymentFilter,
    ) -> Result<Updates<Payment>>;

    /// Send and wait for the final status of the payment.
    async fn send_payment(&self, request: PaymentRequest) -> Result<Payment>;

    async fn get_route(&self, query: RouteQuery) -> Result<RouteEstimate>;

    /// Release connections held by the client.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Signs fragments with a client's node key.
pub struct ClientSigner {
    client: Arc<dyn LightningClient>,
    address: Address,
}

impl ClientSigner {
    pub fn new(client: Arc<dyn LightningClient>, address: Address) -> Self {
        Self { client, address }
    }
}

#[async_trait]
impl Signer for ClientSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.client.sign_message(data).await
    }
}

/// Verifies fragments addressed to a client's node.
pub struct ClientVerifier {
    client: Arc<dyn LightningClient>,
    address: Address,
}

impl ClientVerifier {
    pub fn new(client: Arc<dyn LightningClient>, address: Address) -> Self {
        Self { client, address }
    }
}

#[async_trait]
impl Verifier for ClientVerifier {
    fn address(&self) -> Address {
        self.address
    }

    async fn verify(&self, data: &[u8], sig: &[u8], sender: &Address) -> Result<bool> {
        let recovered = self
            .client
            .verify_signature_extract_pubkey(data, sig)
            .await?;
        Ok(recovered.as_ref() == Some(sender))
    }
}
