//! Scripted in-memory channel client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use super::fixtures::{mock_signature, recover_mock_signature};
use crate::client::{
    HtlcStatus, Hop, Invoice, InvoiceFilter, InvoiceRequest, InvoiceState, LightningClient,
    NodeInfo, PayReq, Payment, PaymentFilter, PaymentHtlc, PaymentRequest, PaymentStatus, Route,
    RouteEstimate, RouteQuery, Updates,
};
use crate::wire::{Signer, Verifier};
use crate::{Address, Amount, ErrorKind, LnchatError, Result};

const STREAM_CAPACITY: usize = 64;

/// Scripted result of a payment to one destination.
#[derive(Clone, Debug)]
pub enum PaymentOutcome {
    Succeed,
    /// Payment reaches a final FAILED status with this reason.
    Fail(String),
    /// The send call itself errors.
    Error(ErrorKind, String),
}

#[derive(Default)]
struct State {
    invoices: Vec<Invoice>,
    payments: Vec<Payment>,
    invoice_subs: Vec<(InvoiceFilter, mpsc::Sender<Result<Invoice>>)>,
    payment_subs: Vec<(PaymentFilter, mpsc::Sender<Result<Payment>>)>,
    invoice_subscribe_indexes: Vec<u64>,
    payment_subscribe_indexes: Vec<u64>,
    failing_subscriptions: usize,
    outcomes: HashMap<Address, PaymentOutcome>,
    probabilities: HashMap<Address, f64>,
    pay_reqs: HashMap<String, PayReq>,
    sent: Vec<PaymentRequest>,
    signed: Vec<Vec<u8>>,
    created: Vec<Invoice>,
}

/// In-memory channel client for tests.
///
/// Signatures use [`mock_signature`]; payments succeed unless scripted
/// otherwise; every payment is also broadcast to payment subscribers.
pub struct MockLightningClient {
    info: NodeInfo,
    state: Mutex<State>,
    next_payment_index: AtomicU64,
    next_add_index: AtomicU64,
    closed: AtomicBool,
}

impl MockLightningClient {
    pub fn new(address: Address) -> Self {
        Self {
            info: NodeInfo {
                alias: "mock".to_string(),
                address,
            },
            state: Mutex::new(State::default()),
            next_payment_index: AtomicU64::new(0),
            next_add_index: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn address(&self) -> Address {
        self.info.address
    }

    /// Script the outcome of payments to `destination`.
    pub fn set_payment_outcome(&self, destination: Address, outcome: PaymentOutcome) {
        self.state().outcomes.insert(destination, outcome);
    }

    /// Route success probability towards `destination` (default 1.0).
    pub fn set_route_probability(&self, destination: Address, probability: f64) {
        self.state().probabilities.insert(destination, probability);
    }

    /// Register a payment request the client can decode.
    pub fn add_payment_request(&self, payment_request: &str, decoded: PayReq) {
        self.state()
            .pay_reqs
            .insert(payment_request.to_string(), decoded);
    }

    /// Make the next `n` subscribe calls fail with a network error.
    pub fn fail_next_subscriptions(&self, n: usize) {
        self.state().failing_subscriptions = n;
    }

    /// Record an invoice update and deliver it to live subscribers.
    pub fn push_invoice(&self, invoice: Invoice) {
        let mut state = self.state();
        state.invoices.push(invoice.clone());
        state.invoice_subs.retain(|(filter, tx)| {
            !filter.accepts(&invoice) || tx.try_send(Ok(invoice.clone())).is_ok()
        });
    }

    /// Record a payment update and deliver it to live subscribers.
    pub fn push_payment(&self, payment: Payment) {
        let mut state = self.state();
        state.payments.push(payment.clone());
        state.payment_subs.retain(|(filter, tx)| {
            !filter.accepts(&payment) || tx.try_send(Ok(payment.clone())).is_ok()
        });
    }

    /// Break every live stream with an error item.
    pub fn fail_streams(&self, kind: ErrorKind) {
        let mut state = self.state();
        for (_, tx) in state.invoice_subs.drain(..) {
            let _ = tx.try_send(Err(LnchatError::new(kind, "stream broken")));
        }
        for (_, tx) in state.payment_subs.drain(..) {
            let _ = tx.try_send(Err(LnchatError::new(kind, "stream broken")));
        }
    }

    /// Close every live stream without error.
    pub fn end_streams(&self) {
        let mut state = self.state();
        state.invoice_subs.clear();
        state.payment_subs.clear();
    }

    pub fn live_invoice_subscriptions(&self) -> usize {
        self.state()
            .invoice_subs
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    pub fn live_payment_subscriptions(&self) -> usize {
        self.state()
            .payment_subs
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    /// Settle index each invoice subscription started after.
    pub fn invoice_subscribe_indexes(&self) -> Vec<u64> {
        self.state().invoice_subscribe_indexes.clone()
    }

    pub fn payment_subscribe_indexes(&self) -> Vec<u64> {
        self.state().payment_subscribe_indexes.clone()
    }

    pub fn sent_payments(&self) -> Vec<PaymentRequest> {
        self.state().sent.clone()
    }

    pub fn signed_messages(&self) -> Vec<Vec<u8>> {
        self.state().signed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_subscription_failure(&self) -> Result<()> {
        let mut state = self.state();
        if state.failing_subscriptions > 0 {
            state.failing_subscriptions -= 1;
            return Err(LnchatError::new(ErrorKind::Network, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl LightningClient for MockLightningClient {
    async fn get_info(&self) -> Result<NodeInfo> {
        Ok(self.info.clone())
    }

    async fn sign_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.state().signed.push(data.to_vec());
        Ok(mock_signature(&self.info.address, data))
    }

    async fn verify_signature_extract_pubkey(
        &self,
        data: &[u8],
        signature: &[u8],
    ) -> Result<Option<Address>> {
        Ok(recover_mock_signature(data, signature))
    }

    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice> {
        let add_index = self.next_add_index.fetch_add(1, Ordering::SeqCst) + 1;
        let invoice = Invoice {
            creator_address: self.info.address,
            memo: request.memo,
            preimage_hash: format!("{:064x}", add_index),
            preimage: String::new(),
            payment_request: format!("lnmockinv{}", add_index),
            value: request.amount,
            amt_paid: Amount::ZERO,
            created_at: Utc::now(),
            settled_at: None,
            expiry_secs: request.expiry_secs,
            private: request.private,
            state: InvoiceState::Open,
            add_index,
            settle_index: 0,
            htlcs: Vec::new(),
        };
        self.state().created.push(invoice.clone());
        Ok(invoice)
    }

    async fn lookup_invoice(&self, payment_request: &str) -> Result<Invoice> {
        let state = self.state();
        state
            .created
            .iter()
            .chain(state.invoices.iter())
            .find(|i| i.payment_request == payment_request)
            .cloned()
            .ok_or_else(|| {
                LnchatError::new(ErrorKind::NotFound, format!("invoice {}", payment_request))
            })
    }

    async fn decode_payment_request(&self, payment_request: &str) -> Result<PayReq> {
        self.state()
            .pay_reqs
            .get(payment_request)
            .cloned()
            .ok_or_else(|| {
                LnchatError::invalid_argument(format!("undecodable payment request {}", payment_request))
            })
    }

    async fn subscribe_invoice_updates(
        &self,
        settle_index: u64,
        filter: InvoiceFilter,
    ) -> Result<Updates<Invoice>> {
        self.take_subscription_failure()?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let mut state = self.state();
        state.invoice_subscribe_indexes.push(settle_index);
        for invoice in state
            .invoices
            .iter()
            .filter(|i| i.settle_index > settle_index && filter.accepts(i))
        {
            let _ = tx.try_send(Ok(invoice.clone()));
        }
        state.invoice_subs.push((filter, tx));
        Ok(rx)
    }

    async fn subscribe_payment_updates(
        &self,
        payment_index: u64,
        filter: PaymentFilter,
    ) -> Result<Updates<Payment>> {
        self.take_subscription_failure()?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let mut state = self.state();
        state.payment_subscribe_indexes.push(payment_index);
        for payment in state
            .payments
            .iter()
            .filter(|p| p.payment_index > payment_index && filter.accepts(p))
        {
            let _ = tx.try_send(Ok(payment.clone()));
        }
        state.payment_subs.push((filter, tx));
        Ok(rx)
    }

    async fn send_payment(&self, request: PaymentRequest) -> Result<Payment> {
        let (destination, outcome) = {
            let mut state = self.state();
            state.sent.push(request.clone());
            let destination = match (&request.destination, &request.payment_request) {
                (Some(dest), _) => *dest,
                (None, Some(pr)) => state
                    .pay_reqs
                    .get(pr)
                    .map(|p| p.destination)
                    .ok_or_else(|| LnchatError::invalid_argument("undecodable payment request"))?,
                (None, None) => return Err(LnchatError::invalid_argument("no destination")),
            };
            let outcome = state
                .outcomes
                .get(&destination)
                .cloned()
                .unwrap_or(PaymentOutcome::Succeed);
            (destination, outcome)
        };

        let (status, failure_reason) = match outcome {
            PaymentOutcome::Succeed => (PaymentStatus::Succeeded, String::new()),
            PaymentOutcome::Fail(reason) => (PaymentStatus::Failed, reason),
            PaymentOutcome::Error(kind, msg) => return Err(LnchatError::new(kind, msg)),
        };
        let payment_index = self.next_payment_index.fetch_add(1, Ordering::SeqCst) + 1;
        let fee = Amount(1000);
        let htlc_status = if status == PaymentStatus::Succeeded {
            HtlcStatus::Succeeded
        } else {
            HtlcStatus::Failed
        };
        let payment = Payment {
            payer: self.info.address,
            payee: destination,
            hash: format!("{:064x}", payment_index),
            preimage: if status == PaymentStatus::Succeeded {
                format!("{:064x}", payment_index + 1)
            } else {
                String::new()
            },
            value: request.amount,
            fee,
            status,
            failure_reason,
            payment_index,
            created_at: Utc::now(),
            htlcs: vec![PaymentHtlc {
                status: htlc_status,
                route: Route {
                    total_amt: request.amount.saturating_add(fee),
                    total_fees: fee,
                    hops: vec![Hop {
                        chan_id: payment_index,
                        pub_key: Some(destination),
                        amt_to_forward: request.amount,
                        fee,
                    }],
                },
            }],
        };
        self.push_payment(payment.clone());
        Ok(payment)
    }

    async fn get_route(&self, query: RouteQuery) -> Result<RouteEstimate> {
        let destination = query
            .destination
            .ok_or_else(|| LnchatError::invalid_argument("route query needs a destination"))?;
        let success_prob = self
            .state()
            .probabilities
            .get(&destination)
            .copied()
            .unwrap_or(1.0);
        if success_prob <= 0.0 {
            return Err(LnchatError::new(ErrorKind::NoRouteFound, destination.to_string()));
        }
        let fee = Amount(1000);
        Ok(RouteEstimate {
            route: Route {
                total_amt: query.amount.saturating_add(fee),
                total_fees: fee,
                hops: vec![Hop {
                    chan_id: 1,
                    pub_key: Some(destination),
                    amt_to_forward: query.amount,
                    fee,
                }],
            },
            success_prob,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.end_streams();
        Ok(())
    }
}

/// Signer producing [`mock_signature`]s.
pub struct MockSigner {
    address: Address,
    fail: bool,
}

impl MockSigner {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            fail: false,
        }
    }

    /// Signer whose every call fails with an internal error.
    pub fn failing(address: Address) -> Self {
        Self {
            address,
            fail: true,
        }
    }
}

#[async_trait]
impl Signer for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.fail {
            return Err(LnchatError::internal("signer unavailable"));
        }
        Ok(mock_signature(&self.address, data))
    }
}

/// Verifier accepting [`mock_signature`]s.
pub struct MockVerifier {
    address: Address,
}

impl MockVerifier {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Verifier for MockVerifier {
    fn address(&self) -> Address {
        self.address
    }

    async fn verify(&self, data: &[u8], sig: &[u8], sender: &Address) -> Result<bool> {
        Ok(recover_mock_signature(data, sig).as_ref() == Some(sender))
    }
}
