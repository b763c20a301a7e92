//! Consumer-facing messaging API.
//!
//! [`MessageService`] owns the send path (options merge, envelope signing,
//! one payment per recipient, persistence) and the handlers the supervisor
//! feeds settlement updates into. Everything else is a thin pass-through to
//! the store or the channel client with argument checks in front.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use lnchat_lib::client::{
    Invoice, InvoiceRequest, InvoiceState, LightningClient, Payment, PaymentRequest,
    PaymentStatus, Route, RouteQuery,
};
use lnchat_lib::errors::rpc_code;
use lnchat_lib::{override_options, Address, Amount, ErrorKind, LnchatError, MessageOptions, Result};
use lnchat_store::{
    Contact, Discussion, DiscussionStatistics, MessageAggregate, PageOptions, RawMessage, Store,
    StoreError,
};

use crate::bus::{Bus, Event, Subscription, Topic};
use crate::payload::{MessageEnvelope, MessagePayload};

/// Upper bound on one signature verification round trip.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Base of the options merge for every send.
    pub default_options: MessageOptions,
    pub verify_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_options: MessageOptions::default(),
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }
}

/// Outgoing message, addressed either to a discussion or to a payment request.
#[derive(Clone, Debug, Default)]
pub struct SendRequest {
    pub payload: String,
    pub amount: Amount,
    pub discussion_id: Option<u64>,
    pub payment_request: Option<String>,
    pub options: Option<MessageOptions>,
}

impl SendRequest {
    pub fn to_discussion(discussion_id: u64, payload: impl Into<String>, amount: Amount) -> Self {
        Self {
            payload: payload.into(),
            amount,
            discussion_id: Some(discussion_id),
            ..Self::default()
        }
    }

    pub fn to_payment_request(payment_request: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            payment_request: Some(payment_request.into()),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Outcome of a send, or the synthetic result of an estimate (`id` 0).
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: u64,
    pub discussion_id: u64,
    pub payload: String,
    pub sender: Option<Address>,
    /// Amount delivered across all successful routes, fees excluded.
    pub amount: Amount,
    pub total_fees: Amount,
    pub success_prob: f64,
    pub routes: Vec<Route>,
    pub timestamp: DateTime<Utc>,
}

/// Stream of message aggregates, both directions.
pub struct MessageSubscription {
    inner: Subscription,
}

impl MessageSubscription {
    /// `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<MessageAggregate> {
        loop {
            if let Event::Message(aggregate) = self.inner.recv().await? {
                return Some(*aggregate);
            }
        }
    }
}

/// Who a send goes to, resolved from a [`SendRequest`].
struct Target {
    discussion: Discussion,
    recipients: Vec<Address>,
    payment_request: Option<String>,
    /// What each recipient receives.
    amount: Amount,
    /// Amount passed with the payment; zero when the invoice fixes it.
    payment_amount: Amount,
}

pub struct MessageService {
    client: Arc<dyn LightningClient>,
    store: Arc<dyn Store>,
    bus: Arc<Bus>,
    self_address: Address,
    config: ServiceConfig,
}

impl MessageService {
    /// Ask the node who it is and wire the service around it.
    #[tracing::instrument(skip_all)]
    pub async fn new(
        client: Arc<dyn LightningClient>,
        store: Arc<dyn Store>,
        bus: Arc<Bus>,
        config: ServiceConfig,
    ) -> Result<Self> {
        let info = client.get_info().await?;
        info!(address = %info.address, alias = %info.alias, "connected to node");
        Ok(Self {
            client,
            store,
            bus,
            self_address: info.address,
            config,
        })
    }

    pub fn self_address(&self) -> Address {
        self.self_address
    }

    pub fn client(&self) -> &Arc<dyn LightningClient> {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // Contacts

    pub async fn add_contact(&self, contact: Contact) -> Result<Contact> {
        if contact.address() == self.self_address {
            return Err(LnchatError::invalid_argument("the local node cannot be a contact"));
        }
        Ok(self.store.add_contact(contact).await?)
    }

    pub async fn get_contact(&self, id: u64) -> Result<Contact> {
        Ok(self.store.get_contact(id).await?)
    }

    pub async fn list_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self.store.list_contacts().await?)
    }

    pub async fn remove_contact_by_id(&self, id: u64) -> Result<()> {
        Ok(self.store.remove_contact(id).await?)
    }

    pub async fn remove_contact_by_address(&self, address: &Address) -> Result<()> {
        Ok(self.store.remove_contact_by_address(address).await?)
    }

    // Discussions

    /// Create a discussion with everyone in `participants` except the local
    /// node.
    pub async fn add_discussion(
        &self,
        participants: Vec<Address>,
        options: MessageOptions,
    ) -> Result<Discussion> {
        let participants = self.without_self(participants);
        if participants.is_empty() {
            return Err(LnchatError::invalid_argument(
                "discussion needs a participant other than the local node",
            ));
        }
        Ok(self
            .store
            .add_discussion(Discussion::new(participants, options))
            .await?)
    }

    pub async fn get_discussion(&self, id: u64) -> Result<Discussion> {
        Ok(self.store.get_discussion(id).await?)
    }

    pub async fn remove_discussion(&self, id: u64) -> Result<()> {
        Ok(self.store.remove_discussion(id).await?)
    }

    pub async fn list_discussions(&self, offset: u64, size: u64) -> Result<Vec<Discussion>> {
        Ok(self.store.list_discussions(offset, size).await?)
    }

    pub async fn get_discussion_history(
        &self,
        discussion_id: u64,
        page: PageOptions,
    ) -> Result<Vec<MessageAggregate>> {
        Ok(self.store.get_messages(discussion_id, page).await?)
    }

    pub async fn get_discussion_statistics(&self, discussion_id: u64) -> Result<DiscussionStatistics> {
        let history = self
            .store
            .get_messages(discussion_id, PageOptions::all())
            .await?;
        Ok(DiscussionStatistics::from_aggregates(&history))
    }

    pub async fn update_last_read(&self, discussion_id: u64, message_id: u64) -> Result<()> {
        Ok(self.store.update_last_read(discussion_id, message_id).await?)
    }

    // Invoices and payments

    pub async fn create_invoice(
        &self,
        memo: impl Into<String>,
        amount: Amount,
        expiry_secs: i64,
        private: bool,
    ) -> Result<Invoice> {
        if amount.msat() < 0 || expiry_secs < 0 {
            return Err(LnchatError::invalid_argument(format!(
                "invoice amount {} and expiry {}s must not be negative",
                amount, expiry_secs
            )));
        }
        self.client
            .create_invoice(InvoiceRequest {
                memo: memo.into(),
                amount,
                expiry_secs,
                private,
            })
            .await
    }

    pub async fn lookup_invoice(&self, payment_request: &str) -> Result<Invoice> {
        self.client.lookup_invoice(payment_request).await
    }

    pub async fn list_invoices(&self, page: PageOptions) -> Result<Vec<Invoice>> {
        Ok(self.store.list_invoices(page).await?)
    }

    pub async fn list_payments(&self, page: PageOptions) -> Result<Vec<Payment>> {
        Ok(self.store.list_payments(page).await?)
    }

    // Messages

    /// Send a message, one payment per recipient.
    ///
    /// Recipients are paid in turn. The call fails only when no payment
    /// succeeds, with every recipient's failure joined into one error.
    /// Otherwise all payments are persisted and the message references the
    /// successful ones.
    #[tracing::instrument(skip_all, fields(discussion_id = ?request.discussion_id))]
    pub async fn send_pay(&self, request: SendRequest) -> Result<Message> {
        let target = self.resolve_target(&request, true).await?;
        let options = self.merge_options(&target.discussion, request.options)?;

        let envelope = MessageEnvelope::new(
            target.discussion.participants().to_vec(),
            request.payload.clone(),
        )
        .encode()?;
        let payload = if options.anonymous {
            MessagePayload::anonymous(envelope)
        } else {
            let signature = self.client.sign_message(&envelope).await?;
            MessagePayload::signed(envelope, self.self_address, signature)
        };
        let records = payload.to_records();

        let mut payments = Vec::with_capacity(target.recipients.len());
        let mut errors = Vec::new();
        for recipient in &target.recipients {
            let outcome = self
                .client
                .send_payment(PaymentRequest {
                    destination: target.payment_request.is_none().then_some(*recipient),
                    payment_request: target.payment_request.clone(),
                    amount: target.payment_amount,
                    fee_limit: options.fee_limit,
                    custom_records: records.clone(),
                })
                .await;
            match outcome {
                Ok(payment) if payment.status == PaymentStatus::Succeeded => {
                    debug!(%recipient, payment_index = payment.payment_index, "payment succeeded");
                    payments.push(payment);
                }
                Ok(payment) => {
                    errors.push(LnchatError::from_rpc_status(
                        rpc_code::UNKNOWN,
                        format!("payment to {} failed: {}", recipient, payment.failure_reason),
                    ));
                    payments.push(payment);
                }
                Err(e) => errors.push(LnchatError::new(
                    e.kind(),
                    format!("payment to {}: {}", recipient, e.detail()),
                )),
            }
        }

        let succeeded: Vec<Payment> = payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Succeeded)
            .cloned()
            .collect();
        if succeeded.is_empty() {
            return Err(LnchatError::join(errors));
        }
        if !errors.is_empty() {
            let failed = errors.len();
            warn!(
                delivered = succeeded.len(),
                failed = failed,
                "partial delivery: {}",
                LnchatError::join(errors)
            );
        }

        for payment in payments {
            self.store_payment(payment).await?;
        }
        let mut raw = RawMessage::outgoing(
            payload.payload,
            target.discussion.id,
            succeeded.iter().map(|p| p.payment_index).collect(),
        );
        raw.signature_verified = payload.sender.is_some();
        raw.sender = payload.sender;
        raw.signature = payload.signature;
        let stored = self.store.add_raw_message(raw).await?;

        let message = sent_message(&stored, request.payload, &succeeded);
        self.bus.publish(Event::Message(Box::new(MessageAggregate {
            message: stored,
            invoice: None,
            payments: succeeded,
        })));
        Ok(message)
    }

    /// Price a message without sending it.
    ///
    /// Queries one route per recipient; `success_prob` is the product of the
    /// route probabilities. A payment request with no known discussion is
    /// estimated without creating one.
    #[tracing::instrument(skip_all, fields(discussion_id = ?request.discussion_id))]
    pub async fn estimate_payment(&self, request: SendRequest) -> Result<Message> {
        let target = self.resolve_target(&request, false).await?;
        let options = self.merge_options(&target.discussion, request.options)?;

        let envelope = MessageEnvelope::new(
            target.discussion.participants().to_vec(),
            request.payload.clone(),
        )
        .encode()?;
        let mut payload = MessagePayload::anonymous(envelope);
        if !options.anonymous {
            payload.sender = Some(self.self_address);
        }
        let records = payload.to_records();

        let mut success_prob = 1.0;
        let mut total_fees = Amount::ZERO;
        let mut routes = Vec::with_capacity(target.recipients.len());
        for recipient in &target.recipients {
            let estimate = self
                .client
                .get_route(RouteQuery {
                    destination: Some(*recipient),
                    amount: target.amount,
                    fee_limit: options.fee_limit,
                    custom_records: records.clone(),
                })
                .await?;
            success_prob *= estimate.success_prob;
            total_fees = total_fees.saturating_add(estimate.route.total_fees);
            routes.push(estimate.route);
        }

        Ok(Message {
            id: 0,
            discussion_id: target.discussion.id,
            payload: request.payload,
            sender: payload.sender,
            amount: Amount(target.amount.msat().saturating_mul(routes.len() as i64)),
            total_fees,
            success_prob,
            routes,
            timestamp: Utc::now(),
        })
    }

    /// Sent and received messages from now on.
    pub fn subscribe_messages(&self) -> MessageSubscription {
        MessageSubscription {
            inner: self.bus.subscribe(Topic::Message),
        }
    }

    // Settlement updates

    /// Publish an invoice update and, once settled, persist it and any
    /// message it carried. Returns the stored message.
    #[tracing::instrument(skip_all, fields(settle_index = invoice.settle_index))]
    pub async fn handle_invoice(&self, invoice: Invoice) -> Result<Option<MessageAggregate>> {
        self.bus.publish(Event::Invoice(Box::new(invoice.clone())));
        if invoice.state != InvoiceState::Settled {
            return Ok(None);
        }
        match self.store.add_invoice(invoice.clone()).await {
            Ok(()) => {}
            Err(StoreError::InvoiceAlreadyExists(index)) => {
                debug!(index, "invoice already processed");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let Some(records) = invoice.settled_custom_records() else {
            return Ok(None);
        };
        let Some(payload) = MessagePayload::from_records(records)? else {
            return Ok(None);
        };
        let signature_verified = self.verify(&payload).await?;
        let envelope = MessageEnvelope::decode(&payload.payload)?;

        let mut participants = self.without_self(envelope.participants);
        participants.extend(payload.sender);
        let discussion = self.discussion_for(participants).await?;

        let mut raw = RawMessage::incoming(payload.payload, invoice.settle_index);
        raw.discussion_id = discussion.id;
        raw.sender = payload.sender;
        raw.signature = payload.signature;
        raw.signature_verified = signature_verified;
        raw.timestamp = invoice.settled_at.unwrap_or_else(Utc::now);
        let message = self.store.add_raw_message(raw).await?;
        debug!(
            message_id = message.id,
            discussion_id = discussion.id,
            verified = signature_verified,
            "message received"
        );

        let aggregate = MessageAggregate {
            message,
            invoice: Some(invoice),
            payments: Vec::new(),
        };
        self.bus.publish(Event::Message(Box::new(aggregate.clone())));
        Ok(Some(aggregate))
    }

    /// Persist a final payment update and publish it.
    #[tracing::instrument(skip_all, fields(payment_index = payment.payment_index))]
    pub async fn handle_payment(&self, payment: Payment) -> Result<()> {
        self.store_payment(payment.clone()).await?;
        self.bus.publish(Event::Payment(Box::new(payment)));
        Ok(())
    }

    async fn store_payment(&self, payment: Payment) -> Result<()> {
        match self.store.add_payments(vec![payment]).await {
            Ok(()) | Err(StoreError::PaymentAlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the signature recovers to the claimed sender.
    async fn verify(&self, payload: &MessagePayload) -> Result<bool> {
        let Some(sender) = payload.sender else {
            return Ok(false);
        };
        if payload.signature.is_empty() {
            return Ok(false);
        }
        let extracted = tokio::time::timeout(
            self.config.verify_timeout,
            self.client
                .verify_signature_extract_pubkey(&payload.payload, &payload.signature),
        )
        .await??;
        Ok(extracted == Some(sender))
    }

    fn without_self(&self, participants: impl IntoIterator<Item = Address>) -> Vec<Address> {
        participants
            .into_iter()
            .filter(|a| *a != self.self_address)
            .collect()
    }

    /// Retrieve-or-create by participant set.
    async fn discussion_for(&self, participants: Vec<Address>) -> Result<Discussion> {
        match self.store.get_discussion_by_participants(&participants).await {
            Ok(d) => return Ok(d),
            Err(StoreError::DiscussionNotFound) => {}
            Err(e) => return Err(e.into()),
        }
        let created = self
            .store
            .add_discussion(Discussion::new(participants.clone(), MessageOptions::default()))
            .await;
        match created {
            Ok(d) => {
                info!(discussion_id = d.id, participants = d.participants().len(), "discussion created");
                Ok(d)
            }
            // Lost a race with a concurrent update.
            Err(StoreError::DiscussionAlreadyExists) => {
                Ok(self.store.get_discussion_by_participants(&participants).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_target(&self, request: &SendRequest, create: bool) -> Result<Target> {
        if request.amount.msat() < 0 {
            return Err(LnchatError::invalid_argument(format!(
                "amount {} must not be negative",
                request.amount
            )));
        }
        match (request.discussion_id, request.payment_request.as_deref()) {
            (Some(id), None) => {
                let discussion = self.store.get_discussion(id).await?;
                if discussion.participants().is_empty() {
                    return Err(LnchatError::invalid_argument(format!(
                        "discussion {} has no recipients",
                        id
                    )));
                }
                Ok(Target {
                    recipients: discussion.participants().to_vec(),
                    discussion,
                    payment_request: None,
                    amount: request.amount,
                    payment_amount: request.amount,
                })
            }
            (None, Some(payment_request)) => {
                let decoded = self.client.decode_payment_request(payment_request).await?;
                let discussion = if create {
                    self.discussion_for(vec![decoded.destination]).await?
                } else {
                    match self
                        .store
                        .get_discussion_by_participants(&[decoded.destination])
                        .await
                    {
                        Ok(d) => d,
                        Err(StoreError::DiscussionNotFound) => {
                            Discussion::new([decoded.destination], MessageOptions::default())
                        }
                        Err(e) => return Err(e.into()),
                    }
                };
                let (amount, payment_amount) = if decoded.amount.is_zero() {
                    (request.amount, request.amount)
                } else {
                    (decoded.amount, Amount::ZERO)
                };
                Ok(Target {
                    discussion,
                    recipients: vec![decoded.destination],
                    payment_request: Some(payment_request.to_string()),
                    amount,
                    payment_amount,
                })
            }
            _ => Err(LnchatError::invalid_argument(
                "exactly one of discussion id and payment request is required",
            )),
        }
    }

    fn merge_options(
        &self,
        discussion: &Discussion,
        call: Option<MessageOptions>,
    ) -> Result<MessageOptions> {
        let mut overrides = vec![discussion.options];
        overrides.extend(call);
        let options = override_options(self.config.default_options, true, &overrides);
        if discussion.is_group() && options.anonymous {
            return Err(LnchatError::new(
                ErrorKind::DiscAnonymousMessage,
                format!("discussion {}", discussion.id),
            ));
        }
        Ok(options)
    }
}

fn sent_message(stored: &RawMessage, payload: String, succeeded: &[Payment]) -> Message {
    let routes: Vec<Route> = succeeded
        .iter()
        .filter_map(|p| p.succeeded_route().cloned())
        .collect();
    Message {
        id: stored.id,
        discussion_id: stored.discussion_id,
        payload,
        sender: stored.sender,
        amount: succeeded
            .iter()
            .fold(Amount::ZERO, |acc, p| acc.saturating_add(p.value)),
        total_fees: succeeded
            .iter()
            .fold(Amount::ZERO, |acc, p| acc.saturating_add(p.fee)),
        success_prob: 1.0,
        routes,
        timestamp: stored.timestamp,
    }
}
