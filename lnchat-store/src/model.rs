//! Persisted entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lnchat_lib::client::{Invoice, NodeInfo, Payment, PaymentStatus};
use lnchat_lib::{Address, Amount, MessageOptions};

use crate::error::{StoreError, StoreResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Assigned by the store on insert.
    pub id: u64,
    pub display_name: String,
    pub node: NodeInfo,
}

impl Contact {
    pub fn new(display_name: impl Into<String>, node: NodeInfo) -> Self {
        Self {
            id: 0,
            display_name: display_name.into(),
            node,
        }
    }

    pub fn address(&self) -> Address {
        self.node.address
    }
}

/// Sorted and deduplicated participant list; the identity of a discussion.
pub fn canonical_participants(participants: impl IntoIterator<Item = Address>) -> Vec<Address> {
    let mut out: Vec<Address> = participants.into_iter().collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// A conversation, identified by its participants excluding the local node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discussion {
    pub id: u64,
    pub(crate) participants: Vec<Address>,
    pub options: MessageOptions,
    pub last_read_id: u64,
    pub last_message_id: u64,
}

impl Discussion {
    pub fn new(participants: impl IntoIterator<Item = Address>, options: MessageOptions) -> Self {
        Self {
            id: 0,
            participants: canonical_participants(participants),
            options,
            last_read_id: 0,
            last_message_id: 0,
        }
    }

    /// Participants in canonical order.
    pub fn participants(&self) -> &[Address] {
        &self.participants
    }

    pub fn is_group(&self) -> bool {
        self.participants.len() > 1
    }

    pub fn unread(&self) -> bool {
        self.last_message_id > self.last_read_id
    }
}

/// Persisted trace of one sent or received message.
///
/// Incoming messages reference the invoice they arrived on, outgoing ones
/// the payments that carried them; never both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: u64,
    pub discussion_id: u64,
    pub raw_payload: Vec<u8>,
    pub sender: Option<Address>,
    pub signature: Vec<u8>,
    pub signature_verified: bool,
    pub invoice_settle_index: u64,
    pub payment_indexes: Vec<u64>,
    pub timestamp: DateTime<Utc>,
}

impl RawMessage {
    /// Message received on the invoice with `settle_index`.
    pub fn incoming(raw_payload: Vec<u8>, settle_index: u64) -> Self {
        Self {
            id: 0,
            discussion_id: 0,
            raw_payload,
            sender: None,
            signature: Vec::new(),
            signature_verified: false,
            invoice_settle_index: settle_index,
            payment_indexes: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Message sent with the given payments.
    pub fn outgoing(raw_payload: Vec<u8>, discussion_id: u64, payment_indexes: Vec<u64>) -> Self {
        Self {
            id: 0,
            discussion_id,
            raw_payload,
            sender: None,
            signature: Vec::new(),
            signature_verified: false,
            invoice_settle_index: 0,
            payment_indexes,
            timestamp: Utc::now(),
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.invoice_settle_index != 0
    }

    /// Exactly one of the invoice and payment references must be set.
    pub fn validate(&self) -> StoreResult<()> {
        match (self.invoice_settle_index != 0, !self.payment_indexes.is_empty()) {
            (true, false) | (false, true) => Ok(()),
            (false, false) => Err(StoreError::InvalidMessage(
                "message references neither an invoice nor payments".into(),
            )),
            (true, true) => Err(StoreError::InvalidMessage(
                "message references both an invoice and payments".into(),
            )),
        }
    }
}

/// A message joined with its invoice or payments at read time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAggregate {
    pub message: RawMessage,
    pub invoice: Option<Invoice>,
    pub payments: Vec<Payment>,
}

impl MessageAggregate {
    pub fn is_incoming(&self) -> bool {
        self.message.is_incoming()
    }

    fn succeeded(&self) -> impl Iterator<Item = &Payment> {
        self.payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Succeeded)
    }

    /// Amount delivered to recipients, fees excluded.
    pub fn amount_sent(&self) -> Amount {
        self.succeeded()
            .fold(Amount::ZERO, |acc, p| acc.saturating_add(p.value))
    }

    pub fn fees_paid(&self) -> Amount {
        self.succeeded()
            .fold(Amount::ZERO, |acc, p| acc.saturating_add(p.fee))
    }

    pub fn amount_received(&self) -> Amount {
        self.invoice
            .as_ref()
            .map(|i| i.amt_paid)
            .unwrap_or(Amount::ZERO)
    }
}

/// Keyset pagination.
///
/// Forward pages start after `last_id` (0 is the beginning) in ascending
/// order. Reverse pages walk down from just below `last_id` and come back
/// newest first. `page_size` 0 means no limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOptions {
    pub last_id: u64,
    pub page_size: u64,
    pub reverse: bool,
}

impl PageOptions {
    /// Everything, from the beginning.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn forward(last_id: u64, page_size: u64) -> Self {
        Self {
            last_id,
            page_size,
            reverse: false,
        }
    }

    pub fn reverse(last_id: u64, page_size: u64) -> Self {
        Self {
            last_id,
            page_size,
            reverse: true,
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.reverse && self.last_id == 0 {
            return Err(StoreError::InvalidArgument(
                "reverse pagination needs a non-zero anchor".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn limit(&self) -> usize {
        match self.page_size {
            0 => usize::MAX,
            n => usize::try_from(n).unwrap_or(usize::MAX),
        }
    }
}

/// Per-discussion totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionStatistics {
    pub sent_messages: u64,
    pub received_messages: u64,
    pub amount_sent: Amount,
    pub fees_paid: Amount,
    pub amount_received: Amount,
}

impl DiscussionStatistics {
    pub fn from_aggregates<'a>(aggregates: impl IntoIterator<Item = &'a MessageAggregate>) -> Self {
        aggregates.into_iter().fold(Self::default(), |mut s, a| {
            if a.is_incoming() {
                s.received_messages += 1;
                s.amount_received = s.amount_received.saturating_add(a.amount_received());
            } else {
                s.sent_messages += 1;
                s.amount_sent = s.amount_sent.saturating_add(a.amount_sent());
                s.fees_paid = s.fees_paid.saturating_add(a.fees_paid());
            }
            s
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lnchat_lib::test_utils::{address, invoice, payment};

    #[test]
    fn test_participants_are_canonical() {
        let d = Discussion::new([address(9), address(2), address(9)], MessageOptions::default());
        assert_eq!(d.participants(), &[address(2), address(9)]);
        assert!(d.is_group());
    }

    #[test]
    fn test_message_reference_rules() {
        assert!(RawMessage::incoming(b"x".to_vec(), 3).validate().is_ok());
        assert!(RawMessage::outgoing(b"x".to_vec(), 1, vec![4]).validate().is_ok());
        assert!(RawMessage::outgoing(b"x".to_vec(), 1, vec![]).validate().is_err());

        let mut both = RawMessage::incoming(b"x".to_vec(), 3);
        both.payment_indexes.push(4);
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_reverse_needs_anchor() {
        assert!(PageOptions::reverse(0, 10).validate().is_err());
        assert!(PageOptions::reverse(5, 10).validate().is_ok());
        assert!(PageOptions::forward(0, 0).validate().is_ok());
        assert_eq!(PageOptions::all().limit(), usize::MAX);
    }

    #[test]
    fn test_statistics() {
        let me = address(1);
        let peer = address(2);
        let mut failed = payment(me, peer, 8);
        failed.status = PaymentStatus::Failed;

        let sent = MessageAggregate {
            message: RawMessage::outgoing(b"a".to_vec(), 1, vec![7]),
            invoice: None,
            payments: vec![payment(me, peer, 7), failed],
        };
        let received = MessageAggregate {
            message: RawMessage::incoming(b"b".to_vec(), 3),
            invoice: Some(invoice(me, 3)),
            payments: Vec::new(),
        };

        let stats = DiscussionStatistics::from_aggregates([&sent, &received, &received]);
        assert_eq!(stats.sent_messages, 1);
        assert_eq!(stats.received_messages, 2);
        assert_eq!(stats.amount_sent, payment(me, peer, 7).value);
        assert_eq!(stats.fees_paid, payment(me, peer, 7).fee);
        assert_eq!(stats.amount_received, Amount(2000));
    }
}
