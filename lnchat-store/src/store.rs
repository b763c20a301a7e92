//! Storage interface consumed by the messaging service.

use async_trait::async_trait;

use lnchat_lib::client::{Invoice, Payment};
use lnchat_lib::Address;

use crate::error::StoreResult;
use crate::model::{Contact, Discussion, MessageAggregate, PageOptions, RawMessage};

/// Trait for persisting contacts, discussions, settlements and messages.
///
/// Implementations linearise writes. Every insert of a keyed entity rejects
/// duplicates with the matching `AlreadyExists` sentinel.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a contact, unique on its address. Returns it with its new id.
    async fn add_contact(&self, contact: Contact) -> StoreResult<Contact>;

    async fn get_contact(&self, id: u64) -> StoreResult<Contact>;

    async fn get_contact_by_address(&self, address: &Address) -> StoreResult<Contact>;

    async fn list_contacts(&self) -> StoreResult<Vec<Contact>>;

    async fn remove_contact(&self, id: u64) -> StoreResult<()>;

    async fn remove_contact_by_address(&self, address: &Address) -> StoreResult<()>;

    /// Insert a discussion, unique on its canonical participants. The empty
    /// participant set is the discussion of anonymous senders.
    async fn add_discussion(&self, discussion: Discussion) -> StoreResult<Discussion>;

    async fn get_discussion(&self, id: u64) -> StoreResult<Discussion>;

    /// Look up by participant set in any order.
    async fn get_discussion_by_participants(&self, participants: &[Address]) -> StoreResult<Discussion>;

    /// Discussions by ascending id. `size` 0 means no limit.
    async fn list_discussions(&self, offset: u64, size: u64) -> StoreResult<Vec<Discussion>>;

    /// Remove a discussion and its messages.
    async fn remove_discussion(&self, id: u64) -> StoreResult<()>;

    /// Mark `message_id` read; it must belong to the discussion.
    async fn update_last_read(&self, discussion_id: u64, message_id: u64) -> StoreResult<()>;

    /// Insert an invoice keyed by its settle index.
    async fn add_invoice(&self, invoice: Invoice) -> StoreResult<()>;

    async fn get_invoice(&self, settle_index: u64) -> StoreResult<Invoice>;

    /// Highest stored settle index, 0 when empty.
    async fn get_last_settle_index(&self) -> StoreResult<u64>;

    async fn list_invoices(&self, page: PageOptions) -> StoreResult<Vec<Invoice>>;

    /// Insert payments keyed by payment index; all or nothing.
    async fn add_payments(&self, payments: Vec<Payment>) -> StoreResult<()>;

    async fn get_payment(&self, payment_index: u64) -> StoreResult<Payment>;

    /// Highest stored payment index, 0 when empty.
    async fn get_last_payment_index(&self) -> StoreResult<u64>;

    async fn list_payments(&self, page: PageOptions) -> StoreResult<Vec<Payment>>;

    /// Insert a message with a new id and advance its discussion's
    /// `last_message_id` in the same write.
    async fn add_raw_message(&self, message: RawMessage) -> StoreResult<RawMessage>;

    /// Messages of one discussion joined with their settlements.
    async fn get_messages(&self, discussion_id: u64, page: PageOptions) -> StoreResult<Vec<MessageAggregate>>;
}
