//! Key-value store with optional sealed file snapshots.
//!
//! All tables live in memory behind one lock. When opened on a path, writers
//! queue on an async mutex; each committed write is staged on a copy of the
//! tables, persisted as a snapshot (temp file + rename) on the blocking pool
//! and only then made visible, so a failed write leaves both memory and disk
//! untouched. Readers never wait on disk I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lnchat_lib::client::{Invoice, Payment};
use lnchat_lib::Address;

use crate::encryption::{SealingKey, SNAPSHOT_LABEL};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    canonical_participants, Contact, Discussion, MessageAggregate, PageOptions, RawMessage,
};
use crate::store::Store;

#[derive(Clone, Default, Serialize, Deserialize)]
struct Tables {
    next_contact_id: u64,
    next_discussion_id: u64,
    next_message_id: u64,
    contacts: BTreeMap<u64, Contact>,
    discussions: BTreeMap<u64, Discussion>,
    invoices: BTreeMap<u64, Invoice>,
    payments: BTreeMap<u64, Payment>,
    messages: BTreeMap<u64, RawMessage>,

    #[serde(skip)]
    contacts_by_address: HashMap<Address, u64>,
    #[serde(skip)]
    discussions_by_participants: HashMap<Vec<Address>, u64>,
    #[serde(skip)]
    messages_by_discussion: HashMap<u64, BTreeSet<u64>>,
}

impl Tables {
    fn reindex(&mut self) {
        self.contacts_by_address = self
            .contacts
            .values()
            .map(|c| (c.address(), c.id))
            .collect();
        self.discussions_by_participants = self
            .discussions
            .values()
            .map(|d| (d.participants().to_vec(), d.id))
            .collect();
        self.messages_by_discussion.clear();
        for m in self.messages.values() {
            self.messages_by_discussion
                .entry(m.discussion_id)
                .or_default()
                .insert(m.id);
        }
    }

    fn contact_id(&self, address: &Address) -> StoreResult<u64> {
        self.contacts_by_address
            .get(address)
            .copied()
            .ok_or(StoreError::ContactNotFound)
    }

    fn discussion(&self, id: u64) -> StoreResult<&Discussion> {
        self.discussions.get(&id).ok_or(StoreError::DiscussionNotFound)
    }

    fn aggregate(&self, message: &RawMessage) -> MessageAggregate {
        MessageAggregate {
            message: message.clone(),
            invoice: self.invoices.get(&message.invoice_settle_index).cloned(),
            payments: message
                .payment_indexes
                .iter()
                .filter_map(|i| self.payments.get(i).cloned())
                .collect(),
        }
    }
}

fn after(last_id: u64) -> (Bound<u64>, Bound<u64>) {
    (Bound::Excluded(last_id), Bound::Unbounded)
}

fn page_map<V: Clone>(map: &BTreeMap<u64, V>, page: PageOptions) -> StoreResult<Vec<V>> {
    page.validate()?;
    let limit = page.limit();
    let values = if page.reverse {
        map.range(..page.last_id)
            .rev()
            .take(limit)
            .map(|(_, v)| v.clone())
            .collect()
    } else {
        map.range(after(page.last_id))
            .take(limit)
            .map(|(_, v)| v.clone())
            .collect()
    };
    Ok(values)
}

fn page_set(set: &BTreeSet<u64>, page: PageOptions) -> StoreResult<Vec<u64>> {
    page.validate()?;
    let limit = page.limit();
    let ids = if page.reverse {
        set.range(..page.last_id).rev().take(limit).copied().collect()
    } else {
        set.range(after(page.last_id)).take(limit).copied().collect()
    };
    Ok(ids)
}

struct Snapshot {
    path: PathBuf,
    key: Option<SealingKey>,
}

impl Snapshot {
    fn load(&self) -> StoreResult<Option<Tables>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&self.path)?;
        let json = match &self.key {
            Some(key) => key.open(&raw)?,
            None => raw,
        };
        let mut tables: Tables = serde_json::from_slice(&json)?;
        tables.reindex();
        Ok(Some(tables))
    }

    fn save(&self, tables: &Tables) -> StoreResult<()> {
        let json = serde_json::to_vec(tables)?;
        let bytes = match &self.key {
            Some(key) => key.seal(&json)?,
            None => json,
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// The store.
pub struct KvStore {
    tables: RwLock<Tables>,
    snapshot: Option<Arc<Snapshot>>,
    /// Serialises file-backed commits across the snapshot write.
    writer: tokio::sync::Mutex<()>,
}

impl KvStore {
    /// Volatile store; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot: None,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Open or create a store persisted at `path`, sealed when `key` is set.
    pub fn open(path: impl AsRef<Path>, key: Option<&[u8; 32]>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let key = key
            .map(|k| SealingKey::derive(k, SNAPSHOT_LABEL))
            .transpose()?;
        let snapshot = Snapshot { path, key };
        let tables = match snapshot.load()? {
            Some(tables) => {
                tracing::debug!(
                    path = %snapshot.path.display(),
                    messages = tables.messages.len(),
                    "loaded store snapshot"
                );
                tables
            }
            None => Tables::default(),
        };
        Ok(Self {
            tables: RwLock::new(tables),
            snapshot: Some(Arc::new(snapshot)),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one write. `op` must validate before it mutates.
    async fn commit<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send,
        F: FnOnce(&mut Tables) -> StoreResult<T> + Send,
    {
        let Some(snapshot) = &self.snapshot else {
            return op(&mut *self.write());
        };
        let _writer = self.writer.lock().await;
        let mut staged = self.read().clone();
        let out = op(&mut staged)?;

        let snapshot = Arc::clone(snapshot);
        let staged = tokio::task::spawn_blocking(move || snapshot.save(&staged).map(|()| staged))
            .await
            .map_err(|e| StoreError::Io(format!("snapshot task: {}", e)))??;
        *self.write() = staged;
        Ok(out)
    }
}

#[async_trait]
impl Store for KvStore {
    async fn add_contact(&self, mut contact: Contact) -> StoreResult<Contact> {
        self.commit(|t| {
            if t.contacts_by_address.contains_key(&contact.address()) {
                return Err(StoreError::ContactAlreadyExists);
            }
            t.next_contact_id += 1;
            contact.id = t.next_contact_id;
            t.contacts_by_address.insert(contact.address(), contact.id);
            t.contacts.insert(contact.id, contact.clone());
            Ok(contact)
        })
        .await
    }

    async fn get_contact(&self, id: u64) -> StoreResult<Contact> {
        self.read()
            .contacts
            .get(&id)
            .cloned()
            .ok_or(StoreError::ContactNotFound)
    }

    async fn get_contact_by_address(&self, address: &Address) -> StoreResult<Contact> {
        let t = self.read();
        let id = t.contact_id(address)?;
        t.contacts.get(&id).cloned().ok_or(StoreError::ContactNotFound)
    }

    async fn list_contacts(&self) -> StoreResult<Vec<Contact>> {
        Ok(self.read().contacts.values().cloned().collect())
    }

    async fn remove_contact(&self, id: u64) -> StoreResult<()> {
        self.commit(|t| {
            let contact = t.contacts.remove(&id).ok_or(StoreError::ContactNotFound)?;
            t.contacts_by_address.remove(&contact.address());
            Ok(())
        })
        .await
    }

    async fn remove_contact_by_address(&self, address: &Address) -> StoreResult<()> {
        self.commit(|t| {
            let id = t.contact_id(address)?;
            t.contacts.remove(&id);
            t.contacts_by_address.remove(address);
            Ok(())
        })
        .await
    }

    async fn add_discussion(&self, mut discussion: Discussion) -> StoreResult<Discussion> {
        discussion.participants = canonical_participants(discussion.participants);
        self.commit(|t| {
            if t
                .discussions_by_participants
                .contains_key(&discussion.participants)
            {
                return Err(StoreError::DiscussionAlreadyExists);
            }
            t.next_discussion_id += 1;
            discussion.id = t.next_discussion_id;
            discussion.last_read_id = 0;
            discussion.last_message_id = 0;
            t.discussions_by_participants
                .insert(discussion.participants.clone(), discussion.id);
            t.discussions.insert(discussion.id, discussion.clone());
            Ok(discussion)
        })
        .await
    }

    async fn get_discussion(&self, id: u64) -> StoreResult<Discussion> {
        self.read().discussion(id).cloned()
    }

    async fn get_discussion_by_participants(&self, participants: &[Address]) -> StoreResult<Discussion> {
        let key = canonical_participants(participants.iter().copied());
        let t = self.read();
        let id = t
            .discussions_by_participants
            .get(&key)
            .copied()
            .ok_or(StoreError::DiscussionNotFound)?;
        t.discussion(id).cloned()
    }

    async fn list_discussions(&self, offset: u64, size: u64) -> StoreResult<Vec<Discussion>> {
        let limit = PageOptions::forward(0, size).limit();
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(self
            .read()
            .discussions
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove_discussion(&self, id: u64) -> StoreResult<()> {
        self.commit(|t| {
            let discussion = t
                .discussions
                .remove(&id)
                .ok_or(StoreError::DiscussionNotFound)?;
            t.discussions_by_participants
                .remove(discussion.participants());
            for message_id in t.messages_by_discussion.remove(&id).unwrap_or_default() {
                t.messages.remove(&message_id);
            }
            Ok(())
        })
        .await
    }

    async fn update_last_read(&self, discussion_id: u64, message_id: u64) -> StoreResult<()> {
        self.commit(|t| {
            t.discussion(discussion_id)?;
            let message = t
                .messages
                .get(&message_id)
                .ok_or(StoreError::MessageNotFound(message_id))?;
            if message.discussion_id != discussion_id {
                return Err(StoreError::MessageInvalidDiscussion {
                    message_id,
                    discussion_id,
                });
            }
            if let Some(d) = t.discussions.get_mut(&discussion_id) {
                d.last_read_id = message_id;
            }
            Ok(())
        })
        .await
    }

    async fn add_invoice(&self, invoice: Invoice) -> StoreResult<()> {
        let index = invoice.settle_index;
        if index == 0 {
            return Err(StoreError::InvalidArgument("invoice is not settled".into()));
        }
        self.commit(|t| {
            if t.invoices.contains_key(&index) {
                return Err(StoreError::InvoiceAlreadyExists(index));
            }
            t.invoices.insert(index, invoice);
            Ok(())
        })
        .await
    }

    async fn get_invoice(&self, settle_index: u64) -> StoreResult<Invoice> {
        self.read()
            .invoices
            .get(&settle_index)
            .cloned()
            .ok_or(StoreError::InvoiceNotFound(settle_index))
    }

    async fn get_last_settle_index(&self) -> StoreResult<u64> {
        Ok(self.read().invoices.keys().next_back().copied().unwrap_or(0))
    }

    async fn list_invoices(&self, page: PageOptions) -> StoreResult<Vec<Invoice>> {
        page_map(&self.read().invoices, page)
    }

    async fn add_payments(&self, payments: Vec<Payment>) -> StoreResult<()> {
        self.commit(|t| {
            let mut batch = BTreeSet::new();
            for p in &payments {
                if p.payment_index == 0 {
                    return Err(StoreError::InvalidArgument("payment has no index".into()));
                }
                if t.payments.contains_key(&p.payment_index) || !batch.insert(p.payment_index) {
                    return Err(StoreError::PaymentAlreadyExists(p.payment_index));
                }
            }
            for p in payments {
                t.payments.insert(p.payment_index, p);
            }
            Ok(())
        })
        .await
    }

    async fn get_payment(&self, payment_index: u64) -> StoreResult<Payment> {
        self.read()
            .payments
            .get(&payment_index)
            .cloned()
            .ok_or(StoreError::PaymentNotFound(payment_index))
    }

    async fn get_last_payment_index(&self) -> StoreResult<u64> {
        Ok(self.read().payments.keys().next_back().copied().unwrap_or(0))
    }

    async fn list_payments(&self, page: PageOptions) -> StoreResult<Vec<Payment>> {
        page_map(&self.read().payments, page)
    }

    async fn add_raw_message(&self, mut message: RawMessage) -> StoreResult<RawMessage> {
        message.validate()?;
        self.commit(|t| {
            t.discussion(message.discussion_id)?;
            if message.invoice_settle_index != 0
                && !t.invoices.contains_key(&message.invoice_settle_index)
            {
                return Err(StoreError::InvoiceNotFound(message.invoice_settle_index));
            }
            if let Some(missing) = message
                .payment_indexes
                .iter()
                .find(|i| !t.payments.contains_key(i))
            {
                return Err(StoreError::PaymentNotFound(*missing));
            }

            t.next_message_id += 1;
            message.id = t.next_message_id;
            t.messages_by_discussion
                .entry(message.discussion_id)
                .or_default()
                .insert(message.id);
            if let Some(d) = t.discussions.get_mut(&message.discussion_id) {
                d.last_message_id = message.id;
            }
            t.messages.insert(message.id, message.clone());
            Ok(message)
        })
        .await
    }

    async fn get_messages(&self, discussion_id: u64, page: PageOptions) -> StoreResult<Vec<MessageAggregate>> {
        let t = self.read();
        t.discussion(discussion_id)?;
        let Some(ids) = t.messages_by_discussion.get(&discussion_id) else {
            page.validate()?;
            return Ok(Vec::new());
        };
        Ok(page_set(ids, page)?
            .into_iter()
            .filter_map(|id| t.messages.get(&id))
            .map(|m| t.aggregate(m))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lnchat_lib::test_utils::{address, invoice, payment};
    use lnchat_lib::MessageOptions;

    async fn discussion(store: &KvStore, tags: &[u8]) -> Discussion {
        let d = Discussion::new(tags.iter().map(|t| address(*t)), MessageOptions::default());
        store.add_discussion(d).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_failure_leaves_tables_untouched() {
        let store = KvStore::in_memory();
        let d = discussion(&store, &[2]).await;
        let msg = RawMessage::outgoing(b"x".to_vec(), d.id, vec![5]);
        assert!(matches!(
            store.add_raw_message(msg).await,
            Err(StoreError::PaymentNotFound(5))
        ));
        assert_eq!(store.read().next_message_id, 0);
        assert_eq!(store.get_discussion(d.id).await.unwrap().last_message_id, 0);
    }

    #[tokio::test]
    async fn test_indexes_rebuilt_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = KvStore::open(&path, None).unwrap();
            let d = discussion(&store, &[3, 2]).await;
            store.add_invoice(invoice(address(1), 4)).await.unwrap();
            let mut msg = RawMessage::incoming(b"hi".to_vec(), 4);
            msg.discussion_id = d.id;
            store.add_raw_message(msg).await.unwrap();
        }

        let store = KvStore::open(&path, None).unwrap();
        let d = store
            .get_discussion_by_participants(&[address(2), address(3)])
            .await
            .unwrap();
        let messages = store.get_messages(d.id, PageOptions::all()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].invoice.as_ref().unwrap().settle_index, 4);
        assert_eq!(store.read().next_message_id, 1);
    }

    #[tokio::test]
    async fn test_payments_batch_is_atomic() {
        let store = KvStore::in_memory();
        store
            .add_payments(vec![payment(address(1), address(2), 3)])
            .await
            .unwrap();
        let batch = vec![
            payment(address(1), address(2), 4),
            payment(address(1), address(2), 3),
        ];
        assert!(matches!(
            store.add_payments(batch).await,
            Err(StoreError::PaymentAlreadyExists(3))
        ));
        assert!(store.get_payment(4).await.is_err());
        assert_eq!(store.get_last_payment_index().await.unwrap(), 3);
    }
}
