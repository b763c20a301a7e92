//! Persistence for lnchat.
//!
//! Contacts, discussions, settled invoices, payments and the raw messages
//! they carried. The [`Store`] trait is the interface the messaging service
//! consumes; [`KvStore`] implements it in memory with optional sealed file
//! snapshots.
//!
//! # Example
//!
//! ```
//! # tokio_test::block_on(async {
//! use lnchat_store::{Discussion, KvStore, Store};
//! use lnchat_lib::{Address, MessageOptions};
//!
//! let store = KvStore::in_memory();
//! let peer = Address::new([2u8; 33]);
//! let d = store
//!     .add_discussion(Discussion::new([peer], MessageOptions::default()))
//!     .await
//!     .unwrap();
//! assert_eq!(d.id, 1);
//! # });
//! ```

pub mod encryption;
pub mod error;
pub mod kv;
pub mod model;
pub mod store;

pub use encryption::{generate_key, load_key_file, EncryptionError};
pub use error::{StoreError, StoreResult};
pub use kv::KvStore;
pub use model::{
    canonical_participants, Contact, Discussion, DiscussionStatistics, MessageAggregate,
    PageOptions, RawMessage,
};
pub use store::Store;
