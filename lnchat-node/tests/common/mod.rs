//! Shared setup for lnchat-node integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lnchat_lib::test_utils::{address, mock_signature, MockLightningClient};
use lnchat_lib::wire::TlvRecords;
use lnchat_lib::{Address, LightningClient};
use lnchat_node::{Bus, MessageEnvelope, MessagePayload, MessageService, ServiceConfig};
use lnchat_store::{KvStore, Store};

/// Address of the local node in every harness.
pub fn me() -> Address {
    address(1)
}

pub struct Harness {
    pub client: Arc<MockLightningClient>,
    pub store: Arc<KvStore>,
    pub service: Arc<MessageService>,
}

pub async fn harness() -> Harness {
    harness_with(Arc::new(KvStore::in_memory()), ServiceConfig::default()).await
}

pub async fn harness_with(store: Arc<KvStore>, config: ServiceConfig) -> Harness {
    let client = Arc::new(MockLightningClient::new(me()));
    let service = MessageService::new(
        Arc::clone(&client) as Arc<dyn LightningClient>,
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(Bus::new()),
        config,
    )
    .await
    .unwrap();
    Harness {
        client,
        store,
        service: Arc::new(service),
    }
}

/// Records of a message `from` signed as the sender would.
pub fn signed_records(from: Address, participants: Vec<Address>, text: &str) -> TlvRecords {
    let bytes = MessageEnvelope::new(participants, text).encode().unwrap();
    let signature = mock_signature(&from, &bytes);
    MessagePayload::signed(bytes, from, signature).to_records()
}

pub fn anonymous_records(participants: Vec<Address>, text: &str) -> TlvRecords {
    let bytes = MessageEnvelope::new(participants, text).encode().unwrap();
    MessagePayload::anonymous(bytes).to_records()
}

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
