//! Message payloads carried in payment custom records.
//!
//! A message travels as up to three TLV records: the JSON envelope bytes, the
//! sender's address and a signature over the envelope bytes. Anonymous
//! messages carry only the envelope.

use serde::{Deserialize, Serialize};

use lnchat_lib::wire::TlvRecords;
use lnchat_lib::{Address, LnchatError, Result};

pub const PAYLOAD_RECORD: u64 = 0x117C_17A1;
pub const SENDER_RECORD: u64 = 0x117C_17A3;
pub const SIGNATURE_RECORD: u64 = 0x117C_17A5;

/// JSON body of a message. Unknown keys are ignored on decode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub participants: Vec<Address>,
    #[serde(default)]
    pub message: String,
}

impl MessageEnvelope {
    pub fn new(participants: Vec<Address>, message: impl Into<String>) -> Self {
        Self {
            participants,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| LnchatError::marshal(format!("message envelope: {}", e)).with_source(e))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessagePayload {
    pub payload: Vec<u8>,
    pub sender: Option<Address>,
    pub signature: Vec<u8>,
}

impl MessagePayload {
    pub fn anonymous(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn signed(payload: Vec<u8>, sender: Address, signature: Vec<u8>) -> Self {
        Self {
            payload,
            sender: Some(sender),
            signature,
        }
    }

    pub fn to_records(&self) -> TlvRecords {
        let mut records = TlvRecords::new();
        records.insert(PAYLOAD_RECORD, self.payload.clone());
        if let Some(sender) = &self.sender {
            records.insert(SENDER_RECORD, sender.as_bytes().to_vec());
        }
        if !self.signature.is_empty() {
            records.insert(SIGNATURE_RECORD, self.signature.clone());
        }
        records
    }

    /// `None` when the records carry no message. A sender record of the
    /// wrong length is an `InvalidAddress` error.
    pub fn from_records(records: &TlvRecords) -> Result<Option<Self>> {
        let Some(payload) = records.get(&PAYLOAD_RECORD) else {
            return Ok(None);
        };
        let sender = match records.get(&SENDER_RECORD) {
            Some(bytes) if !bytes.is_empty() => Some(Address::from_bytes(bytes)?),
            _ => None,
        };
        Ok(Some(Self {
            payload: payload.clone(),
            sender,
            signature: records.get(&SIGNATURE_RECORD).cloned().unwrap_or_default(),
        }))
    }
}
