//! Versioned TLV framing of fragments and their signatures.
//!
//! A fragment travels as a `DataStruct` under [`CodecConfig::data_struct_key`];
//! its signature, when present, as a `DataSig` under
//! [`CodecConfig::data_sig_key`]. The signature covers
//! `destination || DataStruct bytes`, binding a fragment to its recipient.
//!
//! # Wire Format
//!
//! ```text
//! DataStruct { 1: version u32, 2: payload bytes,
//!              3: fragment { 1: total_size u32, 2: fragset_id u64, 3: offset u32 } }
//! DataSig    { 1: version u32, 2: sig bytes, 3: sender_pk bytes(33) }
//! ```

pub mod proto;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::transmission::Fragment;
use crate::{Address, ErrorKind, LnchatError, Result};
use proto::{Decoder, Encoder};

/// Wire version produced and accepted by this codec.
pub const WIRE_VERSION: u32 = 1;

pub const DEFAULT_DATA_STRUCT_KEY: u64 = 0x117C17A7;
pub const DEFAULT_DATA_SIG_KEY: u64 = 0x117C17A9;

/// Largest transmission a receiver reassembles, in bytes.
pub const DEFAULT_MAX_TRANSMISSION_SIZE: u32 = 4 * 1024 * 1024;

/// Custom records attached to one HTLC.
pub type TlvRecords = BTreeMap<u64, Vec<u8>>;

/// Record keys and size limit used by the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub data_struct_key: u64,
    pub data_sig_key: u64,
    /// Upper bound on a fragment's `total_size`; the receiver buffers this
    /// much per transmission.
    pub max_transmission_size: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            data_struct_key: DEFAULT_DATA_STRUCT_KEY,
            data_sig_key: DEFAULT_DATA_SIG_KEY,
            max_transmission_size: DEFAULT_MAX_TRANSMISSION_SIZE,
        }
    }
}

/// Signs on behalf of a local identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Address whose key produces the signatures.
    fn address(&self) -> Address;

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Checks signatures addressed to a local identity.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Local address; prefixed to signed data and imprinted as destination.
    fn address(&self) -> Address;

    /// Whether `sig` over `data` was produced by `sender`.
    async fn verify(&self, data: &[u8], sig: &[u8], sender: &Address) -> Result<bool>;
}

/// Decoded `DataStruct`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataStruct {
    pub version: u32,
    pub payload: Vec<u8>,
    pub total_size: u32,
    pub fragset_id: u64,
    pub offset: u32,
}

impl DataStruct {
    pub fn encode(&self) -> Vec<u8> {
        let fragment = Encoder::new()
            .uint(1, self.total_size as u64)
            .uint(2, self.fragset_id)
            .uint(3, self.offset as u64)
            .finish();
        Encoder::new()
            .uint(1, self.version as u64)
            .bytes(2, &self.payload)
            .message(3, &fragment)
            .finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut out = DataStruct::default();
        let mut dec = Decoder::new(buf);
        while let Some((field, value)) = dec.next_field()? {
            match field {
                1 => out.version = value.as_u32(field)?,
                2 => out.payload = value.as_bytes(field)?.to_vec(),
                3 => {
                    let mut inner = Decoder::new(value.as_bytes(field)?);
                    while let Some((f, v)) = inner.next_field()? {
                        match f {
                            1 => out.total_size = v.as_u32(f)?,
                            2 => out.fragset_id = v.as_u64(f)?,
                            3 => out.offset = v.as_u32(f)?,
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Decoded `DataSig`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataSig {
    pub version: u32,
    pub sig: Vec<u8>,
    pub sender_pk: Vec<u8>,
}

impl DataSig {
    pub fn encode(&self) -> Vec<u8> {
        Encoder::new()
            .uint(1, self.version as u64)
            .bytes(2, &self.sig)
            .bytes(3, &self.sender_pk)
            .finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut out = DataSig::default();
        let mut dec = Decoder::new(buf);
        while let Some((field, value)) = dec.next_field()? {
            match field {
                1 => out.version = value.as_u32(field)?,
                2 => out.sig = value.as_bytes(field)?.to_vec(),
                3 => out.sender_pk = value.as_bytes(field)?.to_vec(),
                _ => {}
            }
        }
        Ok(out)
    }
}

fn signed_bytes(destination: &Address, data_struct: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(destination.as_bytes().len() + data_struct.len());
    msg.extend_from_slice(destination.as_bytes());
    msg.extend_from_slice(data_struct);
    msg
}

/// Encode a fragment and, with a signer, sign it for `destination`.
pub async fn marshal_and_sign(
    config: &CodecConfig,
    fragment: &Fragment,
    destination: Option<&Address>,
    signer: Option<&dyn Signer>,
) -> Result<TlvRecords> {
    let ds = DataStruct {
        version: WIRE_VERSION,
        payload: fragment.payload.clone(),
        total_size: fragment.total_size,
        fragset_id: fragment.fragset_id,
        offset: fragment.start,
    }
    .encode();

    let mut records = TlvRecords::new();
    if let Some(signer) = signer {
        let destination = destination.ok_or_else(|| {
            LnchatError::new(ErrorKind::DestinationRequired, "signed fragment needs a destination")
        })?;
        let sig = signer.sign(&signed_bytes(destination, &ds)).await?;
        let data_sig = DataSig {
            version: WIRE_VERSION,
            sig,
            sender_pk: signer.address().as_bytes().to_vec(),
        };
        records.insert(config.data_sig_key, data_sig.encode());
    }
    records.insert(config.data_struct_key, ds);
    Ok(records)
}

/// Decode a fragment and, with a verifier, check its signature.
///
/// Returns the fragment and the sender taken from the signature record. An
/// unsigned fragment yields no sender and is never verified.
pub async fn unmarshal_and_verify(
    config: &CodecConfig,
    records: &TlvRecords,
    verifier: Option<&dyn Verifier>,
) -> Result<(Fragment, Option<Address>)> {
    let raw = records
        .get(&config.data_struct_key)
        .ok_or_else(|| LnchatError::marshal("no data struct record"))?;
    let ds = DataStruct::decode(raw)?;
    if ds.version > WIRE_VERSION {
        return Err(LnchatError::marshal(format!(
            "unsupported data struct version {}",
            ds.version
        )));
    }

    let total_size = if ds.total_size == 0 {
        u32::try_from(ds.payload.len())
            .map_err(|_| LnchatError::marshal("payload larger than u32"))?
    } else {
        ds.total_size
    };
    if total_size > config.max_transmission_size {
        return Err(LnchatError::marshal(format!(
            "total size {} exceeds limit {}",
            total_size, config.max_transmission_size
        )));
    }
    if ds.offset as u64 + ds.payload.len() as u64 > total_size as u64 {
        return Err(LnchatError::marshal(format!(
            "fragment [{}, +{}) exceeds total size {}",
            ds.offset,
            ds.payload.len(),
            total_size
        )));
    }

    let mut fragment = Fragment {
        start: ds.offset,
        payload: ds.payload,
        total_size,
        fragset_id: ds.fragset_id,
        verified: false,
    };

    let Some(raw_sig) = records.get(&config.data_sig_key) else {
        return Ok((fragment, None));
    };
    let data_sig = DataSig::decode(raw_sig)?;
    if data_sig.version > WIRE_VERSION {
        return Err(LnchatError::marshal(format!(
            "unsupported data sig version {}",
            data_sig.version
        )));
    }
    let sender = Address::from_bytes(&data_sig.sender_pk)?;

    if let Some(verifier) = verifier {
        let msg = signed_bytes(&verifier.address(), raw);
        fragment.verified = verifier.verify(&msg, &data_sig.sig, &sender).await?;
    }
    Ok((fragment, Some(sender)))
}
