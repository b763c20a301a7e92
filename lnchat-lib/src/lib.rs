//! lnchat library.
//!
//! Carries arbitrary byte payloads over a payment-channel network by attaching
//! TLV records to payments. The crate stays free of persistence and runtime
//! policy: callers inject the channel client, signer and verifier through
//! traits.
//!
//! # Building blocks
//!
//! - **Sharder**: leases caller-sized, signed fragments out of one payload
//! - **Aggregator**: reassembles fragments per source into transmissions
//! - **Wire codec**: versioned DataStruct/DataSig framing bound to a destination
//! - **Channel client**: the control and data surface of the remote node
//!
//! # Example
//!
//! ```ignore
//! use lnchat_lib::{Aggregator, CodecConfig, SequentialIds, Sharder};
//!
//! let ids = SequentialIds::new(true);
//! let sharder = Sharder::new(data, Some(dest), Some(signer), &ids, CodecConfig::default())?;
//! let aggregator = Aggregator::new(Some(verifier));
//!
//! while let Some((fields, lease)) = sharder.get(1024).await? {
//!     let notifier = aggregator.update(&fields).await?;
//!     lease.commit();
//! }
//! ```

use std::fmt;
use std::str::FromStr;

pub mod aggregator;
pub mod client;
pub mod errors;
pub mod ids;
#[cfg(feature = "lnd-rest")]
pub mod lnd;
pub mod options;
pub mod sharder;
pub mod skiplist;
pub mod transmission;
pub mod wire;

/// Test utilities for messaging tests.
///
/// This module is only available with the `test-utils` feature or in test builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use aggregator::{Aggregator, Notifier, DEFAULT_IDLE_TIMEOUT};
pub use client::{ClientSigner, ClientVerifier, LightningClient};
pub use errors::{ErrorKind, LnchatError};
pub use ids::{IdDispenser, SequentialIds};
pub use options::{override_options, MessageOptions};
pub use sharder::{Lease, Sharder};
pub use transmission::{Fragment, Transmission, TransmissionId};
pub use wire::{CodecConfig, Signer, TlvRecords, Verifier};

/// Common result alias for lnchat operations.
pub type Result<T> = std::result::Result<T, LnchatError>;

/// Length in bytes of a network participant address.
pub const ADDRESS_LEN: usize = 33;

/// Compressed public key identifying a network participant.
///
/// # Example
///
/// ```
/// use lnchat_lib::Address;
///
/// let mut raw = [0u8; 33];
/// raw[0] = 0x02;
/// let addr = Address::from_bytes(&raw).unwrap();
/// assert_eq!(addr.to_string().len(), 66);
/// assert!(Address::from_bytes(&raw[..32]).is_err());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Wrap an exact 33-byte array.
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse raw bytes; any length other than 33 is an `InvalidAddress` error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| {
            LnchatError::new(
                ErrorKind::InvalidAddress,
                format!("address must be {} bytes, got {}", ADDRESS_LEN, bytes.len()),
            )
        })?;
        Ok(Self(raw))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Lowercase hex form, as used in JSON envelopes and node APIs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = LnchatError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| {
            LnchatError::new(ErrorKind::InvalidAddress, format!("address {:?}: {}", s, e))
        })?;
        Self::from_bytes(&raw)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Amount in milli-units of account. Zero is a valid value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Amount(pub i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_msat(msat: i64) -> Self {
        Self(msat)
    }

    pub fn msat(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Add without overflowing; saturates at the bounds.
    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }
}

impl From<i64> for Amount {
    fn from(msat: i64) -> Self {
        Self(msat)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} msat", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_roundtrip() {
        let mut raw = [0u8; 33];
        raw[0] = 0x03;
        raw[32] = 0xff;
        let addr = Address::new(raw);
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_address_invalid_length() {
        let err = Address::from_bytes(&[0u8; 20]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);

        let err = "0203".parse::<Address>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
    }

    #[test]
    fn test_address_serde_as_hex() {
        let addr = Address::new([0x02; 33]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", "02".repeat(33)));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_address_ordering_is_lexical() {
        let a = Address::new([0x02; 33]);
        let b = Address::new([0x03; 33]);
        assert!(a < b);
    }

    #[test]
    fn test_amount() {
        assert!(Amount::ZERO.is_zero());
        assert_eq!(Amount(5).saturating_add(Amount(i64::MAX)), Amount(i64::MAX));
        assert_eq!(Amount::from(1000).to_string(), "1000 msat");
    }
}
