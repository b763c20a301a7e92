//! Test fixtures and data generators.

use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::client::{
    HtlcStatus, Invoice, InvoiceHtlc, InvoiceHtlcState, InvoiceState, Payment, PaymentHtlc,
    PaymentStatus, Route,
};
use crate::wire::TlvRecords;
use crate::{Address, Amount};

/// Address whose first byte is `tag` and the rest zero.
pub fn address(tag: u8) -> Address {
    let mut raw = [0u8; 33];
    raw[0] = tag;
    Address::new(raw)
}

/// Deterministic recoverable signature: `signer || sha256(signer || data)`.
pub fn mock_signature(signer: &Address, data: &[u8]) -> Vec<u8> {
    let mut sig = signer.as_bytes().to_vec();
    sig.extend_from_slice(&digest(signer, data));
    sig
}

/// Signer of a [`mock_signature`], if the signature matches `data`.
pub fn recover_mock_signature(data: &[u8], sig: &[u8]) -> Option<Address> {
    if sig.len() != 33 + 32 {
        return None;
    }
    let signer = Address::from_bytes(&sig[..33]).ok()?;
    (digest(&signer, data)[..] == sig[33..]).then_some(signer)
}

fn digest(signer: &Address, data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(signer.as_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

/// Settled invoice without HTLCs.
pub fn invoice(creator: Address, settle_index: u64) -> Invoice {
    let created_at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default();
    Invoice {
        creator_address: creator,
        memo: String::new(),
        preimage_hash: format!("{:064x}", settle_index),
        preimage: format!("{:064x}", settle_index + 1),
        payment_request: format!("lnmock{}", settle_index),
        value: Amount(1000),
        amt_paid: Amount(1000),
        created_at,
        settled_at: Some(created_at),
        expiry_secs: 3600,
        private: false,
        state: InvoiceState::Settled,
        add_index: settle_index,
        settle_index,
        htlcs: Vec::new(),
    }
}

/// Settled invoice paid by one HTLC carrying `records`.
pub fn settled_invoice_with_records(creator: Address, settle_index: u64, records: TlvRecords) -> Invoice {
    let mut inv = invoice(creator, settle_index);
    inv.htlcs.push(InvoiceHtlc {
        state: InvoiceHtlcState::Settled,
        amount: inv.amt_paid,
        custom_records: records,
    });
    inv
}

/// Succeeded single-HTLC payment.
pub fn payment(payer: Address, payee: Address, payment_index: u64) -> Payment {
    let route = Route {
        total_amt: Amount(1000),
        total_fees: Amount(1),
        hops: Vec::new(),
    };
    Payment {
        payer,
        payee,
        hash: format!("{:064x}", payment_index),
        preimage: format!("{:064x}", payment_index + 1),
        value: Amount(1000),
        fee: Amount(1),
        status: PaymentStatus::Succeeded,
        failure_reason: String::new(),
        payment_index,
        created_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default(),
        htlcs: vec![PaymentHtlc {
            status: HtlcStatus::Succeeded,
            route,
        }],
    }
}
