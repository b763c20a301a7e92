//! LND REST gateway JSON shapes.
//!
//! The gateway renders 64-bit integers as strings and byte fields as base64;
//! both forms of integer are accepted on input.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::client::{
    HtlcStatus, Hop, Invoice, InvoiceHtlc, InvoiceHtlcState, InvoiceState, NodeInfo, PayReq,
    Payment, PaymentHtlc, PaymentStatus, Route,
};
use crate::wire::TlvRecords;
use crate::{Address, Amount, LnchatError, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum StrOrNum {
    Str(String),
    Int(i64),
    UInt(u64),
}

impl StrOrNum {
    fn parse<E: serde::de::Error>(self) -> std::result::Result<i128, E> {
        match self {
            StrOrNum::Int(n) => Ok(n as i128),
            StrOrNum::UInt(n) => Ok(n as i128),
            StrOrNum::Str(s) if s.is_empty() => Ok(0),
            StrOrNum::Str(s) => s.parse().map_err(E::custom),
        }
    }
}

pub(crate) fn de_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    let n = StrOrNum::deserialize(d)?.parse::<D::Error>()?;
    u64::try_from(n).map_err(serde::de::Error::custom)
}

pub(crate) fn de_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    let n = StrOrNum::deserialize(d)?.parse::<D::Error>()?;
    i64::try_from(n).map_err(serde::de::Error::custom)
}

/// `{"code": .., "message": ..}` error body, also used inside stream frames.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct LndError {
    #[serde(default, alias = "grpc_code")]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl LndError {
    pub fn into_error(self) -> LnchatError {
        LnchatError::from_rpc_status(self.code, self.message)
    }
}

/// One newline-delimited frame of a server stream.
#[derive(Deserialize)]
pub(crate) struct StreamFrame<T> {
    pub result: Option<T>,
    pub error: Option<LndError>,
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    B64.decode(value)
        .map_err(|e| LnchatError::marshal(format!("{} is not base64: {}", field, e)))
}

fn b64_to_hex(field: &str, value: &str) -> Result<String> {
    Ok(hex::encode(decode_b64(field, value)?))
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn records_from_json(raw: BTreeMap<String, String>) -> Result<TlvRecords> {
    raw.into_iter()
        .map(|(k, v)| {
            let key = k
                .parse::<u64>()
                .map_err(|e| LnchatError::marshal(format!("record key {}: {}", k, e)))?;
            Ok((key, decode_b64("custom record", &v)?))
        })
        .collect()
}

pub(crate) fn records_to_json(records: &TlvRecords) -> BTreeMap<String, String> {
    records
        .iter()
        .map(|(k, v)| (k.to_string(), B64.encode(v)))
        .collect()
}

#[derive(Deserialize)]
pub(crate) struct GetInfoResponse {
    #[serde(default)]
    pub alias: String,
    pub identity_pubkey: String,
}

impl GetInfoResponse {
    pub fn into_node_info(self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            alias: self.alias,
            address: self.identity_pubkey.parse()?,
        })
    }
}

#[derive(Serialize)]
pub(crate) struct SignMessageRequest {
    pub msg: String,
}

#[derive(Deserialize)]
pub(crate) struct SignMessageResponse {
    pub signature: String,
}

#[derive(Serialize)]
pub(crate) struct VerifyMessageRequest {
    pub msg: String,
    pub signature: String,
}

#[derive(Deserialize)]
pub(crate) struct VerifyMessageResponse {
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub pubkey: String,
}

#[derive(Serialize)]
pub(crate) struct AddInvoiceRequest {
    pub memo: String,
    pub value_msat: String,
    pub expiry: String,
    pub private: bool,
}

#[derive(Deserialize)]
pub(crate) struct AddInvoiceResponse {
    pub r_hash: String,
}

impl AddInvoiceResponse {
    pub fn hash_hex(&self) -> Result<String> {
        b64_to_hex("r_hash", &self.r_hash)
    }
}

#[derive(Deserialize)]
pub(crate) struct LndInvoiceHtlc {
    #[serde(default)]
    state: String,
    #[serde(default, deserialize_with = "de_i64")]
    amt_msat: i64,
    #[serde(default)]
    custom_records: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub(crate) struct LndInvoice {
    #[serde(default)]
    memo: String,
    #[serde(default)]
    r_preimage: String,
    #[serde(default)]
    r_hash: String,
    #[serde(default, deserialize_with = "de_i64")]
    value_msat: i64,
    #[serde(default, deserialize_with = "de_i64")]
    creation_date: i64,
    #[serde(default, deserialize_with = "de_i64")]
    settle_date: i64,
    #[serde(default)]
    payment_request: String,
    #[serde(default, deserialize_with = "de_i64")]
    expiry: i64,
    #[serde(default)]
    private: bool,
    #[serde(default, deserialize_with = "de_u64")]
    add_index: u64,
    #[serde(default, deserialize_with = "de_u64")]
    settle_index: u64,
    #[serde(default, deserialize_with = "de_i64")]
    amt_paid_msat: i64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    htlcs: Vec<LndInvoiceHtlc>,
}

impl LndInvoice {
    pub fn into_invoice(self, creator: Address) -> Result<Invoice> {
        let state = match self.state.as_str() {
            "SETTLED" => InvoiceState::Settled,
            "ACCEPTED" => InvoiceState::Accepted,
            "CANCELED" | "CANCELLED" => InvoiceState::Cancelled,
            _ => InvoiceState::Open,
        };
        let htlcs = self
            .htlcs
            .into_iter()
            .map(|h| {
                Ok(InvoiceHtlc {
                    state: match h.state.as_str() {
                        "SETTLED" => InvoiceHtlcState::Settled,
                        "CANCELED" | "CANCELLED" => InvoiceHtlcState::Cancelled,
                        _ => InvoiceHtlcState::Accepted,
                    },
                    amount: Amount(h.amt_msat),
                    custom_records: records_from_json(h.custom_records)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Invoice {
            creator_address: creator,
            memo: self.memo,
            preimage_hash: b64_to_hex("r_hash", &self.r_hash)?,
            preimage: b64_to_hex("r_preimage", &self.r_preimage)?,
            payment_request: self.payment_request,
            value: Amount(self.value_msat),
            amt_paid: Amount(self.amt_paid_msat),
            created_at: timestamp(self.creation_date),
            settled_at: (self.settle_date > 0).then(|| timestamp(self.settle_date)),
            expiry_secs: self.expiry,
            private: self.private,
            state,
            add_index: self.add_index,
            settle_index: self.settle_index,
            htlcs,
        })
    }
}

#[derive(Deserialize)]
pub(crate) struct PayReqResponse {
    destination: String,
    #[serde(default)]
    payment_hash: String,
    #[serde(default, deserialize_with = "de_i64")]
    num_msat: i64,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "de_i64")]
    expiry: i64,
    #[serde(default, deserialize_with = "de_i64")]
    timestamp: i64,
}

impl PayReqResponse {
    pub fn into_pay_req(self) -> Result<PayReq> {
        Ok(PayReq {
            destination: self.destination.parse()?,
            payment_hash: self.payment_hash,
            amount: Amount(self.num_msat),
            description: self.description,
            expiry_secs: self.expiry,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Deserialize)]
pub(crate) struct LndHop {
    #[serde(default, deserialize_with = "de_u64")]
    chan_id: u64,
    #[serde(default)]
    pub_key: String,
    #[serde(default, deserialize_with = "de_i64")]
    amt_to_forward_msat: i64,
    #[serde(default, deserialize_with = "de_i64")]
    fee_msat: i64,
}

#[derive(Deserialize)]
pub(crate) struct LndRoute {
    #[serde(default, deserialize_with = "de_i64")]
    total_amt_msat: i64,
    #[serde(default, deserialize_with = "de_i64")]
    total_fees_msat: i64,
    #[serde(default)]
    hops: Vec<LndHop>,
}

impl LndRoute {
    pub fn into_route(self) -> Route {
        Route {
            total_amt: Amount(self.total_amt_msat),
            total_fees: Amount(self.total_fees_msat),
            hops: self
                .hops
                .into_iter()
                .map(|h| Hop {
                    chan_id: h.chan_id,
                    pub_key: h.pub_key.parse().ok(),
                    amt_to_forward: Amount(h.amt_to_forward_msat),
                    fee: Amount(h.fee_msat),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct LndPaymentHtlc {
    #[serde(default)]
    status: String,
    route: Option<LndRoute>,
}

#[derive(Deserialize)]
pub(crate) struct LndPayment {
    #[serde(default)]
    payment_hash: String,
    #[serde(default)]
    payment_preimage: String,
    #[serde(default, deserialize_with = "de_i64")]
    value_msat: i64,
    #[serde(default, deserialize_with = "de_i64")]
    fee_msat: i64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    failure_reason: String,
    #[serde(default, deserialize_with = "de_u64")]
    payment_index: u64,
    #[serde(default, deserialize_with = "de_i64")]
    creation_time_ns: i64,
    #[serde(default)]
    htlcs: Vec<LndPaymentHtlc>,
}

impl LndPayment {
    /// The payee is the last hop of the first routed HTLC; `payee` overrides
    /// it when the caller already knows the destination.
    pub fn into_payment(self, payer: Address, payee: Option<Address>) -> Payment {
        let htlcs: Vec<PaymentHtlc> = self
            .htlcs
            .into_iter()
            .map(|h| PaymentHtlc {
                status: match h.status.as_str() {
                    "SUCCEEDED" => HtlcStatus::Succeeded,
                    "FAILED" => HtlcStatus::Failed,
                    _ => HtlcStatus::InFlight,
                },
                route: h.route.map(LndRoute::into_route).unwrap_or_default(),
            })
            .collect();
        let routed_payee = htlcs
            .iter()
            .find_map(|h| h.route.hops.last().and_then(|hop| hop.pub_key));
        let preimage = if self.payment_preimage.bytes().all(|b| b == b'0') {
            String::new()
        } else {
            self.payment_preimage
        };
        let failure_reason = match self.failure_reason.as_str() {
            "FAILURE_REASON_NONE" => String::new(),
            other => other.to_string(),
        };

        Payment {
            payer,
            payee: payee.or(routed_payee).unwrap_or(payer),
            hash: self.payment_hash,
            preimage,
            value: Amount(self.value_msat),
            fee: Amount(self.fee_msat),
            status: match self.status.as_str() {
                "SUCCEEDED" => PaymentStatus::Succeeded,
                "FAILED" => PaymentStatus::Failed,
                "IN_FLIGHT" | "INITIATED" => PaymentStatus::InFlight,
                _ => PaymentStatus::Unknown,
            },
            failure_reason,
            payment_index: self.payment_index,
            created_at: Utc.timestamp_nanos(self.creation_time_ns),
            htlcs,
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ListPaymentsResponse {
    #[serde(default)]
    pub payments: Vec<LndPayment>,
    #[serde(default, deserialize_with = "de_u64")]
    pub last_index_offset: u64,
}

#[derive(Serialize, Default)]
pub(crate) struct SendPaymentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amt_msat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_limit_msat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    pub timeout_seconds: i32,
    pub no_inflight_updates: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dest_custom_records: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub(crate) struct QueryRoutesResponse {
    #[serde(default)]
    pub routes: Vec<LndRoute>,
    #[serde(default)]
    pub success_prob: f64,
}

pub(crate) fn b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_or_number_integers() {
        #[derive(Deserialize)]
        struct T {
            #[serde(deserialize_with = "de_u64")]
            a: u64,
            #[serde(deserialize_with = "de_i64")]
            b: i64,
        }
        let t: T = serde_json::from_str(r#"{"a":"18446744073709551615","b":-5}"#).unwrap();
        assert_eq!(t.a, u64::MAX);
        assert_eq!(t.b, -5);
        assert!(serde_json::from_str::<T>(r#"{"a":"-1","b":0}"#).is_err());
    }

    #[test]
    fn test_invoice_conversion() {
        let json = r#"{
            "memo": "hi",
            "r_hash": "AAEC",
            "r_preimage": "",
            "value_msat": "1000",
            "creation_date": "1700000000",
            "settle_date": "1700000100",
            "payment_request": "lnbc1",
            "add_index": "4",
            "settle_index": "2",
            "amt_paid_msat": "1000",
            "state": "SETTLED",
            "htlcs": [{"state": "SETTLED", "amt_msat": "1000",
                       "custom_records": {"293345191": "AQI="}}]
        }"#;
        let lnd: LndInvoice = serde_json::from_str(json).unwrap();
        let invoice = lnd.into_invoice(Address::new([2; 33])).unwrap();
        assert_eq!(invoice.state, InvoiceState::Settled);
        assert_eq!(invoice.settle_index, 2);
        assert_eq!(invoice.preimage_hash, "000102");
        assert_eq!(invoice.htlcs[0].custom_records.get(&0x117C17A7), Some(&vec![1, 2]));
        assert!(invoice.settled_at.is_some());
    }

    #[test]
    fn test_payment_payee_from_route() {
        let payee = Address::new([3; 33]);
        let json = format!(
            r#"{{"payment_hash":"ab","status":"SUCCEEDED","payment_index":"9",
                 "failure_reason":"FAILURE_REASON_NONE",
                 "htlcs":[{{"status":"SUCCEEDED","route":{{"total_fees_msat":"3",
                   "hops":[{{"chan_id":"1","pub_key":"{}"}}]}}}}]}}"#,
            payee
        );
        let lnd: LndPayment = serde_json::from_str(&json).unwrap();
        let payment = lnd.into_payment(Address::new([2; 33]), None);
        assert_eq!(payment.payee, payee);
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.payment_index, 9);
        assert!(payment.failure_reason.is_empty());
        assert_eq!(payment.succeeded_route().map(|r| r.total_fees), Some(Amount(3)));
    }

    #[test]
    fn test_records_json() {
        let mut records = TlvRecords::new();
        records.insert(5482373484, vec![0xff]);
        let json = records_to_json(&records);
        assert_eq!(json.get("5482373484").map(String::as_str), Some("/w=="));
        assert_eq!(records_from_json(json).unwrap(), records);
    }
}
