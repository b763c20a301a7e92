//! LND REST client implementation.

use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, OnceCell};

use super::config::LndConfig;
use super::json::{
    b64, records_to_json, AddInvoiceRequest, AddInvoiceResponse, GetInfoResponse, LndError,
    LndInvoice, LndPayment, ListPaymentsResponse, PayReqResponse, QueryRoutesResponse,
    SendPaymentRequest, SignMessageRequest, SignMessageResponse, StreamFrame,
    VerifyMessageRequest, VerifyMessageResponse,
};
use crate::client::{
    Invoice, InvoiceFilter, InvoiceRequest, LightningClient, NodeInfo, PayReq, Payment,
    PaymentFilter, PaymentRequest, RouteEstimate, RouteQuery, Updates,
};
use crate::{Address, ErrorKind, LnchatError, Result};

/// Custom record carrying the preimage of a spontaneous payment.
pub const KEYSEND_PREIMAGE_RECORD: u64 = 5482373484;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";
const STREAM_BUFFER: usize = 16;
const LIST_PAGE_SIZE: usize = 500;

/// Channel client talking to LND's REST gateway.
pub struct LndRestClient {
    config: LndConfig,
    http: Client,
    stream_http: Client,
    identity: OnceCell<NodeInfo>,
}

fn client_builder(config: &LndConfig) -> Result<ClientBuilder> {
    let mut headers = HeaderMap::new();
    let macaroon = HeaderValue::from_str(&config.macaroon_hex)
        .map_err(|_| LnchatError::invalid_argument("macaroon is not a valid header value"))?;
    headers.insert(MACAROON_HEADER, macaroon);

    let mut builder = Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(config.timeout_secs));
    if let Some(pem) = &config.tls_cert_pem {
        let cert = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
            LnchatError::invalid_argument("tls certificate is not valid PEM").with_source(e)
        })?;
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder)
}

fn build(builder: ClientBuilder) -> Result<Client> {
    builder
        .build()
        .map_err(|e| LnchatError::internal("failed to build HTTP client").with_source(e))
}

fn transport_error(err: reqwest::Error) -> LnchatError {
    let kind = if err.is_timeout() {
        ErrorKind::DeadlineExceeded
    } else {
        ErrorKind::Network
    };
    LnchatError::new(kind, err.to_string()).with_source(err)
}

fn status_error(status: StatusCode, body: &[u8]) -> LnchatError {
    match serde_json::from_slice::<LndError>(body) {
        Ok(err) if err.code != 0 || !err.message.is_empty() => err.into_error(),
        _ => {
            let kind = match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Permission,
                StatusCode::NOT_FOUND => ErrorKind::NotFound,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Network,
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                    ErrorKind::DeadlineExceeded
                }
                _ => ErrorKind::Internal,
            };
            LnchatError::new(kind, format!("HTTP {}", status))
        }
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Forward newline-delimited frames of `response` into `tx` until the
/// stream ends, an error frame arrives or the receiver goes away.
///
/// A frame longer than `max_line` bytes ends the stream with a marshal error.
async fn pump<W, T, F>(
    mut response: Response,
    tx: mpsc::Sender<Result<T>>,
    max_line: usize,
    mut map: F,
) where
    W: DeserializeOwned,
    F: FnMut(W) -> Result<Option<T>>,
{
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => return,
            chunk = response.chunk() => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => buf.extend_from_slice(&bytes),
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(transport_error(e))).await;
                return;
            }
        }

        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            if pos > max_line {
                let _ = tx.send(Err(oversized_frame(pos, max_line))).await;
                return;
            }
            let line: Vec<u8> = buf.drain(..=pos).collect();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let item = match serde_json::from_slice::<StreamFrame<W>>(&line) {
                Ok(StreamFrame {
                    error: Some(err), ..
                }) => Err(err.into_error()),
                Ok(StreamFrame {
                    result: Some(value),
                    ..
                }) => match map(value) {
                    Ok(Some(item)) => Ok(item),
                    Ok(None) => continue,
                    Err(e) => Err(e),
                },
                Ok(_) => continue,
                Err(e) => Err(LnchatError::from(e)),
            };
            let fatal = item.is_err();
            if tx.send(item).await.is_err() || fatal {
                return;
            }
        }

        if buf.len() > max_line {
            let _ = tx.send(Err(oversized_frame(buf.len(), max_line))).await;
            return;
        }
    }
}

fn oversized_frame(len: usize, max_line: usize) -> LnchatError {
    LnchatError::marshal(format!(
        "stream frame of at least {} bytes exceeds limit {}",
        len, max_line
    ))
}

impl LndRestClient {
    /// Create a client; no request is made until first use.
    pub fn new(config: LndConfig) -> Result<Self> {
        config.validate()?;
        let http = build(client_builder(&config)?.timeout(Duration::from_secs(config.timeout_secs)))?;
        let stream_http = build(client_builder(&config)?)?;
        Ok(Self {
            config,
            http,
            stream_http,
            identity: OnceCell::new(),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &LndConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.rest_url.trim_end_matches('/'), path)
    }

    async fn identity(&self) -> Result<&NodeInfo> {
        self.identity
            .get_or_try_init(|| async {
                let info: GetInfoResponse = self.get("/v1/getinfo").await?;
                info.into_node_info()
            })
            .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.http.get(self.url(path))).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.http.post(self.url(path)).json(body)).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn stream<W, T, F>(&self, request: RequestBuilder, map: F) -> Result<Updates<T>>
    where
        W: DeserializeOwned + Send + 'static,
        T: Send + 'static,
        F: FnMut(W) -> Result<Option<T>> + Send + 'static,
    {
        let response = request.send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump(response, tx, self.config.max_stream_line, map));
        Ok(rx)
    }

    async fn invoice_by_hash(&self, hash_hex: &str) -> Result<Invoice> {
        let creator = self.identity().await?.address;
        let invoice: LndInvoice = self.get(&format!("/v1/invoice/{}", hash_hex)).await?;
        invoice.into_invoice(creator)
    }

    async fn list_payments_after(
        &self,
        payer: Address,
        payment_index: u64,
        filter: &PaymentFilter,
    ) -> Result<Vec<Payment>> {
        let mut backlog = Vec::new();
        let mut offset = payment_index;
        loop {
            let page: ListPaymentsResponse = self
                .get(&format!(
                    "/v1/payments?index_offset={}&max_payments={}&include_incomplete=true",
                    offset, LIST_PAGE_SIZE
                ))
                .await?;
            let count = page.payments.len();
            backlog.extend(
                page.payments
                    .into_iter()
                    .map(|p| p.into_payment(payer, None))
                    .filter(|p| p.payment_index > payment_index && filter.accepts(p)),
            );
            if count < LIST_PAGE_SIZE || page.last_index_offset <= offset {
                break;
            }
            offset = page.last_index_offset;
        }
        Ok(backlog)
    }
}

#[async_trait]
impl LightningClient for LndRestClient {
    async fn get_info(&self) -> Result<NodeInfo> {
        self.identity().await.cloned()
    }

    async fn sign_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let response: SignMessageResponse = self
            .post("/v1/signmessage", &SignMessageRequest { msg: b64(data) })
            .await?;
        Ok(response.signature.into_bytes())
    }

    async fn verify_signature_extract_pubkey(
        &self,
        data: &[u8],
        signature: &[u8],
    ) -> Result<Option<Address>> {
        let Ok(signature) = String::from_utf8(signature.to_vec()) else {
            return Ok(None);
        };
        let response: VerifyMessageResponse = self
            .post(
                "/v1/verifymessage",
                &VerifyMessageRequest {
                    msg: b64(data),
                    signature,
                },
            )
            .await?;
        if !response.valid {
            return Ok(None);
        }
        Ok(Some(response.pubkey.parse()?))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice> {
        let added: AddInvoiceResponse = self
            .post(
                "/v1/invoices",
                &AddInvoiceRequest {
                    memo: request.memo,
                    value_msat: request.amount.msat().to_string(),
                    expiry: request.expiry_secs.to_string(),
                    private: request.private,
                },
            )
            .await?;
        self.invoice_by_hash(&added.hash_hex()?).await
    }

    async fn lookup_invoice(&self, payment_request: &str) -> Result<Invoice> {
        let decoded = self.decode_payment_request(payment_request).await?;
        self.invoice_by_hash(&decoded.payment_hash).await
    }

    async fn decode_payment_request(&self, payment_request: &str) -> Result<PayReq> {
        let response: PayReqResponse = self.get(&format!("/v1/payreq/{}", payment_request)).await?;
        response.into_pay_req()
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, filter)))]
    async fn subscribe_invoice_updates(
        &self,
        settle_index: u64,
        filter: InvoiceFilter,
    ) -> Result<Updates<Invoice>> {
        let creator = self.identity().await?.address;
        let request = self.stream_http.get(self.url(&format!(
            "/v1/invoices/subscribe?settle_index={}",
            settle_index
        )));
        self.stream(request, move |raw: LndInvoice| {
            let invoice = raw.into_invoice(creator)?;
            Ok(filter.accepts(&invoice).then_some(invoice))
        })
        .await
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, filter)))]
    async fn subscribe_payment_updates(
        &self,
        payment_index: u64,
        filter: PaymentFilter,
    ) -> Result<Updates<Payment>> {
        let payer = self.identity().await?.address;

        // Open the live stream before listing so nothing falls in between;
        // overlap is harmless because payment indexes are unique keys.
        let live_filter = filter.clone();
        let request = self
            .stream_http
            .get(self.url("/v2/router/payments?no_inflight_updates=true"));
        let mut live = self
            .stream(request, move |raw: LndPayment| {
                let payment = raw.into_payment(payer, None);
                Ok(live_filter.accepts(&payment).then_some(payment))
            })
            .await?;
        let backlog = self.list_payments_after(payer, payment_index, &filter).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for payment in backlog {
                if tx.send(Ok(payment)).await.is_err() {
                    return;
                }
            }
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => return,
                    item = live.recv() => item,
                };
                match item {
                    Some(item) => {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        });
        Ok(rx)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, request), fields(amount = %request.amount)))]
    async fn send_payment(&self, request: PaymentRequest) -> Result<Payment> {
        let payer = self.identity().await?.address;
        let mut custom_records = request.custom_records.clone();
        let mut body = SendPaymentRequest {
            timeout_seconds: i32::try_from(self.config.payment_timeout_secs).unwrap_or(i32::MAX),
            no_inflight_updates: true,
            ..Default::default()
        };

        let destination = match (&request.payment_request, &request.destination) {
            (Some(pr), dest) => {
                body.payment_request = Some(pr.clone());
                match dest {
                    Some(d) => *d,
                    None => self.decode_payment_request(pr).await?.destination,
                }
            }
            (None, Some(dest)) => {
                let mut preimage = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut preimage);
                body.dest = Some(b64(dest.as_bytes()));
                body.payment_hash = Some(b64(&Sha256::digest(preimage)));
                custom_records.insert(KEYSEND_PREIMAGE_RECORD, preimage.to_vec());
                *dest
            }
            (None, None) => {
                return Err(LnchatError::invalid_argument(
                    "payment needs a destination or a payment request",
                ))
            }
        };
        if !request.amount.is_zero() {
            body.amt_msat = Some(request.amount.msat().to_string());
        }
        if !request.fee_limit.is_zero() {
            body.fee_limit_msat = Some(request.fee_limit.msat().to_string());
        }
        body.dest_custom_records = records_to_json(&custom_records);

        let http_request = self
            .stream_http
            .post(self.url("/v2/router/send"))
            .json(&body);
        let mut updates = self
            .stream(http_request, move |raw: LndPayment| {
                Ok(Some(raw.into_payment(payer, Some(destination))))
            })
            .await?;

        while let Some(update) = updates.recv().await {
            let payment = update?;
            if payment.status.is_final() {
                return Ok(payment);
            }
        }
        Err(LnchatError::internal(
            "payment stream ended before a final status",
        ))
    }

    async fn get_route(&self, query: RouteQuery) -> Result<RouteEstimate> {
        let destination = query
            .destination
            .ok_or_else(|| LnchatError::invalid_argument("route query needs a destination"))?;
        let mut path = format!(
            "/v1/graph/routes/{}/0?amt_msat={}",
            destination,
            query.amount.msat()
        );
        if !query.fee_limit.is_zero() {
            path.push_str(&format!("&fee_limit.fixed_msat={}", query.fee_limit.msat()));
        }
        let response: QueryRoutesResponse = self.get(&path).await?;
        let route = response
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| LnchatError::new(ErrorKind::NoRouteFound, destination.to_string()))?;
        Ok(RouteEstimate {
            route: route.into_route(),
            success_prob: response.success_prob,
        })
    }
}
