//! Connection settings for the LND REST gateway.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{LnchatError, Result};

/// Configuration for [`LndRestClient`](super::LndRestClient).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LndConfig {
    /// REST endpoint URL (e.g., "https://localhost:8080").
    pub rest_url: String,

    /// Macaroon for authentication (hex-encoded).
    pub macaroon_hex: String,

    /// TLS certificate (PEM format, optional for self-signed).
    pub tls_cert_pem: Option<String>,

    /// Timeout of unary requests in seconds. Streams are not bounded.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Give-up time of a single payment attempt in seconds.
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_secs: u64,

    /// Longest frame accepted from a subscription stream, in bytes.
    #[serde(default = "default_max_stream_line")]
    pub max_stream_line: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_payment_timeout() -> u64 {
    60
}

fn default_max_stream_line() -> usize {
    4 * 1024 * 1024
}

impl LndConfig {
    /// Create a new LND configuration. A bare `host:port` gets an `https://`
    /// scheme.
    pub fn new(rest_url: impl Into<String>, macaroon_hex: impl Into<String>) -> Self {
        let mut rest_url = rest_url.into();
        if !rest_url.is_empty() && !rest_url.contains("://") {
            rest_url = format!("https://{}", rest_url);
        }
        Self {
            rest_url,
            macaroon_hex: macaroon_hex.into(),
            tls_cert_pem: None,
            timeout_secs: default_timeout(),
            payment_timeout_secs: default_payment_timeout(),
            max_stream_line: default_max_stream_line(),
        }
    }

    /// Build from the node's macaroon and certificate files.
    pub fn from_files(
        rest_url: impl Into<String>,
        macaroon_path: &Path,
        tls_path: Option<&Path>,
    ) -> Result<Self> {
        let macaroon = std::fs::read(macaroon_path).map_err(|e| {
            LnchatError::invalid_argument(format!("macaroon {}", macaroon_path.display()))
                .with_source(e)
        })?;
        let mut config = Self::new(rest_url, hex::encode(macaroon));
        if let Some(tls_path) = tls_path {
            let pem = std::fs::read_to_string(tls_path).map_err(|e| {
                LnchatError::invalid_argument(format!("tls certificate {}", tls_path.display()))
                    .with_source(e)
            })?;
            config = config.with_tls_cert(pem);
        }
        Ok(config)
    }

    /// Set the TLS certificate.
    pub fn with_tls_cert(mut self, cert_pem: impl Into<String>) -> Self {
        self.tls_cert_pem = Some(cert_pem.into());
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Cap the length of one subscription frame.
    pub fn with_max_stream_line(mut self, bytes: usize) -> Self {
        self.max_stream_line = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rest_url.is_empty() {
            return Err(LnchatError::invalid_argument("REST URL cannot be empty"));
        }
        if self.macaroon_hex.is_empty() {
            return Err(LnchatError::invalid_argument("macaroon cannot be empty"));
        }
        if self.max_stream_line == 0 {
            return Err(LnchatError::invalid_argument("max_stream_line must be positive"));
        }
        Ok(())
    }
}
