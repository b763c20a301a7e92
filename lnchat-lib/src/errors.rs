//! Error types for lnchat operations.
//!
//! Every error surfaced by the library carries a closed [`ErrorKind`], a short
//! contextual detail and an optional wrapped cause. Upstream error types are
//! translated at the boundary and never leak through.

use std::fmt;

/// Closed set of error kinds, with stable codes for FFI and RPC front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    /// Encoding or decoding failed
    Marshal = 1000,
    /// Operation was cancelled by the caller
    Cancelled = 2000,
    /// Operation ran out of time
    DeadlineExceeded = 2001,
    /// Remote service unreachable
    Network = 2002,
    /// Caller is not authorized
    Permission = 3000,
    /// No route to the destination
    NoRouteFound = 4000,
    /// Address is malformed
    InvalidAddress = 4001,
    /// Not enough outbound balance
    InsufficientBalance = 4002,
    /// Contact with this address exists
    ContactAlreadyExists = 5000,
    /// Contact is unknown
    ContactNotFound = 5001,
    /// Discussion with these participants exists
    DiscussionAlreadyExists = 5002,
    /// Discussion is unknown
    DiscussionNotFound = 5003,
    /// Message does not belong to the discussion
    MessageInvalidDiscussion = 5004,
    /// Generic duplicate insert
    AlreadyExists = 5005,
    /// Generic missing entity
    NotFound = 5006,
    /// Argument rejected before doing any work
    InvalidArgument = 6000,
    /// A signed transmission needs a destination
    DestinationRequired = 6001,
    /// Anonymous messages to group discussions are refused
    DiscAnonymousMessage = 6002,
    /// Unclassified failure reported by a remote
    Unknown = 9000,
    /// Internal/unexpected error
    Internal = 9999,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Marshal => "marshal error",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::Network => "network error",
            Self::Permission => "permission error",
            Self::NoRouteFound => "no route found",
            Self::InvalidAddress => "invalid address",
            Self::InsufficientBalance => "insufficient balance",
            Self::ContactAlreadyExists => "contact already exists",
            Self::ContactNotFound => "contact not found",
            Self::DiscussionAlreadyExists => "discussion already exists",
            Self::DiscussionNotFound => "discussion not found",
            Self::MessageInvalidDiscussion => "message does not belong to discussion",
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid argument",
            Self::DestinationRequired => "destination required",
            Self::DiscAnonymousMessage => "anonymous message to group discussion",
            Self::Unknown => "unknown error",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-band failure strings the channel service reports under an `Unknown`
/// status. Matched by substring.
const NO_ROUTE_SENTINELS: &[&str] = &["unable to find a path", "no route", "FAILURE_REASON_NO_ROUTE"];
const INVALID_ADDRESS_SENTINELS: &[&str] = &["invalid pubkey", "invalid vertex length", "invalid destination"];
const INSUFFICIENT_BALANCE_SENTINELS: &[&str] = &[
    "insufficient local balance",
    "insufficient balance",
    "FAILURE_REASON_INSUFFICIENT_BALANCE",
];

/// gRPC status codes the channel service reports.
pub mod rpc_code {
    pub const OK: i32 = 0;
    pub const CANCELLED: i32 = 1;
    pub const UNKNOWN: i32 = 2;
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const NOT_FOUND: i32 = 5;
    pub const ALREADY_EXISTS: i32 = 6;
    pub const PERMISSION_DENIED: i32 = 7;
    pub const UNAVAILABLE: i32 = 14;
    pub const UNAUTHENTICATED: i32 = 16;
}

/// Error returned by every fallible lnchat operation.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{}", with_separator(.detail))]
pub struct LnchatError {
    kind: ErrorKind,
    detail: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

fn with_separator(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

impl LnchatError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Get the error code for FFI/RPC integration.
    pub fn code(&self) -> i32 {
        self.kind as i32
    }

    /// Returns true if this error is potentially recoverable by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Network | ErrorKind::DeadlineExceeded | ErrorKind::Unknown
        )
    }

    /// Duplicate-insert errors, which idempotent callers skip.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::AlreadyExists
                | ErrorKind::ContactAlreadyExists
                | ErrorKind::DiscussionAlreadyExists
        )
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, detail)
    }

    pub fn marshal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Marshal, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    pub fn network<E>(detail: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(ErrorKind::Network, detail).with_source(cause)
    }

    /// Combine per-recipient failures into one error.
    ///
    /// Details are joined with `"; "`. The kind is kept when every error
    /// agrees on it, otherwise the result is `Internal`. An empty list yields
    /// an `Internal` error with no detail.
    pub fn join(errors: Vec<LnchatError>) -> Self {
        let mut iter = errors.into_iter();
        let Some(first) = iter.next() else {
            return Self::internal("");
        };
        let mut kind = first.kind;
        let mut detail = first.to_string();
        for err in iter {
            if err.kind != kind {
                kind = ErrorKind::Internal;
            }
            detail.push_str("; ");
            detail.push_str(&err.to_string());
        }
        Self::new(kind, detail)
    }

    /// Translate a status reported by the channel service.
    ///
    /// Total over all codes: cancellation, deadline and availability map
    /// directly; an unknown status carrying a known in-band failure string
    /// maps to the matching kind; everything else is `Internal`.
    pub fn from_rpc_status(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match code {
            rpc_code::CANCELLED => ErrorKind::Cancelled,
            rpc_code::DEADLINE_EXCEEDED => ErrorKind::DeadlineExceeded,
            rpc_code::UNAVAILABLE => ErrorKind::Network,
            rpc_code::PERMISSION_DENIED | rpc_code::UNAUTHENTICATED => ErrorKind::Permission,
            rpc_code::NOT_FOUND => ErrorKind::NotFound,
            rpc_code::ALREADY_EXISTS => ErrorKind::AlreadyExists,
            rpc_code::UNKNOWN => classify_in_band(&message),
            _ => ErrorKind::Internal,
        };
        Self::new(kind, message)
    }
}

fn classify_in_band(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    let hit = |sentinels: &[&str]| {
        sentinels
            .iter()
            .any(|s| lower.contains(&s.to_ascii_lowercase()))
    };
    if hit(NO_ROUTE_SENTINELS) {
        ErrorKind::NoRouteFound
    } else if hit(INVALID_ADDRESS_SENTINELS) {
        ErrorKind::InvalidAddress
    } else if hit(INSUFFICIENT_BALANCE_SENTINELS) {
        ErrorKind::InsufficientBalance
    } else {
        ErrorKind::Internal
    }
}

impl From<serde_json::Error> for LnchatError {
    fn from(err: serde_json::Error) -> Self {
        Self::marshal(err.to_string()).with_source(err)
    }
}

impl From<std::io::Error> for LnchatError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => ErrorKind::Network,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

impl From<tokio::time::error::Elapsed> for LnchatError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, err.to_string())
    }
}
