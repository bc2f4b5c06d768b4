//! Typed error taxonomy shared across the reception, queue, and relay layers.
//!
//! Each layer classifies failures into one of the categories below rather than
//! letting a generic `anyhow::Error` cross a boundary where callers need to
//! make a decision (retry? bounce? keep the connection open?). `anyhow`
//! remains the currency at the outermost task boundaries (`lib.rs`,
//! `main.rs`), matching the rest of the crate.

use thiserror::Error;

use crate::reply::Reply;

/// Malformed or out-of-sequence wire input. Maps to SMTP 500/501/503.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("command out of sequence: {0}")]
    OutOfSequence(String),
    #[error("unrecognized command: {0}")]
    Unrecognized(String),
}

/// SASL/AUTH failures. Maps to SMTP 535/538.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication mechanism not supported: {0}")]
    UnsupportedMechanism(String),
    #[error("authentication exchange cancelled by client")]
    Cancelled,
    #[error("authentication credentials rejected")]
    Rejected,
    #[error("plaintext authentication refused without TLS")]
    PlaintextRefused,
    #[error("no usable authentication mechanism available")]
    NoUsableMechanism,
}

/// DATA exceeded the configured maximum size. Maps to SMTP 552.
#[derive(Debug, Error)]
#[error("message size exceeds the configured maximum of {max} bytes")]
pub struct SizeExceeded {
    pub max: usize,
}

/// The four timeout categories a client session distinguishes, per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTimeoutKind {
    Connect,
    Command,
    Data,
    Idle,
}

impl std::fmt::Display for ClientTimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientTimeoutKind::Connect => "connect_timeout",
            ClientTimeoutKind::Command => "command_timeout",
            ClientTimeoutKind::Data => "data_timeout",
            ClientTimeoutKind::Idle => "idle_timeout",
        };
        f.write_str(s)
    }
}

/// Per-recipient (or per-message) delivery result, as classified by a client
/// session or the relay manager. Never fails the whole batch by itself.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Success,
    /// Retry later: 4xx reply, connect/command timeout, DNS SERVFAIL, ...
    Transient(Reply),
    /// Stop retrying: 5xx reply, NXDOMAIN, no MX and no A/AAAA, ...
    Permanent(Reply),
}

impl DeliveryOutcome {
    pub fn from_reply(reply: Reply) -> Self {
        use crate::reply::ReplyClass;
        match reply.classify() {
            ReplyClass::Success | ReplyClass::Intermediate => DeliveryOutcome::Success,
            ReplyClass::Transient => DeliveryOutcome::Transient(reply),
            ReplyClass::Permanent => DeliveryOutcome::Permanent(reply),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

/// The storage contract refused a write or read.
#[derive(Debug, Error)]
#[error("storage operation failed")]
pub struct QueueError(#[from] pub anyhow::Error);

/// Connection loss while acting as client or server, classified by when it
/// happened relative to DATA, per spec §7.
#[derive(Debug, Error)]
pub enum ConnectionLost {
    #[error("connection lost before DATA completed")]
    BeforeData,
    #[error("connection lost after DATA completed")]
    AfterData,
}

/// Errors that can terminate a server session's read/process/write loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    SizeExceeded(#[from] SizeExceeded),
    #[error("session I/O timed out")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
}
