//! The envelope data model: sender, recipients, headers, opaque body, and
//! received-session metadata, per spec.md §3.

use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;

/// A syntactically validated mailbox (`local@domain`). Validation is
/// intentionally shallow — RFC 5321 mailbox syntax in full is not the
/// concern of this crate (that belongs to a dedicated address parser); this
/// enforces only what the state machines rely on: non-empty, single `@`,
/// no whitespace or control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("not a syntactically valid mailbox: {0:?}")]
pub struct MailboxError(pub String);

impl Mailbox {
    pub fn parse(raw: &str) -> Result<Self, MailboxError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MailboxError(raw.to_string()));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(MailboxError(raw.to_string()));
        }
        let at_count = trimmed.matches('@').count();
        if at_count != 1 {
            return Err(MailboxError(raw.to_string()));
        }
        let (local, domain) = trimmed.split_once('@').unwrap();
        if local.is_empty() || domain.is_empty() || !domain.contains('.') {
            return Err(MailboxError(raw.to_string()));
        }
        Ok(Mailbox(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domain part, lowercased, as used for MX grouping.
    pub fn domain(&self) -> String {
        self.0
            .rsplit_once('@')
            .map(|(_, d)| d.to_lowercase())
            .unwrap_or_default()
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serializes as its plain string form, so `FilesystemStorage` can store
/// recipient lists as ordinary JSON string arrays.
impl serde::Serialize for Mailbox {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Mailbox {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Mailbox::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The TLS state a session was received (or sent) over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    Tls,
}

/// The protocol an envelope arrived through, for `Received:` headers and
/// the HTTP-edge mapping noted in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    Esmtp,
    Esmtps,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Smtp => "SMTP",
            Protocol::Esmtp => "ESMTP",
            Protocol::Esmtps => "ESMTPS",
            Protocol::Http => "HTTP",
        };
        f.write_str(s)
    }
}

/// Session metadata recorded at reception time and carried with the
/// envelope for the life of the message (used by `AddReceivedHeader` and by
/// bounce generation).
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub client_ip: IpAddr,
    pub reverse_dns: Option<String>,
    pub ehlo: Option<String>,
    pub security: Security,
    pub authenticated_as: Option<String>,
    pub protocol: Protocol,
}

impl SessionMetadata {
    pub fn new(client_ip: IpAddr, protocol: Protocol) -> Self {
        SessionMetadata {
            client_ip,
            reverse_dns: None,
            ehlo: None,
            security: Security::None,
            authenticated_as: None,
            protocol,
        }
    }
}

/// The full envelope: sender, recipients, headers, opaque body, and the
/// metadata of the session it was received over.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// `None` represents the empty sender used by bounces (spec.md §3).
    pub sender: Option<Mailbox>,
    /// Order-preserving; duplicates allowed.
    pub recipients: Vec<Mailbox>,
    /// Order-preserving `(name, value)` pairs; duplicates allowed, because
    /// `Received:` chains depend on insertion order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub metadata: SessionMetadata,
}

impl Envelope {
    pub fn new(metadata: SessionMetadata) -> Self {
        Envelope {
            sender: None,
            recipients: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
            metadata,
        }
    }

    /// Inserts a header at the front, the way `Received:` and similar
    /// prepended trace headers must appear before anything already present.
    pub fn prepend_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(0, (name.into(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Serializes headers, a blank line, then the body, per the
    /// header-section-CRLF-terminated invariant in spec.md §3.
    pub fn flatten(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.body.len() + 256);
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        Bytes::from(buf)
    }

    /// True once the envelope is ready to be handed to the queue: sender
    /// valid-or-empty (enforced by construction), at least one recipient.
    pub fn is_enqueueable(&self) -> bool {
        !self.recipients.is_empty()
    }

    /// Returns a copy of this envelope narrowed to only the given
    /// recipients, used when a relay partially succeeds and the record is
    /// rewritten to cover just the still-pending recipients (spec.md §4.6).
    pub fn narrowed_to(&self, recipients: Vec<Mailbox>) -> Envelope {
        Envelope {
            sender: self.sender.clone(),
            recipients,
            headers: self.headers.clone(),
            body: self.body.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn meta() -> SessionMetadata {
        SessionMetadata::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Protocol::Esmtp)
    }

    #[test]
    fn mailbox_requires_single_at_and_dotted_domain() {
        assert!(Mailbox::parse("a@b.example").is_ok());
        assert!(Mailbox::parse("a@@b.example").is_err());
        assert!(Mailbox::parse("a@nodot").is_err());
        assert!(Mailbox::parse("").is_err());
        assert!(Mailbox::parse("has space@b.example").is_err());
    }

    #[test]
    fn domain_is_lowercased() {
        let m = Mailbox::parse("Foo@EXAMPLE.com").unwrap();
        assert_eq!(m.domain(), "example.com");
    }

    #[test]
    fn flatten_is_header_block_crlf_then_body() {
        let mut env = Envelope::new(meta());
        env.headers.push(("Subject".into(), "hi".into()));
        env.body = Bytes::from_static(b"hello\r\n");
        let flat = env.flatten();
        assert_eq!(&flat[..], b"Subject: hi\r\n\r\nhello\r\n".as_slice());
    }

    #[test]
    fn prepend_header_goes_before_existing_ones() {
        let mut env = Envelope::new(meta());
        env.headers.push(("Subject".into(), "hi".into()));
        env.prepend_header("Received", "from x");
        assert_eq!(env.headers[0].0, "Received");
        assert_eq!(env.headers[1].0, "Subject");
    }
}
