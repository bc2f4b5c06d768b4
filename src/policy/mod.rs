//! Synchronous pre-queue policies, per spec.md §4.8: each runs in order
//! over the envelope(s) produced by the policy before it, may mutate, fork
//! into several envelopes, or reject the whole submission with a reply.

use chrono::Local;
use rand::Rng;

use crate::envelope::Envelope;
use crate::reply::Reply;

/// What running one policy over one envelope produced.
pub enum PolicyResult {
    /// The envelope (possibly split into several) continues to the next
    /// policy, then eventually to storage.
    Continue(Vec<Envelope>),
    /// The whole submission is refused; no envelope reaches storage.
    Reject(Reply),
}

pub trait Policy: Send + Sync {
    fn apply(&self, envelope: Envelope) -> PolicyResult;
}

/// Runs `policies` in order over `envelope`, threading the output of one
/// policy into the next. A single `Reject` anywhere aborts the whole
/// pipeline, per spec.md §4.5 step 1.
pub fn run_pipeline(policies: &[Box<dyn Policy>], envelope: Envelope) -> Result<Vec<Envelope>, Reply> {
    let mut pending = vec![envelope];
    for policy in policies {
        let mut next = Vec::with_capacity(pending.len());
        for candidate in pending {
            match policy.apply(candidate) {
                PolicyResult::Continue(envelopes) => next.extend(envelopes),
                PolicyResult::Reject(reply) => return Err(reply),
            }
        }
        pending = next;
    }
    Ok(pending)
}

/// Inserts an RFC 5322 `Date:` header in the local timezone if none exists.
pub struct AddDateHeader;

impl Policy for AddDateHeader {
    fn apply(&self, mut envelope: Envelope) -> PolicyResult {
        if !envelope.has_header("Date") {
            let date = Local::now().to_rfc2822();
            envelope.prepend_header("Date", date);
        }
        PolicyResult::Continue(vec![envelope])
    }
}

/// Inserts a `Message-Id:` header of the form `<timestamp.random@hostname>`
/// if none exists.
pub struct AddMessageIdHeader {
    pub hostname: String,
}

impl Policy for AddMessageIdHeader {
    fn apply(&self, mut envelope: Envelope) -> PolicyResult {
        if !envelope.has_header("Message-Id") {
            let timestamp = chrono::Utc::now().timestamp();
            let random: u64 = rand::thread_rng().gen();
            let id = format!("<{timestamp}.{random:016x}@{}>", self.hostname);
            envelope.prepend_header("Message-Id", id);
        }
        PolicyResult::Continue(vec![envelope])
    }
}

/// Always prepends a `Received:` trace header naming the sending IP,
/// reverse DNS, EHLO string, local hostname, protocol, recipient (when the
/// envelope has exactly one), a trace id, and the current date.
pub struct AddReceivedHeader {
    pub hostname: String,
}

impl Policy for AddReceivedHeader {
    fn apply(&self, mut envelope: Envelope) -> PolicyResult {
        let meta = &envelope.metadata;
        let from = format!(
            "{} ({})",
            meta.ehlo.as_deref().unwrap_or("unknown"),
            meta.reverse_dns.as_deref().unwrap_or(&meta.client_ip.to_string()),
        );
        let for_clause = match envelope.recipients.as_slice() {
            [only] => format!(" for <{only}>"),
            _ => String::new(),
        };
        let trace_id: u64 = rand::thread_rng().gen();
        let date = Local::now().to_rfc2822();
        let value = format!(
            "from {from} by {} with {}{for_clause} id {trace_id:016x}; {date}",
            self.hostname, meta.protocol,
        );
        envelope.prepend_header("Received", value);
        PolicyResult::Continue(vec![envelope])
    }
}

/// Rewrites each recipient by the first matching rule (first match wins;
/// no match leaves the recipient unchanged).
pub struct Forward {
    pub rules: Vec<(regex::Regex, String)>,
}

impl Policy for Forward {
    fn apply(&self, mut envelope: Envelope) -> PolicyResult {
        for recipient in &mut envelope.recipients {
            let address = recipient.as_str().to_string();
            for (pattern, replacement) in &self.rules {
                if pattern.is_match(&address) {
                    let rewritten = pattern.replace(&address, replacement.as_str()).into_owned();
                    if let Ok(mailbox) = crate::envelope::Mailbox::parse(&rewritten) {
                        *recipient = mailbox;
                    }
                    break;
                }
            }
        }
        PolicyResult::Continue(vec![envelope])
    }
}

/// Forks one envelope into N, one per recipient.
pub struct RecipientSplit;

impl Policy for RecipientSplit {
    fn apply(&self, envelope: Envelope) -> PolicyResult {
        let forks = envelope
            .recipients
            .iter()
            .cloned()
            .map(|recipient| envelope.narrowed_to(vec![recipient]))
            .collect();
        PolicyResult::Continue(forks)
    }
}

/// Forks one envelope into N, one per unique recipient domain.
pub struct RecipientDomainSplit;

impl Policy for RecipientDomainSplit {
    fn apply(&self, envelope: Envelope) -> PolicyResult {
        let mut by_domain: std::collections::BTreeMap<String, Vec<crate::envelope::Mailbox>> =
            std::collections::BTreeMap::new();
        for recipient in &envelope.recipients {
            by_domain.entry(recipient.domain()).or_default().push(recipient.clone());
        }
        let forks = by_domain
            .into_values()
            .map(|recipients| envelope.narrowed_to(recipients))
            .collect();
        PolicyResult::Continue(forks)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::envelope::{Mailbox, Protocol, SessionMetadata};

    fn base_envelope() -> Envelope {
        let metadata = SessionMetadata::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Protocol::Esmtp);
        let mut envelope = Envelope::new(metadata);
        envelope.sender = Some(Mailbox::parse("a@b.example").unwrap());
        envelope
    }

    #[test]
    fn add_date_header_is_skipped_when_already_present() {
        let mut envelope = base_envelope();
        envelope.headers.push(("Date".into(), "already set".into()));
        let PolicyResult::Continue(out) = AddDateHeader.apply(envelope) else {
            panic!("expected Continue");
        };
        assert_eq!(out[0].header("Date"), Some("already set"));
    }

    #[test]
    fn add_message_id_header_generates_one_when_absent() {
        let envelope = base_envelope();
        let policy = AddMessageIdHeader { hostname: "mail.example.test".into() };
        let PolicyResult::Continue(out) = policy.apply(envelope) else {
            panic!("expected Continue");
        };
        let id = out[0].header("Message-Id").expect("Message-Id inserted");
        assert!(id.ends_with("@mail.example.test>"));
    }

    #[test]
    fn recipient_split_forks_one_envelope_per_recipient() {
        let mut envelope = base_envelope();
        envelope.recipients.push(Mailbox::parse("c@d.example").unwrap());
        envelope.recipients.push(Mailbox::parse("e@f.example").unwrap());
        let PolicyResult::Continue(out) = RecipientSplit.apply(envelope) else {
            panic!("expected Continue");
        };
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].recipients.len(), 1);
    }

    #[test]
    fn recipient_domain_split_groups_by_domain() {
        let mut envelope = base_envelope();
        envelope.recipients.push(Mailbox::parse("c@d.example").unwrap());
        envelope.recipients.push(Mailbox::parse("e@d.example").unwrap());
        envelope.recipients.push(Mailbox::parse("g@h.example").unwrap());
        let PolicyResult::Continue(out) = RecipientDomainSplit.apply(envelope) else {
            panic!("expected Continue");
        };
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn forward_rewrites_with_first_matching_rule_only() {
        let mut envelope = base_envelope();
        envelope.recipients.push(Mailbox::parse("old@d.example").unwrap());
        let rules = vec![
            (regex::Regex::new(r"^old@d\.example$").unwrap(), "new@d.example".to_string()),
            (regex::Regex::new(r"^old@.*$").unwrap(), "unreachable@d.example".to_string()),
        ];
        let PolicyResult::Continue(out) = (Forward { rules }).apply(envelope) else {
            panic!("expected Continue");
        };
        assert_eq!(out[0].recipients[0].to_string(), "new@d.example");
    }

    #[test]
    fn forward_leaves_non_matching_recipients_unchanged() {
        let mut envelope = base_envelope();
        envelope.recipients.push(Mailbox::parse("keep@d.example").unwrap());
        let rules = vec![(regex::Regex::new(r"^nomatch@.*$").unwrap(), "x@y.example".to_string())];
        let PolicyResult::Continue(out) = (Forward { rules }).apply(envelope) else {
            panic!("expected Continue");
        };
        assert_eq!(out[0].recipients[0].to_string(), "keep@d.example");
    }
}
