//! Bounce envelope synthesis, per spec.md §4.7: when a delivery attempt
//! ends in permanent failure for one or more recipients, a new envelope is
//! generated addressed back to the original sender with empty sender,
//! carrying the failure reason(s) and the flattened original message.

use chrono::Local;

use crate::envelope::{Envelope, Mailbox, Protocol, SessionMetadata};
use crate::reply::Reply;

/// Builds a bounce for `original`, reporting `failures` (the recipients
/// that permanently failed and the reply each one got). Returns `None` if
/// `original` itself had no sender — per spec.md §4.7, a bounce of a
/// bounce is logged and dropped rather than generating another bounce.
pub fn synthesize(original: &Envelope, failures: &[(Mailbox, Reply)], hostname: &str) -> Option<Envelope> {
    let recipient = original.sender.clone()?;

    let metadata = SessionMetadata {
        client_ip: original.metadata.client_ip,
        reverse_dns: None,
        ehlo: None,
        security: crate::envelope::Security::None,
        authenticated_as: None,
        protocol: Protocol::Smtp,
    };
    let mut bounce = Envelope::new(metadata);
    bounce.recipients = vec![recipient];

    let date = Local::now().to_rfc2822();
    let original_from = original
        .sender
        .as_ref()
        .map(|m| m.as_str())
        .unwrap_or("<>");
    bounce.headers.push(("Date".into(), date));
    bounce.headers.push(("From".into(), format!("Mail Delivery Subsystem <postmaster@{hostname}>")));
    bounce.headers.push(("To".into(), bounce.recipients[0].to_string()));
    bounce.headers.push(("Subject".into(), "Undelivered Mail Returned to Sender".into()));
    bounce.headers.push(("Content-Type".into(), "text/plain; charset=us-ascii".into()));
    bounce.headers.push(("Auto-Submitted".into(), "auto-replied".into()));

    let mut report = String::new();
    report.push_str("This is the mail system at host ");
    report.push_str(hostname);
    report.push_str(".\r\n\r\n");
    report.push_str("I'm sorry to have to inform you that your message could not\r\n");
    report.push_str("be delivered to one or more recipients. It's attached below.\r\n\r\n");
    report.push_str(&format!("Original sender: {original_from}\r\n\r\n"));
    for (mailbox, reply) in failures {
        report.push_str(&format!("  <{mailbox}>: {} {}\r\n", reply.code, reply.text.join(" ")));
    }
    report.push_str("\r\n--- Original message follows ---\r\n\r\n");

    let mut body = Vec::new();
    body.extend_from_slice(report.as_bytes());
    body.extend_from_slice(&original.flatten());
    bounce.body = body.into();

    Some(bounce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn meta() -> SessionMetadata {
        SessionMetadata::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Protocol::Esmtp)
    }

    #[test]
    fn bounce_of_a_bounce_is_none() {
        let mut original = Envelope::new(meta());
        original.sender = None;
        original.recipients = vec![Mailbox::parse("a@b.example").unwrap()];
        let failures = vec![(Mailbox::parse("a@b.example").unwrap(), Reply::new(550, "no such user"))];
        assert!(synthesize(&original, &failures, "mail.example.test").is_none());
    }

    #[test]
    fn bounce_is_addressed_back_to_sender_with_empty_sender() {
        let mut original = Envelope::new(meta());
        original.sender = Some(Mailbox::parse("sender@a.example").unwrap());
        original.recipients = vec![Mailbox::parse("dead@b.example").unwrap()];
        let failures = vec![(Mailbox::parse("dead@b.example").unwrap(), Reply::new(550, "no such user"))];
        let bounce = synthesize(&original, &failures, "mail.example.test").unwrap();
        assert!(bounce.sender.is_none());
        assert_eq!(bounce.recipients, vec![Mailbox::parse("sender@a.example").unwrap()]);
        let flat = String::from_utf8_lossy(&bounce.flatten()).into_owned();
        assert!(flat.contains("no such user"));
        assert!(flat.contains("Original message follows"));
    }
}
