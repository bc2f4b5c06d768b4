//! The server-session validator hook, per spec.md §4.2/§9.
//!
//! The source system this spec was distilled from lets validators raise an
//! exception to short-circuit a command; per the REDESIGN note in spec.md
//! §9 that becomes explicit `Reply` mutation instead: every hook receives
//! the reply the session is about to send and returns the reply that
//! actually gets sent. Returning it unchanged (the default) means "allow".
//! Whether the session advances state is derived from the returned reply's
//! class, never from a separate flag — a validator rejects a command by
//! handing back a non-2xx/3xx reply.

use async_trait::async_trait;

use crate::envelope::{Envelope, Mailbox, SessionMetadata};
use crate::reply::Reply;
use crate::submit::SubmitOutcome;

#[async_trait]
pub trait Validator: Send + Sync {
    async fn on_connect(&mut self, _meta: &SessionMetadata, proposed: Reply) -> Reply {
        proposed
    }

    async fn on_greet(&mut self, _hostname_arg: &str, proposed: Reply) -> Reply {
        proposed
    }

    async fn on_mail(&mut self, _sender: &Option<Mailbox>, proposed: Reply) -> Reply {
        proposed
    }

    async fn on_rcpt(&mut self, _recipient: &Mailbox, proposed: Reply) -> Reply {
        proposed
    }

    async fn on_data_start(&mut self, proposed: Reply) -> Reply {
        proposed
    }

    /// Runs after the body has been fully received but before the envelope
    /// is handed to the queue; may still reject the whole message.
    async fn have_data(&mut self, _envelope: &Envelope, proposed: Reply) -> Reply {
        proposed
    }

    /// Runs after the submission attempt, so a validator can customize the
    /// success/failure text (e.g. echoing back a tracking id).
    async fn handle_queued(&mut self, _outcome: &SubmitOutcome, proposed: Reply) -> Reply {
        proposed
    }
}

/// Produces a fresh `Validator` per connection, so the edge can own each
/// session's validator lifetime independently (spec.md §4.4: "the edge owns
/// the lifetime of the validator instance per session").
pub trait ValidatorFactory: Send + Sync {
    fn new_validator(&self) -> Box<dyn Validator>;
}

/// The permissive default: accepts everything unconditionally. Useful for
/// tests and as a documented minimal example.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveValidator;

impl Validator for PermissiveValidator {}

impl ValidatorFactory for PermissiveValidator {
    fn new_validator(&self) -> Box<dyn Validator> {
        Box::new(PermissiveValidator)
    }
}
