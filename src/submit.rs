//! The narrow contract between an edge's SMTP server session and whatever
//! accepts a completed envelope — almost always `queue::QueueHandle`, but
//! kept as a trait so sessions can be unit-tested without a real queue.

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::reply::Reply;

/// Outcome of handing a completed envelope off, mirroring spec.md §4.5:
/// `enqueue(envelope) → (id, result)` where `result` is either success (the
/// edge emits 250 with the id in the text) or a transient failure (`451`).
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted { id: String },
    Rejected { reply: Reply },
}

#[async_trait]
pub trait EnvelopeSubmitter: Send + Sync {
    async fn submit(&self, envelope: Envelope) -> SubmitOutcome;
}
