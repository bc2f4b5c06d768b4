//! The durable queue engine, per spec.md §4.5: pre-queue policies, atomic
//! storage writes, a min-heap scheduler driven by a single dispatcher task,
//! backoff-governed retry, and bounce generation on permanent failure.
//!
//! The heap is owned exclusively by the dispatcher task; every other piece
//! of the crate (including the dispatcher's own delivery attempts) only
//! ever mutates it by sending an `Event` over the mpsc channel, mirroring
//! how `smtp::server::Session` never touches the socket except through its
//! codec.

pub mod backoff;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Duration as TokioDuration;
use tokio_util::sync::CancellationToken;

use crate::bounce;
use crate::envelope::{Envelope, Mailbox};
use crate::error::DeliveryOutcome;
use crate::policy::{self, Policy};
use crate::relay::RelayManager;
use crate::reply::Reply;
use crate::storage::{QueueMetadata, Storage, StorageError};
use crate::submit::{EnvelopeSubmitter, SubmitOutcome};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// What mutates the dispatcher's heap / in-flight set; the only channel
/// through which that state changes.
enum Event {
    /// A new or rescheduled id is due for dispatch no earlier than `due`.
    Schedule { id: String, due: i64 },
    /// A dispatch attempt for `id` has fully resolved (storage already
    /// updated); clear its in-flight flag.
    Done { id: String },
}

/// Configuration for a running queue engine.
pub struct QueueConfig {
    pub hostname: String,
    pub policies: Vec<Box<dyn Policy>>,
    pub backoff: backoff::Backoff,
}

/// The handle edges submit completed envelopes through; cheap to clone,
/// shared by every accepted connection. Implements `EnvelopeSubmitter` so
/// an `smtp::server::Session` never depends on the queue's concrete type.
#[derive(Clone)]
pub struct QueueHandle {
    storage: Arc<dyn Storage>,
    policies: Arc<Vec<Box<dyn Policy>>>,
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl EnvelopeSubmitter for QueueHandle {
    async fn submit(&self, envelope: Envelope) -> SubmitOutcome {
        let forks = match policy::run_pipeline(&self.policies, envelope) {
            Ok(forks) => forks,
            Err(reply) => return SubmitOutcome::Rejected { reply },
        };

        let mut ids = Vec::with_capacity(forks.len());
        for fork in forks {
            if !fork.is_enqueueable() {
                continue;
            }
            match self.write_and_schedule(fork, now()).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    error!("queue write failed, rejecting submission: {e}");
                    return SubmitOutcome::Rejected {
                        reply: Reply::with_enhanced(
                            451,
                            crate::reply::EnhancedStatus::new(4, 3, 0),
                            "local error in processing, please try again later",
                        ),
                    };
                }
            }
        }

        if ids.is_empty() {
            return SubmitOutcome::Rejected {
                reply: Reply::new(554, "no valid recipients after policy processing"),
            };
        }

        SubmitOutcome::Accepted { id: ids.join(",") }
    }
}

impl QueueHandle {
    async fn write_and_schedule(&self, envelope: Envelope, due: i64) -> Result<String, StorageError> {
        let metadata = QueueMetadata::fresh(due);
        let id = self.storage.write(envelope, metadata).await?;
        let _ = self.events.send(Event::Schedule { id: id.clone(), due });
        Ok(id)
    }

    /// Writes and schedules a bounce envelope generated by the dispatcher.
    /// Skips the policy pipeline: the bounce body is already final.
    async fn enqueue_bounce(&self, envelope: Envelope) {
        if let Err(e) = self.write_and_schedule(envelope, now()).await {
            error!("failed to enqueue bounce: {e}");
        }
    }
}

/// The dispatcher: owns the scheduling heap and in-flight set, and is the
/// only task that ever pops or re-inserts into either.
pub struct Queue {
    storage: Arc<dyn Storage>,
    relay: Arc<RelayManager>,
    backoff: backoff::Backoff,
    hostname: String,
    handle: QueueHandle,
    events_rx: mpsc::UnboundedReceiver<Event>,
    heap: BinaryHeap<Reverse<(i64, String)>>,
    in_flight: HashSet<String>,
}

impl Queue {
    /// Builds the queue engine and its externally-shared handle, without
    /// yet running crash recovery or starting the dispatcher loop — call
    /// `run` (typically via `tokio::spawn`) to do both.
    pub fn new(storage: Arc<dyn Storage>, relay: Arc<RelayManager>, config: QueueConfig) -> (QueueHandle, Queue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let policies = Arc::new(config.policies);
        let handle = QueueHandle {
            storage: storage.clone(),
            policies,
            events: tx,
        };
        let queue = Queue {
            storage,
            relay,
            backoff: config.backoff,
            hostname: config.hostname,
            handle: handle.clone(),
            events_rx: rx,
            heap: BinaryHeap::new(),
            in_flight: HashSet::new(),
        };
        (handle, queue)
    }

    /// Loads every id currently on disk and schedules it at its stored
    /// timestamp, per spec.md §4.5's crash-recovery requirement. Call once,
    /// before `run`.
    pub async fn recover(&mut self) -> Result<(), StorageError> {
        let records = self.storage.load_all().await?;
        info!("recovering {} queued record(s) from storage", records.len());
        for (id, metadata) in records {
            self.heap.push(Reverse((metadata.scheduled_at, id)));
        }
        Ok(())
    }

    /// Runs the dispatcher loop. Once `shutdown` is cancelled, no further
    /// delay is awaited before attempting to drain: the loop keeps
    /// dispatching whatever is already due and processing completions
    /// until both the heap and the in-flight set are empty.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() && self.heap.is_empty() && self.in_flight.is_empty() {
                debug!("queue dispatcher drained, shutting down");
                break;
            }

            let sleep_for = self.next_wake_delay();
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    self.dispatch_due();
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(Event::Schedule { id, due }) => self.heap.push(Reverse((due, id))),
                        Some(Event::Done { id }) => { self.in_flight.remove(&id); }
                        None => break,
                    }
                }
                _ = shutdown.cancelled(), if !shutdown.is_cancelled() => {
                    // Loop back around; the top-of-loop check decides
                    // whether draining is actually complete.
                }
            }
        }
    }

    fn next_wake_delay(&self) -> TokioDuration {
        match self.heap.peek() {
            None => TokioDuration::from_secs(3600),
            Some(Reverse((due, _))) => {
                let delta = due - now();
                if delta <= 0 {
                    TokioDuration::ZERO
                } else {
                    TokioDuration::from_secs(delta as u64)
                }
            }
        }
    }

    /// Pops every currently-due, not-already-in-flight id and spawns a
    /// delivery attempt for each.
    fn dispatch_due(&mut self) {
        let current = now();
        let mut deferred = Vec::new();
        while let Some(Reverse((due, id))) = self.heap.peek().cloned() {
            if due > current {
                break;
            }
            self.heap.pop();
            if self.in_flight.contains(&id) {
                // Still being delivered from a previous pop; re-check later
                // rather than dispatching twice.
                deferred.push(Reverse((due, id)));
                continue;
            }
            self.in_flight.insert(id.clone());
            self.spawn_attempt(id);
        }
        for entry in deferred {
            self.heap.push(entry);
        }
    }

    fn spawn_attempt(&self, id: String) {
        let storage = self.storage.clone();
        let relay = self.relay.clone();
        let backoff = self.backoff.clone();
        let hostname = self.hostname.clone();
        let handle = self.handle.clone();
        let events = self.handle.events.clone();
        tokio::spawn(async move {
            let reschedule = attempt_delivery(&id, &storage, &relay, &backoff, &hostname, &handle).await;
            if let Some(due) = reschedule {
                let _ = events.send(Event::Schedule { id: id.clone(), due });
            }
            let _ = events.send(Event::Done { id });
        });
    }
}

/// Loads and attempts delivery of one record, updating storage according
/// to the per-recipient outcome, per spec.md §4.5/§4.7. Returns `Some(due)`
/// if the record should be re-scheduled (and has already been narrowed in
/// storage to the recipients it's being retried for), or `None` if the
/// record is fully resolved (delivered, bounced, or exhausted).
async fn attempt_delivery(
    id: &str,
    storage: &Arc<dyn Storage>,
    relay: &Arc<RelayManager>,
    backoff: &backoff::Backoff,
    hostname: &str,
    handle: &QueueHandle,
) -> Option<i64> {
    let (envelope, metadata) = match storage.get(id).await {
        Ok(record) => record,
        Err(e) => {
            warn!("dispatcher could not load id {id}: {e}");
            return None;
        }
    };

    let outcomes = relay.deliver(&envelope).await;

    let mut transient: Vec<(Mailbox, Reply)> = Vec::new();
    let mut permanent: Vec<(Mailbox, Reply)> = Vec::new();
    for (recipient, outcome) in outcomes {
        match outcome {
            DeliveryOutcome::Success => {}
            DeliveryOutcome::Transient(reply) => transient.push((recipient, reply)),
            DeliveryOutcome::Permanent(reply) => permanent.push((recipient, reply)),
        }
    }

    if !permanent.is_empty() {
        match bounce::synthesize(&envelope, &permanent, hostname) {
            Some(bounce_envelope) => handle.enqueue_bounce(bounce_envelope).await,
            None => warn!("permanent failure for id {id} with empty sender; bounce suppressed"),
        }
    }

    if transient.is_empty() {
        if let Err(e) = storage.remove(id).await {
            warn!("failed to remove resolved id {id}: {e}");
        }
        return None;
    }

    let next_attempt = metadata.attempts + 1;
    match (backoff)(&envelope, next_attempt) {
        Some(delay) => {
            let remaining: Vec<Mailbox> = transient.iter().map(|(m, _)| m.clone()).collect();
            if let Err(e) = storage.set_recipients_delivered(id, remaining).await {
                warn!("failed to narrow id {id} to remaining recipients: {e}");
            }
            let scheduled_at = now() + delay.as_secs() as i64;
            let new_metadata = QueueMetadata {
                attempts: next_attempt,
                scheduled_at,
            };
            if let Err(e) = storage.write_metadata(id, new_metadata).await {
                warn!("failed to write retry metadata for id {id}: {e}");
            }
            Some(scheduled_at)
        }
        None => {
            info!("id {id} exhausted retries, treating remaining recipients as permanent");
            match bounce::synthesize(&envelope, &transient, hostname) {
                Some(bounce_envelope) => handle.enqueue_bounce(bounce_envelope).await,
                None => warn!("retry-exhausted failure for id {id} with empty sender; bounce suppressed"),
            }
            if let Err(e) = storage.remove(id).await {
                warn!("failed to remove exhausted id {id}: {e}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use crate::envelope::{Protocol, SessionMetadata};
    use crate::storage::memory::MemoryStorage;

    fn envelope(recipient: &str) -> Envelope {
        let meta = SessionMetadata::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Protocol::Esmtp);
        let mut env = Envelope::new(meta);
        env.sender = Some(Mailbox::parse("sender@a.example").unwrap());
        env.recipients = vec![Mailbox::parse(recipient).unwrap()];
        env
    }

    #[tokio::test]
    async fn submit_writes_one_record_per_non_empty_fork() {
        let storage: Arc<dyn Storage> = MemoryStorage::new();
        let relay = test_relay().await;
        let (handle, queue) = Queue::new(
            storage.clone(),
            relay,
            QueueConfig {
                hostname: "mail.example.test".into(),
                policies: vec![Box::new(policy::RecipientSplit)],
                backoff: backoff::exponential(),
            },
        );
        let shutdown = CancellationToken::new();
        let mut envelope = envelope("a@b.example");
        envelope.recipients.push(Mailbox::parse("c@d.example").unwrap());
        let join = tokio::spawn(queue.run(shutdown.clone()));

        let outcome = handle.submit(envelope).await;
        match outcome {
            SubmitOutcome::Accepted { id } => assert_eq!(id.split(',').count(), 2),
            SubmitOutcome::Rejected { reply } => panic!("unexpected rejection: {reply:?}"),
        }

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
    }

    async fn test_relay() -> Arc<RelayManager> {
        use crate::relay::{RelayManager, RelayManagerConfig, RelayMode};
        use crate::smtp::client::ClientConfig;
        Arc::new(
            RelayManager::new(RelayManagerConfig {
                mode: RelayMode::Static {
                    host: "127.0.0.1".into(),
                    port: 1,
                },
                concurrent_connections: 1,
                idle_timeout: Duration::from_secs(30),
                client: Arc::new(ClientConfig::new("mail.example.test")),
                forced_hosts: Default::default(),
            })
            .unwrap(),
        )
    }
}
