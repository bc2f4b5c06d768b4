//! MX-aware relay manager, per spec.md §4.7: computes next hops, borrows a
//! pooled client session per destination, attempts delivery, and returns a
//! per-recipient classification the queue engine uses to decide between
//! `storage.remove`, a narrowed retry, or bounce generation.

pub mod mx;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

use crate::envelope::{Envelope, Mailbox};
use crate::error::DeliveryOutcome;
use crate::smtp::client::ClientConfig;

use mx::{MxError, MxResolver};
use pool::RelayPool;

/// How the relay manager picks a destination for a recipient's domain.
#[derive(Debug, Clone)]
pub enum RelayMode {
    /// Every recipient, regardless of domain, is relayed to one fixed host.
    Static { host: String, port: u16 },
    /// Recipients are grouped by domain and routed via MX (or A/AAAA)
    /// lookup, honoring any forced-host overrides.
    Mx { port: u16 },
}

pub struct RelayManagerConfig {
    pub mode: RelayMode,
    pub concurrent_connections: usize,
    pub idle_timeout: Duration,
    pub client: Arc<ClientConfig>,
    pub forced_hosts: HashMap<String, String>,
}

/// Orchestrates MX resolution and pooled delivery for envelopes handed off
/// by the queue's dispatcher.
pub struct RelayManager {
    mode: RelayMode,
    resolver: MxResolver,
    pool: RelayPool,
    client_config: Arc<ClientConfig>,
}

impl RelayManager {
    pub fn new(config: RelayManagerConfig) -> anyhow::Result<Self> {
        let dns_resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(RelayManager {
            resolver: MxResolver::new(dns_resolver, config.forced_hosts),
            pool: RelayPool::new(config.concurrent_connections, config.idle_timeout),
            client_config: config.client,
            mode: config.mode,
        })
    }

    /// Attempts delivery of `envelope` to all of its recipients, returning
    /// a classification for each. Recipients sharing a domain (MX mode) or
    /// all recipients (static mode) are delivered together in one SMTP
    /// transaction when they resolve to the same destination.
    pub async fn deliver(&self, envelope: &Envelope) -> HashMap<Mailbox, DeliveryOutcome> {
        let mut outcomes = HashMap::new();
        for (destination, recipients) in self.group_by_destination(envelope).await {
            match destination {
                Ok((host, port)) => {
                    let per_recipient = self.deliver_to_destination(envelope, &recipients, &host, port).await;
                    outcomes.extend(per_recipient);
                }
                Err(mx_error) => {
                    let reply = synthetic_reply(&mx_error);
                    for recipient in recipients {
                        outcomes.insert(recipient, DeliveryOutcome::from_reply(reply.clone()));
                    }
                }
            }
        }
        outcomes
    }

    /// Partitions an envelope's recipients into destination groups,
    /// resolving MX next hops per domain when in `RelayMode::Mx`.
    async fn group_by_destination(
        &self,
        envelope: &Envelope,
    ) -> Vec<(Result<(String, u16), MxError>, Vec<Mailbox>)> {
        match &self.mode {
            RelayMode::Static { host, port } => {
                vec![(Ok((host.clone(), *port)), envelope.recipients.clone())]
            }
            RelayMode::Mx { port } => {
                let mut by_domain: HashMap<String, Vec<Mailbox>> = HashMap::new();
                for recipient in &envelope.recipients {
                    by_domain.entry(recipient.domain()).or_default().push(recipient.clone());
                }
                let mut groups = Vec::new();
                for (domain, recipients) in by_domain {
                    let destination = match self.resolver.resolve(&domain).await {
                        Ok(exchanges) => exchanges
                            .first()
                            .map(|exchange| Ok((exchange.host.clone(), *port)))
                            .unwrap_or_else(|| Err(MxError::Permanent(format!("{domain} resolved to no exchanges")))),
                        Err(e) => Err(e),
                    };
                    groups.push((destination, recipients));
                }
                groups
            }
        }
    }

    async fn deliver_to_destination(
        &self,
        envelope: &Envelope,
        recipients: &[Mailbox],
        host: &str,
        port: u16,
    ) -> HashMap<Mailbox, DeliveryOutcome> {
        let scoped = envelope.narrowed_to(recipients.to_vec());
        let leased = match self.pool.acquire(host, port, self.client_config.clone()).await {
            Ok(leased) => leased,
            Err(e) => {
                let reply = crate::reply::Reply::new(421, format!("connection to {host}:{port} failed: {e}"));
                return recipients
                    .iter()
                    .cloned()
                    .map(|r| (r, DeliveryOutcome::from_reply(reply.clone())))
                    .collect();
            }
        };
        let pool::Leased { mut session, .. } = leased;

        let report = match session.deliver(&scoped).await {
            Ok(report) => report,
            Err(e) => {
                let reply = crate::reply::Reply::new(421, format!("delivery to {host}:{port} failed: {e}"));
                return recipients
                    .iter()
                    .cloned()
                    .map(|r| (r, DeliveryOutcome::from_reply(reply.clone())))
                    .collect();
            }
        };

        self.pool.release(host, port, session).await;

        report.per_recipient.into_iter().collect()
    }
}

fn synthetic_reply(error: &MxError) -> crate::reply::Reply {
    match error {
        MxError::Permanent(msg) => crate::reply::Reply::new(550, msg.clone()),
        MxError::Transient(msg) => crate::reply::Reply::new(450, msg.clone()),
    }
}
