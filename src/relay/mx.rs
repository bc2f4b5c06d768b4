//! MX resolution with TTL caching, per spec.md §4.7: group recipients by
//! domain, query MX records, fall back to implicit MX via A/AAAA, shuffle
//! among equal-preference exchanges, and classify DNS failures as
//! permanent (NXDOMAIN) or transient (SERVFAIL, timeout).

use std::collections::HashMap;
use std::time::Instant;

use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

/// One resolved mail exchange, in ascending-preference order with ties
/// already shuffled.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub host: String,
    pub preference: u16,
}

#[derive(Debug, Clone)]
pub enum MxError {
    /// NXDOMAIN: the domain itself does not exist.
    Permanent(String),
    /// SERVFAIL or a resolver timeout.
    Transient(String),
}

impl std::fmt::Display for MxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MxError::Permanent(m) | MxError::Transient(m) => f.write_str(m),
        }
    }
}

impl std::error::Error for MxError {}

struct CacheEntry {
    exchanges: Vec<Exchange>,
    expires_at: Instant,
}

/// Caches MX lookups until their TTL and applies user-configured forced
/// hosts ahead of any DNS query.
///
/// Per the resolved Open Question in spec.md §9(b), a record TTL of 0 means
/// "do not cache": `hickory_resolver::Lookup::valid_until()` already folds
/// the response's minimum TTL into an `Instant`, so a TTL-0 answer simply
/// produces a `valid_until()` in the past (or, at the latest, "now") and the
/// entry is immediately treated as expired on the next lookup rather than
/// cached for a fixed duration.
pub struct MxResolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<HashMap<String, CacheEntry>>,
    forced_hosts: HashMap<String, String>,
}

impl MxResolver {
    pub fn new(resolver: TokioAsyncResolver, forced_hosts: HashMap<String, String>) -> Self {
        MxResolver {
            resolver,
            cache: Mutex::new(HashMap::new()),
            forced_hosts,
        }
    }

    /// Resolves the ordered exchange list for `domain`, consulting the
    /// cache and forced-host overrides first.
    pub async fn resolve(&self, domain: &str) -> Result<Vec<Exchange>, MxError> {
        let domain = domain.to_lowercase();
        if let Some(forced) = self.forced_hosts.get(&domain) {
            return Ok(vec![Exchange {
                host: forced.clone(),
                preference: 0,
            }]);
        }

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&domain) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.exchanges.clone());
                }
            }
        }

        let (exchanges, expires_at) = self.lookup(&domain).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(domain, CacheEntry { exchanges: exchanges.clone(), expires_at });
        Ok(exchanges)
    }

    async fn lookup(&self, domain: &str) -> Result<(Vec<Exchange>, Instant), MxError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let expires_at = lookup.valid_until();
                let mut by_preference: HashMap<u16, Vec<String>> = HashMap::new();
                for record in lookup.iter() {
                    let host = record.exchange().to_utf8().trim_end_matches('.').to_string();
                    by_preference.entry(record.preference()).or_default().push(host);
                }
                let mut preferences: Vec<u16> = by_preference.keys().copied().collect();
                preferences.sort_unstable();
                let mut exchanges = Vec::new();
                let mut rng = rand::thread_rng();
                for preference in preferences {
                    let mut hosts = by_preference.remove(&preference).unwrap_or_default();
                    hosts.shuffle(&mut rng);
                    for host in hosts {
                        exchanges.push(Exchange { host, preference });
                    }
                }
                Ok((exchanges, expires_at))
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => self.implicit_mx(domain).await,
                ResolveErrorKind::Timeout => Err(MxError::Transient(format!("MX lookup for {domain} timed out"))),
                _ => Err(MxError::Transient(format!("MX lookup for {domain} failed: {e}"))),
            },
        }
    }

    /// No MX records exist; fall back to the domain's own A/AAAA record as
    /// an implicit MX at preference 0. NXDOMAIN here is permanent.
    async fn implicit_mx(&self, domain: &str) -> Result<(Vec<Exchange>, Instant), MxError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) if lookup.iter().next().is_some() => {
                let expires_at = lookup.valid_until();
                Ok((vec![Exchange { host: domain.to_string(), preference: 0 }], expires_at))
            }
            Ok(_) => Err(MxError::Permanent(format!("{domain} has no MX and no A/AAAA records"))),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    Err(MxError::Permanent(format!("{domain} has no MX and no A/AAAA records")))
                }
                ResolveErrorKind::Timeout => Err(MxError::Transient(format!("A/AAAA lookup for {domain} timed out"))),
                _ => Err(MxError::Transient(format!("A/AAAA lookup for {domain} failed: {e}"))),
            },
        }
    }
}
