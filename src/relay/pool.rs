//! Per-destination connection pooling: a counting semaphore bounds
//! concurrent connections to one `(host, port)`, with a FIFO wait queue
//! supplied by `tokio::sync::Semaphore` itself, and idle sessions are
//! reused within `idle_timeout` rather than reconnecting, per spec.md §5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::smtp::client::{ClientConfig, ClientError, ClientSession};

struct IdleSession {
    session: ClientSession<tokio::net::TcpStream>,
    idle_since: Instant,
}

struct Destination {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
}

/// Holds a leased connection plus the permit that bounds concurrency for
/// its destination; dropping it without calling `release` discards the
/// session rather than returning it to the idle pool.
pub struct Leased {
    pub session: ClientSession<tokio::net::TcpStream>,
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

/// Bounds concurrent connections per `(host, port)` and reuses idle ones.
pub struct RelayPool {
    concurrent_connections: usize,
    idle_timeout: Duration,
    destinations: Mutex<HashMap<(String, u16), Arc<Destination>>>,
}

impl RelayPool {
    pub fn new(concurrent_connections: usize, idle_timeout: Duration) -> Self {
        RelayPool {
            concurrent_connections,
            idle_timeout,
            destinations: Mutex::new(HashMap::new()),
        }
    }

    async fn destination_for(&self, host: &str, port: u16) -> Arc<Destination> {
        let mut destinations = self.destinations.lock().await;
        destinations
            .entry((host.to_string(), port))
            .or_insert_with(|| {
                Arc::new(Destination {
                    semaphore: Arc::new(Semaphore::new(self.concurrent_connections)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Waits for a free slot, then reuses a fresh-enough idle session for
    /// `(host, port)` or opens a new TCP connection and runs the EHLO
    /// handshake for it.
    pub async fn acquire(&self, host: &str, port: u16, config: Arc<ClientConfig>) -> Result<Leased, ClientError> {
        let destination = self.destination_for(host, port).await;
        let permit = destination
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("destination semaphore is never closed");

        let reusable = {
            let mut idle = destination.idle.lock().await;
            loop {
                match idle.pop() {
                    Some(candidate) if candidate.idle_since.elapsed() <= self.idle_timeout => break Some(candidate),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };

        let session = match reusable {
            Some(idle) => idle.session,
            None => {
                // Each destination needs its own `tls_domain` to verify the
                // peer certificate against, so derive a per-connection
                // config from the shared one rather than mutating it.
                let mut conn_config = (*config).clone();
                conn_config.tls_domain = Some(host.to_string());
                let conn_config = Arc::new(conn_config);

                let stream = TcpStream::connect((host, port)).await?;
                let mut session = ClientSession::connect(stream, conn_config.clone()).await?;
                if session.capabilities().starttls && conn_config.tls_connector.is_some() {
                    session.starttls().await?;
                }
                if conn_config.credentials.is_some() {
                    session.authenticate().await?;
                }
                session
            }
        };

        Ok(Leased { session, permit })
    }

    /// Returns a still-usable session to the idle pool for `(host, port)`.
    pub async fn release(&self, host: &str, port: u16, session: ClientSession<tokio::net::TcpStream>) {
        let destination = self.destination_for(host, port).await;
        destination.idle.lock().await.push(IdleSession {
            session,
            idle_since: Instant::now(),
        });
    }
}
