//! The SMTP edge server, per spec.md §4.4: binds one or more sockets,
//! optionally recovers the real peer address via the PROXY protocol, and
//! runs a bounded pool of `smtp::server::Session`s, handing each completed
//! envelope to the queue.
//!
//! Generalizes the teacher's `smtp::Server::run` accept loop (bind one
//! socket, `tokio::spawn` a handler per connection, log and continue past
//! per-connection errors) to multiple bind addresses and a semaphore-bounded
//! worker pool, per spec.md §4.4: "when the pool is saturated, further
//! accepts block".

pub mod http;
pub mod proxy;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Protocol, SessionMetadata};
use crate::smtp::server::{Session, ServerConfig, ValidatorFactory};
use crate::submit::EnvelopeSubmitter;

pub struct EdgeConfig {
    pub bind_addrs: Vec<SocketAddr>,
    pub max_connections: usize,
    pub proxy_protocol: bool,
    /// How long in-flight sessions are allowed to finish once shutdown is
    /// requested before their sockets are forced closed, per spec.md §5.
    pub shutdown_grace: Duration,
    pub server: Arc<ServerConfig>,
    pub validator_factory: Arc<dyn ValidatorFactory>,
}

struct EdgeContext {
    semaphore: Arc<Semaphore>,
    sessions: Mutex<JoinSet<()>>,
    server_config: Arc<ServerConfig>,
    validator_factory: Arc<dyn ValidatorFactory>,
    submitter: Arc<dyn EnvelopeSubmitter>,
    proxy_protocol: bool,
}

/// Runs the edge until `shutdown` is cancelled: stops accepting new
/// connections, waits up to `shutdown_grace` for in-flight sessions to
/// finish on their own, then aborts whatever remains.
pub async fn run(config: EdgeConfig, submitter: Arc<dyn EnvelopeSubmitter>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let ctx = Arc::new(EdgeContext {
        semaphore: Arc::new(Semaphore::new(config.max_connections)),
        sessions: Mutex::new(JoinSet::new()),
        server_config: config.server,
        validator_factory: config.validator_factory,
        submitter,
        proxy_protocol: config.proxy_protocol,
    });

    let mut acceptors = JoinSet::new();
    for addr in config.bind_addrs {
        let listener = TcpListener::bind(addr).await?;
        info!("SMTP edge listening on {addr}");
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        acceptors.spawn(accept_loop(listener, ctx, shutdown));
    }
    while acceptors.join_next().await.is_some() {}

    info!("edge no longer accepting; draining in-flight sessions (grace: {:?})", config.shutdown_grace);
    let drained = tokio::time::timeout(config.shutdown_grace, async {
        let mut sessions = ctx.sessions.lock().await;
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("shutdown grace period expired with sessions still in flight; aborting");
        ctx.sessions.lock().await.abort_all();
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, ctx: Arc<EdgeContext>, shutdown: CancellationToken) {
    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = ctx.semaphore.clone().acquire_owned() => permit.expect("edge semaphore is never closed"),
        };
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => { drop(permit); break; }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _peer)) => {
                let ctx = ctx.clone();
                ctx.sessions.lock().await.spawn(async move {
                    let _permit = permit;
                    run_one(stream, ctx).await;
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
                drop(permit);
            }
        }
    }
}

async fn run_one(mut stream: TcpStream, ctx: Arc<EdgeContext>) {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("could not read peer address: {e}");
            return;
        }
    };

    let client_ip = if ctx.proxy_protocol {
        match proxy::detect(&mut stream).await {
            Ok(Some(real)) => real.ip(),
            Ok(None) => peer.ip(),
            Err(e) => {
                warn!("PROXY protocol parse failed from {peer}: {e}");
                return;
            }
        }
    } else {
        peer.ip()
    };

    let metadata = SessionMetadata::new(client_ip, Protocol::Smtp);
    let validator = ctx.validator_factory.new_validator();
    let session = Session::new(stream, ctx.server_config.clone(), metadata, validator, ctx.submitter.clone());
    if let Err(e) = session.run().await {
        debug!("session with {peer} ended: {e}");
    }
}
