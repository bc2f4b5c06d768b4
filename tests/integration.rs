//! End-to-end exercises of the SMTP edge, the HTTP edge, and the queue's
//! relay pipeline, run entirely in-process against loopback sockets — no
//! external services required.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use mailcrucible::envelope::Envelope;
use mailcrucible::edge::{self, EdgeConfig};
use mailcrucible::queue::{backoff, Queue, QueueConfig};
use mailcrucible::relay::{RelayManager, RelayManagerConfig, RelayMode};
use mailcrucible::smtp::client::ClientConfig;
use mailcrucible::smtp::server::{PermissiveValidator, ServerConfig};
use mailcrucible::storage::memory::MemoryStorage;
use mailcrucible::storage::Storage;
use mailcrucible::submit::{EnvelopeSubmitter, SubmitOutcome};

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("reserve a free port");
    listener.local_addr().unwrap().port()
}

async fn send_line(writer: &mut (impl AsyncWriteExt + Unpin), line: &str) {
    writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

async fn read_line(reader: &mut (impl AsyncBufReadExt + Unpin)) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

/// Reads SMTP reply lines until a non-continuation (` `, not `-`) line, per
/// RFC 5321 multiline replies, returning the final line's status code.
async fn read_reply(reader: &mut (impl AsyncBufReadExt + Unpin)) -> u16 {
    loop {
        let line = read_line(reader).await;
        assert!(line.len() >= 4, "malformed reply line: {line:?}");
        if line.as_bytes()[3] == b' ' {
            return line[..3].parse().expect("reply code is numeric");
        }
    }
}

/// Captures every envelope handed to it and always accepts.
#[derive(Clone, Default)]
struct RecordingSubmitter {
    received: Arc<Mutex<Vec<Envelope>>>,
}

#[async_trait]
impl EnvelopeSubmitter for RecordingSubmitter {
    async fn submit(&self, envelope: Envelope) -> SubmitOutcome {
        self.received.lock().unwrap().push(envelope);
        SubmitOutcome::Accepted { id: "test-id".into() }
    }
}

fn test_server_config() -> Arc<ServerConfig> {
    Arc::new(ServerConfig::new("mail.example.test"))
}

/// Spawns an SMTP edge bound to `port` backed by `submitter`, returning its
/// shutdown token. Callers must cancel it once the test is done.
async fn spawn_edge(port: u16, submitter: Arc<dyn EnvelopeSubmitter>) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let config = EdgeConfig {
        bind_addrs: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)],
        max_connections: 16,
        proxy_protocol: false,
        shutdown_grace: Duration::from_secs(1),
        server: test_server_config(),
        validator_factory: Arc::new(PermissiveValidator),
    };
    let task_shutdown = shutdown.clone();
    tokio::spawn(async move {
        edge::run(config, submitter, task_shutdown).await.unwrap();
    });
    // Give the listener a moment to bind before the first connection attempt.
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown
}

#[tokio::test]
async fn smtp_edge_accepts_a_full_transaction_and_hands_it_to_the_submitter() {
    let port = free_port();
    let submitter = Arc::new(RecordingSubmitter::default());
    let shutdown = spawn_edge(port, submitter.clone()).await;

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (reader_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    assert_eq!(read_reply(&mut reader).await, 220);

    send_line(&mut writer, "EHLO client.example.test").await;
    assert_eq!(read_reply(&mut reader).await, 250);

    send_line(&mut writer, "MAIL FROM:<sender@example.test>").await;
    assert_eq!(read_reply(&mut reader).await, 250);

    send_line(&mut writer, "RCPT TO:<recipient@example.test>").await;
    assert_eq!(read_reply(&mut reader).await, 250);

    send_line(&mut writer, "DATA").await;
    assert_eq!(read_reply(&mut reader).await, 354);

    send_line(&mut writer, "Subject: hello").await;
    send_line(&mut writer, "").await;
    send_line(&mut writer, "body text").await;
    send_line(&mut writer, ".").await;
    assert_eq!(read_reply(&mut reader).await, 250);

    send_line(&mut writer, "QUIT").await;
    assert_eq!(read_reply(&mut reader).await, 221);

    let received = submitter.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender.as_ref().unwrap().to_string(), "sender@example.test");
    assert_eq!(received[0].recipients[0].to_string(), "recipient@example.test");
    assert_eq!(received[0].header("Subject"), Some("hello"));

    shutdown.cancel();
}

#[tokio::test]
async fn smtp_edge_rejects_rcpt_before_mail() {
    let port = free_port();
    let submitter = Arc::new(RecordingSubmitter::default());
    let shutdown = spawn_edge(port, submitter.clone()).await;

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (reader_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    assert_eq!(read_reply(&mut reader).await, 220);
    send_line(&mut writer, "EHLO client.example.test").await;
    assert_eq!(read_reply(&mut reader).await, 250);

    send_line(&mut writer, "RCPT TO:<recipient@example.test>").await;
    assert_eq!(read_reply(&mut reader).await, 503);

    assert!(submitter.received.lock().unwrap().is_empty());
    shutdown.cancel();
}

/// Exercises the full pipeline: an SMTP edge hands envelopes to the queue,
/// which relays them (in `RelayMode::Static`) to a second in-process SMTP
/// server standing in for the next hop, and the queue removes the record
/// from storage once that hop accepts it.
#[tokio::test]
async fn queue_relays_an_accepted_envelope_to_its_static_next_hop_and_clears_storage() {
    let upstream_port = free_port();
    let upstream_submitter = Arc::new(RecordingSubmitter::default());
    let upstream_shutdown = spawn_edge(upstream_port, upstream_submitter.clone()).await;

    let storage: Arc<dyn Storage> = MemoryStorage::new();
    let relay = Arc::new(
        RelayManager::new(RelayManagerConfig {
            mode: RelayMode::Static { host: "127.0.0.1".into(), port: upstream_port },
            concurrent_connections: 2,
            idle_timeout: Duration::from_secs(30),
            client: Arc::new(ClientConfig::new("relay.example.test")),
            forced_hosts: Default::default(),
        })
        .unwrap(),
    );

    let (queue_handle, queue) = Queue::new(
        storage.clone(),
        relay,
        QueueConfig {
            hostname: "mail.example.test".into(),
            policies: vec![],
            backoff: backoff::exponential(),
        },
    );
    let queue_shutdown = CancellationToken::new();
    let queue_join = tokio::spawn(queue.run(queue_shutdown.clone()));

    let port = free_port();
    let queue_handle: Arc<dyn EnvelopeSubmitter> = Arc::new(queue_handle);
    let edge_shutdown = spawn_edge(port, queue_handle).await;

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (reader_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    assert_eq!(read_reply(&mut reader).await, 220);
    send_line(&mut writer, "EHLO client.example.test").await;
    assert_eq!(read_reply(&mut reader).await, 250);
    send_line(&mut writer, "MAIL FROM:<sender@example.test>").await;
    assert_eq!(read_reply(&mut reader).await, 250);
    send_line(&mut writer, "RCPT TO:<recipient@example.test>").await;
    assert_eq!(read_reply(&mut reader).await, 250);
    send_line(&mut writer, "DATA").await;
    assert_eq!(read_reply(&mut reader).await, 354);
    send_line(&mut writer, "Subject: relayed").await;
    send_line(&mut writer, "").await;
    send_line(&mut writer, "body").await;
    send_line(&mut writer, ".").await;
    assert_eq!(read_reply(&mut reader).await, 250);

    // Wait for the dispatcher's background delivery attempt to land and
    // clear the record from storage.
    let mut delivered = false;
    for _ in 0..50 {
        if storage.load_all().await.unwrap().is_empty() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(delivered, "record was not delivered and cleared within the timeout");
    assert_eq!(upstream_submitter.received.lock().unwrap().len(), 1);

    edge_shutdown.cancel();
    upstream_shutdown.cancel();
    queue_shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), queue_join).await;
}
