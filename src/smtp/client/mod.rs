//! Drives the client side of an SMTP conversation: EHLO/HELO handshake,
//! opportunistic STARTTLS, AUTH mechanism selection, and message delivery
//! with a per-recipient result map, per spec.md §4.3.
//!
//! Grounded in the sequential command/response style of
//! `paolobarbolini-lettre`'s `SmtpConnection` (`other_examples/50b2740c_...`)
//! and `Ekleog-kannader`'s `smtp-client` (`other_examples/d944e615_...`),
//! adapted to this crate's async codec and `Reply`/`DeliveryOutcome` types.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::codec::SmtpCodec;
use crate::envelope::{Envelope, Mailbox};
use crate::error::{ClientTimeoutKind, DeliveryOutcome, SessionError};
use crate::reply::{Reply, ReplyClass};
use crate::sasl::{self, Mechanism};

use super::transport::ClientStream;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0} timed out")]
    Timeout(ClientTimeoutKind),
    #[error("server rejected greeting or handshake: {0}")]
    Handshake(Reply),
    #[error("server does not offer STARTTLS")]
    StartTlsUnsupported,
    #[error("no authentication mechanism the server offers is usable here")]
    NoUsableMechanism,
    #[error("authentication failed: {0}")]
    AuthFailed(Reply),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub authcid: String,
    pub password: String,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub ehlo_name: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub data_timeout: Duration,
    pub tls_connector: Option<tokio_rustls::TlsConnector>,
    /// Hostname to verify the peer certificate against; required when
    /// `tls_connector` is set.
    pub tls_domain: Option<String>,
    pub credentials: Option<Credentials>,
}

impl ClientConfig {
    pub fn new(ehlo_name: impl Into<String>) -> Self {
        ClientConfig {
            ehlo_name: ehlo_name.into(),
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(120),
            data_timeout: Duration::from_secs(600),
            tls_connector: None,
            tls_domain: None,
            credentials: None,
        }
    }
}

/// Capabilities advertised in an EHLO response, parsed per RFC 5321/1869.
#[derive(Debug, Default, Clone)]
pub struct ServerCapabilities {
    pub size: Option<usize>,
    pub starttls: bool,
    pub auth_mechanisms: Vec<Mechanism>,
    pub eightbitmime: bool,
    pub pipelining: bool,
    pub enhanced_status_codes: bool,
}

impl ServerCapabilities {
    fn from_ehlo(reply: &Reply) -> Self {
        let mut caps = ServerCapabilities::default();
        for line in &reply.text {
            let upper = line.to_uppercase();
            if upper == "STARTTLS" {
                caps.starttls = true;
            } else if upper == "PIPELINING" {
                caps.pipelining = true;
            } else if upper == "8BITMIME" {
                caps.eightbitmime = true;
            } else if upper == "ENHANCEDSTATUSCODES" {
                caps.enhanced_status_codes = true;
            } else if let Some(rest) = upper.strip_prefix("SIZE") {
                caps.size = rest.trim().parse().ok();
            } else if let Some(rest) = upper.strip_prefix("AUTH") {
                caps.auth_mechanisms = rest.split_whitespace().filter_map(Mechanism::parse).collect();
            }
        }
        caps
    }
}

/// The outcome of attempting delivery of one envelope: a result per
/// recipient, since a relay may accept some and reject others (spec.md
/// §4.6: "a batch never succeeds or fails atomically").
#[derive(Debug)]
pub struct DeliveryReport {
    pub per_recipient: Vec<(Mailbox, DeliveryOutcome)>,
}

pub struct ClientSession<IO> {
    codec: Option<SmtpCodec<ClientStream<IO>>>,
    config: Arc<ClientConfig>,
    capabilities: ServerCapabilities,
}

impl<IO> ClientSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the greeting and performs the EHLO (falling back to HELO)
    /// handshake over an already-connected stream.
    pub async fn connect(stream: IO, config: Arc<ClientConfig>) -> Result<Self, ClientError> {
        let mut session = ClientSession {
            codec: Some(SmtpCodec::new(ClientStream::Plain(stream))),
            config,
            capabilities: ServerCapabilities::default(),
        };
        let greeting = session.read_reply_timeout(ClientTimeoutKind::Connect).await?;
        if !greeting.is_success() {
            return Err(ClientError::Handshake(greeting));
        }
        session.ehlo().await?;
        Ok(session)
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    fn codec_mut(&mut self) -> &mut SmtpCodec<ClientStream<IO>> {
        self.codec.as_mut().expect("codec present outside STARTTLS swap")
    }

    fn is_tls(&self) -> bool {
        self.codec.as_ref().map(|c| c.get_ref().is_tls()).unwrap_or(false)
    }

    async fn send_line(&mut self, line: impl AsRef<str>) -> Result<(), ClientError> {
        let dur = self.config.command_timeout;
        match timeout(dur, self.codec_mut().write_line(line.as_ref())).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ClientError::Timeout(ClientTimeoutKind::Command)),
        }
    }

    /// Reads one (possibly multi-line) reply, folding continuation lines
    /// into a single `Reply` the way `Reply::to_wire` would render them.
    async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let mut code = None;
        let mut enhanced = None;
        let mut lines = Vec::new();
        loop {
            let line = self
                .codec_mut()
                .read_line()
                .await?
                .ok_or(SessionError::ConnectionClosed)?;
            let (c, is_final, es, text) = Reply::parse_line(&line)
                .ok_or_else(|| ClientError::Session(SessionError::ConnectionClosed))?;
            code.get_or_insert(c);
            if es.is_some() {
                enhanced = es;
            }
            lines.push(text);
            if is_final {
                break;
            }
        }
        Ok(Reply {
            code: code.expect("at least one line was read"),
            enhanced,
            text: lines,
        })
    }

    async fn read_reply_timeout(&mut self, kind: ClientTimeoutKind) -> Result<Reply, ClientError> {
        let dur = match kind {
            ClientTimeoutKind::Connect => self.config.connect_timeout,
            ClientTimeoutKind::Data => self.config.data_timeout,
            ClientTimeoutKind::Command | ClientTimeoutKind::Idle => self.config.command_timeout,
        };
        match timeout(dur, self.read_reply()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(kind)),
        }
    }

    async fn ehlo(&mut self) -> Result<(), ClientError> {
        let ehlo_name = self.config.ehlo_name.clone();
        self.send_line(format!("EHLO {ehlo_name}")).await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.is_success() {
            self.capabilities = ServerCapabilities::from_ehlo(&reply);
            return Ok(());
        }
        self.send_line(format!("HELO {ehlo_name}")).await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.is_success() {
            self.capabilities = ServerCapabilities::default();
            Ok(())
        } else {
            Err(ClientError::Handshake(reply))
        }
    }

    /// Upgrades to TLS if the server offers it and a connector is
    /// configured; re-issues EHLO afterward per RFC 3207. A no-op if TLS is
    /// already active.
    pub async fn starttls(&mut self) -> Result<(), ClientError> {
        if self.is_tls() {
            return Ok(());
        }
        if !self.capabilities.starttls {
            return Err(ClientError::StartTlsUnsupported);
        }
        let Some(connector) = self.config.tls_connector.clone() else {
            return Err(ClientError::StartTlsUnsupported);
        };
        let Some(domain) = self.config.tls_domain.clone() else {
            return Err(ClientError::StartTlsUnsupported);
        };
        self.send_line("STARTTLS").await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if !reply.is_success() {
            return Err(ClientError::Handshake(reply));
        }
        let codec = self.codec.take().expect("codec present");
        let plain = match codec.into_inner() {
            ClientStream::Plain(io) => io,
            ClientStream::Tls(_) => unreachable!("checked is_tls above"),
        };
        let server_name = rustls::pki_types::ServerName::try_from(domain)
            .map_err(|_| ClientError::StartTlsUnsupported)?;
        let tls_stream = connector.connect(server_name, plain).await?;
        self.codec = Some(SmtpCodec::new(ClientStream::Tls(Box::new(tls_stream))));
        self.ehlo().await
    }

    /// Picks the strongest mutually usable mechanism (`CRAM-MD5` over
    /// `LOGIN` over `PLAIN`) and authenticates, refusing to send a
    /// plaintext mechanism outside of TLS.
    pub async fn authenticate(&mut self) -> Result<(), ClientError> {
        let Some(creds) = self.config.credentials.clone() else {
            return Ok(());
        };
        let mechanism = [Mechanism::CramMd5, Mechanism::Login, Mechanism::Plain]
            .into_iter()
            .find(|m| self.capabilities.auth_mechanisms.contains(m) && (!m.is_plaintext() || self.is_tls()))
            .ok_or(ClientError::NoUsableMechanism)?;
        match mechanism {
            Mechanism::Plain => self.auth_plain(&creds).await,
            Mechanism::Login => self.auth_login(&creds).await,
            Mechanism::CramMd5 => self.auth_cram_md5(&creds).await,
        }
    }

    async fn auth_plain(&mut self, creds: &Credentials) -> Result<(), ClientError> {
        let encoded = sasl::encode_plain(None, &creds.authcid, &creds.password);
        self.send_line(format!("AUTH PLAIN {encoded}")).await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(ClientError::AuthFailed(reply))
        }
    }

    async fn auth_login(&mut self, creds: &Credentials) -> Result<(), ClientError> {
        self.send_line("AUTH LOGIN").await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.code != 334 {
            return Err(ClientError::AuthFailed(reply));
        }
        self.send_line(sasl::encode_base64_text(&creds.authcid)).await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.code != 334 {
            return Err(ClientError::AuthFailed(reply));
        }
        self.send_line(sasl::encode_base64_text(&creds.password)).await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(ClientError::AuthFailed(reply))
        }
    }

    async fn auth_cram_md5(&mut self, creds: &Credentials) -> Result<(), ClientError> {
        self.send_line("AUTH CRAM-MD5").await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.code != 334 {
            return Err(ClientError::AuthFailed(reply));
        }
        let challenge_b64 = reply.text.first().cloned().unwrap_or_default();
        let challenge = sasl::decode_base64_text(&challenge_b64).map_err(|_| ClientError::AuthFailed(reply.clone()))?;
        let digest = sasl::cram_md5_digest(&challenge, &creds.password);
        let response = sasl::encode_base64_text(&format!("{} {}", creds.authcid, digest));
        self.send_line(response).await?;
        let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(ClientError::AuthFailed(reply))
        }
    }

    /// Delivers one envelope: `MAIL FROM`, one `RCPT TO` per recipient, then
    /// `DATA` only if at least one recipient was accepted. Never fails the
    /// whole call for a partial per-recipient rejection — that's reported
    /// in `DeliveryReport::per_recipient`.
    pub async fn deliver(&mut self, envelope: &Envelope) -> Result<DeliveryReport, ClientError> {
        let from = envelope.sender.as_ref().map(|m| m.as_str().to_string()).unwrap_or_default();
        let mail_cmd = if self.capabilities.size.is_some() {
            format!("MAIL FROM:<{from}> SIZE={}", envelope.body.len())
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.send_line(mail_cmd).await?;
        let mail_reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if !mail_reply.is_success() {
            let outcome = DeliveryOutcome::from_reply(mail_reply);
            return Ok(DeliveryReport {
                per_recipient: envelope.recipients.iter().cloned().map(|m| (m, outcome.clone())).collect(),
            });
        }

        let mut per_recipient = Vec::with_capacity(envelope.recipients.len());
        for rcpt in &envelope.recipients {
            self.send_line(format!("RCPT TO:<{}>", rcpt.as_str())).await?;
            let reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
            per_recipient.push((rcpt.clone(), DeliveryOutcome::from_reply(reply)));
        }

        if per_recipient.iter().all(|(_, o)| !o.is_success()) {
            self.send_line("RSET").await?;
            let _ = self.read_reply_timeout(ClientTimeoutKind::Command).await;
            return Ok(DeliveryReport { per_recipient });
        }

        self.send_line("DATA").await?;
        let data_reply = self.read_reply_timeout(ClientTimeoutKind::Command).await?;
        if data_reply.classify() != ReplyClass::Intermediate {
            let outcome = DeliveryOutcome::from_reply(data_reply);
            return Ok(DeliveryReport {
                per_recipient: per_recipient
                    .into_iter()
                    .map(|(m, o)| (m, if o.is_success() { outcome.clone() } else { o }))
                    .collect(),
            });
        }

        let body = envelope.flatten();
        let data_timeout = self.config.data_timeout;
        match timeout(data_timeout, self.codec_mut().write_data(&body)).await {
            Ok(res) => res?,
            Err(_) => return Err(ClientError::Timeout(ClientTimeoutKind::Data)),
        }
        let final_reply = self.read_reply_timeout(ClientTimeoutKind::Data).await?;
        let final_outcome = DeliveryOutcome::from_reply(final_reply);
        Ok(DeliveryReport {
            per_recipient: per_recipient
                .into_iter()
                .map(|(m, o)| (m, if o.is_success() { final_outcome.clone() } else { o }))
                .collect(),
        })
    }

    pub async fn quit(mut self) -> Result<(), ClientError> {
        self.send_line("QUIT").await?;
        let _ = self.read_reply_timeout(ClientTimeoutKind::Command).await;
        Ok(())
    }
}
