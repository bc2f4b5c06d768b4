//! Drives the server side of an SMTP conversation, per spec.md §4.2.
//!
//! Generalizes the teacher's `SmtpProtocol`/`handle_connection` split (which
//! hard-coded a single recipient and no extensions) into the full ESMTP
//! state machine: `Banner → Greeted → Mail → Rcpt → Data`, with `Greeted`
//! re-entrant, STARTTLS, SASL AUTH, and the `Validator` hook points.

pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::codec::command::{Command, Params};
use crate::codec::{DataReadOutcome, SmtpCodec};
use crate::envelope::{Envelope, Mailbox, Protocol, SessionMetadata};
use crate::error::{AuthError, SessionError};
use crate::reply::{EnhancedStatus, Reply};
use crate::sasl::{self, Mechanism};
use crate::submit::{EnvelopeSubmitter, SubmitOutcome};

use super::transport::ServerStream;
pub use validator::{PermissiveValidator, Validator, ValidatorFactory};

/// Re-entrant states of the server session, per spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Banner,
    Greeted,
    Mail,
    Rcpt,
    Data,
}

/// Verifies SASL credentials. Kept separate from `Validator` because
/// authentication is a narrower, security-sensitive concern a deployment
/// usually backs with a credential store rather than arbitrary policy code.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify_plain(&self, authcid: &str, password: &str) -> bool;
    async fn lookup_cram_secret(&self, identity: &str) -> Option<String>;
}

#[derive(Clone)]
pub struct AuthConfig {
    /// Whether `PLAIN`/`LOGIN` may be attempted without TLS active. Per
    /// spec.md §9 Open Question (a), this defaults to `false`.
    pub allow_plaintext_without_tls: bool,
    pub verifier: Arc<dyn CredentialVerifier>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub max_message_size: usize,
    pub tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    pub auth: Option<AuthConfig>,
    /// Per-read timeout; any single read exceeding this emits 421 4.4.2 and
    /// closes the connection, per spec.md §4.2/§5.
    pub session_timeout: Duration,
}

impl ServerConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        ServerConfig {
            hostname: hostname.into(),
            max_message_size: 25 * 1024 * 1024,
            tls_acceptor: None,
            auth: None,
            session_timeout: Duration::from_secs(300),
        }
    }
}

fn parse_size_param(params: &Params) -> Option<usize> {
    params
        .iter()
        .find(|(k, _)| k == "SIZE")
        .and_then(|(_, v)| v.as_ref())
        .and_then(|v| v.parse().ok())
}

/// Drives one accepted connection through the server state machine.
pub struct Session<IO> {
    codec: Option<SmtpCodec<ServerStream<IO>>>,
    config: Arc<ServerConfig>,
    state: SessionState,
    metadata: SessionMetadata,
    sender: Option<Mailbox>,
    mail_seen: bool,
    recipients: Vec<Mailbox>,
    authenticated_as: Option<String>,
    validator: Box<dyn Validator>,
    submitter: Arc<dyn EnvelopeSubmitter>,
}

impl<IO> Session<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: IO,
        config: Arc<ServerConfig>,
        metadata: SessionMetadata,
        validator: Box<dyn Validator>,
        submitter: Arc<dyn EnvelopeSubmitter>,
    ) -> Self {
        Session {
            codec: Some(SmtpCodec::new(ServerStream::Plain(stream))),
            config,
            state: SessionState::Banner,
            metadata,
            sender: None,
            mail_seen: false,
            recipients: Vec::new(),
            authenticated_as: None,
            validator,
            submitter,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn codec_mut(&mut self) -> &mut SmtpCodec<ServerStream<IO>> {
        self.codec.as_mut().expect("codec present outside STARTTLS swap")
    }

    fn is_tls(&self) -> bool {
        self.codec
            .as_ref()
            .map(|c| c.get_ref().is_tls())
            .unwrap_or(false)
    }

    async fn write_reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        self.codec_mut().write_reply(reply).await
    }

    fn reset_transaction(&mut self) {
        self.sender = None;
        self.mail_seen = false;
        self.recipients.clear();
    }

    /// Runs the session to completion: banner, command loop, close.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let banner = Reply::new(
            220,
            format!("{} ESMTP service ready", self.config.hostname),
        );
        let banner = self.validator.on_connect(&self.metadata, banner).await;
        let accept = banner.is_success() || banner.classify() == crate::reply::ReplyClass::Intermediate;
        self.write_reply(&banner).await?;
        if !accept {
            return Ok(());
        }

        let session_timeout = self.config.session_timeout;
        loop {
            let line = match timeout(session_timeout, self.codec_mut().read_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    debug!("peer closed connection");
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!("session timed out waiting for a command");
                    let _ = self
                        .write_reply(&Reply::with_enhanced(
                            421,
                            EnhancedStatus::new(4, 4, 2),
                            "timeout waiting for command",
                        ))
                        .await;
                    return Ok(());
                }
            };
            trace!(target: "mailcrucible::smtp::server", "<- {line}");

            if self.state == SessionState::Data {
                // Should be unreachable: `handle_data` owns the DATA
                // sub-loop itself via `read_data`, so the main loop never
                // observes a bare DATA-phase line.
                continue;
            }

            let command = match crate::codec::command::parse(&line) {
                Ok(cmd) => cmd,
                Err(crate::error::ProtocolError::Unrecognized(_)) => {
                    self.write_reply(&Reply::new(500, "Command not recognized")).await?;
                    continue;
                }
                Err(_) => {
                    self.write_reply(&Reply::new(501, "Syntax error in parameters or arguments")).await?;
                    continue;
                }
            };

            match command {
                Command::Helo(domain) => self.handle_greet(domain, false).await?,
                Command::Ehlo(domain) => self.handle_greet(domain, true).await?,
                Command::StartTls => self.handle_starttls().await?,
                Command::Auth { mechanism, initial_response } => {
                    self.handle_auth(mechanism, initial_response).await?
                }
                Command::MailFrom { address, params } => self.handle_mail(address, params).await?,
                Command::RcptTo { address, params } => self.handle_rcpt(address, params).await?,
                Command::Data => {
                    if self.handle_data().await? {
                        // handle_data signals connection-ending failure (e.g.
                        // storage down mid-terminator) only via the ? above;
                        // nothing further to do here.
                    }
                }
                Command::Rset => {
                    self.reset_transaction();
                    self.write_reply(&Reply::new(250, "OK")).await?;
                }
                Command::Noop => self.write_reply(&Reply::new(250, "OK")).await?,
                Command::Vrfy(_) => {
                    self.write_reply(&Reply::new(252, "Cannot VRFY user, but will accept message")).await?;
                }
                Command::Quit => {
                    self.write_reply(&Reply::new(221, format!("{} closing connection", self.config.hostname)))
                        .await?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_greet(&mut self, domain: String, esmtp: bool) -> Result<(), SessionError> {
        if self.state == SessionState::Data {
            self.write_reply(&Reply::new(503, "Bad sequence of commands")).await?;
            return Ok(());
        }
        let proposed = if esmtp {
            Reply::multiline(250, self.ehlo_lines(&domain))
        } else {
            Reply::new(250, self.config.hostname.clone())
        };
        let reply = self.validator.on_greet(&domain, proposed).await;
        let accepted = reply.is_success();
        self.write_reply(&reply).await?;
        if accepted {
            self.metadata.ehlo = if domain.is_empty() { None } else { Some(domain) };
            self.metadata.protocol = match (esmtp, self.is_tls()) {
                (true, true) => Protocol::Esmtps,
                (true, false) => Protocol::Esmtp,
                (false, _) => Protocol::Smtp,
            };
            self.state = SessionState::Greeted;
            self.reset_transaction();
        }
        Ok(())
    }

    fn ehlo_lines(&self, domain: &str) -> Vec<String> {
        let greeted_as = if domain.is_empty() { "client" } else { domain };
        let mut lines = vec![format!("{} greets {}", self.config.hostname, greeted_as)];
        lines.push("8BITMIME".to_string());
        lines.push("PIPELINING".to_string());
        lines.push("ENHANCEDSTATUSCODES".to_string());
        lines.push(format!("SIZE {}", self.config.max_message_size));
        if self.config.tls_acceptor.is_some() && !self.is_tls() {
            lines.push("STARTTLS".to_string());
        }
        lines.push("SMTPUTF8".to_string());
        if self.config.auth.is_some() {
            lines.push(format!(
                "AUTH {} {} {}",
                Mechanism::Plain.name(),
                Mechanism::Login.name(),
                Mechanism::CramMd5.name()
            ));
        }
        lines
    }

    async fn handle_starttls(&mut self) -> Result<(), SessionError> {
        if self.is_tls() {
            self.write_reply(&Reply::with_enhanced(503, EnhancedStatus::new(5, 5, 1), "TLS already active"))
                .await?;
            return Ok(());
        }
        let Some(acceptor) = self.config.tls_acceptor.clone() else {
            self.write_reply(&Reply::new(454, "TLS not available")).await?;
            return Ok(());
        };
        self.write_reply(&Reply::new(220, "Go ahead")).await?;
        let codec = self.codec.take().expect("codec present");
        let plain = match codec.into_inner() {
            ServerStream::Plain(io) => io,
            ServerStream::Tls(_) => unreachable!("checked is_tls above"),
        };
        let tls_stream = acceptor.accept(plain).await?;
        self.codec = Some(SmtpCodec::new(ServerStream::Tls(Box::new(tls_stream))));
        self.metadata.security = crate::envelope::Security::Tls;
        // Per spec.md §4.2: reset to pre-EHLO state; the client must EHLO
        // again, and previously announced security downgrades (STARTTLS
        // itself) drop from the advertisement set once TLS is active.
        self.state = SessionState::Banner;
        self.reset_transaction();
        self.metadata.ehlo = None;
        Ok(())
    }

    async fn handle_auth(&mut self, mechanism_name: String, initial_response: Option<String>) -> Result<(), SessionError> {
        let Some(auth_cfg) = self.config.auth.clone() else {
            self.write_reply(&Reply::new(503, "AUTH not supported")).await?;
            return Ok(());
        };
        if self.authenticated_as.is_some() {
            self.write_reply(&Reply::with_enhanced(503, EnhancedStatus::new(5, 5, 1), "already authenticated"))
                .await?;
            return Ok(());
        }
        let Some(mechanism) = Mechanism::parse(&mechanism_name) else {
            self.write_reply(&Reply::with_enhanced(
                504,
                EnhancedStatus::new(5, 5, 4),
                "unrecognized authentication mechanism",
            ))
            .await?;
            return Ok(());
        };
        if mechanism.is_plaintext() && !self.is_tls() && !auth_cfg.allow_plaintext_without_tls {
            self.write_reply(&Reply::with_enhanced(
                538,
                EnhancedStatus::new(5, 7, 11),
                "encryption required for requested authentication mechanism",
            ))
            .await?;
            return Ok(());
        }

        let result = match mechanism {
            Mechanism::Plain => self.sasl_plain(initial_response, &auth_cfg).await,
            Mechanism::Login => self.sasl_login(initial_response, &auth_cfg).await,
            Mechanism::CramMd5 => self.sasl_cram_md5(&auth_cfg).await,
        };

        match result {
            Ok(identity) => {
                self.metadata.authenticated_as = Some(identity.clone());
                self.authenticated_as = Some(identity);
                self.write_reply(&Reply::with_enhanced(235, EnhancedStatus::new(2, 7, 0), "Authentication successful"))
                    .await?;
            }
            Err(AuthError::Cancelled) => {
                self.write_reply(&Reply::with_enhanced(501, EnhancedStatus::new(5, 5, 4), "authentication cancelled"))
                    .await?;
            }
            Err(_) => {
                self.write_reply(&Reply::with_enhanced(535, EnhancedStatus::new(5, 7, 8), "authentication failed"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn read_auth_line(&mut self) -> Result<String, AuthError> {
        let line = self
            .codec_mut()
            .read_line()
            .await
            .map_err(|_| AuthError::Rejected)?
            .ok_or(AuthError::Rejected)?;
        if line.trim() == "*" {
            return Err(AuthError::Cancelled);
        }
        Ok(line)
    }

    async fn sasl_plain(&mut self, initial: Option<String>, cfg: &AuthConfig) -> Result<String, AuthError> {
        let response = match initial {
            Some(r) => r,
            None => {
                self.write_reply(&Reply::new(334, "")).await.map_err(|_| AuthError::Rejected)?;
                self.read_auth_line().await?
            }
        };
        let (_authzid, authcid, password) = sasl::decode_plain(&response)?;
        if cfg.verifier.verify_plain(&authcid, &password).await {
            Ok(authcid)
        } else {
            Err(AuthError::Rejected)
        }
    }

    async fn sasl_login(&mut self, initial: Option<String>, cfg: &AuthConfig) -> Result<String, AuthError> {
        let username_b64 = match initial {
            Some(r) => r,
            None => {
                self.write_reply(&Reply::new(334, sasl::encode_base64_text("Username:")))
                    .await
                    .map_err(|_| AuthError::Rejected)?;
                self.read_auth_line().await?
            }
        };
        let username = sasl::decode_base64_text(&username_b64)?;
        self.write_reply(&Reply::new(334, sasl::encode_base64_text("Password:")))
            .await
            .map_err(|_| AuthError::Rejected)?;
        let password_b64 = self.read_auth_line().await?;
        let password = sasl::decode_base64_text(&password_b64)?;
        if cfg.verifier.verify_plain(&username, &password).await {
            Ok(username)
        } else {
            Err(AuthError::Rejected)
        }
    }

    async fn sasl_cram_md5(&mut self, cfg: &AuthConfig) -> Result<String, AuthError> {
        let nonce: u64 = rand::random();
        let (challenge_plain, challenge_b64) =
            sasl::cram_md5_challenge(&self.config.hostname, nonce, chrono::Utc::now().timestamp());
        self.write_reply(&Reply::new(334, challenge_b64)).await.map_err(|_| AuthError::Rejected)?;
        let response_b64 = self.read_auth_line().await?;
        let response = sasl::decode_base64_text(&response_b64)?;
        let (user, _digest) = response.rsplit_once(' ').ok_or(AuthError::Rejected)?;
        let secret = cfg.verifier.lookup_cram_secret(user).await;
        sasl::verify_cram_md5(&challenge_plain, &response_b64, secret.as_deref())
    }

    async fn handle_mail(&mut self, address: String, params: Params) -> Result<(), SessionError> {
        if self.state != SessionState::Greeted {
            self.write_reply(&Reply::with_enhanced(503, EnhancedStatus::new(5, 5, 1), "Bad sequence of commands"))
                .await?;
            return Ok(());
        }
        if let Some(size) = parse_size_param(&params) {
            if size > self.config.max_message_size {
                self.write_reply(&Reply::with_enhanced(
                    552,
                    EnhancedStatus::new(5, 3, 4),
                    "Message size exceeds fixed maximum message size",
                ))
                .await?;
                return Ok(());
            }
        }
        let sender = if address.is_empty() {
            None
        } else {
            match Mailbox::parse(&address) {
                Ok(m) => Some(m),
                Err(_) => {
                    self.write_reply(&Reply::new(501, "Syntax error in MAIL FROM address")).await?;
                    return Ok(());
                }
            }
        };
        let proposed = Reply::with_enhanced(250, EnhancedStatus::new(2, 1, 0), "OK");
        let reply = self.validator.on_mail(&sender, proposed).await;
        let accepted = reply.is_success();
        self.write_reply(&reply).await?;
        if accepted {
            self.sender = sender;
            self.mail_seen = true;
            self.recipients.clear();
            self.state = SessionState::Mail;
        }
        Ok(())
    }

    async fn handle_rcpt(&mut self, address: String, _params: Params) -> Result<(), SessionError> {
        if !self.mail_seen {
            self.write_reply(&Reply::with_enhanced(503, EnhancedStatus::new(5, 5, 1), "Need MAIL before RCPT"))
                .await?;
            return Ok(());
        }
        let recipient = match Mailbox::parse(&address) {
            Ok(m) => m,
            Err(_) => {
                self.write_reply(&Reply::new(501, "Syntax error in RCPT TO address")).await?;
                return Ok(());
            }
        };
        let proposed = Reply::with_enhanced(250, EnhancedStatus::new(2, 1, 5), "OK");
        let reply = self.validator.on_rcpt(&recipient, proposed).await;
        let accepted = reply.is_success();
        self.write_reply(&reply).await?;
        if accepted {
            self.recipients.push(recipient);
            self.state = SessionState::Rcpt;
        }
        Ok(())
    }

    /// Returns `Ok(true)` once the transaction has concluded (queued,
    /// rejected, or drained after an oversized body); `Ok(false)` is never
    /// actually returned today but is kept so a future early-reject path
    /// (e.g. `have_data` rejecting before any I/O) has somewhere to signal
    /// "stay put" without changing the call site.
    async fn handle_data(&mut self) -> Result<bool, SessionError> {
        if self.recipients.is_empty() {
            self.write_reply(&Reply::with_enhanced(554, EnhancedStatus::new(5, 5, 1), "no valid recipients"))
                .await?;
            return Ok(true);
        }
        let proposed = Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>");
        let reply = self.validator.on_data_start(proposed).await;
        if !reply.is_success() && reply.classify() != crate::reply::ReplyClass::Intermediate {
            self.write_reply(&reply).await?;
            return Ok(true);
        }
        self.write_reply(&reply).await?;
        self.state = SessionState::Data;

        let max_message_size = self.config.max_message_size;
        let outcome = self.codec_mut().read_data(Some(max_message_size)).await?;
        self.state = SessionState::Greeted;

        let raw = match outcome {
            DataReadOutcome::TooLarge => {
                self.write_reply(&Reply::with_enhanced(
                    552,
                    EnhancedStatus::new(5, 3, 4),
                    "message exceeds fixed maximum message size",
                ))
                .await?;
                self.reset_transaction();
                return Ok(true);
            }
            DataReadOutcome::Ok(body) => body,
        };

        let mut envelope = Envelope::new(self.metadata.clone());
        envelope.sender = self.sender.clone();
        envelope.recipients = self.recipients.clone();
        let (headers, body) = split_header_section(&raw);
        envelope.headers = headers;
        envelope.body = body;

        let proposed = Reply::new(250, "Message accepted");
        let reply = self.validator.have_data(&envelope, proposed).await;
        if !reply.is_success() {
            self.write_reply(&reply).await?;
            self.reset_transaction();
            return Ok(true);
        }

        let outcome = self.submitter.submit(envelope).await;
        let proposed = match &outcome {
            SubmitOutcome::Accepted { id } => {
                Reply::with_enhanced(250, EnhancedStatus::new(2, 6, 0), format!("OK queued as {id}"))
            }
            SubmitOutcome::Rejected { reply } => reply.clone(),
        };
        let final_reply = self.validator.handle_queued(&outcome, proposed).await;
        self.write_reply(&final_reply).await?;
        self.reset_transaction();
        Ok(true)
    }
}

/// Splits a raw DATA payload into ordered `(name, value)` header pairs and
/// the remaining opaque body, using `mailparse` for the header-section
/// scan. The body is never interpreted further, per spec.md §1's
/// non-goal of semantic MIME parsing.
pub(crate) fn split_header_section(raw: &[u8]) -> (Vec<(String, String)>, bytes::Bytes) {
    match mailparse::parse_headers(raw, 0) {
        Ok((headers, body_offset)) => {
            let pairs = headers
                .iter()
                .map(|h| (h.get_key(), h.get_value()))
                .collect();
            (pairs, bytes::Bytes::copy_from_slice(&raw[body_offset..]))
        }
        Err(_) => (Vec::new(), bytes::Bytes::copy_from_slice(raw)),
    }
}
