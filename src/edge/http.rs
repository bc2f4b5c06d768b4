//! The HTTP edge, per spec.md §6: an alternate ingress that maps a
//! `message/rfc822` POST plus header-encoded envelope metadata onto the
//! same `submit::EnvelopeSubmitter` the SMTP edge uses, so both front-ends
//! feed one core.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{body::Bytes, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::warn;

use crate::envelope::{Envelope, Mailbox, Protocol, SessionMetadata};
use crate::reply::ReplyClass;
use crate::smtp::server::split_header_section;
use crate::submit::{EnvelopeSubmitter, SubmitOutcome};

pub fn router(submitter: Arc<dyn EnvelopeSubmitter>) -> Router {
    Router::new()
        .route("/", post(submit_message))
        .with_state(submitter)
}

fn decode_b64_header(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?;
    let decoded = BASE64.decode(raw.trim()).ok()?;
    String::from_utf8(decoded).ok()
}

async fn submit_message(
    State(submitter): State<Arc<dyn EnvelopeSubmitter>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(content_type) = headers.get("content-type").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "Content-Type: message/rfc822 required").into_response();
    };
    if !content_type.eq_ignore_ascii_case("message/rfc822") {
        return (StatusCode::BAD_REQUEST, "unsupported content type").into_response();
    }

    let sender_raw = decode_b64_header(&headers, "x-envelope-sender");
    let sender = match sender_raw.as_deref() {
        None | Some("") => None,
        Some(addr) => match Mailbox::parse(addr) {
            Ok(m) => Some(m),
            Err(_) => return (StatusCode::BAD_REQUEST, "malformed X-Envelope-Sender").into_response(),
        },
    };

    let recipients: Vec<Mailbox> = headers
        .get_all("x-envelope-recipient")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|raw| BASE64.decode(raw.trim()).ok())
        .filter_map(|bytes| String::from_utf8(bytes).ok())
        .filter_map(|addr| Mailbox::parse(&addr).ok())
        .collect();
    if recipients.is_empty() {
        return (StatusCode::BAD_REQUEST, "at least one valid X-Envelope-Recipient required").into_response();
    }

    let ehlo = headers.get("x-ehlo").and_then(|v| v.to_str().ok()).map(str::to_string);

    let mut metadata = SessionMetadata::new(peer.ip(), Protocol::Http);
    metadata.ehlo = ehlo;

    let mut envelope = Envelope::new(metadata);
    envelope.sender = sender;
    envelope.recipients = recipients;
    let (parsed_headers, parsed_body) = split_header_section(&body);
    envelope.headers = parsed_headers;
    envelope.body = parsed_body;

    match submitter.submit(envelope).await {
        SubmitOutcome::Accepted { id } => {
            let mut response = (StatusCode::OK, id.clone()).into_response();
            if let Ok(value) = format!("250; message=\"OK queued as {id}\"").parse() {
                response.headers_mut().insert("x-smtp-reply", value);
            }
            response
        }
        SubmitOutcome::Rejected { reply } => {
            // Spec's HTTP<->SMTP status mapping runs opposite to a naive
            // reading: an SMTP 5xx (permanent, don't retry) surfaces as an
            // HTTP 4xx (client error); an SMTP 4xx (transient) surfaces as
            // an HTTP 5xx (server error, safe for the caller to retry).
            let status = match reply.classify() {
                ReplyClass::Permanent => StatusCode::BAD_REQUEST,
                ReplyClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
                ReplyClass::Success | ReplyClass::Intermediate => {
                    warn!("submit rejected with a non-failure reply code {}", reply.code);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            let mut response = (status, reply.text.join(" ")).into_response();
            if let Ok(value) = format!("{}; message=\"{}\"", reply.code, reply.text.join(" ")).parse() {
                response.headers_mut().insert("x-smtp-reply", value);
            }
            response
        }
    }
}
