//! Push-notification ingress: HMAC validation and event-type demux.
//!
//! The HTTP server itself lives outside this crate; validation works on the
//! already-read method, headers and body. Every failure mode gets its own
//! error so the endpoint can answer (and log) precisely.

use std::collections::HashMap;

use hmac::{Hmac, Mac as _};
use oscar_core::Project;
use serde::Deserialize;
use sha2::Sha256;
use snafu::Snafu;

use crate::types::Issue;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// The secret name webhook deliveries are signed with.
pub const WEBHOOK_SECRET_NAME: &str = "github-webhook";

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum WebhookError {
    #[snafu(display("method `{method}` not allowed, POST required"))]
    WrongMethod { method: String },
    #[snafu(display("missing payload"))]
    MissingPayload,
    #[snafu(display("missing or malformed X-Hub-Signature-256 header"))]
    BadSignatureHeader,
    #[snafu(display("no `github-webhook` secret for project `{project}`"))]
    MissingKey { project: String },
    #[snafu(display("invalid HMAC"))]
    InvalidHmac,
    #[snafu(display("missing X-GitHub-Event header"))]
    MissingEventType,
    #[snafu(display("invalid `{event_type}` payload"))]
    InvalidPayload { event_type: String },
}

pub type WebhookResult<T> = std::result::Result<T, WebhookError>;

/// Per-project webhook secrets. Secret loading is the caller's concern;
/// this is the read surface validation needs.
#[derive(Debug, Default, Clone)]
pub struct Secrets {
    inner: HashMap<String, String>,
}

impl Secrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, project: &Project, secret: impl Into<String>) {
        self.inner.insert(project.to_string(), secret.into());
    }

    fn get(&self, project: &Project) -> Option<&str> {
        self.inner.get(project.as_str()).map(String::as_str)
    }
}

/// An inbound delivery, as read off the wire.
#[derive(Debug, Clone)]
pub struct WebhookRequest<'a> {
    pub method: &'a str,
    /// `X-Hub-Signature-256` header, if present.
    pub signature: Option<&'a str>,
    /// `X-GitHub-Event` header, if present.
    pub event_type: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuesPayload {
    pub action: String,
    pub issue: Issue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentPayload {
    pub action: String,
    pub issue: Issue,
    pub comment: crate::types::IssueComment,
}

/// A validated delivery. Known event types decode; unknown ones pass
/// through as opaque bytes for the caller to route or drop.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Issues(IssuesPayload),
    IssueComment(IssueCommentPayload),
    Discussion(serde_json::Value),
    Other {
        event_type: String,
        raw: Vec<u8>,
    },
}

/// Validate a delivery for `project` and decode its payload.
///
/// Checks, in order: POST method, non-empty body, well-formed signature
/// header, a stored secret, the HMAC itself (constant-time), and a
/// non-empty event type.
pub fn validate(
    request: &WebhookRequest<'_>,
    project: &Project,
    secrets: &Secrets,
) -> WebhookResult<WebhookEvent> {
    if request.method != "POST" {
        return WrongMethodSnafu {
            method: request.method,
        }
        .fail();
    }
    if request.body.is_empty() {
        return MissingPayloadSnafu.fail();
    }

    let signature_hex = request
        .signature
        .and_then(|header| header.strip_prefix(SIGNATURE_PREFIX))
        .ok_or(WebhookError::BadSignatureHeader)?;
    let signature = data_encoding::HEXLOWER_PERMISSIVE
        .decode(signature_hex.as_bytes())
        .map_err(|_| WebhookError::BadSignatureHeader)?;

    let Some(secret) = secrets.get(project) else {
        return MissingKeySnafu {
            project: project.to_string(),
        }
        .fail();
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(request.body);
    mac.verify_slice(&signature)
        .map_err(|_| WebhookError::InvalidHmac)?;

    let event_type = match request.event_type {
        Some(event_type) if !event_type.is_empty() => event_type,
        _ => return MissingEventTypeSnafu.fail(),
    };

    decode_event(event_type, request.body)
}

fn decode_event(event_type: &str, body: &[u8]) -> WebhookResult<WebhookEvent> {
    let invalid = |_| WebhookError::InvalidPayload {
        event_type: event_type.to_string(),
    };
    Ok(match event_type {
        "issues" => WebhookEvent::Issues(serde_json::from_slice(body).map_err(invalid)?),
        "issue_comment" => {
            WebhookEvent::IssueComment(serde_json::from_slice(body).map_err(invalid)?)
        }
        "discussion" => WebhookEvent::Discussion(serde_json::from_slice(body).map_err(invalid)?),
        _ => WebhookEvent::Other {
            event_type: event_type.to_string(),
            raw: body.to_vec(),
        },
    })
}
