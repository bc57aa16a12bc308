use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::changeset::ChangeEvent;
use crate::config::{Secret, Settings};
use crate::error::SyncError;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const PUSH_EVENT: &str = "push";
const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Raw webhook invocation: headers plus the unparsed body the signature
/// covers. Deserializes from a Lambda-style event document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl WebhookRequest {
    pub fn new(headers: BTreeMap<String, String>, body: impl Into<String>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Header lookup ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Signature header value for `body`, as a sender would compute it.
pub fn sign(secret: &Secret, body: &str) -> String {
    let mut mac = new_mac(secret);
    mac.update(body.as_bytes());
    format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Constant-time check of a `sha256=<hex>` header value against `body`.
pub fn verify_signature(secret: &Secret, body: &str, header: &str) -> bool {
    let Some(encoded) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(encoded) else {
        return false;
    };
    let mut mac = new_mac(secret);
    mac.update(body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn new_mac(secret: &Secret) -> HmacSha256 {
    match HmacSha256::new_from_slice(secret.expose().as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    }
}

/// Validate a webhook invocation and extract its change event.
///
/// Checks run in order: local mode, signature, event type, payload shape,
/// pushed ref.
pub fn authenticate(request: &WebhookRequest, settings: &Settings) -> Result<ChangeEvent, SyncError> {
    if settings.local_mode {
        return Err(SyncError::LocalMode);
    }

    let secret = settings.webhook.secret.as_ref().ok_or_else(|| {
        SyncError::Config(anyhow::anyhow!(
            "webhook secret is not configured (set WEBHOOK_SECRET)"
        ))
    })?;
    let signed = request
        .header(SIGNATURE_HEADER)
        .is_some_and(|header| verify_signature(secret, &request.body, header));
    if !signed {
        return Err(SyncError::Unauthorized("unauthorized signature".to_string()));
    }

    let is_push = request.header(EVENT_HEADER).is_some_and(|events| {
        events
            .split(',')
            .any(|event| event.trim().eq_ignore_ascii_case(PUSH_EVENT))
    });
    if !is_push {
        return Err(SyncError::BadRequest("only push event".to_string()));
    }

    let event: ChangeEvent = serde_json::from_str(&request.body).map_err(|error| {
        debug!(%error, "rejecting webhook body");
        SyncError::BadRequest("malformed payload".to_string())
    })?;

    let on_target = event.branch().is_some_and(|branch| {
        settings
            .webhook
            .target_branches
            .iter()
            .any(|target| target == branch)
    });
    if !on_target {
        debug!(pushed_ref = %event.pushed_ref, "ignoring push outside target branches");
        return Err(SyncError::BadRequest("only target branch".to_string()));
    }

    Ok(event)
}
