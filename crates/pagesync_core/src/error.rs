use thiserror::Error;

use crate::source::SourceError;

/// Failure taxonomy of a sync run, mapped onto response status codes.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Signature missing or not matching the shared secret.
    #[error("{0}")]
    Unauthorized(String),

    /// Wrong event type, disallowed ref or unparseable payload.
    #[error("{0}")]
    BadRequest(String),

    /// Webhook invocations are refused in local/offline mode.
    #[error("no event on local")]
    LocalMode,

    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("content source error: {0}")]
    Source(#[from] SourceError),

    /// Any browser launch, navigation or selector failure.
    #[error("{0:#}")]
    Automation(anyhow::Error),
}

impl SyncError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::BadRequest(_) => 400,
            Self::LocalMode | Self::Config(_) | Self::Source(_) | Self::Automation(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SyncError;
    use crate::source::SourceError;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(SyncError::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(SyncError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(SyncError::LocalMode.status_code(), 500);
        assert_eq!(
            SyncError::Source(SourceError::NotFound("code/js/a/b.js".into())).status_code(),
            500
        );
        assert_eq!(
            SyncError::Automation(anyhow::anyhow!("timeout")).status_code(),
            500
        );
    }

    #[test]
    fn automation_message_includes_context_chain() {
        let error = anyhow::anyhow!("timed out").context("open edit menu failed for js:greet");
        let message = SyncError::Automation(error).to_string();
        assert_eq!(message, "open edit menu failed for js:greet: timed out");
    }
}
