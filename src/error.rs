use thiserror::Error;

/// Scope the Graph application registration needs for delete/move.
pub const WRITE_SCOPE: &str = "Mail.ReadWrite";

/// Errors produced by the gateway and the credential provider.
#[derive(Debug, Error)]
pub enum MailError {
    /// The request never produced an HTTP response.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response; `message` is the server's human-readable text.
    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// No bearer token could be acquired; the user must sign in again.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response had no body")]
    EmptyResponse,
}

/// Failure classes the synchronizer and search coordinator act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    AuthorizationDenied,
    QueryUnsupported,
    NotFound,
    AuthRequired,
    Unknown,
}

impl MailError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MailError::Network(_) => ErrorKind::Network,
            MailError::AuthRequired(_) => ErrorKind::AuthRequired,
            MailError::Decode(_) | MailError::InvalidRequest(_) | MailError::EmptyResponse => {
                ErrorKind::Unknown
            }
            MailError::Api { status, .. } => match *status {
                400 => ErrorKind::QueryUnsupported,
                401 => ErrorKind::AuthRequired,
                403 => ErrorKind::AuthorizationDenied,
                404 | 410 => ErrorKind::NotFound,
                408 | 429 | 500..=599 => ErrorKind::Network,
                _ => ErrorKind::Unknown,
            },
        }
    }

    /// Text shown to the user when a write path fails. `action` is a short
    /// verb phrase such as "delete email".
    pub fn user_message(&self, action: &str) -> String {
        match self.kind() {
            ErrorKind::AuthorizationDenied => format!(
                "Permission denied. Please ensure:\n\n\
                 1. The app registration has the \"{WRITE_SCOPE}\" permission (not just \"Mail.Read\")\n\
                 2. Admin consent has been granted\n\
                 3. You have signed out and back in to refresh your token"
            ),
            ErrorKind::AuthRequired => {
                "Your session has expired. Please sign in again.".to_string()
            }
            ErrorKind::Network => {
                format!("Failed to {action}: the server could not be reached. Please try again.")
            }
            _ => format!("Failed to {action}: {}", self.server_message()),
        }
    }

    fn server_message(&self) -> String {
        match self {
            MailError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<hyper::Error> for MailError {
    fn from(e: hyper::Error) -> Self {
        MailError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> MailError {
        MailError::Api {
            status,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(api(400).kind(), ErrorKind::QueryUnsupported);
        assert_eq!(api(401).kind(), ErrorKind::AuthRequired);
        assert_eq!(api(403).kind(), ErrorKind::AuthorizationDenied);
        assert_eq!(api(404).kind(), ErrorKind::NotFound);
        assert_eq!(api(410).kind(), ErrorKind::NotFound);
        assert_eq!(api(429).kind(), ErrorKind::Network);
        assert_eq!(api(503).kind(), ErrorKind::Network);
        assert_eq!(api(409).kind(), ErrorKind::Unknown);
        assert_eq!(
            MailError::Network("reset".into()).kind(),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_permission_message_names_scope() {
        let msg = api(403).user_message("delete email");
        assert!(msg.contains(WRITE_SCOPE));
        assert!(msg.starts_with("Permission denied"));
    }

    #[test]
    fn test_generic_message_uses_server_text_verbatim() {
        let err = MailError::Api {
            status: 409,
            message: "The item is locked.".to_string(),
        };
        assert_eq!(
            err.user_message("delete email"),
            "Failed to delete email: The item is locked."
        );
    }
}
