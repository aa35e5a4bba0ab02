//! Error taxonomy for vendor calls and the parse lifecycle.

use thiserror::Error;

/// Failure talking to, or reported by, an extraction vendor.
#[derive(Error, Debug)]
pub enum VendorError {
    #[error("missing vendor credentials: {0}")]
    MissingCredentials(String),

    #[error("vendor unreachable: {0}")]
    Transport(String),

    #[error("vendor API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("vendor job failed: {reason}")]
    JobFailed { reason: String },

    #[error("invalid vendor response: {0}")]
    InvalidResponse(String),
}

impl VendorError {
    /// True for failures reaching the vendor at all (network, auth,
    /// credentials), as opposed to a job the vendor reported as failed.
    pub fn is_transport(&self) -> bool {
        match self {
            VendorError::MissingCredentials(_) | VendorError::Transport(_) => true,
            VendorError::Api { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for VendorError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => VendorError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None if e.is_decode() => VendorError::InvalidResponse(e.to_string()),
            None => VendorError::Transport(e.to_string()),
        }
    }
}

/// Failure of a parse lifecycle operation.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("no completed parse job found for document: {0}")]
    NoCompletedJob(String),

    #[error("failed to read document file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Vendor(#[from] VendorError),

    #[error("normalization failed: {0}")]
    Normalize(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ParseError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ParseError::DocumentNotFound(_) | ParseError::NoCompletedJob(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(VendorError::MissingCredentials("REDUCTO_API_KEY".into()).is_transport());
        assert!(VendorError::Transport("connection refused".into()).is_transport());
        assert!(VendorError::Api {
            status: 401,
            message: "bad key".into()
        }
        .is_transport());
        assert!(!VendorError::Api {
            status: 422,
            message: "bad file".into()
        }
        .is_transport());
        assert!(!VendorError::JobFailed {
            reason: "corrupt pdf".into()
        }
        .is_transport());
    }

    #[test]
    fn test_reason_text_is_display() {
        let err = VendorError::JobFailed {
            reason: "page limit exceeded".into(),
        };
        assert_eq!(err.to_string(), "vendor job failed: page limit exceeded");
    }
}
