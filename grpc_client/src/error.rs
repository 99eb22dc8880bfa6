use thiserror::Error;
use tonic::Code;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid backend address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to connect to backend at {address}: {reason}")]
    Connect { address: String, reason: String },

    /// The backend could not be reached or dropped the connection
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend call timed out")]
    Timeout,

    #[error("backend call cancelled")]
    Cancelled,

    #[error("backend returned {code:?}: {message}")]
    Rpc { code: Code, message: String },

    /// The call completed but the backend reported `success = false`
    #[error("backend reported failure: {0}")]
    Failed(String),
}

impl ClientError {
    /// True when the failure happened below the RPC layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::Unavailable(_) | ClientError::Timeout
        )
    }
}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            Code::Unavailable => ClientError::Unavailable(status.message().to_string()),
            Code::DeadlineExceeded => ClientError::Timeout,
            Code::Cancelled => ClientError::Cancelled,
            code => ClientError::Rpc {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(ClientError::from(tonic::Status::unavailable("refused")).is_transport());
        assert!(matches!(
            ClientError::from(tonic::Status::deadline_exceeded("slow")),
            ClientError::Timeout
        ));
        let err = ClientError::from(tonic::Status::internal("boom"));
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "backend returned Internal: boom");
    }
}
