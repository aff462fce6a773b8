use thiserror::Error;

use crate::synth::SynthesisError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no text to narrate")]
    EmptyText,
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("synthesis ran out of accelerator memory: {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// HTTP-style status for the transport layer.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::EmptyText
            | ServiceError::UnknownEngine(_)
            | ServiceError::InvalidParameter { .. } => 400,
            ServiceError::ResourceExhausted(_) => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status() < 500
    }

    /// What a caller may see. Internal failures stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ServiceError::Internal(_) => "internal server error".to_string(),
            ServiceError::ResourceExhausted(_) => {
                "synthesis ran out of accelerator memory, retry shortly".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<SynthesisError> for ServiceError {
    fn from(err: SynthesisError) -> Self {
        match err {
            SynthesisError::ResourceExhausted(reason) => ServiceError::ResourceExhausted(reason),
            SynthesisError::Internal(err) => ServiceError::Internal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(ServiceError::EmptyText.status(), 400);
        assert_eq!(ServiceError::UnknownEngine("piper".into()).status(), 400);
        assert_eq!(ServiceError::invalid("speed", "must be positive").status(), 400);
        assert_eq!(ServiceError::ResourceExhausted("cuda".into()).status(), 503);
        assert_eq!(ServiceError::Internal(anyhow!("boom")).status(), 500);
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ServiceError::Internal(anyhow!("/srv/secret/path exploded"));
        assert_eq!(err.client_message(), "internal server error");
        assert_eq!(
            ServiceError::UnknownEngine("piper".into()).client_message(),
            "unknown engine: piper"
        );
    }
}
