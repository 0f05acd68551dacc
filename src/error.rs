use thiserror::Error;

/// Normalized failure surfaced by the control client and the orchestrator.
///
/// Every variant renders as a single line suitable for direct display.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("control plane unreachable: {0}")]
    Transport(String),

    #[error("API Error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response from control plane: {0}")]
    Decode(String),

    #[error("\"{0}\" is not a valid country code. Use codes like: us, uk, de, jp")]
    InvalidCountry(String),

    #[error("an operation for {0} is already in progress")]
    Busy(String),

    #[error("controller session closed")]
    SessionClosed,
}

impl ControlError {
    /// HTTP status carried by protocol errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            ControlError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
