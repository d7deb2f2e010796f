//! Domain errors for the gaze engine, plus stable code strings used by the
//! control plane to map errors to HTTP responses.
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("need at least 4 calibration points, got {got}")]
    InsufficientPoints { got: usize },
    #[error("homography system is singular")]
    SingularSystem,
    #[error("more than half of the calibration points were rejected as outliers")]
    RansacRejection,
    #[error("calibration is not collecting points")]
    NotCollecting,
    #[error("no gaze sample observed yet")]
    NoSampleYet,
}

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("invalid sample: {0}")]
    InvalidSample(&'static str),
    #[error("calibration failed: {0}")]
    CalibrationFailed(#[from] CalibrationError),
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already running: {0}")]
    SessionAlreadyRunning(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for the HTTP edge. These strings are
    /// part of the API contract; do not rename.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::DeviceUnavailable(_) => "device_unavailable",
            EngineError::InvalidSample(_) => "invalid_sample",
            EngineError::CalibrationFailed(c) => match c {
                CalibrationError::InsufficientPoints { .. } => "insufficient_points",
                CalibrationError::SingularSystem => "singular_system",
                CalibrationError::RansacRejection => "ransac_rejection",
                CalibrationError::NotCollecting => "not_collecting",
                CalibrationError::NoSampleYet => "no_sample_yet",
            },
            EngineError::PersistenceFailed(_) => "persistence_failed",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::SessionAlreadyRunning(_) => "session_already_running",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            EngineError::CalibrationFailed(CalibrationError::InsufficientPoints { got: 3 }).code(),
            "insufficient_points"
        );
        assert_eq!(
            EngineError::SessionNotFound("s1".into()).code(),
            "session_not_found"
        );
        assert_eq!(
            EngineError::SessionAlreadyRunning("s1".into()).code(),
            "session_already_running"
        );
    }
}
