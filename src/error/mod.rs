use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ActivationError {
    PermissionDenied,
    Config(String),
    NotInitialized,
    AlreadyListening,
    RecordingConflict,
    Network(String),
    InvalidResponse(String),
    InvalidRange { field: &'static str, value: f64 },
    Audio(String),
    Settings(String),
}

impl ActivationError {
    /// Soft errors are expected races (duplicate start, concurrent recording)
    /// that callers treat as no-ops rather than failures.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::AlreadyListening | Self::RecordingConflict)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::Config(_) => "config_error",
            Self::NotInitialized => "not_initialized",
            Self::AlreadyListening => "already_listening",
            Self::RecordingConflict => "recording_conflict",
            Self::Network(_) => "network_failure",
            Self::InvalidResponse(_) => "invalid_response",
            Self::InvalidRange { .. } => "invalid_range",
            Self::Audio(_) => "audio_error",
            Self::Settings(_) => "settings_error",
        }
    }
}

impl fmt::Display for ActivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "Microphone permission was denied"),
            Self::Config(message) => write!(f, "Configuration error: {message}"),
            Self::NotInitialized => write!(f, "Component has not been initialized"),
            Self::AlreadyListening => write!(f, "Wake-word detector is already listening"),
            Self::RecordingConflict => write!(f, "Another recording session is already active"),
            Self::Network(message) => write!(f, "Network error: {message}"),
            Self::InvalidResponse(message) => write!(f, "Invalid endpoint response: {message}"),
            Self::InvalidRange { field, value } => {
                write!(f, "`{field}` must be within [0, 1], got {value}")
            }
            Self::Audio(message) => write!(f, "Audio error: {message}"),
            Self::Settings(message) => write!(f, "Settings error: {message}"),
        }
    }
}

impl std::error::Error for ActivationError {}

/// Rejects values outside the closed unit interval before any state is touched.
pub fn ensure_unit_interval(field: &'static str, value: f32) -> Result<f32, ActivationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ActivationError::InvalidRange {
            field,
            value: f64::from(value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_errors_are_limited_to_listen_and_recording_races() {
        assert!(ActivationError::AlreadyListening.is_soft());
        assert!(ActivationError::RecordingConflict.is_soft());
        assert!(!ActivationError::PermissionDenied.is_soft());
        assert!(!ActivationError::Network("offline".to_string()).is_soft());
    }

    #[test]
    fn unit_interval_check_rejects_out_of_bounds_and_nan() {
        assert_eq!(ensure_unit_interval("sensitivity", 0.0), Ok(0.0));
        assert_eq!(ensure_unit_interval("sensitivity", 1.0), Ok(1.0));
        assert!(ensure_unit_interval("sensitivity", -0.01).is_err());
        assert!(ensure_unit_interval("sensitivity", 1.01).is_err());
        assert!(ensure_unit_interval("sensitivity", f32::NAN).is_err());
    }

    #[test]
    fn invalid_range_message_names_field() {
        let error = ensure_unit_interval("threshold", 2.0).expect_err("should reject");
        assert_eq!(error.to_string(), "`threshold` must be within [0, 1], got 2");
    }
}
