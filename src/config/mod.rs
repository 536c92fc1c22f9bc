use std::path::PathBuf;

use tracing::{debug, warn};

use crate::{
    speaker_verification::{http_client::VerificationClientConfig, VerifierConfig},
    voice_pipeline::ControllerConfig,
};

const DATA_DIR_ENV: &str = "VOICE_ACTIVATION_DATA_DIR";
const DATA_DIR_NAME: &str = "safe-voice";

#[derive(Debug, Clone)]
pub struct ActivationConfig {
    pub data_dir: PathBuf,
    pub controller: ControllerConfig,
    pub verifier: VerifierConfig,
    pub verification_client: VerificationClientConfig,
}

impl ActivationConfig {
    pub fn from_env() -> Self {
        let data_dir = read_non_empty_env(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let config = Self {
            data_dir,
            controller: ControllerConfig::from_env(),
            verifier: VerifierConfig::from_env(),
            verification_client: VerificationClientConfig::from_env(),
        };
        debug!(data_dir = %config.data_dir.display(), "loaded activation config");
        config
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
}

pub(crate) fn read_non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub(crate) fn read_u64_env(name: &str) -> Option<u64> {
    let raw = read_non_empty_env(name)?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring non-numeric environment value");
            None
        }
    }
}

pub(crate) fn read_u32_env(name: &str) -> Option<u32> {
    let raw = read_non_empty_env(name)?;
    match raw.parse::<u32>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring non-numeric environment value");
            None
        }
    }
}

/// Reads a value that must fall inside [0, 1]; anything else is ignored.
pub(crate) fn read_unit_f32_env(name: &str) -> Option<f32> {
    let raw = read_non_empty_env(name)?;
    match raw.parse::<f32>() {
        Ok(value) if (0.0..=1.0).contains(&value) => Some(value),
        _ => {
            warn!(name, value = %raw, "ignoring out-of-range environment value");
            None
        }
    }
}
