use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

/// Microphone permission prompt owned by the host platform.
#[async_trait]
pub trait MicrophonePermission: Send + Sync {
    async fn request_microphone(&self) -> PermissionState;
}

/// Fixed answer, for hosts that resolve the prompt before handing control to
/// the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission {
    state: PermissionState,
}

impl StaticPermission {
    pub fn granted() -> Self {
        Self {
            state: PermissionState::Granted,
        }
    }

    pub fn denied() -> Self {
        Self {
            state: PermissionState::Denied,
        }
    }
}

#[async_trait]
impl MicrophonePermission for StaticPermission {
    async fn request_microphone(&self) -> PermissionState {
        self.state
    }
}
