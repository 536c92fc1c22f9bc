//! Short-clip recorder and remote speaker scoring.
//!
//! A recording is closed by one timer task: at the target duration it performs
//! the normal stop; if that stop fails it waits until the max duration and
//! force-aborts the capture. Whoever closes the recording first wins, later
//! attempts observe that nothing is open.

pub mod http_client;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    audio_capture_service::{AudioSessionOptions, AudioSource, CaptureMode},
    config::{read_u64_env, read_unit_f32_env},
    error::{ensure_unit_interval, ActivationError},
};

use self::http_client::VerificationClient;

pub const DEFAULT_TARGET_DURATION_MS: u64 = 1_200;
pub const DEFAULT_MAX_DURATION_MS: u64 = 2_000;
pub const DEFAULT_THRESHOLD: f32 = 0.78;

/// Headroom kept for upload and scoring inside a `quick_verify` budget.
const QUICK_VERIFY_UPLOAD_RESERVE_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    pub target_duration_ms: u64,
    pub max_duration_ms: u64,
    pub default_threshold: f32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            target_duration_ms: DEFAULT_TARGET_DURATION_MS,
            max_duration_ms: DEFAULT_MAX_DURATION_MS,
            default_threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl VerifierConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(target_ms) = read_u64_env("VOICE_VERIFY_TARGET_DURATION_MS") {
            config.target_duration_ms = target_ms.max(1);
        }

        if let Some(max_ms) = read_u64_env("VOICE_VERIFY_MAX_DURATION_MS") {
            config.max_duration_ms = max_ms.max(1);
        }

        if let Some(threshold) = read_unit_f32_env("VOICE_VERIFY_THRESHOLD") {
            config.default_threshold = threshold;
        }

        if config.target_duration_ms > config.max_duration_ms {
            warn!(
                target_duration_ms = config.target_duration_ms,
                max_duration_ms = config.max_duration_ms,
                "verification target duration exceeds max; raising max"
            );
            config.max_duration_ms = config.target_duration_ms;
        }

        debug!(
            target_duration_ms = config.target_duration_ms,
            max_duration_ms = config.max_duration_ms,
            default_threshold = config.default_threshold,
            "loaded speaker verifier config"
        );
        config
    }

    pub fn validate(&self) -> Result<(), ActivationError> {
        ensure_unit_interval("threshold", self.default_threshold)?;
        if self.target_duration_ms == 0 || self.target_duration_ms > self.max_duration_ms {
            return Err(ActivationError::Config(format!(
                "Verification target duration {}ms must be positive and at most the max duration {}ms",
                self.target_duration_ms, self.max_duration_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationPhase {
    Recording,
    Processing,
    Verifying,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub success: bool,
    pub score: f32,
    pub threshold: f32,
    #[serde(rename = "match")]
    pub is_match: bool,
    pub message: String,
}

impl VerificationResult {
    fn unavailable(threshold: f32, reason: impl fmt::Display) -> Self {
        Self {
            success: false,
            score: 0.0,
            threshold,
            is_match: false,
            message: format!("Voice verification unavailable ({reason}); please try again"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingHandle {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, PartialEq)]
pub struct RecordedClip {
    pub id: Uuid,
    pub wav_bytes: Vec<u8>,
    pub sample_count: usize,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl fmt::Debug for RecordedClip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedClip")
            .field("id", &self.id)
            .field("wav_bytes", &self.wav_bytes.len())
            .field("duration_ms", &self.duration_ms)
            .finish()
    }
}

pub type ProgressCallback = Arc<dyn Fn(VerificationPhase) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct QuickVerifyOptions {
    pub timeout_ms: u64,
    pub device_id: String,
    pub on_progress: Option<ProgressCallback>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifierStatus {
    pub initialized: bool,
    pub recording: bool,
    pub target_duration_ms: u64,
    pub max_duration_ms: u64,
    pub default_threshold: f32,
}

#[derive(Debug)]
struct ActiveRecording {
    id: Uuid,
    started_at: Instant,
    timer: Option<JoinHandle<()>>,
}

impl ActiveRecording {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct VerifierState {
    initialized: bool,
    active: Option<ActiveRecording>,
    /// Clip closed by the target-duration timer, held for the next `stop_recording`.
    completed: Option<RecordedClip>,
}

struct VerifierInner {
    audio: Arc<dyn AudioSource>,
    client: Arc<dyn VerificationClient>,
    config: VerifierConfig,
    state: Mutex<VerifierState>,
}

#[derive(Clone)]
pub struct SpeakerVerifier {
    inner: Arc<VerifierInner>,
}

impl fmt::Debug for SpeakerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeakerVerifier")
            .field("client", &self.inner.client.name())
            .field("status", &self.status())
            .finish()
    }
}

impl SpeakerVerifier {
    pub fn new(
        audio: Arc<dyn AudioSource>,
        client: Arc<dyn VerificationClient>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            inner: Arc::new(VerifierInner {
                audio,
                client,
                config,
                state: Mutex::new(VerifierState::default()),
            }),
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.inner.config
    }

    pub fn initialize(&self) -> Result<(), ActivationError> {
        let mut state = self.inner.lock_state()?;
        if state.initialized {
            debug!("speaker verifier already initialized");
            return Ok(());
        }

        self.inner.config.validate()?;
        self.inner.audio.configure_session(AudioSessionOptions {
            allow_recording_in_silent_mode: true,
            ..AudioSessionOptions::default()
        })?;
        state.initialized = true;
        info!(
            target_duration_ms = self.inner.config.target_duration_ms,
            max_duration_ms = self.inner.config.max_duration_ms,
            "speaker verifier initialized"
        );
        Ok(())
    }

    /// Opens a clip recording. Returns `None` when a recording is already
    /// active or the audio source refuses to open.
    pub fn start_recording(&self) -> Option<RecordingHandle> {
        let mut state = self.inner.lock_state().ok()?;
        if !state.initialized {
            warn!("speaker verifier recording requested before initialize");
            return None;
        }
        if state.active.is_some() {
            warn!("speaker verifier recording already active");
            return None;
        }

        if let Err(error) = self.inner.audio.start_capture(CaptureMode::Clip) {
            warn!(%error, "speaker verifier failed to open recording");
            return None;
        }

        let id = Uuid::new_v4();
        let timer = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(recording_timer(
                Arc::downgrade(&self.inner),
                id,
                Duration::from_millis(self.inner.config.target_duration_ms),
                Duration::from_millis(self.inner.config.max_duration_ms),
            ))),
            Err(_) => {
                warn!("no async runtime; verification recording has no duration timer");
                None
            }
        };

        state.completed = None;
        state.active = Some(ActiveRecording {
            id,
            started_at: Instant::now(),
            timer,
        });
        debug!(recording_id = %id, "speaker verification recording started");
        Some(RecordingHandle {
            id,
            started_at: Utc::now(),
        })
    }

    /// Closes the recording and returns its clip. Failures are logged and
    /// reported as `None`.
    pub fn stop_recording(&self) -> Option<RecordedClip> {
        self.finish_recording(None)
    }

    /// `only` restricts the stop to one recording so a caller cannot close a
    /// recording someone else opened after its own was cancelled.
    fn finish_recording(&self, only: Option<Uuid>) -> Option<RecordedClip> {
        let owned = |id: Uuid| only.map_or(true, |only| only == id);
        let mut state = self.inner.lock_state().ok()?;
        if state.completed.as_ref().is_some_and(|clip| owned(clip.id)) {
            let clip = state.completed.take()?;
            debug!(recording_id = %clip.id, "returning clip closed by duration timer");
            return Some(clip);
        }

        if !state.active.as_ref().is_some_and(|active| owned(active.id)) {
            debug!("speaker verifier stop ignored; no matching active recording");
            return None;
        }
        let mut active = state.active.take()?;
        active.cancel_timer();

        match self.inner.close_recording(&active) {
            Ok(clip) => Some(clip),
            Err(error) => {
                warn!(recording_id = %active.id, %error, "failed to stop verification recording");
                if let Err(error) = self.inner.audio.abort_capture() {
                    warn!(%error, "failed to abort verification recording");
                }
                None
            }
        }
    }

    /// Uploads the clip for scoring. Never fails; errors become an
    /// unsuccessful, non-matching result.
    pub async fn verify(&self, clip: &RecordedClip, device_id: &str) -> VerificationResult {
        let threshold = self.inner.config.default_threshold;
        if clip.wav_bytes.is_empty() {
            warn!(recording_id = %clip.id, "refusing to verify empty clip");
            return VerificationResult::unavailable(threshold, "empty recording");
        }

        match self
            .inner
            .client
            .verify(clip.wav_bytes.clone(), device_id)
            .await
        {
            Ok(response) => {
                let threshold = response.threshold.unwrap_or(threshold);
                let message = response.message.unwrap_or_else(|| {
                    if response.is_match {
                        "Voice verified".to_string()
                    } else {
                        "Voice did not match".to_string()
                    }
                });
                info!(
                    recording_id = %clip.id,
                    score = response.score,
                    threshold,
                    is_match = response.is_match,
                    "speaker verification completed"
                );
                VerificationResult {
                    success: true,
                    score: response.score,
                    threshold,
                    is_match: response.is_match,
                    message,
                }
            }
            Err(error) => {
                warn!(recording_id = %clip.id, %error, "speaker verification failed");
                VerificationResult::unavailable(threshold, error)
            }
        }
    }

    /// Records, stops and verifies within `timeout_ms`, reporting each phase.
    pub async fn quick_verify(&self, options: QuickVerifyOptions) -> VerificationResult {
        let started_at = Instant::now();
        let budget = Duration::from_millis(options.timeout_ms);
        let threshold = self.inner.config.default_threshold;
        let report = |phase: VerificationPhase| {
            debug!(?phase, "quick verify progress");
            if let Some(on_progress) = options.on_progress.as_ref() {
                on_progress(phase);
            }
        };

        report(VerificationPhase::Recording);
        let Some(handle) = self.start_recording() else {
            report(VerificationPhase::Complete);
            return VerificationResult::unavailable(threshold, "microphone busy");
        };

        let record_for = Duration::from_millis(
            self.inner.config.target_duration_ms.min(
                options
                    .timeout_ms
                    .saturating_sub(QUICK_VERIFY_UPLOAD_RESERVE_MS),
            ),
        );
        tokio::time::sleep(record_for).await;

        report(VerificationPhase::Processing);
        let Some(clip) = self.finish_recording(Some(handle.id)) else {
            report(VerificationPhase::Complete);
            return VerificationResult::unavailable(threshold, "no audio captured");
        };

        report(VerificationPhase::Verifying);
        let remaining = budget.saturating_sub(started_at.elapsed());
        let result =
            match tokio::time::timeout(remaining, self.verify(&clip, &options.device_id)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        timeout_ms = options.timeout_ms,
                        "quick verify exceeded its time budget"
                    );
                    VerificationResult::unavailable(threshold, "timed out")
                }
            };

        report(VerificationPhase::Complete);
        result
    }

    /// Force-closes any active recording without verifying it.
    pub fn cancel(&self) -> bool {
        let Ok(mut state) = self.inner.lock_state() else {
            return false;
        };
        state.completed = None;
        let Some(mut active) = state.active.take() else {
            return false;
        };
        active.cancel_timer();

        if let Err(error) = self.inner.audio.abort_capture() {
            warn!(recording_id = %active.id, %error, "failed to abort cancelled recording");
        }
        info!(recording_id = %active.id, "speaker verification recording cancelled");
        true
    }

    pub fn is_recording(&self) -> bool {
        self.inner
            .lock_state()
            .map(|state| state.active.is_some())
            .unwrap_or(false)
    }

    pub fn status(&self) -> VerifierStatus {
        let (initialized, recording) = self
            .inner
            .lock_state()
            .map(|state| (state.initialized, state.active.is_some()))
            .unwrap_or((false, false));
        VerifierStatus {
            initialized,
            recording,
            target_duration_ms: self.inner.config.target_duration_ms,
            max_duration_ms: self.inner.config.max_duration_ms,
            default_threshold: self.inner.config.default_threshold,
        }
    }
}

impl VerifierInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, VerifierState>, ActivationError> {
        self.state
            .lock()
            .map_err(|_| ActivationError::Audio("Speaker verifier lock is poisoned".to_string()))
    }

    fn close_recording(&self, active: &ActiveRecording) -> Result<RecordedClip, ActivationError> {
        let recorded = self.audio.stop_capture()?;
        debug!(
            recording_id = %active.id,
            elapsed_ms = active.started_at.elapsed().as_millis() as u64,
            duration_ms = recorded.duration_ms,
            "speaker verification recording stopped"
        );
        Ok(RecordedClip {
            id: active.id,
            wav_bytes: recorded.wav_bytes,
            sample_count: recorded.sample_count,
            duration_ms: recorded.duration_ms,
            recorded_at: Utc::now(),
        })
    }

    /// Target-duration stop. Returns `false` when the recording is still open.
    fn stop_on_timer(&self, id: Uuid) -> bool {
        let Ok(mut state) = self.lock_state() else {
            return false;
        };
        let Some(active) = state.active.as_ref().filter(|active| active.id == id) else {
            return true;
        };

        match self.close_recording(active) {
            Ok(clip) => {
                state.active = None;
                state.completed = Some(clip);
                true
            }
            Err(error) => {
                warn!(recording_id = %id, %error, "target-duration stop failed; waiting for failsafe");
                false
            }
        }
    }

    fn abort_on_failsafe(&self, id: Uuid) {
        let Ok(mut state) = self.lock_state() else {
            return;
        };
        if !state.active.as_ref().is_some_and(|active| active.id == id) {
            return;
        }

        state.active = None;
        warn!(recording_id = %id, "max-duration failsafe closing verification recording");
        if let Err(error) = self.audio.abort_capture() {
            warn!(recording_id = %id, %error, "failsafe abort failed");
        }
    }
}

async fn recording_timer(inner: Weak<VerifierInner>, id: Uuid, target: Duration, max: Duration) {
    tokio::time::sleep(target).await;
    match inner.upgrade() {
        Some(inner) if !inner.stop_on_timer(id) => {}
        _ => return,
    }

    tokio::time::sleep(max.saturating_sub(target)).await;
    if let Some(inner) = inner.upgrade() {
        inner.abort_on_failsafe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_for, FakeAudioSource, FakeVerificationClient};
    use super::http_client::{HttpVerificationClient, VerificationClientConfig};
    use std::sync::Mutex as StdMutex;

    fn fast_config() -> VerifierConfig {
        VerifierConfig {
            target_duration_ms: 60,
            max_duration_ms: 150,
            default_threshold: 0.78,
        }
    }

    fn verifier_with(
        audio: Arc<FakeAudioSource>,
        client: Arc<FakeVerificationClient>,
        config: VerifierConfig,
    ) -> SpeakerVerifier {
        let verifier = SpeakerVerifier::new(audio, client, config);
        verifier.initialize().expect("initialize should succeed");
        verifier
    }

    #[tokio::test]
    async fn initialize_configures_silent_mode_once() {
        let audio = Arc::new(FakeAudioSource::new());
        let verifier = verifier_with(
            audio.clone(),
            Arc::new(FakeVerificationClient::matching(0.9)),
            fast_config(),
        );

        verifier.initialize().expect("second initialize should succeed");

        let sessions = audio.configured_sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].allow_recording_in_silent_mode);
    }

    #[tokio::test]
    async fn second_start_returns_none_and_keeps_first_recording() {
        let audio = Arc::new(FakeAudioSource::new());
        let verifier = verifier_with(
            audio.clone(),
            Arc::new(FakeVerificationClient::matching(0.9)),
            VerifierConfig::default(),
        );

        let first = verifier.start_recording();
        let second = verifier.start_recording();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(verifier.is_recording());
        assert_eq!(audio.start_count("clip"), 1);

        let clip = verifier.stop_recording().expect("first recording should stop");
        assert!(!clip.wav_bytes.is_empty());
        assert!(!verifier.status().recording);
    }

    #[tokio::test]
    async fn stop_recording_is_idempotent() {
        let verifier = verifier_with(
            Arc::new(FakeAudioSource::new()),
            Arc::new(FakeVerificationClient::matching(0.9)),
            VerifierConfig::default(),
        );

        verifier.start_recording().expect("recording should start");

        assert!(verifier.stop_recording().is_some());
        assert!(verifier.stop_recording().is_none());
    }

    #[tokio::test]
    async fn stop_failure_is_swallowed_and_capture_aborted() {
        let audio = Arc::new(FakeAudioSource::new());
        let verifier = verifier_with(
            audio.clone(),
            Arc::new(FakeVerificationClient::matching(0.9)),
            VerifierConfig::default(),
        );
        verifier.start_recording().expect("recording should start");
        audio.set_fail_stop(true);

        assert!(verifier.stop_recording().is_none());
        assert!(!verifier.is_recording());
        assert!(!audio.is_capturing());
        assert_eq!(audio.abort_count(), 1);
    }

    #[tokio::test]
    async fn target_timer_closes_recording_and_stashes_clip() {
        let audio = Arc::new(FakeAudioSource::new());
        let verifier = verifier_with(
            audio.clone(),
            Arc::new(FakeVerificationClient::matching(0.9)),
            fast_config(),
        );

        verifier.start_recording().expect("recording should start");
        wait_for(Duration::from_secs(1), || !verifier.is_recording()).await;

        assert_eq!(audio.stop_count(), 1);
        assert!(verifier.stop_recording().is_some());
        assert!(verifier.stop_recording().is_none());
    }

    #[tokio::test]
    async fn failsafe_aborts_when_target_stop_fails() {
        let audio = Arc::new(FakeAudioSource::new());
        audio.set_fail_stop(true);
        let verifier = verifier_with(
            audio.clone(),
            Arc::new(FakeVerificationClient::matching(0.9)),
            fast_config(),
        );

        verifier.start_recording().expect("recording should start");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(verifier.is_recording(), "failsafe has not fired yet");

        wait_for(Duration::from_secs(1), || !verifier.is_recording()).await;
        assert_eq!(audio.abort_count(), 1);
        assert!(!audio.is_capturing());
    }

    #[tokio::test]
    async fn cancel_aborts_active_recording() {
        let audio = Arc::new(FakeAudioSource::new());
        let verifier = verifier_with(
            audio.clone(),
            Arc::new(FakeVerificationClient::matching(0.9)),
            VerifierConfig::default(),
        );
        verifier.start_recording().expect("recording should start");

        assert!(verifier.cancel());
        assert!(!verifier.cancel());
        assert!(!audio.is_capturing());
        assert!(verifier.stop_recording().is_none());
    }

    #[tokio::test]
    async fn quick_verify_matches_within_budget() {
        let client = Arc::new(FakeVerificationClient::matching(0.9));
        let verifier = verifier_with(
            Arc::new(FakeAudioSource::new()),
            client.clone(),
            VerifierConfig::default(),
        );
        let phases = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&phases);

        let started_at = Instant::now();
        let result = verifier
            .quick_verify(QuickVerifyOptions {
                timeout_ms: 2_000,
                device_id: "device-123".to_string(),
                on_progress: Some(Arc::new(move |phase: VerificationPhase| {
                    sink.lock().expect("phase lock").push(phase);
                })),
            })
            .await;

        assert!(started_at.elapsed() < Duration::from_millis(2_000));
        assert!(result.success);
        assert!(result.is_match);
        assert_eq!(result.threshold, 0.78);
        assert_eq!(client.device_ids(), vec!["device-123".to_string()]);
        assert_eq!(
            *phases.lock().expect("phase lock"),
            vec![
                VerificationPhase::Recording,
                VerificationPhase::Processing,
                VerificationPhase::Verifying,
                VerificationPhase::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn quick_verify_times_out_slow_endpoint() {
        let client = Arc::new(
            FakeVerificationClient::matching(0.9).with_delay(Duration::from_millis(2_000)),
        );
        let verifier = verifier_with(Arc::new(FakeAudioSource::new()), client, fast_config());

        let started_at = Instant::now();
        let result = verifier
            .quick_verify(QuickVerifyOptions {
                timeout_ms: 600,
                device_id: "device-123".to_string(),
                on_progress: None,
            })
            .await;

        assert!(started_at.elapsed() < Duration::from_millis(1_000));
        assert!(!result.success);
        assert!(!result.is_match);
    }

    #[tokio::test]
    async fn verify_reports_unreachable_endpoint_as_neutral_failure() {
        let verifier = verifier_with(
            Arc::new(FakeAudioSource::new()),
            Arc::new(FakeVerificationClient::failing(ActivationError::Network(
                "connection refused".to_string(),
            ))),
            VerifierConfig::default(),
        );
        verifier.start_recording().expect("recording should start");
        let clip = verifier.stop_recording().expect("clip should be recorded");

        let result = verifier.verify(&clip, "device-123").await;

        assert!(!result.success);
        assert!(!result.is_match);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.threshold, 0.78);
    }

    #[tokio::test]
    async fn http_client_against_closed_port_yields_neutral_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind a port");
        let port = listener.local_addr().expect("bound address").port();
        drop(listener);
        let client = HttpVerificationClient::new(VerificationClientConfig {
            base_url: format!("http://127.0.0.1:{port}"),
            request_timeout_ms: 500,
            max_retries: 1,
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 10,
        })
        .expect("client construction should succeed");
        let verifier = SpeakerVerifier::new(
            Arc::new(FakeAudioSource::new()),
            Arc::new(client),
            VerifierConfig::default(),
        );
        verifier.initialize().expect("initialize should succeed");
        verifier.start_recording().expect("recording should start");
        let clip = verifier.stop_recording().expect("clip should be recorded");

        let result = verifier.verify(&clip, "device-123").await;

        assert!(!result.success);
        assert!(!result.is_match);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.threshold, 0.78);
        assert!(!result.message.is_empty());
    }

    #[tokio::test]
    async fn verify_rejects_empty_clip_without_calling_endpoint() {
        let client = Arc::new(FakeVerificationClient::matching(0.9));
        let verifier = verifier_with(
            Arc::new(FakeAudioSource::new()),
            client.clone(),
            VerifierConfig::default(),
        );
        let clip = RecordedClip {
            id: Uuid::new_v4(),
            wav_bytes: Vec::new(),
            sample_count: 0,
            duration_ms: 0,
            recorded_at: Utc::now(),
        };

        let result = verifier.verify(&clip, "device-123").await;

        assert!(!result.success);
        assert!(client.device_ids().is_empty());
    }

    #[test]
    fn config_validation_rejects_inverted_durations() {
        let config = VerifierConfig {
            target_duration_ms: 3_000,
            ..VerifierConfig::default()
        };

        assert!(matches!(config.validate(), Err(ActivationError::Config(_))));
    }
}
