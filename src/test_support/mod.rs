//! In-process doubles for the audio, engine, verification and host seams.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{
    audio_capture_service::{
        AudioInputChunk, AudioInputChunkCallback, AudioSessionOptions, AudioSource, CaptureMode,
        RecordedAudio, TARGET_SAMPLE_RATE_HZ,
    },
    error::ActivationError,
    speaker_verification::http_client::{VerificationClient, VerificationResponse},
    voice_pipeline::{AlertData, ConfirmModalData, PipelineDelegate},
    wake_word::{
        EngineConfig, KeywordDetection, KeywordEngine, KeywordEngineProvider, WakeEvent,
    },
};

/// Sample value the fake engine treats as the spoken wake phrase.
pub const WAKE_MARKER: i16 = i16::MAX;

const FAKE_FRAME_LENGTH: usize = 4;
const FAKE_CLIP_SAMPLES: usize = 19_200;

enum FakeCapture {
    Stream(AudioInputChunkCallback),
    Clip,
}

#[derive(Default)]
struct FakeAudioState {
    active: Option<FakeCapture>,
    sessions: Vec<AudioSessionOptions>,
    starts: Vec<&'static str>,
    stops: usize,
    aborts: usize,
    fail_stop: bool,
}

#[derive(Default)]
pub struct FakeAudioSource {
    state: Mutex<FakeAudioState>,
}

impl std::fmt::Debug for FakeAudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeAudioSource").finish_non_exhaustive()
    }
}

impl FakeAudioSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a chunk to the open stream capture. Returns `false` when no
    /// stream is open.
    pub fn push_chunk(&self, samples: Vec<i16>) -> bool {
        let callback = match self.state.lock().expect("fake audio lock").active.as_ref() {
            Some(FakeCapture::Stream(callback)) => callback.clone(),
            _ => return false,
        };
        callback(AudioInputChunk {
            pcm16_mono_samples: samples,
            sample_rate_hz: TARGET_SAMPLE_RATE_HZ,
        });
        true
    }

    pub fn set_fail_stop(&self, fail_stop: bool) {
        self.state.lock().expect("fake audio lock").fail_stop = fail_stop;
    }

    pub fn start_count(&self, mode: &str) -> usize {
        self.state
            .lock()
            .expect("fake audio lock")
            .starts
            .iter()
            .filter(|started| **started == mode)
            .count()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().expect("fake audio lock").stops
    }

    pub fn abort_count(&self) -> usize {
        self.state.lock().expect("fake audio lock").aborts
    }

    pub fn configured_sessions(&self) -> Vec<AudioSessionOptions> {
        self.state.lock().expect("fake audio lock").sessions.clone()
    }
}

impl AudioSource for FakeAudioSource {
    fn configure_session(&self, options: AudioSessionOptions) -> Result<(), ActivationError> {
        self.state
            .lock()
            .expect("fake audio lock")
            .sessions
            .push(options);
        Ok(())
    }

    fn start_capture(&self, mode: CaptureMode) -> Result<(), ActivationError> {
        let mut state = self.state.lock().expect("fake audio lock");
        if state.active.is_some() {
            return Err(ActivationError::RecordingConflict);
        }
        state.starts.push(mode.label());
        state.active = Some(match mode {
            CaptureMode::Stream(callback) => FakeCapture::Stream(callback),
            CaptureMode::Clip => FakeCapture::Clip,
        });
        Ok(())
    }

    fn stop_capture(&self) -> Result<RecordedAudio, ActivationError> {
        let mut state = self.state.lock().expect("fake audio lock");
        if state.fail_stop {
            return Err(ActivationError::Audio("simulated stop failure".to_string()));
        }
        let samples = match state.active.take() {
            Some(FakeCapture::Clip) => vec![0i16; FAKE_CLIP_SAMPLES],
            Some(FakeCapture::Stream(_)) => Vec::new(),
            None => return Err(ActivationError::Audio("no capture is open".to_string())),
        };
        state.stops += 1;
        RecordedAudio::from_samples(&samples, TARGET_SAMPLE_RATE_HZ)
    }

    fn abort_capture(&self) -> Result<bool, ActivationError> {
        let mut state = self.state.lock().expect("fake audio lock");
        let was_open = state.active.take().is_some();
        if was_open {
            state.aborts += 1;
        }
        Ok(was_open)
    }

    fn is_capturing(&self) -> bool {
        self.state.lock().expect("fake audio lock").active.is_some()
    }
}

struct FakeEngine;

impl KeywordEngine for FakeEngine {
    fn frame_length(&self) -> usize {
        FAKE_FRAME_LENGTH
    }

    fn process(&mut self, frame: &[i16]) -> Option<KeywordDetection> {
        frame.contains(&WAKE_MARKER).then_some(KeywordDetection {
            keyword_index: 0,
            confidence: 0.9,
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeEngineProvider {
    created: Mutex<Vec<f32>>,
}

impl FakeEngineProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_sensitivities(&self) -> Vec<f32> {
        self.created.lock().expect("fake engine lock").clone()
    }
}

impl KeywordEngineProvider for FakeEngineProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create(&self, config: &EngineConfig) -> Result<Box<dyn KeywordEngine>, ActivationError> {
        self.created
            .lock()
            .expect("fake engine lock")
            .push(config.sensitivity);
        Ok(Box::new(FakeEngine))
    }
}

pub struct FakeVerificationClient {
    response: Result<VerificationResponse, ActivationError>,
    delay: Duration,
    device_ids: Mutex<Vec<String>>,
}

impl FakeVerificationClient {
    pub fn matching(score: f32) -> Self {
        Self {
            response: Ok(VerificationResponse {
                score,
                is_match: true,
                threshold: Some(0.78),
                message: None,
            }),
            delay: Duration::ZERO,
            device_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: ActivationError) -> Self {
        Self {
            response: Err(error),
            delay: Duration::ZERO,
            device_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.device_ids.lock().expect("fake client lock").clone()
    }
}

#[async_trait]
impl VerificationClient for FakeVerificationClient {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn verify(
        &self,
        _wav_bytes: Vec<u8>,
        device_id: &str,
    ) -> Result<VerificationResponse, ActivationError> {
        self.device_ids
            .lock()
            .expect("fake client lock")
            .push(device_id.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.clone()
    }
}

#[derive(Debug, Default)]
pub struct RecordingDelegate {
    alerts: Mutex<Vec<AlertData>>,
    modals: Mutex<Vec<ConfirmModalData>>,
    alert_failure: Mutex<Option<String>>,
    hides: AtomicUsize,
    acknowledgments: AtomicUsize,
    enrollments: AtomicUsize,
}

impl RecordingDelegate {
    pub fn fail_alerts(&self, message: &str) {
        *self.alert_failure.lock().expect("delegate lock") = Some(message.to_string());
    }

    pub fn alerts(&self) -> Vec<AlertData> {
        self.alerts.lock().expect("delegate lock").clone()
    }

    pub fn modals(&self) -> Vec<ConfirmModalData> {
        self.modals.lock().expect("delegate lock").clone()
    }

    pub fn hides(&self) -> usize {
        self.hides.load(Ordering::SeqCst)
    }

    pub fn acknowledgments(&self) -> usize {
        self.acknowledgments.load(Ordering::SeqCst)
    }

    pub fn enrollments(&self) -> usize {
        self.enrollments.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineDelegate for RecordingDelegate {
    async fn on_alert_triggered(&self, alert: &AlertData) -> Result<(), String> {
        if let Some(message) = self.alert_failure.lock().expect("delegate lock").clone() {
            return Err(message);
        }
        self.alerts.lock().expect("delegate lock").push(alert.clone());
        Ok(())
    }

    fn on_confirm_modal_show(&self, modal: &ConfirmModalData) {
        self.modals.lock().expect("delegate lock").push(modal.clone());
    }

    fn on_confirm_modal_hide(&self) {
        self.hides.fetch_add(1, Ordering::SeqCst);
    }

    fn on_wake_acknowledged(&self, _event: &WakeEvent) {
        self.acknowledgments.fetch_add(1, Ordering::SeqCst);
    }

    fn on_enrollment_requested(&self) {
        self.enrollments.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `condition` until it holds, yielding to the runtime between checks.
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> impl Future<Output = ()>
where
    F: FnMut() -> bool,
{
    async move {
        let deadline = Instant::now() + timeout;
        while !condition() {
            assert!(
                Instant::now() < deadline,
                "condition not met within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
