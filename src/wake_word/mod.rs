//! Wake-word detector.
//!
//! Wraps a keyword-spotting engine fed from the shared [`AudioSource`] and
//! publishes debounced [`WakeEvent`]s to registered listeners.

pub mod energy;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::{
    audio_capture_service::{AudioInputChunk, AudioInputChunkCallback, AudioSource, CaptureMode},
    error::{ensure_unit_interval, ActivationError},
    listener_registry::{ListenerId, ListenerRegistry},
    permission_service::{MicrophonePermission, PermissionState},
};

pub use energy::{EnergyEngineProvider, EnergyKeywordEngine};

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub access_key: Option<String>,
    pub sensitivity: f32,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub access_key: String,
    pub sensitivity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeywordDetection {
    pub keyword_index: usize,
    pub confidence: f32,
}

pub trait KeywordEngine: Send {
    /// Samples per `process` call; zero means any chunk size is accepted.
    fn frame_length(&self) -> usize;

    fn process(&mut self, frame: &[i16]) -> Option<KeywordDetection>;
}

pub trait KeywordEngineProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn create(&self, config: &EngineConfig) -> Result<Box<dyn KeywordEngine>, ActivationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeEvent {
    pub keyword_index: usize,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorStatus {
    pub initialized: bool,
    pub listening: bool,
    pub sensitivity: f32,
    pub debounce_ms: u64,
    pub listener_count: usize,
    pub last_wake_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct DetectorState {
    access_key: Option<String>,
    listening: bool,
    sensitivity: f32,
    debounce: Duration,
    last_wake_at: Option<Instant>,
    last_wake_timestamp: Option<DateTime<Utc>>,
}

struct DetectorShared {
    audio: Arc<dyn AudioSource>,
    permission: Arc<dyn MicrophonePermission>,
    engines: Arc<dyn KeywordEngineProvider>,
    state: Mutex<DetectorState>,
    listeners: ListenerRegistry<WakeEvent>,
    origin_instant: Instant,
    origin_wall: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WakeWordDetector {
    shared: Arc<DetectorShared>,
}

impl fmt::Debug for WakeWordDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeWordDetector")
            .field("engine", &self.shared.engines.name())
            .field("status", &self.status())
            .finish()
    }
}

impl WakeWordDetector {
    pub fn new(
        audio: Arc<dyn AudioSource>,
        permission: Arc<dyn MicrophonePermission>,
        engines: Arc<dyn KeywordEngineProvider>,
    ) -> Self {
        debug!(engine = engines.name(), "wake-word detector created");
        Self {
            shared: Arc::new(DetectorShared {
                audio,
                permission,
                engines,
                state: Mutex::new(DetectorState {
                    access_key: None,
                    listening: false,
                    sensitivity: crate::settings_store::DEFAULT_SENSITIVITY,
                    debounce: Duration::from_millis(crate::settings_store::DEFAULT_DEBOUNCE_MS),
                    last_wake_at: None,
                    last_wake_timestamp: None,
                }),
                listeners: ListenerRegistry::new("wake_word"),
                origin_instant: Instant::now(),
                origin_wall: Utc::now(),
            }),
        }
    }

    pub async fn initialize(&self, config: DetectorConfig) -> Result<(), ActivationError> {
        if self.lock_state()?.access_key.is_some() {
            debug!("wake-word detector already initialized");
            return Ok(());
        }

        let access_key = config
            .access_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ActivationError::Config("Wake-word access key is missing".to_string()))?;
        let sensitivity = ensure_unit_interval("sensitivity", config.sensitivity)?;

        match self.shared.permission.request_microphone().await {
            PermissionState::Granted => {}
            state => {
                warn!(?state, "microphone permission not granted");
                return Err(ActivationError::PermissionDenied);
            }
        }

        let mut state = self.lock_state()?;
        state.access_key = Some(access_key);
        state.sensitivity = sensitivity;
        state.debounce = Duration::from_millis(config.debounce_ms);
        info!(
            engine = self.shared.engines.name(),
            sensitivity,
            debounce_ms = config.debounce_ms,
            "wake-word detector initialized"
        );
        Ok(())
    }

    /// Opens the listening session. A second call while listening is a logged no-op.
    pub fn start(&self) -> Result<(), ActivationError> {
        match self.try_start() {
            Err(ActivationError::AlreadyListening) => {
                debug!("wake-word detector start ignored; already listening");
                Ok(())
            }
            result => result,
        }
    }

    fn try_start(&self) -> Result<(), ActivationError> {
        let engine_config = {
            let mut state = self.lock_state()?;
            let access_key = state
                .access_key
                .clone()
                .ok_or(ActivationError::NotInitialized)?;
            if state.listening {
                return Err(ActivationError::AlreadyListening);
            }
            // Claimed under the lock so a concurrent start observes AlreadyListening.
            state.listening = true;
            EngineConfig {
                access_key,
                sensitivity: state.sensitivity,
            }
        };

        let opened = self
            .shared
            .engines
            .create(&engine_config)
            .and_then(|engine| {
                let callback = stream_callback(Arc::downgrade(&self.shared), engine);
                self.shared.audio.start_capture(CaptureMode::Stream(callback))
            });

        if let Err(error) = opened {
            if let Ok(mut state) = self.lock_state() {
                state.listening = false;
            }
            warn!(%error, "wake-word detector failed to start listening");
            return Err(error);
        }

        info!(sensitivity = engine_config.sensitivity, "wake-word detector listening");
        Ok(())
    }

    /// Releases the listening session. Safe to call when not listening.
    pub fn stop(&self) {
        let was_listening = match self.lock_state() {
            Ok(mut state) => std::mem::replace(&mut state.listening, false),
            Err(_) => false,
        };
        if !was_listening {
            trace!("wake-word detector stop ignored; not listening");
            return;
        }

        match self.shared.audio.stop_capture() {
            Ok(_) => info!("wake-word detector stopped listening"),
            Err(error) => {
                warn!(%error, "failed to stop listening session; aborting capture");
                if let Err(error) = self.shared.audio.abort_capture() {
                    warn!(%error, "failed to abort listening session");
                }
            }
        }
    }

    /// Validates, stores and, when listening, restarts the engine with the new
    /// value. Listening is briefly interrupted during the restart.
    pub fn update_sensitivity(&self, sensitivity: f32) -> Result<(), ActivationError> {
        if self.set_sensitivity(sensitivity)? {
            self.stop();
            self.start()?;
        }
        Ok(())
    }

    /// Stores the value for the next listening session without touching the
    /// current one. Returns whether a session is open.
    pub fn set_sensitivity(&self, sensitivity: f32) -> Result<bool, ActivationError> {
        let sensitivity = ensure_unit_interval("sensitivity", sensitivity)?;
        let mut state = self.lock_state()?;
        state.sensitivity = sensitivity;
        debug!(sensitivity, listening = state.listening, "wake-word sensitivity stored");
        Ok(state.listening)
    }

    pub fn update_debounce(&self, debounce_ms: u64) -> Result<(), ActivationError> {
        self.lock_state()?.debounce = Duration::from_millis(debounce_ms);
        Ok(())
    }

    pub fn on_wake<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&WakeEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unsubscribe(id)
    }

    /// Applies the debounce rule to an engine match observed at `at` and, when
    /// accepted, notifies every listener before returning the event.
    pub fn report_detection(&self, detection: KeywordDetection, at: Instant) -> Option<WakeEvent> {
        self.shared.report_detection(detection, at)
    }

    pub fn is_listening(&self) -> bool {
        self.lock_state()
            .map(|state| state.listening)
            .unwrap_or(false)
    }

    pub fn status(&self) -> DetectorStatus {
        let listener_count = self.shared.listeners.len();
        match self.lock_state() {
            Ok(state) => DetectorStatus {
                initialized: state.access_key.is_some(),
                listening: state.listening,
                sensitivity: state.sensitivity,
                debounce_ms: state.debounce.as_millis() as u64,
                listener_count,
                last_wake_at: state.last_wake_timestamp,
            },
            Err(_) => DetectorStatus {
                initialized: false,
                listening: false,
                sensitivity: 0.0,
                debounce_ms: 0,
                listener_count,
                last_wake_at: None,
            },
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, DetectorState>, ActivationError> {
        self.shared.lock_state()
    }
}

impl DetectorShared {
    fn lock_state(&self) -> Result<MutexGuard<'_, DetectorState>, ActivationError> {
        self.state
            .lock()
            .map_err(|_| ActivationError::Audio("Wake-word detector lock is poisoned".to_string()))
    }

    fn report_detection(&self, detection: KeywordDetection, at: Instant) -> Option<WakeEvent> {
        let event = {
            let mut state = self.lock_state().ok()?;
            if !state.listening {
                trace!("dropping keyword match; detector not listening");
                return None;
            }

            if let Some(last) = state.last_wake_at {
                let since_last = at.checked_duration_since(last);
                if since_last.map_or(true, |elapsed| elapsed.is_zero() || elapsed < state.debounce)
                {
                    debug!(
                        since_last_ms = since_last.map(|elapsed| elapsed.as_millis() as u64),
                        debounce_ms = state.debounce.as_millis() as u64,
                        "wake event debounced"
                    );
                    return None;
                }
            }

            let offset = at
                .checked_duration_since(self.origin_instant)
                .and_then(|elapsed| chrono::Duration::from_std(elapsed).ok())
                .unwrap_or_else(chrono::Duration::zero);
            let event = WakeEvent {
                keyword_index: detection.keyword_index,
                timestamp: self.origin_wall + offset,
                confidence: detection.confidence.clamp(0.0, 1.0),
            };
            state.last_wake_at = Some(at);
            state.last_wake_timestamp = Some(event.timestamp);
            event
        };

        info!(
            keyword_index = event.keyword_index,
            confidence = event.confidence,
            "wake word detected"
        );
        self.listeners.emit(&event);
        Some(event)
    }
}

/// Re-frames stream chunks to the engine's frame length.
struct EngineFramer {
    engine: Box<dyn KeywordEngine>,
    pending: Vec<i16>,
}

impl EngineFramer {
    fn feed(&mut self, samples: &[i16]) -> Vec<KeywordDetection> {
        let frame_length = self.engine.frame_length();
        if frame_length == 0 {
            return self.engine.process(samples).into_iter().collect();
        }

        self.pending.extend_from_slice(samples);
        let mut detections = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= frame_length {
            if let Some(detection) = self
                .engine
                .process(&self.pending[offset..offset + frame_length])
            {
                detections.push(detection);
            }
            offset += frame_length;
        }
        self.pending.drain(..offset);
        detections
    }
}

fn stream_callback(
    shared: Weak<DetectorShared>,
    engine: Box<dyn KeywordEngine>,
) -> AudioInputChunkCallback {
    let framer = Mutex::new(EngineFramer {
        engine,
        pending: Vec::new(),
    });

    Arc::new(move |chunk: AudioInputChunk| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let detections = match framer.lock() {
            Ok(mut framer) => framer.feed(&chunk.pcm16_mono_samples),
            Err(_) => return,
        };
        for detection in detections {
            shared.report_detection(detection, Instant::now());
        }
    })
}
