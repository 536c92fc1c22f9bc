//! Voice activation controller.
//!
//! Sequences `Armed -> WakeProcessing -> [Verifying] -> Confirming ->
//! {Firing | Cancelled} -> Armed` and owns pause/resume across app lifecycle
//! transitions. The controller is the only writer of [`PipelineState`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{
    config::{read_non_empty_env, read_u64_env},
    error::{ensure_unit_interval, ActivationError},
    listener_registry::{ListenerId, ListenerRegistry},
    settings_store::SettingsStore,
    speaker_verification::{
        ProgressCallback, QuickVerifyOptions, SpeakerVerifier, VerificationPhase,
        VerificationResult,
    },
    wake_word::{DetectorConfig, WakeEvent, WakeWordDetector},
};

const DEFAULT_VOICE_ALERT_ROLE: &str = "user";
const DEFAULT_VERIFICATION_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_ALERT_SOURCE: &str = "wake_word";
const REARM_RETRY_DELAY_MS: u64 = 500;
const MAX_REARM_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    Skip,
    Required,
}

/// What `initialize` does when no enabled preference was ever saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoArmPolicy {
    ArmWhenUnset,
    IdleWhenUnset,
}

impl AutoArmPolicy {
    fn arms(self) -> bool {
        matches!(self, Self::ArmWhenUnset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub access_key: Option<String>,
    pub voice_alert_role: String,
    pub verification_policy: VerificationPolicy,
    pub verification_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    pub auto_arm_policy: AutoArmPolicy,
    pub alert_source: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            voice_alert_role: DEFAULT_VOICE_ALERT_ROLE.to_string(),
            verification_policy: VerificationPolicy::Skip,
            verification_timeout_ms: DEFAULT_VERIFICATION_TIMEOUT_MS,
            confirmation_timeout_ms: DEFAULT_CONFIRMATION_TIMEOUT_MS,
            auto_arm_policy: AutoArmPolicy::ArmWhenUnset,
            alert_source: DEFAULT_ALERT_SOURCE.to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.access_key = read_non_empty_env("WAKE_WORD_ACCESS_KEY");

        if let Some(role) = read_non_empty_env("VOICE_ALERT_ROLE") {
            config.voice_alert_role = role;
        }

        if let Some(policy) = read_non_empty_env("VOICE_VERIFICATION_POLICY") {
            match policy.to_ascii_lowercase().as_str() {
                "skip" => config.verification_policy = VerificationPolicy::Skip,
                "required" => config.verification_policy = VerificationPolicy::Required,
                _ => warn!(value = %policy, "ignoring unknown VOICE_VERIFICATION_POLICY"),
            }
        }

        if let Some(policy) = read_non_empty_env("VOICE_AUTO_ARM") {
            match policy.to_ascii_lowercase().as_str() {
                "arm_when_unset" => config.auto_arm_policy = AutoArmPolicy::ArmWhenUnset,
                "idle_when_unset" => config.auto_arm_policy = AutoArmPolicy::IdleWhenUnset,
                _ => warn!(value = %policy, "ignoring unknown VOICE_AUTO_ARM"),
            }
        }

        if let Some(timeout_ms) = read_u64_env("VOICE_VERIFICATION_TIMEOUT_MS") {
            config.verification_timeout_ms = timeout_ms.max(1);
        }

        if let Some(timeout_ms) = read_u64_env("VOICE_CONFIRMATION_TIMEOUT_MS") {
            config.confirmation_timeout_ms = timeout_ms.max(1);
        }

        if let Some(source) = read_non_empty_env("VOICE_ALERT_SOURCE") {
            config.alert_source = source;
        }

        debug!(
            has_access_key = config.access_key.is_some(),
            voice_alert_role = %config.voice_alert_role,
            verification_policy = ?config.verification_policy,
            auto_arm_policy = ?config.auto_arm_policy,
            verification_timeout_ms = config.verification_timeout_ms,
            confirmation_timeout_ms = config.confirmation_timeout_ms,
            "loaded controller config"
        );
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub role: String,
}

/// `Idle` covers both "not yet initialized" and "disabled by the user".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Armed,
    WakeProcessing,
    Verifying,
    Confirming,
    Firing,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycleState {
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorStage {
    WakeProcessing,
    Verification,
    AlertTrigger,
    Rearm,
    Lifecycle,
}

impl PipelineErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WakeProcessing => "wake_processing",
            Self::Verification => "verification",
            Self::AlertTrigger => "alert_trigger",
            Self::Rearm => "rearm",
            Self::Lifecycle => "lifecycle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineError {
    pub stage: PipelineErrorStage,
    pub message: String,
}

impl PipelineError {
    fn new(stage: PipelineErrorStage, message: impl fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertData {
    pub triggered_by: String,
    pub verification_score: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmModalData {
    pub verification_score: Option<f32>,
    pub threshold: Option<f32>,
    /// The confirmation surface auto-cancels after this long.
    pub expires_in_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Declined,
    Backgrounded,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    WakeDetected(WakeEvent),
    VerificationProgress {
        phase: VerificationPhase,
    },
    VerificationCompleted(VerificationResult),
    ConfirmModalShown(ConfirmModalData),
    ConfirmModalHidden,
    AlertTriggered(AlertData),
    AlertCancelled {
        reason: CancelReason,
    },
    ListeningChanged {
        listening: bool,
    },
    EnrollmentRequested,
    Error(PipelineError),
}

/// Host collaborators: alert sink, confirmation UI and navigation.
#[async_trait]
pub trait PipelineDelegate: Send + Sync {
    async fn on_alert_triggered(&self, alert: &AlertData) -> Result<(), String>;
    fn on_confirm_modal_show(&self, modal: &ConfirmModalData);
    fn on_confirm_modal_hide(&self);

    /// Immediate haptic or visual acknowledgment of a wake event.
    fn on_wake_acknowledged(&self, _event: &WakeEvent) {}

    fn on_enrollment_requested(&self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub state: PipelineState,
    pub initialized: bool,
    pub enabled: bool,
    pub listening: bool,
    pub recording: bool,
    pub foreground: bool,
    pub resume_pending: bool,
    pub sensitivity: Option<f32>,
    pub device_id: Option<String>,
    pub confirmation_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingConfirmation {
    generation: u64,
    verification_score: Option<f32>,
}

struct ControllerState {
    state: PipelineState,
    initialized: bool,
    enabled: bool,
    foreground: bool,
    resume_pending: bool,
    /// Bumped by stop, background and re-enroll; cycles holding an older value are stale.
    generation: u64,
    pending_confirmation: Option<PendingConfirmation>,
    delegate: Option<Arc<dyn PipelineDelegate>>,
    wake_listener: Option<ListenerId>,
    runtime: Option<Handle>,
}

impl ControllerState {
    fn transition(&mut self, next: PipelineState) -> Option<PipelineEvent> {
        let from = self.state;
        if from == next {
            return None;
        }
        self.state = next;
        info!(from = ?from, to = ?next, "pipeline state changed");
        Some(PipelineEvent::StateChanged { from, to: next })
    }
}

struct ControllerInner {
    detector: WakeWordDetector,
    verifier: SpeakerVerifier,
    settings: Arc<SettingsStore>,
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    processing: AtomicBool,
    events: ListenerRegistry<PipelineEvent>,
}

#[derive(Clone)]
pub struct VoiceActivationController {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for VoiceActivationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceActivationController")
            .field("status", &self.status())
            .finish()
    }
}

impl VoiceActivationController {
    pub fn new(
        detector: WakeWordDetector,
        verifier: SpeakerVerifier,
        settings: Arc<SettingsStore>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                detector,
                verifier,
                settings,
                config,
                state: Mutex::new(ControllerState {
                    state: PipelineState::Idle,
                    initialized: false,
                    enabled: false,
                    foreground: true,
                    resume_pending: false,
                    generation: 0,
                    pending_confirmation: None,
                    delegate: None,
                    wake_listener: None,
                    runtime: None,
                }),
                processing: AtomicBool::new(false),
                events: ListenerRegistry::new("pipeline"),
            }),
        }
    }

    /// Returns `Ok(false)` when `user` is not entitled to voice alerts; the
    /// detector is never touched in that case. Component initialization
    /// failures are returned to the caller.
    pub async fn initialize(
        &self,
        user: &User,
        delegate: Arc<dyn PipelineDelegate>,
    ) -> Result<bool, ActivationError> {
        let inner = &self.inner;
        if user.role != inner.config.voice_alert_role {
            info!(
                user_id = %user.id,
                role = %user.role,
                required_role = %inner.config.voice_alert_role,
                "voice activation unavailable for user role"
            );
            return Ok(false);
        }

        if inner.lock_state()?.initialized {
            debug!("voice activation controller already initialized");
            return Ok(true);
        }

        let runtime = Handle::try_current().map_err(|_| {
            ActivationError::Config("Voice activation requires a Tokio runtime".to_string())
        })?;
        let settings = inner.settings.load()?;

        inner
            .detector
            .initialize(DetectorConfig {
                access_key: inner.config.access_key.clone(),
                sensitivity: settings.sensitivity,
                debounce_ms: settings.debounce_ms,
            })
            .await?;
        inner.verifier.initialize()?;

        let weak = Arc::downgrade(inner);
        let wake_listener = inner.detector.on_wake(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_wake(event.clone());
            }
        });

        let should_arm = settings
            .enabled
            .unwrap_or_else(|| inner.config.auto_arm_policy.arms())
            || settings.was_listening;

        // The controller only counts as initialized once arming succeeded, so
        // a failed attempt can be retried from scratch.
        let armed = inner.lock_state().and_then(|mut state| {
            state.runtime = Some(runtime);
            let armed = if should_arm {
                inner.arm_locked(&mut state)
            } else {
                Ok(Vec::new())
            };
            if armed.is_ok() {
                state.initialized = true;
                state.enabled = should_arm;
                state.delegate = Some(delegate);
                state.wake_listener = Some(wake_listener);
            }
            armed
        });
        let events = match armed {
            Ok(events) => events,
            Err(error) => {
                inner.detector.remove_listener(wake_listener);
                warn!(%error, "voice activation controller failed to arm");
                return Err(error);
            }
        };

        if settings.was_listening {
            inner.persist_was_listening(false);
        }

        info!(
            user_id = %user.id,
            enabled = ?settings.enabled,
            armed = should_arm,
            verification_policy = ?inner.config.verification_policy,
            "voice activation controller initialized"
        );
        inner.publish_all(events);
        Ok(true)
    }

    /// Arms the pipeline and persists the enabled preference.
    pub fn start(&self) -> Result<(), ActivationError> {
        let inner = &self.inner;
        let events = {
            let mut state = inner.lock_state()?;
            if !state.initialized {
                return Err(ActivationError::NotInitialized);
            }
            if state.enabled && state.state != PipelineState::Idle {
                // `Armed` in the foreground without a session means re-arming gave up.
                let stalled = state.state == PipelineState::Armed
                    && state.foreground
                    && !inner.detector.is_listening();
                if !stalled {
                    debug!(state = ?state.state, "voice activation already enabled");
                    return Ok(());
                }
                info!("re-opening listening session for armed pipeline");
            }
            state.enabled = true;
            state.generation += 1;
            inner.arm_locked(&mut state)?
        };

        inner.settings.set_enabled(true)?;
        info!("voice activation enabled");
        inner.publish_all(events);
        Ok(())
    }

    /// Disarms the pipeline, abandoning any in-flight cycle, and persists the
    /// disabled preference.
    pub fn stop(&self) -> Result<(), ActivationError> {
        let inner = &self.inner;
        let (mut events, was_confirming) = {
            let mut state = inner.lock_state()?;
            if !state.initialized {
                return Err(ActivationError::NotInitialized);
            }
            state.enabled = false;
            state.resume_pending = false;
            state.generation += 1;
            let was_confirming = state.pending_confirmation.take().is_some();
            (
                state
                    .transition(PipelineState::Idle)
                    .into_iter()
                    .collect::<Vec<_>>(),
                was_confirming,
            )
        };

        inner.release_audio(&mut events);
        if was_confirming {
            inner.hide_confirmation(&mut events, CancelReason::Stopped);
        }

        inner.settings.set_enabled(false)?;
        info!("voice activation disabled");
        inner.publish_all(events);
        Ok(())
    }

    /// Resolves the confirmation surface. Ignored unless the pipeline is
    /// waiting for a confirmation.
    pub async fn confirmation_result(&self, confirmed: bool) {
        self.inner.resolve_confirmation(confirmed).await;
    }

    pub fn handle_app_state_change(&self, lifecycle: AppLifecycleState) {
        match lifecycle {
            AppLifecycleState::Background => self.inner.enter_background(),
            AppLifecycleState::Foreground => self.inner.enter_foreground(),
        }
    }

    /// Persists first, then applies the value to the detector. A live session
    /// is restarted only while the pipeline sits idle in `Armed`; otherwise
    /// the value takes effect at the next arm.
    pub fn update_sensitivity(&self, sensitivity: f32) -> Result<(), ActivationError> {
        let inner = &self.inner;
        let sensitivity = ensure_unit_interval("sensitivity", sensitivity)?;
        inner.settings.set_sensitivity(sensitivity)?;

        // Holding `processing` keeps wake cycles out while the engine restarts.
        let restart = {
            let state = inner.lock_state()?;
            state.state == PipelineState::Armed
                && state.foreground
                && !inner.processing.swap(true, Ordering::AcqRel)
        };
        if !restart {
            inner.detector.set_sensitivity(sensitivity)?;
            info!(sensitivity, "wake sensitivity stored for next listening session");
            return Ok(());
        }

        let restarted = inner.detector.update_sensitivity(sensitivity);
        inner.processing.store(false, Ordering::Release);
        restarted?;
        info!(sensitivity, "wake sensitivity updated");
        Ok(())
    }

    /// Persists the debounce window, then applies it to the detector.
    pub fn update_debounce(&self, debounce_ms: u64) -> Result<(), ActivationError> {
        self.inner.settings.set_debounce_ms(debounce_ms)?;
        self.inner.detector.update_debounce(debounce_ms)?;
        info!(debounce_ms, "wake debounce updated");
        Ok(())
    }

    /// Stops listening and asks the host to open the enrollment flow. The
    /// persisted enabled preference is left untouched.
    pub fn re_enroll(&self) -> Result<(), ActivationError> {
        let inner = &self.inner;
        let (mut events, was_confirming, delegate) = {
            let mut state = inner.lock_state()?;
            if !state.initialized {
                return Err(ActivationError::NotInitialized);
            }
            state.enabled = false;
            state.resume_pending = false;
            state.generation += 1;
            let was_confirming = state.pending_confirmation.take().is_some();
            (
                state
                    .transition(PipelineState::Idle)
                    .into_iter()
                    .collect::<Vec<_>>(),
                was_confirming,
                state.delegate.clone(),
            )
        };

        inner.release_audio(&mut events);
        if was_confirming {
            inner.hide_confirmation(&mut events, CancelReason::Stopped);
        }
        if let Some(delegate) = delegate {
            delegate.on_enrollment_requested();
        }
        events.push(PipelineEvent::EnrollmentRequested);
        info!("speaker re-enrollment requested");
        inner.publish_all(events);
        Ok(())
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn state(&self) -> PipelineState {
        self.inner
            .lock_state()
            .map(|state| state.state)
            .unwrap_or(PipelineState::Idle)
    }

    pub fn detector(&self) -> &WakeWordDetector {
        &self.inner.detector
    }

    pub fn status(&self) -> ControllerStatus {
        let inner = &self.inner;
        let settings = inner.settings.current().ok();
        let (state, initialized, enabled, foreground, resume_pending) = inner
            .lock_state()
            .map(|state| {
                (
                    state.state,
                    state.initialized,
                    state.enabled,
                    state.foreground,
                    state.resume_pending,
                )
            })
            .unwrap_or((PipelineState::Idle, false, false, true, false));

        ControllerStatus {
            state,
            initialized,
            enabled,
            listening: inner.detector.is_listening(),
            recording: inner.verifier.is_recording(),
            foreground,
            resume_pending,
            sensitivity: settings.as_ref().map(|settings| settings.sensitivity),
            device_id: settings.map(|settings| settings.device_id),
            confirmation_timeout_ms: inner.config.confirmation_timeout_ms,
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        let listener = self
            .state
            .get_mut()
            .ok()
            .and_then(|state| state.wake_listener.take());
        if let Some(id) = listener {
            self.detector.remove_listener(id);
        }
    }
}

impl ControllerInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, ControllerState>, ActivationError> {
        self.state
            .lock()
            .map_err(|_| ActivationError::Config("Controller state lock is poisoned".to_string()))
    }

    fn publish(&self, event: PipelineEvent) {
        self.events.emit(&event);
    }

    fn publish_all(&self, events: Vec<PipelineEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    fn publish_error(&self, error: PipelineError) {
        warn!(stage = error.stage.as_str(), message = %error.message, "voice activation cycle error");
        self.publish(PipelineEvent::Error(error));
    }

    fn delegate(&self) -> Option<Arc<dyn PipelineDelegate>> {
        self.lock_state()
            .ok()
            .and_then(|state| state.delegate.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_state()
            .map(|state| state.generation == generation)
            .unwrap_or(false)
    }

    /// Starts listening (when foregrounded) and moves to `Armed`. Must be
    /// called with the state lock held so start and the state change are atomic.
    fn arm_locked(
        &self,
        state: &mut ControllerState,
    ) -> Result<Vec<PipelineEvent>, ActivationError> {
        if !state.foreground {
            state.resume_pending = true;
            self.processing.store(false, Ordering::Release);
            debug!("arming deferred until foreground");
            return Ok(state.transition(PipelineState::Armed).into_iter().collect());
        }

        self.detector.start()?;
        let mut events: Vec<_> = state.transition(PipelineState::Armed).into_iter().collect();
        events.push(PipelineEvent::ListeningChanged { listening: true });
        self.processing.store(false, Ordering::Release);
        Ok(events)
    }

    /// Closes any recording or listening session. Never called with the state
    /// lock held: stopping a capture waits for its audio callback to finish.
    fn release_audio(&self, events: &mut Vec<PipelineEvent>) {
        self.processing.store(false, Ordering::Release);
        let was_listening = self.detector.is_listening();
        self.verifier.cancel();
        self.detector.stop();
        if was_listening {
            events.push(PipelineEvent::ListeningChanged { listening: false });
        }
    }

    fn hide_confirmation(&self, events: &mut Vec<PipelineEvent>, reason: CancelReason) {
        if let Some(delegate) = self.delegate() {
            delegate.on_confirm_modal_hide();
        }
        events.push(PipelineEvent::ConfirmModalHidden);
        events.push(PipelineEvent::AlertCancelled { reason });
    }

    fn persist_was_listening(&self, was_listening: bool) {
        if let Err(error) = self.settings.set_was_listening(was_listening) {
            self.publish_error(PipelineError::new(PipelineErrorStage::Lifecycle, error));
        }
    }

    /// Detector listener. Runs on the audio thread, so the cycle itself is
    /// moved onto the runtime.
    fn handle_wake(self: &Arc<Self>, event: WakeEvent) {
        if self.processing.swap(true, Ordering::AcqRel) {
            debug!("wake event dropped; a cycle is already in progress");
            return;
        }

        let started = match self.lock_state() {
            Ok(mut state)
                if state.initialized
                    && state.foreground
                    && state.state == PipelineState::Armed =>
            {
                match state.runtime.clone() {
                    Some(runtime) => {
                        let change = state.transition(PipelineState::WakeProcessing);
                        Some((runtime, state.generation, change))
                    }
                    None => None,
                }
            }
            _ => None,
        };

        let Some((runtime, generation, change)) = started else {
            self.processing.store(false, Ordering::Release);
            debug!("wake event ignored; pipeline not armed");
            return;
        };

        self.publish_all(change.into_iter().collect());
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(error) = inner.process_wake(&event, generation).await {
                inner.publish_error(error);
                inner.rearm(generation, 0);
            }
        });
    }

    async fn process_wake(
        self: &Arc<Self>,
        event: &WakeEvent,
        generation: u64,
    ) -> Result<(), PipelineError> {
        if !self.is_current(generation) {
            return Ok(());
        }

        if let Some(delegate) = self.delegate() {
            delegate.on_wake_acknowledged(event);
        }
        self.publish(PipelineEvent::WakeDetected(event.clone()));

        // Listening must close before a verification clip can open.
        self.detector.stop();
        self.publish(PipelineEvent::ListeningChanged { listening: false });

        let verification = match self.config.verification_policy {
            VerificationPolicy::Skip => {
                debug!("speaker verification skipped by policy");
                None
            }
            VerificationPolicy::Required => match self.verify_speaker(generation).await? {
                Some(result) => Some(result),
                None => return Ok(()),
            },
        };

        // Verification is advisory: a mismatch or failure still asks the user.
        let verified = verification.filter(|result| result.success);
        let modal = ConfirmModalData {
            verification_score: verified.as_ref().map(|result| result.score),
            threshold: verified.as_ref().map(|result| result.threshold),
            expires_in_ms: self.config.confirmation_timeout_ms,
        };

        let (change, delegate) = {
            let mut state = self
                .lock_state()
                .map_err(|error| PipelineError::new(PipelineErrorStage::WakeProcessing, error))?;
            if state.generation != generation {
                debug!("discarding stale cycle before confirmation");
                return Ok(());
            }
            state.pending_confirmation = Some(PendingConfirmation {
                generation,
                verification_score: modal.verification_score,
            });
            (
                state.transition(PipelineState::Confirming),
                state.delegate.clone(),
            )
        };

        self.publish_all(change.into_iter().collect());
        if let Some(delegate) = delegate {
            delegate.on_confirm_modal_show(&modal);
        }
        self.publish(PipelineEvent::ConfirmModalShown(modal));
        Ok(())
    }

    /// Returns `None` when the cycle went stale while verifying.
    async fn verify_speaker(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<Option<VerificationResult>, PipelineError> {
        let (change, device_id) = {
            let mut state = self
                .lock_state()
                .map_err(|error| PipelineError::new(PipelineErrorStage::Verification, error))?;
            if state.generation != generation {
                return Ok(None);
            }
            let device_id = self
                .settings
                .current()
                .map(|settings| settings.device_id)
                .map_err(|error| PipelineError::new(PipelineErrorStage::Verification, error))?;
            (state.transition(PipelineState::Verifying), device_id)
        };
        self.publish_all(change.into_iter().collect());

        let progress_sink = Arc::downgrade(self);
        let on_progress: ProgressCallback = Arc::new(move |phase: VerificationPhase| {
            if let Some(inner) = progress_sink.upgrade() {
                inner.publish(PipelineEvent::VerificationProgress { phase });
            }
        });
        let result = self
            .verifier
            .quick_verify(QuickVerifyOptions {
                timeout_ms: self.config.verification_timeout_ms,
                device_id,
                on_progress: Some(on_progress),
            })
            .await;

        if !self.is_current(generation) {
            debug!("discarding verification result from stale cycle");
            return Ok(None);
        }
        self.publish(PipelineEvent::VerificationCompleted(result.clone()));
        Ok(Some(result))
    }

    async fn resolve_confirmation(self: &Arc<Self>, confirmed: bool) {
        let pending = match self.lock_state() {
            Ok(mut state) if state.state == PipelineState::Confirming => {
                state.pending_confirmation.take()
            }
            Ok(state) => {
                debug!(state = ?state.state, "confirmation result ignored; nothing to confirm");
                None
            }
            Err(_) => None,
        };
        let Some(pending) = pending else {
            return;
        };

        let delegate = self.delegate();
        if let Some(delegate) = delegate.as_ref() {
            delegate.on_confirm_modal_hide();
        }
        self.publish(PipelineEvent::ConfirmModalHidden);

        let next = if confirmed {
            PipelineState::Firing
        } else {
            PipelineState::Cancelled
        };
        let change = match self.lock_state() {
            Ok(mut state) if state.generation == pending.generation => state.transition(next),
            _ => {
                debug!("confirmation belongs to a stale cycle");
                return;
            }
        };
        self.publish_all(change.into_iter().collect());

        if confirmed {
            let alert = AlertData {
                triggered_by: "voice".to_string(),
                verification_score: pending.verification_score,
                timestamp: Utc::now(),
                source: self.config.alert_source.clone(),
            };
            let outcome = match delegate {
                Some(delegate) => delegate.on_alert_triggered(&alert).await,
                None => Err("No alert sink registered".to_string()),
            };
            match outcome {
                Ok(()) => {
                    info!(
                        verification_score = ?alert.verification_score,
                        source = %alert.source,
                        "voice alert triggered"
                    );
                    self.publish(PipelineEvent::AlertTriggered(alert));
                }
                Err(message) => {
                    self.publish_error(PipelineError::new(PipelineErrorStage::AlertTrigger, message));
                }
            }
        } else {
            info!("voice alert cancelled by user");
            self.publish(PipelineEvent::AlertCancelled {
                reason: CancelReason::Declined,
            });
        }

        self.rearm(pending.generation, 0);
    }

    /// Returns a finished (or failed) cycle to `Armed`. Listening failures are
    /// retried a few times before settling in `Armed` without a session.
    fn rearm(self: &Arc<Self>, generation: u64, attempt: u32) {
        let outcome = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if state.generation != generation {
                debug!("skipping re-arm for stale cycle");
                return;
            }
            match self.arm_locked(&mut state) {
                Ok(events) => Ok(events),
                Err(error) if attempt + 1 < MAX_REARM_ATTEMPTS => {
                    Err((error, state.runtime.clone()))
                }
                Err(error) => {
                    self.processing.store(false, Ordering::Release);
                    let mut events = vec![PipelineEvent::Error(PipelineError::new(
                        PipelineErrorStage::Rearm,
                        &error,
                    ))];
                    events.extend(state.transition(PipelineState::Armed));
                    warn!(%error, attempts = attempt + 1, "giving up re-arming listener");
                    Ok(events)
                }
            }
        };

        match outcome {
            Ok(events) => self.publish_all(events),
            Err((error, runtime)) => {
                self.publish_error(PipelineError::new(PipelineErrorStage::Rearm, error));
                let Some(runtime) = runtime else {
                    return;
                };
                let inner = Arc::clone(self);
                runtime.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(REARM_RETRY_DELAY_MS)).await;
                    inner.rearm(generation, attempt + 1);
                });
            }
        }
    }

    fn enter_background(&self) {
        let (mut events, was_confirming, resume_pending) = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if !state.foreground {
                return;
            }
            state.foreground = false;
            if !state.initialized {
                return;
            }

            state.generation += 1;
            let was_confirming = state.pending_confirmation.take().is_some();
            let mut events = Vec::new();
            if state.state != PipelineState::Idle {
                state.resume_pending = true;
                events.extend(state.transition(PipelineState::Armed));
            }
            (events, was_confirming, state.resume_pending)
        };

        self.release_audio(&mut events);
        if was_confirming {
            self.hide_confirmation(&mut events, CancelReason::Backgrounded);
        }
        self.persist_was_listening(resume_pending);
        info!(resume_pending, "voice activation paused for background");
        self.publish_all(events);
    }

    fn enter_foreground(&self) {
        let events = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if state.foreground {
                return;
            }
            state.foreground = true;
            if !state.initialized || !state.resume_pending {
                return;
            }
            state.resume_pending = false;

            match self.arm_locked(&mut state) {
                Ok(events) => events,
                Err(error) => {
                    vec![PipelineEvent::Error(PipelineError::new(
                        PipelineErrorStage::Lifecycle,
                        error,
                    ))]
                }
            }
        };

        self.persist_was_listening(false);
        info!("voice activation resumed for foreground");
        self.publish_all(events);
    }
}
