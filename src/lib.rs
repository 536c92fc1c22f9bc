pub mod audio_capture_service;
pub mod config;
pub mod error;
pub mod listener_registry;
pub mod logging;
pub mod permission_service;
pub mod settings_store;
pub mod speaker_verification;
pub mod voice_pipeline;
pub mod wake_word;

#[cfg(test)]
mod test_support;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

pub use audio_capture_service::{AudioSource, CpalAudioSource};
pub use config::ActivationConfig;
pub use error::ActivationError;
pub use permission_service::{MicrophonePermission, PermissionState, StaticPermission};
pub use settings_store::{PipelineSettings, SettingsStore};
pub use speaker_verification::{
    http_client::{HttpVerificationClient, VerificationClient},
    SpeakerVerifier, VerificationResult,
};
pub use voice_pipeline::{
    AlertData, AppLifecycleState, ConfirmModalData, PipelineDelegate, PipelineEvent,
    PipelineState, User, VoiceActivationController,
};
pub use wake_word::{EnergyEngineProvider, KeywordEngineProvider, WakeEvent, WakeWordDetector};

/// Wires the cpal microphone, HTTP verification client and file-backed
/// settings into a controller. Permission and the keyword engine are host
/// specific and passed in.
pub fn build_controller(
    config: ActivationConfig,
    permission: Arc<dyn MicrophonePermission>,
    engines: Arc<dyn KeywordEngineProvider>,
) -> Result<VoiceActivationController, ActivationError> {
    let audio: Arc<dyn AudioSource> = Arc::new(CpalAudioSource::new());
    let client = HttpVerificationClient::new(config.verification_client)?;
    let settings = Arc::new(SettingsStore::in_data_dir(&config.data_dir));

    let detector = WakeWordDetector::new(Arc::clone(&audio), permission, engines);
    let verifier = SpeakerVerifier::new(audio, Arc::new(client), config.verifier);
    info!(data_dir = %config.data_dir.display(), "voice activation services constructed");

    Ok(VoiceActivationController::new(
        detector,
        verifier,
        settings,
        config.controller,
    ))
}

#[derive(Debug, Default)]
struct ConsoleDelegate;

#[async_trait]
impl PipelineDelegate for ConsoleDelegate {
    async fn on_alert_triggered(&self, alert: &AlertData) -> Result<(), String> {
        let payload = serde_json::to_string(alert).map_err(|error| error.to_string())?;
        println!("ALERT {payload}");
        Ok(())
    }

    fn on_confirm_modal_show(&self, modal: &ConfirmModalData) {
        println!(
            "Send emergency alert? [y/n] (auto-cancels in {}s)",
            modal.expires_in_ms / 1_000
        );
    }

    fn on_confirm_modal_hide(&self) {}

    fn on_enrollment_requested(&self) {
        println!("Enrollment requested; restart listening with `start` when done.");
    }
}

/// Tracks which confirmation is on screen so an expiry timer only declines
/// the confirmation it was started for.
#[derive(Debug, Default)]
struct ConfirmationExpiry {
    epoch: AtomicU64,
}

impl ConfirmationExpiry {
    fn shown(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn hidden(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn is_current(&self, ticket: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == ticket
    }
}

const CONSOLE_LOG_TAIL_LINES: usize = 40;

/// Console host: listens with the energy engine and reads confirmations and
/// lifecycle commands from stdin.
pub fn run() {
    let config = ActivationConfig::from_env();
    let log_files = match logging::initialize(&config.data_dir) {
        Ok(files) => Some(files),
        Err(error) => {
            eprintln!("{error}");
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Failed to start async runtime: {error}");
            return;
        }
    };

    if let Err(error) = runtime.block_on(run_console(config, log_files)) {
        eprintln!("Voice activation stopped: {error}");
    }
}

async fn run_console(
    config: ActivationConfig,
    log_files: Option<logging::LogFiles>,
) -> Result<(), ActivationError> {
    let user = User {
        id: "local".to_string(),
        role: config.controller.voice_alert_role.clone(),
    };
    let controller = build_controller(
        config,
        Arc::new(StaticPermission::granted()),
        Arc::new(EnergyEngineProvider),
    )?;

    let expiry_controller = controller.clone();
    let expiry = Arc::new(ConfirmationExpiry::default());
    let runtime = tokio::runtime::Handle::current();
    controller.subscribe(move |event| {
        if let Ok(payload) = serde_json::to_string(event) {
            info!(event = %payload, "pipeline event");
        }
        match event {
            PipelineEvent::ConfirmModalShown(modal) => {
                let ticket = expiry.shown();
                let expiry = Arc::clone(&expiry);
                let controller = expiry_controller.clone();
                let expires_in = Duration::from_millis(modal.expires_in_ms);
                runtime.spawn(async move {
                    tokio::time::sleep(expires_in).await;
                    if expiry.is_current(ticket) {
                        info!("confirmation expired; declining");
                        controller.confirmation_result(false).await;
                    }
                });
            }
            PipelineEvent::ConfirmModalHidden => expiry.hidden(),
            _ => {}
        }
    });

    if !controller
        .initialize(&user, Arc::new(ConsoleDelegate))
        .await?
    {
        println!("Voice activation is not available for this account.");
        return Ok(());
    }
    println!(
        "Commands: y, n, start, stop, bg, fg, enroll, sensitivity <0-1>, debounce <ms>, status, logs, quit"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "failed to read console input");
                break;
            }
        };

        let mut parts = line.split_whitespace();
        let result = match parts.next() {
            Some("y") => {
                controller.confirmation_result(true).await;
                Ok(())
            }
            Some("n") => {
                controller.confirmation_result(false).await;
                Ok(())
            }
            Some("start") => controller.start(),
            Some("stop") => controller.stop(),
            Some("bg") => {
                controller.handle_app_state_change(AppLifecycleState::Background);
                Ok(())
            }
            Some("fg") => {
                controller.handle_app_state_change(AppLifecycleState::Foreground);
                Ok(())
            }
            Some("enroll") => controller.re_enroll(),
            Some("sensitivity") => match parts.next().map(str::parse::<f32>) {
                Some(Ok(value)) => controller.update_sensitivity(value),
                _ => Err(ActivationError::Config(
                    "usage: sensitivity <0-1>".to_string(),
                )),
            },
            Some("debounce") => match parts.next().map(str::parse::<u64>) {
                Some(Ok(value)) => controller.update_debounce(value),
                _ => Err(ActivationError::Config("usage: debounce <ms>".to_string())),
            },
            Some("logs") => {
                match log_files.as_ref().map(|files| files.tail(CONSOLE_LOG_TAIL_LINES)) {
                    Some(Ok(lines)) => lines.iter().for_each(|line| println!("{line}")),
                    Some(Err(error)) => warn!(%error, "failed to read log files"),
                    None => println!("File logging is not active."),
                }
                Ok(())
            }
            Some("status") => {
                match serde_json::to_string_pretty(&controller.status()) {
                    Ok(status) => println!("{status}"),
                    Err(error) => warn!(%error, "failed to render status"),
                }
                Ok(())
            }
            Some("quit") => break,
            Some(other) => {
                println!("Unknown command `{other}`");
                Ok(())
            }
            None => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(error) if error.is_soft() => {
                debug!(kind = error.kind(), %error, "console command had no effect");
            }
            Err(error) => {
                warn!(kind = error.kind(), %error, "console command failed");
                println!("{error}");
            }
        }
    }

    if let Err(error) = controller.stop() {
        warn!(%error, "failed to stop voice activation on exit");
    }
    Ok(())
}
