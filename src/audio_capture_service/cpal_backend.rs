use std::{
    fmt,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig, StreamError,
};
use tracing::{debug, error, info, warn};

use super::{
    float_to_pcm16, AudioInputChunk, AudioInputChunkCallback, AudioSessionOptions, AudioSource,
    CaptureMode, LinearResampler, RecordedAudio, TARGET_SAMPLE_RATE_HZ,
};
use crate::error::ActivationError;

const WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct CaptureControl {
    stop_tx: Sender<()>,
    join_handle: JoinHandle<()>,
    samples: Arc<Mutex<Vec<i16>>>,
    mode_label: &'static str,
    started_at: Instant,
    device_name: String,
}

/// cpal-backed microphone. Streams are not `Send`, so each capture owns a
/// dedicated worker thread that builds, plays and finally drops its stream.
pub struct CpalAudioSource {
    capture: Mutex<Option<CaptureControl>>,
    session: Mutex<AudioSessionOptions>,
}

impl fmt::Debug for CpalAudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalAudioSource")
            .field("capturing", &self.is_capturing())
            .finish_non_exhaustive()
    }
}

impl Default for CpalAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalAudioSource {
    pub fn new() -> Self {
        debug!("cpal audio source initialized");
        Self {
            capture: Mutex::new(None),
            session: Mutex::new(AudioSessionOptions::default()),
        }
    }

    fn take_capture(&self) -> Result<Option<CaptureControl>, ActivationError> {
        self.capture
            .lock()
            .map(|mut guard| guard.take())
            .map_err(|_| capture_lock_error())
    }
}

impl AudioSource for CpalAudioSource {
    fn configure_session(&self, options: AudioSessionOptions) -> Result<(), ActivationError> {
        if options.sample_rate_hz != TARGET_SAMPLE_RATE_HZ || options.channels != 1 {
            return Err(ActivationError::Config(format!(
                "Unsupported capture format {} Hz / {} channel(s)",
                options.sample_rate_hz, options.channels
            )));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| ActivationError::Audio("Audio session lock is poisoned".to_string()))?;
        *session = options;
        debug!(
            allow_recording_in_silent_mode = options.allow_recording_in_silent_mode,
            "audio session configured"
        );
        Ok(())
    }

    fn start_capture(&self, mode: CaptureMode) -> Result<(), ActivationError> {
        let mut capture_guard = self.capture.lock().map_err(|_| capture_lock_error())?;
        if capture_guard.is_some() {
            warn!(mode = mode.label(), "capture requested while microphone is busy");
            return Err(ActivationError::RecordingConflict);
        }

        let mode_label = mode.label();
        let samples = Arc::new(Mutex::new(Vec::<i16>::new()));
        let sink = match mode {
            CaptureMode::Stream(callback) => CaptureSink::Stream(callback),
            CaptureMode::Clip => CaptureSink::Clip(Arc::clone(&samples)),
        };

        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let mut join_handle = Some(thread::spawn(move || {
            capture_thread_main(sink, ready_tx, stop_rx);
        }));

        let device_name =
            await_worker_startup(&ready_rx, &stop_tx, &mut join_handle, WORKER_STARTUP_TIMEOUT)
                .map_err(ActivationError::Audio)?;
        let join_handle = join_handle
            .ok_or_else(|| ActivationError::Audio("Microphone worker was unavailable".to_string()))?;

        info!(mode = mode_label, device_name = %device_name, "audio capture started");
        *capture_guard = Some(CaptureControl {
            stop_tx,
            join_handle,
            samples,
            mode_label,
            started_at: Instant::now(),
            device_name,
        });
        Ok(())
    }

    fn stop_capture(&self) -> Result<RecordedAudio, ActivationError> {
        let CaptureControl {
            stop_tx,
            join_handle,
            samples,
            mode_label,
            started_at,
            device_name,
        } = self
            .take_capture()?
            .ok_or_else(|| ActivationError::Audio("No capture is in progress".to_string()))?;

        let _ = stop_tx.send(());
        if join_handle.join().is_err() {
            error!("microphone worker panicked while stopping");
            return Err(ActivationError::Audio(
                "Microphone worker panicked while stopping".to_string(),
            ));
        }

        let buffered = samples
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .map_err(|_| ActivationError::Audio("Audio sample buffer lock is poisoned".to_string()))?;
        let recorded = RecordedAudio::from_samples(&buffered, TARGET_SAMPLE_RATE_HZ)?;

        info!(
            mode = mode_label,
            device_name = %device_name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            duration_ms = recorded.duration_ms,
            sample_count = recorded.sample_count,
            "audio capture stopped"
        );
        Ok(recorded)
    }

    fn abort_capture(&self) -> Result<bool, ActivationError> {
        let Some(CaptureControl {
            stop_tx,
            join_handle,
            mode_label,
            ..
        }) = self.take_capture()?
        else {
            debug!("abort requested but no capture was open");
            return Ok(false);
        };

        let _ = stop_tx.send(());
        if join_handle.thread().id() == thread::current().id() {
            drop(join_handle);
        } else if join_handle.join().is_err() {
            error!("microphone worker panicked while aborting");
            return Err(ActivationError::Audio(
                "Microphone worker panicked while aborting".to_string(),
            ));
        }

        warn!(mode = mode_label, "audio capture aborted");
        Ok(true)
    }

    fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

fn capture_lock_error() -> ActivationError {
    ActivationError::Audio("Audio capture state lock is poisoned".to_string())
}

fn await_worker_startup(
    ready_rx: &Receiver<Result<String, String>>,
    stop_tx: &Sender<()>,
    join_handle: &mut Option<JoinHandle<()>>,
    timeout: Duration,
) -> Result<String, String> {
    match ready_rx.recv_timeout(timeout) {
        Ok(Ok(device_name)) => Ok(device_name),
        Ok(Err(err)) => {
            if let Some(handle) = join_handle.take() {
                let _ = handle.join();
            }
            error!(error = %err, "microphone worker failed to initialize");
            Err(err)
        }
        Err(RecvTimeoutError::Timeout) => {
            let _ = stop_tx.send(());
            if join_handle.take().is_some() {
                warn!("detaching microphone worker after startup timeout");
            }
            Err("Timed out while starting microphone stream".to_string())
        }
        Err(RecvTimeoutError::Disconnected) => {
            if let Some(handle) = join_handle.take() {
                let _ = handle.join();
            }
            Err("Microphone stream failed to initialize".to_string())
        }
    }
}

fn capture_thread_main(
    sink: CaptureSink,
    ready_tx: Sender<Result<String, String>>,
    stop_rx: Receiver<()>,
) {
    let (stream, device_name, stream_error_rx) = match open_default_input(sink) {
        Ok(opened) => opened,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let _ = ready_tx.send(Ok(device_name));
    if let CaptureLoopExit::StreamError(message) = run_capture_loop(&stop_rx, &stream_error_rx) {
        error!(message = %message, "microphone worker exited due to stream error");
        // Keep the capture slot occupied until the owner calls stop/abort.
        let _ = stop_rx.recv();
    }
    drop(stream);
    debug!("microphone worker exited");
}

fn open_default_input(sink: CaptureSink) -> Result<(Stream, String, Receiver<String>), String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "No microphone input device is available".to_string())?;
    let device_name = device
        .name()
        .unwrap_or_else(|_| "Default microphone".to_string());

    let supported_config = device.default_input_config().map_err(|err| {
        format!("Failed to read default input config for '{device_name}': {err}")
    })?;
    let sample_format = supported_config.sample_format();
    let stream_config: StreamConfig = supported_config.into();
    let (stream_error_tx, stream_error_rx) = mpsc::channel::<String>();

    let stream = build_input_stream(&device, &stream_config, sample_format, sink, stream_error_tx)?;
    stream
        .play()
        .map_err(|err| format!("Failed to start microphone stream: {err}"))?;
    info!(
        device_name = %device_name,
        device_sample_rate_hz = stream_config.sample_rate.0,
        device_channels = stream_config.channels,
        "microphone stream playback started"
    );

    Ok((stream, device_name, stream_error_rx))
}

#[derive(Debug, PartialEq, Eq)]
enum CaptureLoopExit {
    StopRequested,
    StreamError(String),
}

fn run_capture_loop(stop_rx: &Receiver<()>, stream_error_rx: &Receiver<String>) -> CaptureLoopExit {
    loop {
        match stream_error_rx.try_recv() {
            Ok(message) => return CaptureLoopExit::StreamError(message),
            Err(TryRecvError::Disconnected | TryRecvError::Empty) => {}
        }

        match stop_rx.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                return CaptureLoopExit::StopRequested
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

enum CaptureSink {
    Stream(AudioInputChunkCallback),
    Clip(Arc<Mutex<Vec<i16>>>),
}

/// Downmixes device frames to mono, resamples to 16 kHz and hands the PCM16
/// result to the sink.
struct InputProcessor {
    channels: usize,
    resampler: LinearResampler,
    sink: Arc<CaptureSink>,
    scratch: Vec<f32>,
}

impl InputProcessor {
    fn new(channels: u16, device_rate_hz: u32, sink: Arc<CaptureSink>) -> Self {
        Self {
            channels: usize::from(channels),
            resampler: LinearResampler::new(device_rate_hz, TARGET_SAMPLE_RATE_HZ),
            sink,
            scratch: Vec::new(),
        }
    }

    fn process<T, F>(&mut self, data: &[T], to_f32: F)
    where
        T: Copy,
        F: Fn(T) -> f32,
    {
        if self.channels == 0 {
            return;
        }

        self.scratch.clear();
        for frame in data.chunks_exact(self.channels) {
            let mixed = frame.iter().map(|&sample| to_f32(sample)).sum::<f32>();
            let normalized = (mixed / self.channels as f32).clamp(-1.0, 1.0);
            self.resampler.push(normalized, &mut self.scratch);
        }
        if self.scratch.is_empty() {
            return;
        }

        let pcm16 = self
            .scratch
            .iter()
            .map(|&sample| float_to_pcm16(sample))
            .collect::<Vec<_>>();
        match self.sink.as_ref() {
            CaptureSink::Stream(callback) => callback(AudioInputChunk {
                pcm16_mono_samples: pcm16,
                sample_rate_hz: TARGET_SAMPLE_RATE_HZ,
            }),
            CaptureSink::Clip(samples) => {
                if let Ok(mut buffer) = samples.lock() {
                    buffer.extend_from_slice(&pcm16);
                }
            }
        }
    }
}

fn build_input_stream(
    device: &Device,
    stream_config: &StreamConfig,
    sample_format: SampleFormat,
    sink: CaptureSink,
    stream_error_tx: Sender<String>,
) -> Result<Stream, String> {
    let sink = Arc::new(sink);
    let mut processor = InputProcessor::new(
        stream_config.channels,
        stream_config.sample_rate.0,
        Arc::clone(&sink),
    );
    let error_callback = move |err: StreamError| report_stream_error(&stream_error_tx, err);

    match sample_format {
        SampleFormat::F32 => device
            .build_input_stream(
                stream_config,
                move |data: &[f32], _| processor.process(data, |sample| sample),
                error_callback,
                None,
            )
            .map_err(|err| format!("Failed to build f32 input stream: {err}")),
        SampleFormat::I16 => device
            .build_input_stream(
                stream_config,
                move |data: &[i16], _| {
                    processor.process(data, |sample| sample as f32 / i16::MAX as f32)
                },
                error_callback,
                None,
            )
            .map_err(|err| format!("Failed to build i16 input stream: {err}")),
        SampleFormat::U16 => device
            .build_input_stream(
                stream_config,
                move |data: &[u16], _| {
                    processor.process(data, |sample| {
                        (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
                    })
                },
                error_callback,
                None,
            )
            .map_err(|err| format!("Failed to build u16 input stream: {err}")),
        _ => Err(format!(
            "Unsupported microphone sample format: {sample_format:?}"
        )),
    }
}

fn report_stream_error(stream_error_tx: &Sender<String>, err: StreamError) {
    let message = format!("Microphone stream error: {err}");
    error!(%message, "microphone stream callback error");
    let _ = stream_error_tx.send(message);
}
