//! Diagnostics: a size-capped log file with one rotated predecessor, plus stderr.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::info;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "voice-activation.log";
const ROTATED_LOG_FILE_NAME: &str = "voice-activation.log.1";
const DEFAULT_LOG_FILTER: &str = "info,safe_voice_lib=debug";
const MAX_LOG_FILE_BYTES: u64 = 5 * 1024 * 1024;

/// Locations of the live log and the file it last rotated into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFiles {
    current: PathBuf,
    rotated: PathBuf,
}

impl LogFiles {
    pub fn in_dir(log_dir: &Path) -> Self {
        Self {
            current: log_dir.join(LOG_FILE_NAME),
            rotated: log_dir.join(ROTATED_LOG_FILE_NAME),
        }
    }

    pub fn current(&self) -> &Path {
        &self.current
    }

    /// Last `max_lines` lines across the rotated and live files, oldest first.
    pub fn tail(&self, max_lines: usize) -> Result<Vec<String>, String> {
        let mut contents = read_if_present(&self.rotated)?;
        contents.push_str(&read_if_present(&self.current)?);

        let lines: Vec<&str> = contents.lines().collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
    }
}

/// Installs the global subscriber. Call once, before building the controller.
pub fn initialize(log_dir: &Path) -> Result<LogFiles, String> {
    let files = LogFiles::in_dir(log_dir);
    let sink = RotatingLogFile::open(files.clone(), MAX_LOG_FILE_BYTES)?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(SharedLogSink(Arc::new(Mutex::new(sink)))),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|error| format!("Failed to install voice activation logger: {error}"))?;

    info!(log_file = %files.current().display(), "voice activation logging initialized");
    Ok(files)
}

fn read_if_present(path: &Path) -> Result<String, String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(error) => Err(format!("Failed to read log file `{}`: {error}", path.display())),
    }
}

/// Append-only log file that moves itself aside once it would exceed
/// `max_bytes`. Only the newest rotated file is kept.
#[derive(Debug)]
struct RotatingLogFile {
    files: LogFiles,
    file: File,
    written: u64,
    max_bytes: u64,
}

impl RotatingLogFile {
    fn open(files: LogFiles, max_bytes: u64) -> Result<Self, String> {
        if let Some(dir) = files.current.parent() {
            fs::create_dir_all(dir).map_err(|error| {
                format!("Failed to create log directory `{}`: {error}", dir.display())
            })?;
        }

        let file = append_to(&files.current)?;
        let written = file.metadata().map(|metadata| metadata.len()).unwrap_or(0);
        let mut sink = Self {
            files,
            file,
            written,
            max_bytes,
        };
        if sink.written > sink.max_bytes {
            sink.rotate().map_err(|error| {
                format!(
                    "Failed to rotate oversized log file `{}`: {error}",
                    sink.files.current.display()
                )
            })?;
        }
        Ok(sink)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.files.current, &self.files.rotated)?;
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.files.current)?;
        self.written = 0;
        Ok(())
    }

    fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        let incoming = record.len() as u64;
        if self.written > 0 && self.written + incoming > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(record)?;
        self.written += incoming;
        Ok(())
    }
}

fn append_to(path: &Path) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|error| format!("Failed to open log file `{}`: {error}", path.display()))
}

#[derive(Debug, Clone)]
struct SharedLogSink(Arc<Mutex<RotatingLogFile>>);

impl<'a> MakeWriter<'a> for SharedLogSink {
    type Writer = SharedLogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl io::Write for SharedLogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?
            .write_record(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?
            .file
            .flush()
    }
}
