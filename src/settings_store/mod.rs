use std::{
    collections::BTreeMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ensure_unit_interval, ActivationError};

pub const KEY_ENABLED: &str = "enabled";
pub const KEY_SENSITIVITY: &str = "sensitivity";
pub const KEY_DEBOUNCE_MS: &str = "debounce_ms";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_WAS_LISTENING: &str = "was_listening";

pub const DEFAULT_SENSITIVITY: f32 = 0.5;
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_500;

const SETTINGS_FILE_NAME: &str = "voice_activation_settings.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    pub sensitivity: f32,
    pub debounce_ms: u64,
    /// `None` until the user has explicitly toggled the feature once.
    pub enabled: Option<bool>,
    pub device_id: String,
    pub was_listening: bool,
}

impl PipelineSettings {
    fn from_values(values: &BTreeMap<String, String>, device_id: String) -> Self {
        let sensitivity = values
            .get(KEY_SENSITIVITY)
            .and_then(|raw| parse_value::<f32>(KEY_SENSITIVITY, raw))
            .filter(|value| {
                let valid = ensure_unit_interval(KEY_SENSITIVITY, *value).is_ok();
                if !valid {
                    warn!(value, "stored sensitivity out of range; using default");
                }
                valid
            })
            .unwrap_or(DEFAULT_SENSITIVITY);

        Self {
            sensitivity,
            debounce_ms: values
                .get(KEY_DEBOUNCE_MS)
                .and_then(|raw| parse_value::<u64>(KEY_DEBOUNCE_MS, raw))
                .unwrap_or(DEFAULT_DEBOUNCE_MS),
            enabled: values
                .get(KEY_ENABLED)
                .and_then(|raw| parse_value::<bool>(KEY_ENABLED, raw)),
            device_id,
            was_listening: values
                .get(KEY_WAS_LISTENING)
                .and_then(|raw| parse_value::<bool>(KEY_WAS_LISTENING, raw))
                .unwrap_or(false),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparsable stored setting");
            None
        }
    }
}

/// String key/value persistence the typed store is layered on.
pub trait SettingsBackend: Send + Sync + fmt::Debug {
    fn load_all(&self) -> Result<BTreeMap<String, String>, String>;
    fn set(&self, key: &str, value: &str) -> Result<(), String>;
}

#[derive(Debug)]
pub struct SettingsStore {
    backend: Arc<dyn SettingsBackend>,
    cached: RwLock<Option<PipelineSettings>>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn SettingsBackend>) -> Self {
        debug!(backend = ?backend, "settings store initialized");
        Self {
            backend,
            cached: RwLock::new(None),
        }
    }

    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(Arc::new(FileSettingsBackend::new(
            data_dir.join(SETTINGS_FILE_NAME),
        )))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySettingsBackend::default()))
    }

    /// Reads every key, generating and persisting the device id on first use.
    pub fn load(&self) -> Result<PipelineSettings, ActivationError> {
        let values = self.backend.load_all().map_err(ActivationError::Settings)?;

        let device_id = match values
            .get(KEY_DEVICE_ID)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
        {
            Some(existing) => existing.to_string(),
            None => {
                let generated = Uuid::new_v4().to_string();
                self.backend
                    .set(KEY_DEVICE_ID, &generated)
                    .map_err(ActivationError::Settings)?;
                info!(device_id = %generated, "generated device identifier");
                generated
            }
        };

        let settings = PipelineSettings::from_values(&values, device_id);
        self.replace_cache(settings.clone());
        Ok(settings)
    }

    pub fn current(&self) -> Result<PipelineSettings, ActivationError> {
        let cached = self
            .cached
            .read()
            .map(|guard| guard.clone())
            .unwrap_or(None);
        match cached {
            Some(settings) => Ok(settings),
            None => self.load(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<PipelineSettings, ActivationError> {
        self.write(KEY_ENABLED, enabled.to_string())
    }

    pub fn set_sensitivity(&self, sensitivity: f32) -> Result<PipelineSettings, ActivationError> {
        let sensitivity = ensure_unit_interval(KEY_SENSITIVITY, sensitivity)?;
        self.write(KEY_SENSITIVITY, sensitivity.to_string())
    }

    pub fn set_debounce_ms(&self, debounce_ms: u64) -> Result<PipelineSettings, ActivationError> {
        self.write(KEY_DEBOUNCE_MS, debounce_ms.to_string())
    }

    pub fn set_was_listening(
        &self,
        was_listening: bool,
    ) -> Result<PipelineSettings, ActivationError> {
        self.write(KEY_WAS_LISTENING, was_listening.to_string())
    }

    fn write(&self, key: &str, value: String) -> Result<PipelineSettings, ActivationError> {
        self.backend
            .set(key, &value)
            .map_err(ActivationError::Settings)?;
        debug!(key, value = %value, "setting persisted");
        self.load()
    }

    fn replace_cache(&self, settings: PipelineSettings) {
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(settings);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsBackend {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsBackend {
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: Mutex::new(
                values
                    .into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
            ),
        }
    }
}

impl SettingsBackend for MemorySettingsBackend {
    fn load_all(&self) -> Result<BTreeMap<String, String>, String> {
        self.values
            .lock()
            .map(|values| values.clone())
            .map_err(|_| lock_error())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.values
            .lock()
            .map_err(|_| lock_error())?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON object on disk, rewritten atomically on every `set`.
#[derive(Debug)]
pub struct FileSettingsBackend {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileSettingsBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: Mutex::new(()),
        }
    }
}

impl SettingsBackend for FileSettingsBackend {
    fn load_all(&self) -> Result<BTreeMap<String, String>, String> {
        let _io_guard = self.io_lock.lock().map_err(|_| io_lock_error())?;
        read_settings_file_with_recovery(&self.path)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let _io_guard = self.io_lock.lock().map_err(|_| io_lock_error())?;
        let mut values = read_settings_file_with_recovery(&self.path)?;
        values.insert(key.to_string(), value.to_string());
        write_settings_file(&self.path, &values)
    }
}

#[derive(Debug)]
struct SettingsReadError {
    message: String,
    /// Raw contents of a malformed file; `None` when the file could not be read.
    malformed_contents: Option<String>,
}

impl SettingsReadError {
    fn read(message: String) -> Self {
        Self {
            message,
            malformed_contents: None,
        }
    }

    fn malformed(message: String, contents: String) -> Self {
        Self {
            message,
            malformed_contents: Some(contents),
        }
    }
}

fn read_settings_file_with_recovery(
    settings_path: &Path,
) -> Result<BTreeMap<String, String>, String> {
    match read_settings_file(settings_path) {
        Ok(values) => Ok(values),
        Err(SettingsReadError {
            message,
            malformed_contents: Some(contents),
        }) => {
            let backup_path = backup_corrupt_settings_file(settings_path)?;
            let mut defaults = BTreeMap::new();
            let device_id = salvage_device_id(&contents);
            if let Some(device_id) = device_id.as_ref() {
                defaults.insert(KEY_DEVICE_ID.to_string(), device_id.clone());
            }
            write_settings_file(settings_path, &defaults)?;
            warn!(
                path = %settings_path.display(),
                backup = %backup_path.display(),
                reason = %message,
                kept_device_id = device_id.is_some(),
                "recovered malformed settings file"
            );
            Ok(defaults)
        }
        Err(error) => Err(error.message),
    }
}

fn read_settings_file(settings_path: &Path) -> Result<BTreeMap<String, String>, SettingsReadError> {
    if !settings_path.exists() {
        debug!(path = %settings_path.display(), "settings file missing; using defaults");
        return Ok(BTreeMap::new());
    }

    let file_contents = fs::read_to_string(settings_path)
        .map_err(|error| {
            format!(
                "Failed to read settings file `{}`: {error}",
                settings_path.display()
            )
        })
        .map_err(SettingsReadError::read)?;

    serde_json::from_str::<BTreeMap<String, String>>(&file_contents).map_err(|error| {
        SettingsReadError::malformed(
            format!(
                "Failed to parse settings file `{}`: {error}",
                settings_path.display()
            ),
            file_contents.clone(),
        )
    })
}

/// Pulls a well-formed `device_id` out of a damaged settings file so the
/// device keeps its identity across recovery.
fn salvage_device_id(raw: &str) -> Option<String> {
    let key = format!("\"{KEY_DEVICE_ID}\"");
    let after_key = &raw[raw.find(&key)? + key.len()..];
    let quoted = after_key
        .trim_start()
        .strip_prefix(':')?
        .trim_start()
        .strip_prefix('"')?;
    let candidate = &quoted[..quoted.find('"')?];
    Uuid::parse_str(candidate).ok().map(|id| id.to_string())
}

fn write_settings_file(
    settings_path: &Path,
    values: &BTreeMap<String, String>,
) -> Result<(), String> {
    if let Some(parent_dir) = settings_path.parent() {
        fs::create_dir_all(parent_dir).map_err(|error| {
            format!(
                "Failed to create settings directory `{}`: {error}",
                parent_dir.display()
            )
        })?;
    }

    let serialized = serde_json::to_vec_pretty(values)
        .map_err(|error| format!("Failed to serialize settings: {error}"))?;
    write_atomic_file(settings_path, &serialized)?;

    debug!(
        path = %settings_path.display(),
        keys = values.len(),
        "settings file written"
    );
    Ok(())
}

fn write_atomic_file(file_path: &Path, contents: &[u8]) -> Result<(), String> {
    let temp_path = sibling_path(file_path, "tmp");
    let mut temp_file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|error| {
            format!(
                "Failed to create temp settings file `{}`: {error}",
                temp_path.display()
            )
        })?;

    let written = temp_file
        .write_all(contents)
        .and_then(|()| temp_file.sync_all());
    drop(temp_file);
    if let Err(error) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(format!(
            "Failed to write temp settings file `{}`: {error}",
            temp_path.display()
        ));
    }

    fs::rename(&temp_path, file_path).map_err(|error| {
        let _ = fs::remove_file(&temp_path);
        format!(
            "Failed to finalize settings file `{}`: {error}",
            file_path.display()
        )
    })
}

fn backup_corrupt_settings_file(settings_path: &Path) -> Result<PathBuf, String> {
    let backup_path = sibling_path(settings_path, "bak");
    fs::rename(settings_path, &backup_path).map_err(|error| {
        format!(
            "Failed to backup malformed settings file `{}` to `{}`: {error}",
            settings_path.display(),
            backup_path.display()
        )
    })?;
    Ok(backup_path)
}

/// `.name.<pid>.<ts>.tmp` for temp files, `name.corrupt-<pid>-<ts>.bak` for backups.
fn sibling_path(file_path: &Path, extension: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = file_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(SETTINGS_FILE_NAME);
    let pid = std::process::id();

    if extension == "tmp" {
        file_path.with_file_name(format!(".{file_name}.{pid}.{timestamp}.tmp"))
    } else {
        file_path.with_file_name(format!("{file_name}.corrupt-{pid}-{timestamp}.{extension}"))
    }
}

fn lock_error() -> String {
    "Settings store lock was poisoned".to_string()
}

fn io_lock_error() -> String {
    "Settings store IO lock was poisoned".to_string()
}
