use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Loaded from an optional TOML file, then overridden by `ATTENDANCE_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Requested capture size; the driver may negotiate another.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing the SCRFD detection model.
    pub model_dir: PathBuf,
    /// Root for samples, roster, attendance files and the trained model.
    pub data_dir: PathBuf,
    /// LBPH distance below which a face is accepted.
    pub acceptance_threshold: f64,
    /// Face crops captured per enrollment.
    pub samples_per_enroll: u32,
    /// Pause between enrollment frames so samples vary.
    pub enroll_frame_interval_ms: u64,
    /// Single-shot sessions stop after this long without a mark; 0 disables.
    pub single_shot_timeout_secs: u64,
    /// Consecutive failed camera reads before a capture loop gives up.
    pub max_consecutive_read_failures: u32,
    /// Pause after a failed camera read.
    pub read_retry_delay_ms: u64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_dir: default_model_dir(),
            data_dir: xdg_dir("XDG_DATA_HOME", ".local/share").join("attendance"),
            acceptance_threshold: attendance_core::DEFAULT_ACCEPTANCE_THRESHOLD,
            samples_per_enroll: 100,
            enroll_frame_interval_ms: 100,
            single_shot_timeout_secs: 20,
            max_consecutive_read_failures: 10,
            read_retry_delay_ms: 50,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load `$ATTENDANCE_CONFIG` (or the XDG default path) if it exists, then
    /// apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("ATTENDANCE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| xdg_dir("XDG_CONFIG_HOME", ".config").join("attendance/config.toml"));

        let mut config = if path.exists() {
            tracing::info!(path = %path.display(), "reading config file");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `ATTENDANCE_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse().ok());

        if let Some(v) = lookup("ATTENDANCE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = parsed("ATTENDANCE_FRAME_WIDTH") {
            self.frame_width = v;
        }
        if let Some(v) = parsed("ATTENDANCE_FRAME_HEIGHT") {
            self.frame_height = v;
        }
        if let Some(v) = lookup("ATTENDANCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ATTENDANCE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed("ATTENDANCE_ACCEPTANCE_THRESHOLD") {
            self.acceptance_threshold = v;
        }
        if let Some(v) = parsed("ATTENDANCE_SAMPLES_PER_ENROLL") {
            self.samples_per_enroll = v;
        }
        if let Some(v) = parsed("ATTENDANCE_ENROLL_FRAME_INTERVAL_MS") {
            self.enroll_frame_interval_ms = v;
        }
        if let Some(v) = parsed("ATTENDANCE_SINGLE_SHOT_TIMEOUT_SECS") {
            self.single_shot_timeout_secs = v;
        }
        if let Some(v) = parsed("ATTENDANCE_MAX_READ_FAILURES") {
            self.max_consecutive_read_failures = v;
        }
        if let Some(v) = parsed("ATTENDANCE_READ_RETRY_DELAY_MS") {
            self.read_retry_delay_ms = v;
        }
        if let Some(v) = lookup("ATTENDANCE_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.data_dir.join("samples")
    }

    pub fn roster_path(&self) -> PathBuf {
        self.data_dir.join("roster.csv")
    }

    pub fn attendance_dir(&self) -> PathBuf {
        self.data_dir.join("attendance")
    }

    /// Trained LBPH model artifact.
    pub fn recognizer_path(&self) -> PathBuf {
        self.data_dir.join("model/recognizer.json")
    }

    pub fn single_shot_timeout(&self) -> Option<Duration> {
        (self.single_shot_timeout_secs > 0).then(|| Duration::from_secs(self.single_shot_timeout_secs))
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn enroll_frame_interval(&self) -> Duration {
        Duration::from_millis(self.enroll_frame_interval_ms)
    }
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/attendance/models")
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(home_fallback)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.acceptance_threshold, 70.0);
        assert_eq!(config.samples_per_enroll, 100);
        assert_eq!(config.max_consecutive_read_failures, 10);
        assert_eq!(config.single_shot_timeout(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_toml_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "camera_device = \"/dev/video4\"\nacceptance_threshold = 55.5\ndata_dir = \"/srv/attendance\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.acceptance_threshold, 55.5);
        assert_eq!(config.frame_width, 640);
        assert_eq!(config.roster_path(), PathBuf::from("/srv/attendance/roster.csv"));
        assert_eq!(config.recognizer_path(), PathBuf::from("/srv/attendance/model/recognizer.json"));
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "threshold = 3\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ATTENDANCE_ACCEPTANCE_THRESHOLD", "62"),
            ("ATTENDANCE_SINGLE_SHOT_TIMEOUT_SECS", "0"),
            ("ATTENDANCE_MAX_READ_FAILURES", "not-a-number"),
            ("ATTENDANCE_SYSTEM_BUS", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.acceptance_threshold, 62.0);
        assert_eq!(config.single_shot_timeout(), None);
        assert_eq!(config.max_consecutive_read_failures, 10);
        assert!(config.system_bus);
    }
}
