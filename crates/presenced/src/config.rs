use presence_core::matcher::{DEFAULT_FRAME_ATTEMPTS, DEFAULT_MATCH_THRESHOLD};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on (default: 0.0.0.0:4000).
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Euclidean distance below which a live face matches the reference.
    pub match_threshold: f32,
    /// Timeout in seconds for the biometric gate; 0 disables it.
    pub verify_timeout_secs: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Frames grabbed per attempt while skipping dark ones.
    pub frame_attempts: usize,
    /// HMAC secret used to validate bearer tokens.
    pub jwt_secret: String,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let jwt_secret = std::env::var("PRESENCE_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("PRESENCE_JWT_SECRET"))?;

        Ok(Self {
            bind_addr: std::env::var("PRESENCE_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:4000".to_string()),
            db_path: std::env::var("PRESENCE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("attendance.db")),
            model_dir: std::env::var("PRESENCE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("models")),
            camera_device: std::env::var("PRESENCE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            match_threshold: env_f32("PRESENCE_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            verify_timeout_secs: env_u64("PRESENCE_VERIFY_TIMEOUT_SECS", 15),
            warmup_frames: env_usize("PRESENCE_WARMUP_FRAMES", 4),
            frame_attempts: env_usize("PRESENCE_FRAME_ATTEMPTS", DEFAULT_FRAME_ATTEMPTS),
            jwt_secret,
        })
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f32| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own keys; the process environment is shared.

    #[test]
    fn test_env_helpers_fall_back_on_garbage() {
        std::env::set_var("PRESENCE_TEST_F32", "abc");
        assert_eq!(env_f32("PRESENCE_TEST_F32", 0.6), 0.6);
        std::env::set_var("PRESENCE_TEST_F32", "-1");
        assert_eq!(env_f32("PRESENCE_TEST_F32", 0.6), 0.6);
        std::env::set_var("PRESENCE_TEST_F32", "0.45");
        assert_eq!(env_f32("PRESENCE_TEST_F32", 0.6), 0.45);

        std::env::set_var("PRESENCE_TEST_USIZE", "7");
        assert_eq!(env_usize("PRESENCE_TEST_USIZE", 5), 7);
        assert_eq!(env_u64("PRESENCE_TEST_UNSET_U64", 15), 15);
    }
}
