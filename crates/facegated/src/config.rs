use facegate_core::extractor::DEFAULT_CONFIDENCE_FLOOR;
use facegate_core::matcher::{DEFAULT_DISTANCE_TOLERANCE, DEFAULT_SIMILARITY_THRESHOLD};
use facegate_core::{MatchConfig, Metric};
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_BIND: &str = "0.0.0.0:5000";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Listen address for the HTTP surface.
    pub bind: String,
    /// Directory of enrolled reference images.
    pub known_dir: PathBuf,
    /// Directory of recognition attempt images.
    pub log_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub matching: MatchConfig,
    /// Minimum detector confidence for a face (exclusive).
    pub detection_confidence: f32,
    /// Maximum accepted request body size.
    pub max_upload_bytes: usize,
    pub notify: NotifyConfig,
}

/// Notification channel credentials. Both must be set for notifications to
/// be sent; there are no built-in values.
#[derive(Default)]
pub struct NotifyConfig {
    pub telegram_token: Option<SecretString>,
    pub telegram_chat_id: Option<String>,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = var("FACEGATE_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("facegate")
        });

        let dir = |key: &str, default: &str| {
            var(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(default))
        };

        Self {
            bind: var("FACEGATE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            known_dir: dir("FACEGATE_KNOWN_DIR", "known_faces"),
            log_dir: dir("FACEGATE_LOG_DIR", "logs"),
            model_dir: dir("FACEGATE_MODEL_DIR", "models"),
            matching: MatchConfig {
                metric: parse_or(&var, "FACEGATE_METRIC", Metric::Cosine),
                threshold: parse_or(
                    &var,
                    "FACEGATE_SIMILARITY_THRESHOLD",
                    DEFAULT_SIMILARITY_THRESHOLD,
                ),
                tolerance: parse_or(
                    &var,
                    "FACEGATE_DISTANCE_TOLERANCE",
                    DEFAULT_DISTANCE_TOLERANCE,
                ),
            },
            detection_confidence: parse_or(
                &var,
                "FACEGATE_DETECTION_CONFIDENCE",
                DEFAULT_CONFIDENCE_FLOOR,
            ),
            max_upload_bytes: parse_or(&var, "FACEGATE_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            notify: NotifyConfig {
                telegram_token: var("FACEGATE_TELEGRAM_TOKEN").map(SecretString::from),
                telegram_chat_id: var("FACEGATE_TELEGRAM_CHAT_ID"),
            },
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparsable configuration value, using default");
                default
            }
        },
    }
}
