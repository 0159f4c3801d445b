use crate::engine::EngineSettings;
use crate::session::VerifyConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use veriface_core::{ChallengeError, LivenessChallenge};
use veriface_source::JsonLinesOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read challenge file {path}: {source}")]
    ChallengeRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse challenge file {path}: {source}")]
    ChallengeParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid liveness challenge: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-lines observation file or FIFO written by the model process.
    pub source_path: PathBuf,
    /// Sleep between observations by their timestamp deltas.
    pub source_paced: bool,
    /// Bounded channel capacity between source and session.
    pub channel_capacity: usize,
    /// Path to the registered-identity JSON file.
    pub store_path: PathBuf,
    /// Euclidean distance below which a login match is accepted.
    pub match_threshold: f32,
    /// Tighter distance used to reject a face that is already registered.
    pub duplicate_threshold: f32,
    pub challenge: LivenessChallenge,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("veriface");

        let store_path = lookup("VERIFACE_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("identities.json"));

        let source_path = lookup("VERIFACE_SOURCE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/veriface/observations.fifo"));

        let mut challenge = match lookup("VERIFACE_CHALLENGE_FILE") {
            Some(path) => load_challenge(Path::new(&path))?,
            None => LivenessChallenge::default(),
        };
        challenge.time_budget_ms =
            parse_or(&lookup, "VERIFACE_TIME_BUDGET_MS", challenge.time_budget_ms);
        challenge.face_lost_ticks =
            parse_or(&lookup, "VERIFACE_FACE_LOST_TICKS", challenge.face_lost_ticks);
        challenge.min_face_confidence =
            parse_or(&lookup, "VERIFACE_MIN_FACE_CONFIDENCE", challenge.min_face_confidence);
        if let Some(max) = lookup("VERIFACE_MAX_OBSERVATIONS").and_then(|v| v.parse().ok()) {
            challenge.max_observations = Some(max);
        }
        challenge.validate()?;

        let match_threshold = parse_or(&lookup, "VERIFACE_MATCH_THRESHOLD", 0.5f32);
        let duplicate_threshold = parse_or(&lookup, "VERIFACE_DUPLICATE_THRESHOLD", 0.3f32);
        for (key, value) in [
            ("VERIFACE_MATCH_THRESHOLD", match_threshold),
            ("VERIFACE_DUPLICATE_THRESHOLD", duplicate_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("{value} is not a non-negative distance"),
                });
            }
        }

        let bus = match lookup("VERIFACE_BUS").as_deref() {
            None | Some("session") => BusKind::Session,
            Some("system") => BusKind::System,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "VERIFACE_BUS",
                    message: format!("expected \"session\" or \"system\", got {other:?}"),
                })
            }
        };

        Ok(Self {
            source_path,
            source_paced: lookup("VERIFACE_SOURCE_PACED")
                .map(|v| v != "0")
                .unwrap_or(false),
            channel_capacity: parse_or(&lookup, "VERIFACE_CHANNEL_CAPACITY", 16usize),
            store_path,
            match_threshold,
            duplicate_threshold,
            challenge,
            bus,
        })
    }

    pub fn source_options(&self) -> JsonLinesOptions {
        JsonLinesOptions {
            capacity: self.channel_capacity,
            paced: self.source_paced,
        }
    }

    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig {
            challenge: self.challenge.clone(),
            match_threshold: self.match_threshold,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            verify: self.verify_config(),
            duplicate_threshold: self.duplicate_threshold,
        }
    }
}

/// Parse a TOML liveness challenge, e.g.
///
/// ```toml
/// time_budget_ms = 8000
///
/// [[steps]]
/// name = "blink"
/// kind = "blink"
/// max_eye_aspect_ratio = 0.22
/// ```
pub fn load_challenge(path: &Path) -> Result<LivenessChallenge, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ChallengeRead {
        path: path.to_path_buf(),
        source,
    })?;
    let challenge: LivenessChallenge =
        toml::from_str(&text).map_err(|source| ConfigError::ChallengeParse {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::info!(
        path = %path.display(),
        steps = challenge.steps.len(),
        "loaded liveness challenge"
    );
    Ok(challenge)
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use veriface_core::StepPredicate;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("HOME", "/home/alice")]).unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.duplicate_threshold, 0.3);
        assert_eq!(
            config.store_path,
            PathBuf::from("/home/alice/.local/share/veriface/identities.json")
        );
        assert_eq!(config.challenge, LivenessChallenge::default());
        assert_eq!(config.bus, BusKind::Session);
        assert!(!config.source_paced);
        assert_eq!(config.channel_capacity, 16);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("VERIFACE_MATCH_THRESHOLD", "0.55"),
            ("VERIFACE_TIME_BUDGET_MS", "4000"),
            ("VERIFACE_FACE_LOST_TICKS", "3"),
            ("VERIFACE_MAX_OBSERVATIONS", "120"),
            ("VERIFACE_STORE_PATH", "/var/lib/veriface/ids.json"),
            ("VERIFACE_SOURCE_PACED", "1"),
            ("VERIFACE_BUS", "system"),
        ])
        .unwrap();
        assert_eq!(config.match_threshold, 0.55);
        assert_eq!(config.challenge.time_budget_ms, 4000);
        assert_eq!(config.challenge.face_lost_ticks, 3);
        assert_eq!(config.challenge.max_observations, Some(120));
        assert_eq!(config.store_path, PathBuf::from("/var/lib/veriface/ids.json"));
        assert!(config.source_paced);
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_unparseable_number_falls_back_to_default() {
        let config = config_from(&[("VERIFACE_MATCH_THRESHOLD", "loose")]).unwrap();
        assert_eq!(config.match_threshold, 0.5);
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let err = config_from(&[("VERIFACE_DUPLICATE_THRESHOLD", "-0.1")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "VERIFACE_DUPLICATE_THRESHOLD",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_bus_rejected() {
        assert!(config_from(&[("VERIFACE_BUS", "user")]).is_err());
    }

    #[test]
    fn test_challenge_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
time_budget_ms = 8000

[[steps]]
name = "wink"
kind = "blink"
max_eye_aspect_ratio = 0.2

[[steps]]
name = "surprise"
kind = "expression"
label = "surprised"
min_probability = 0.6
"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let config = config_from(&[("VERIFACE_CHALLENGE_FILE", path.as_str())]).unwrap();
        assert_eq!(config.challenge.time_budget_ms, 8000);
        assert_eq!(config.challenge.steps.len(), 2);
        assert_eq!(
            config.challenge.steps[1].predicate,
            StepPredicate::Expression {
                label: "surprised".into(),
                min_probability: 0.6,
            }
        );
    }

    #[test]
    fn test_missing_challenge_file() {
        let err = config_from(&[("VERIFACE_CHALLENGE_FILE", "/nonexistent/challenge.toml")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::ChallengeRead { .. }));
    }

    #[test]
    fn test_empty_challenge_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "steps = []\n").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(matches!(
            config_from(&[("VERIFACE_CHALLENGE_FILE", path.as_str())]),
            Err(ConfigError::Challenge(_))
        ));
    }
}
