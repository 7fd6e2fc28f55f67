use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::protocol::{BudgetPolicy, Family};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("namespace `{0}` is not a dotted script identifier")]
    InvalidNamespace(String),
    #[error("invalid {family} settings: {reason}")]
    InvalidFamily { family: Family, reason: String },
    #[error("worker name prefix must not contain NUL bytes")]
    InvalidWorkerPrefix,
}

/// What to do when a call-in arrives while its family's engine is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the engine; calls run one after another.
    #[default]
    Queue,
    /// Fail immediately with a busy error.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Script-global object the call-out functions hang off.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Family directories are resolved against this.
    #[serde(default = "default_resource_root")]
    pub resource_root: PathBuf,

    #[serde(default = "default_llm_config")]
    pub llm: FamilyConfig,

    #[serde(default = "default_tts_config")]
    pub tts: FamilyConfig,

    #[serde(default)]
    pub busy_policy: BusyPolicy,

    #[serde(default = "default_worker_name_prefix")]
    pub worker_name_prefix: String,

    /// Script-side deadline for one-shot calls. `None` waits forever.
    #[serde(default, with = "optional_duration_ms")]
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub dir: PathBuf,
    pub extension: String,

    #[serde(default = "default_budget")]
    pub default_budget: u32,

    #[serde(default = "default_max_budget")]
    pub max_budget: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            resource_root: default_resource_root(),
            llm: default_llm_config(),
            tts: default_tts_config(),
            busy_policy: BusyPolicy::default(),
            worker_name_prefix: default_worker_name_prefix(),
            request_timeout: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier_path(&self.namespace) {
            return Err(ConfigError::InvalidNamespace(self.namespace.clone()));
        }
        if self.worker_name_prefix.contains('\0') {
            return Err(ConfigError::InvalidWorkerPrefix);
        }
        for family in Family::ALL {
            let settings = self.family(family);
            let invalid = |reason: &str| ConfigError::InvalidFamily {
                family,
                reason: reason.to_string(),
            };
            let extension = settings.extension.trim_start_matches('.');
            if extension.is_empty() || extension.contains(['.', '/', '\\']) {
                return Err(invalid("extension must be a single non-empty suffix"));
            }
            if settings.max_budget == 0 {
                return Err(invalid("max_budget must be positive"));
            }
            if settings.default_budget > settings.max_budget {
                return Err(invalid("default_budget exceeds max_budget"));
            }
        }
        Ok(())
    }

    pub fn family(&self, family: Family) -> &FamilyConfig {
        match family {
            Family::Llm => &self.llm,
            Family::Tts => &self.tts,
        }
    }

    pub fn resource_dir(&self, family: Family) -> PathBuf {
        self.resource_root.join(&self.family(family).dir)
    }

    pub fn budget_policy(&self, family: Family) -> BudgetPolicy {
        let settings = self.family(family);
        BudgetPolicy {
            default: settings.default_budget,
            max: settings.max_budget,
        }
    }
}

fn is_identifier_path(path: &str) -> bool {
    path.split('.').all(|segment| {
        let mut chars = segment.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    })
}

fn default_namespace() -> String {
    "window.__hostbridge".to_string()
}

fn default_resource_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_llm_config() -> FamilyConfig {
    FamilyConfig {
        dir: PathBuf::from("models"),
        extension: "gguf".to_string(),
        default_budget: default_budget(),
        max_budget: default_max_budget(),
    }
}

fn default_tts_config() -> FamilyConfig {
    FamilyConfig {
        dir: PathBuf::from("voices"),
        extension: "onnx".to_string(),
        default_budget: default_budget(),
        max_budget: default_max_budget(),
    }
}

fn default_budget() -> u32 {
    256
}

fn default_max_budget() -> u32 {
    4096
}

fn default_worker_name_prefix() -> String {
    "hostbridge".to_string()
}

mod optional_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = BridgeConfig::from_json("{}").unwrap();
        assert_eq!(config.namespace, "window.__hostbridge");
        assert_eq!(config.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.resource_dir(Family::Llm), PathBuf::from("./models"));
        assert_eq!(config.family(Family::Tts).extension, "onnx");
        assert_eq!(config.budget_policy(Family::Llm), BudgetPolicy::default());
    }

    #[test]
    fn test_partial_family_section() {
        let config = BridgeConfig::from_json(
            r#"{
                "resource_root": "/srv/bridge",
                "llm": {"dir": "weights", "extension": ".bin", "max_budget": 512},
                "busy_policy": "reject",
                "request_timeout": 1500
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.resource_dir(Family::Llm),
            PathBuf::from("/srv/bridge/weights")
        );
        assert_eq!(
            config.budget_policy(Family::Llm),
            BudgetPolicy {
                default: 256,
                max: 512
            }
        );
        assert_eq!(config.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.request_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_validation_failures() {
        assert!(matches!(
            BridgeConfig::from_json(r#"{"namespace": "window.1bad"}"#),
            Err(ConfigError::InvalidNamespace(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"tts": {"dir": "v", "extension": ""}}"#),
            Err(ConfigError::InvalidFamily {
                family: Family::Tts,
                ..
            })
        ));
        assert!(matches!(
            BridgeConfig::from_json(
                r#"{"llm": {"dir": "m", "extension": "gguf", "default_budget": 10, "max_budget": 5}}"#
            ),
            Err(ConfigError::InvalidFamily {
                family: Family::Llm,
                ..
            })
        ));
        assert!(matches!(
            BridgeConfig::from_json("[]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"namespace": "host.$bridge_2"}}"#).unwrap();
        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.namespace, "host.$bridge_2");

        assert!(matches!(
            BridgeConfig::from_file("/no/such/config.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
