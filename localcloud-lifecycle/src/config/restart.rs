//! Restart configuration types

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use super::duration::{deserialize_duration_list, serialize_duration_list};

/// Default backoff schedule: 1s, 2s, 4s, ... 64s.
pub const DEFAULT_BACKOFF_SECS: [u64; 7] = [1, 2, 4, 8, 16, 32, 64];

pub fn default_backoff() -> Vec<Duration> {
    DEFAULT_BACKOFF_SECS.iter().copied().map(Duration::from_secs).collect()
}

/// When a service that exited should be considered for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartMode {
    /// Restart after any exit.
    Always,
    /// Restart only after a nonzero exit code.
    OnFailure,
    /// Restart after any exit unless an operator stopped the service.
    UnlessStopped,
    #[default]
    Never,
}

impl RestartMode {
    /// Parse a restart mode string (`always`, `on-failure`, `unless-stopped`, `no`).
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "on-failure" | "on_failure" => Ok(Self::OnFailure),
            "unless-stopped" | "unless_stopped" => Ok(Self::UnlessStopped),
            "no" | "never" | "" => Ok(Self::Never),
            unknown => Err(format!(
                "unknown restart policy `{}`. Valid policies: always, on-failure, unless-stopped, no",
                unknown
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::UnlessStopped => "unless-stopped",
            Self::Never => "no",
        }
    }
}

impl fmt::Display for RestartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for RestartMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RestartMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RestartMode::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Restart configuration - supports both simple and extended forms
///
/// Simple form: `restart: on-failure`
/// Extended form: `restart: { policy: on-failure, max_attempts: 3, backoff: [1s, 2s] }`
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum RestartConfig {
    Simple(RestartMode),
    Extended {
        #[serde(default)]
        policy: RestartMode,
        #[serde(default)]
        max_attempts: u32,
        #[serde(
            default,
            serialize_with = "serialize_duration_list",
            skip_serializing_if = "Vec::is_empty"
        )]
        backoff: Vec<Duration>,
    },
}

#[derive(Deserialize)]
struct ExtendedRestart {
    #[serde(default)]
    policy: RestartMode,
    #[serde(default)]
    max_attempts: u32,
    #[serde(default, deserialize_with = "deserialize_duration_list")]
    backoff: Vec<Duration>,
}

impl<'de> Deserialize<'de> for RestartConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(s) => RestartMode::parse(&s)
                .map(RestartConfig::Simple)
                .map_err(serde::de::Error::custom),
            serde_yaml::Value::Mapping(_) => {
                let ext: ExtendedRestart =
                    serde_yaml::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(RestartConfig::Extended {
                    policy: ext.policy,
                    max_attempts: ext.max_attempts,
                    backoff: ext.backoff,
                })
            }
            serde_yaml::Value::Null => Ok(RestartConfig::default()),
            other => Err(serde::de::Error::custom(format!(
                "restart must be a policy string or a mapping, got {:?}",
                other
            ))),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig::Simple(RestartMode::Never)
    }
}

impl RestartConfig {
    pub fn mode(&self) -> RestartMode {
        match self {
            RestartConfig::Simple(mode) => *mode,
            RestartConfig::Extended { policy, .. } => *policy,
        }
    }

    /// Maximum restart attempts; 0 means unlimited.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RestartConfig::Simple(_) => 0,
            RestartConfig::Extended { max_attempts, .. } => *max_attempts,
        }
    }

    /// Backoff schedule, falling back to the default when none is configured.
    pub fn backoff(&self) -> Vec<Duration> {
        match self {
            RestartConfig::Extended { backoff, .. } if !backoff.is_empty() => backoff.clone(),
            _ => default_backoff(),
        }
    }
}
