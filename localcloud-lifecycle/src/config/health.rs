//! Health check and resource threshold configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration::{deserialize_duration, serialize_duration};

/// Health check configuration for a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timeout: default_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_failure_threshold() -> u32 {
    3
}

/// Percent thresholds for resource alerts. Values are compared with `>`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    #[serde(default = "default_memory_warning")]
    pub memory_warning: f64,
    #[serde(default = "default_memory_critical")]
    pub memory_critical: f64,
    #[serde(default = "default_cpu_warning")]
    pub cpu_warning: f64,
    #[serde(default = "default_disk_warning")]
    pub disk_warning: f64,
    #[serde(default = "default_disk_critical")]
    pub disk_critical: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_warning: default_memory_warning(),
            memory_critical: default_memory_critical(),
            cpu_warning: default_cpu_warning(),
            disk_warning: default_disk_warning(),
            disk_critical: default_disk_critical(),
        }
    }
}

fn default_memory_warning() -> f64 {
    80.0
}

fn default_memory_critical() -> f64 {
    90.0
}

fn default_cpu_warning() -> f64 {
    90.0
}

fn default_disk_warning() -> f64 {
    80.0
}

fn default_disk_critical() -> f64 {
    90.0
}
