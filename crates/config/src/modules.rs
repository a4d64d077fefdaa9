//! Typed comparator module configuration
//!
//! Every module gets its own `ModuleConfig<S>` keyed by the module name, so a
//! malformed settings table is rejected when the file is loaded instead of when
//! the module first runs.

use serde::{Deserialize, Serialize};

pub const MODULE_NAME_AGE: &str = "AgeModule";
pub const MODULE_NAME_AUDIO: &str = "AudioModule";
pub const MODULE_NAME_LENGTH: &str = "LengthModule";
pub const MODULE_NAME_LOGMATCH: &str = "LogMatchModule";
pub const MODULE_NAME_MAXSIZE: &str = "MaxSizeModule";
pub const MODULE_NAME_RESOLUTION: &str = "ResolutionModule";
pub const MODULE_NAME_SIZEAPPROX: &str = "SizeApproxModule";
pub const MODULE_NAME_LEGACY: &str = "LegacyModule";
pub const MODULE_NAME_ERRORSKIP: &str = "ErrorSkipModule";
pub const MODULE_NAME_ERRORREPLACE: &str = "ErrorReplaceModule";
pub const MODULE_NAME_DUPLICATELENGTHCHECK: &str = "DuplicateLengthCheckModule";

/// Enabled flag, priority and module specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig<S> {
    #[serde(default)]
    pub enabled: bool,
    /// Higher priorities run first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub settings: S,
}

impl<S: Default> Default for ModuleConfig<S> {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: 0,
            settings: S::default(),
        }
    }
}

impl<S> ModuleConfig<S> {
    /// Enabled module with the given priority and settings
    pub fn enabled(priority: i32, settings: S) -> Self {
        Self {
            enabled: true,
            priority,
            settings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgeSettings {
    /// Duplicates modified within this many hours are kept
    pub max_age: u32,
}

impl Default for AgeSettings {
    fn default() -> Self {
        Self { max_age: 90 }
    }
}

/// How confident the audio classification must be before it counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioAccuracy {
    Low,
    #[default]
    Med,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AudioSettings {
    #[serde(default)]
    pub accuracy: AudioAccuracy,
}

/// Threshold of the error-replace and duplicate-length checks, off by default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdSettings {
    pub threshold: u32,
}

impl ThresholdSettings {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self { threshold: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LengthSettings {
    /// Tolerated shortfall against the EPG length in percent
    pub threshold: u32,
}

impl LengthSettings {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }
}

impl Default for LengthSettings {
    fn default() -> Self {
        Self { threshold: 25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorSkipSettings {
    /// Recordings with more tuner errors than this are skipped
    pub threshold: u32,
}

impl ErrorSkipSettings {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }
}

impl Default for ErrorSkipSettings {
    fn default() -> Self {
        Self { threshold: 3 }
    }
}

/// Precedence between include and exclude hits in the duplicate's logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogMatchMode {
    /// Include hits win over exclude hits
    Include,
    /// Include and exclude hits cancel each other out
    #[default]
    Neutral,
    /// Exclude hits win over include hits
    Exclude,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LogMatchSettings {
    #[serde(default)]
    pub mode: LogMatchMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaxSizeSettings {
    /// Maximum source size in GiB
    pub max_size: u64,
}

impl Default for MaxSizeSettings {
    fn default() -> Self {
        Self { max_size: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolutionSettings {
    /// Minimum pixel count improvement in percentage points
    pub min_resolution: u32,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self { min_resolution: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizeApproxSettings {
    /// Required size difference in percent before replacing
    pub difference: i64,
    /// Number of sampled slices
    pub sample_count: u32,
    /// Length of each slice as a percentage of the recording
    pub fraction: u32,
}

impl Default for SizeApproxSettings {
    fn default() -> Self {
        Self {
            difference: 20,
            sample_count: 2,
            fraction: 5,
        }
    }
}

/// Unit settings for modules without tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct NoSettings {}

/// Configuration of every comparator module
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModulesConfig {
    #[serde(rename = "AgeModule", default)]
    pub age: ModuleConfig<AgeSettings>,
    #[serde(rename = "AudioModule", default)]
    pub audio: ModuleConfig<AudioSettings>,
    #[serde(rename = "LengthModule", default)]
    pub length: ModuleConfig<LengthSettings>,
    #[serde(rename = "LogMatchModule", default)]
    pub log_match: ModuleConfig<LogMatchSettings>,
    #[serde(rename = "MaxSizeModule", default)]
    pub max_size: ModuleConfig<MaxSizeSettings>,
    #[serde(rename = "ResolutionModule", default)]
    pub resolution: ModuleConfig<ResolutionSettings>,
    #[serde(rename = "SizeApproxModule", default)]
    pub size_approx: ModuleConfig<SizeApproxSettings>,
    #[serde(rename = "LegacyModule", default)]
    pub legacy: ModuleConfig<NoSettings>,
    #[serde(rename = "ErrorSkipModule", default)]
    pub error_skip: ModuleConfig<ErrorSkipSettings>,
    #[serde(rename = "ErrorReplaceModule", default)]
    pub error_replace: ModuleConfig<ThresholdSettings>,
    #[serde(rename = "DuplicateLengthCheckModule", default)]
    pub duplicate_length_check: ModuleConfig<ThresholdSettings>,
}
