//! Core configuration structures and loading logic

use crate::modules::ModulesConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but holds unusable values
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Tags used to classify the audio track from tuner and metadata logs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AudioFormats {
    #[serde(default)]
    pub stereo_tags: Vec<String>,
    #[serde(default)]
    pub multi_tags: Vec<String>,
}

/// Term lists shared between all clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TermsConfig {
    /// Name prefixes stripped from the output name
    #[serde(default)]
    pub name_exclude: Vec<String>,
    /// Subtitle suffixes stripped from the output name
    #[serde(default)]
    pub sub_exclude: Vec<String>,
    #[serde(default)]
    pub log_include: Vec<String>,
    #[serde(default)]
    pub log_exclude: Vec<String>,
}

/// Shared library cache kept warm through job broadcasts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Lifetime of a full scan while broadcasts are active (seconds)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    /// Redis server carrying the broadcasts between hosts, e.g.
    /// `redis://cache.lan:6379/0`. Empty keeps them inside this process.
    #[serde(default)]
    pub redis_url: String,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_channel_prefix() -> String {
    "avior".to_string()
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            channel_prefix: default_channel_prefix(),
            redis_url: String::new(),
        }
    }
}

impl SharedCacheConfig {
    /// Name of the broadcast channel completed output paths are published on
    pub fn channel_name(&self) -> String {
        format!("{}-jobs", self.channel_prefix)
    }
}

/// Encoder arguments for one resolution tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EncoderConfig {
    #[serde(default)]
    pub out_directory: PathBuf,
    #[serde(default)]
    pub pre_arguments: Vec<String>,
    #[serde(default)]
    pub post_arguments: Vec<String>,
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderSection {
    /// Encoder executable (default "ffmpeg")
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    /// Encoder arguments keyed by resolution tag
    #[serde(default)]
    pub configs: BTreeMap<String, EncoderConfig>,
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            configs: BTreeMap::new(),
        }
    }
}

fn default_ext() -> String {
    ".mkv".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_resolutions() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("hd".to_string(), "1280x720".to_string()),
        ("fhd".to_string(), "1920x1080".to_string()),
    ])
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Library roots scanned for duplicates
    #[serde(default)]
    pub media_paths: Vec<PathBuf>,
    /// Extension of encoded output files, including the dot
    #[serde(default = "default_ext")]
    pub ext: String,
    /// Root for the `.obsolete` directory; empty means next to the duplicate
    #[serde(default)]
    pub obsolete_path: PathBuf,
    /// Directory holding `processed.log` and `skipped.log`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub pause_on_encode_error: bool,
    /// Resolution tag to `WIDTHxHEIGHT`
    #[serde(default = "default_resolutions")]
    pub resolutions: BTreeMap<String, String>,
    #[serde(default)]
    pub audio_formats: AudioFormats,
    #[serde(default)]
    pub terms: TermsConfig,
    #[serde(default)]
    pub shared_cache: SharedCacheConfig,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub modules: ModulesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_paths: Vec::new(),
            ext: default_ext(),
            obsolete_path: PathBuf::new(),
            log_dir: default_log_dir(),
            pause_on_encode_error: false,
            resolutions: default_resolutions(),
            audio_formats: AudioFormats::default(),
            terms: TermsConfig::default(),
            shared_cache: SharedCacheConfig::default(),
            encoder: EncoderSection::default(),
            modules: ModulesConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject values that would only fail once a job is running
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ext.is_empty() {
            return Err(ConfigError::Invalid("ext must not be empty".to_string()));
        }
        let size_approx = &self.modules.size_approx.settings;
        if size_approx.sample_count == 0 {
            return Err(ConfigError::Invalid(
                "SizeApproxModule sample_count must be at least 1".to_string(),
            ));
        }
        if size_approx.fraction == 0 || size_approx.fraction > 100 {
            return Err(ConfigError::Invalid(format!(
                "SizeApproxModule fraction must be within 1..=100, got {}",
                size_approx.fraction
            )));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - AVIOR_MEDIA_PATHS -> media_paths (comma separated)
    /// - AVIOR_PAUSE_ON_ENCODE_ERROR -> pause_on_encode_error
    /// - AVIOR_CACHE_TTL_SECS -> shared_cache.cache_ttl_secs
    /// - AVIOR_SHARED_CACHE -> shared_cache.enabled
    /// - AVIOR_REDIS_URL -> shared_cache.redis_url
    /// - AVIOR_LOG_DIR -> log_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("AVIOR_MEDIA_PATHS") {
            self.media_paths = val
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Ok(val) = env::var("AVIOR_PAUSE_ON_ENCODE_ERROR") {
            if let Some(flag) = parse_bool(&val) {
                self.pause_on_encode_error = flag;
            }
        }

        if let Ok(val) = env::var("AVIOR_CACHE_TTL_SECS") {
            if let Ok(ttl) = val.parse::<u64>() {
                self.shared_cache.cache_ttl_secs = ttl;
            }
        }

        if let Ok(val) = env::var("AVIOR_SHARED_CACHE") {
            if let Some(flag) = parse_bool(&val) {
                self.shared_cache.enabled = flag;
            }
        }

        if let Ok(val) = env::var("AVIOR_REDIS_URL") {
            self.shared_cache.redis_url = val.trim().to_string();
        }

        if let Ok(val) = env::var("AVIOR_LOG_DIR") {
            if !val.is_empty() {
                self.log_dir = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{AudioAccuracy, LogMatchMode};
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("AVIOR_MEDIA_PATHS");
        env::remove_var("AVIOR_PAUSE_ON_ENCODE_ERROR");
        env::remove_var("AVIOR_CACHE_TTL_SECS");
        env::remove_var("AVIOR_SHARED_CACHE");
        env::remove_var("AVIOR_REDIS_URL");
        env::remove_var("AVIOR_LOG_DIR");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            ext in "\\.[a-z0-9]{2,4}",
            ttl in 1u64..100_000,
            pause in proptest::bool::ANY,
            min_resolution in 0u32..200,
            priority in -10i32..10,
        ) {
            let toml_str = format!(
                r#"
media_paths = ["/media/a", "/media/b"]
ext = "{}"
pause_on_encode_error = {}

[shared_cache]
enabled = true
cache_ttl_secs = {}

[modules.ResolutionModule]
enabled = true
priority = {}

[modules.ResolutionModule.settings]
min_resolution = {}
"#,
                ext, pause, ttl, priority, min_resolution
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.ext, &ext);
            prop_assert_eq!(config.media_paths.len(), 2);
            prop_assert_eq!(config.pause_on_encode_error, pause);
            prop_assert!(config.shared_cache.enabled);
            prop_assert_eq!(config.shared_cache.cache_ttl_secs, ttl);
            prop_assert!(config.modules.resolution.enabled);
            prop_assert_eq!(config.modules.resolution.priority, priority);
            prop_assert_eq!(config.modules.resolution.settings.min_resolution, min_resolution);
        }

        #[test]
        fn prop_env_overrides_cache_ttl(
            initial_ttl in 1u64..10_000,
            override_ttl in 1u64..100_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[shared_cache]
cache_ttl_secs = {}
"#,
                initial_ttl
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("AVIOR_CACHE_TTL_SECS", override_ttl.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.shared_cache.cache_ttl_secs, override_ttl);
        }

        #[test]
        fn prop_env_overrides_pause_on_encode_error(
            initial in proptest::bool::ANY,
            override_flag in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("pause_on_encode_error = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("AVIOR_PAUSE_ON_ENCODE_ERROR", override_flag.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.pause_on_encode_error, override_flag);
        }
    }

    #[test]
    fn test_env_overrides_media_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("AVIOR_MEDIA_PATHS", "/srv/a, /srv/b,,");
        env::set_var("AVIOR_SHARED_CACHE", "yes");
        env::set_var("AVIOR_REDIS_URL", " redis://cache.lan:6379/0 ");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(
            config.media_paths,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
        assert!(config.shared_cache.enabled);
        assert_eq!(config.shared_cache.redis_url, "redis://cache.lan:6379/0");
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        config.pause_on_encode_error = true;
        env::set_var("AVIOR_PAUSE_ON_ENCODE_ERROR", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.pause_on_encode_error);
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config, Config::default());
        assert_eq!(config.ext, ".mkv");
        assert_eq!(config.log_dir, PathBuf::from("log"));
        assert_eq!(config.resolutions.get("fhd").map(String::as_str), Some("1920x1080"));
        assert_eq!(config.encoder.binary, "ffmpeg");
        assert_eq!(config.shared_cache.channel_name(), "avior-jobs");
        assert!(!config.shared_cache.enabled);
        assert_eq!(config.modules.audio.settings.accuracy, AudioAccuracy::Med);
        assert_eq!(config.modules.log_match.settings.mode, LogMatchMode::Neutral);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_encoder_configs_by_tag() {
        let toml_str = r#"
[encoder.configs.fhd]
out_directory = "/out/fhd"
pre_arguments = ["-hide_banner"]
post_arguments = ["-c:v libx265", "-crf 22"]
"#;
        let config = Config::parse_toml(toml_str).expect("encoder section parses");
        let fhd = config.encoder.configs.get("fhd").expect("fhd config");
        assert_eq!(fhd.out_directory, PathBuf::from("/out/fhd"));
        assert_eq!(fhd.post_arguments.len(), 2);
    }

    #[test]
    fn test_validate_rejects_zero_samples() {
        let mut config = Config::default();
        config.modules.size_approx.settings.sample_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_fraction_out_of_range() {
        let mut config = Config::default();
        config.modules.size_approx.settings.fraction = 101;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Config::load("/nonexistent/avior/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
