//! Modules that compare a new recording with an existing duplicate.
//!
//! `Replace` supersedes the duplicate, `Discard` keeps it and drops the new
//! recording.

use super::{enabled_settings, DuplicateModule, Module, ModuleResult};
use crate::config::{
    AgeSettings, AudioAccuracy, AudioSettings, Config, LogMatchMode, LogMatchSettings,
    ModuleConfig, NoSettings, ResolutionSettings, ThresholdSettings, MODULE_NAME_AGE,
    MODULE_NAME_AUDIO, MODULE_NAME_DUPLICATELENGTHCHECK, MODULE_NAME_ERRORREPLACE,
    MODULE_NAME_LEGACY, MODULE_NAME_LOGMATCH, MODULE_NAME_RESOLUTION,
};
use crate::media::{AudioFormat, MediaFile};
use std::fs;
use std::time::{Duration, SystemTime};

/// Keeps the duplicate when the new recording is noticeably shorter.
#[derive(Debug, Default)]
pub struct DuplicateLengthCheckModule {
    config: Option<ModuleConfig<ThresholdSettings>>,
}

impl_module!(
    DuplicateLengthCheckModule,
    MODULE_NAME_DUPLICATELENGTHCHECK,
    duplicate_length_check
);

impl DuplicateModule for DuplicateLengthCheckModule {
    fn run(&self, new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_DUPLICATELENGTHCHECK, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        if new.recorded_length < 0 || duplicate.recorded_length <= 0 {
            return ModuleResult::no_change("recorded length unknown");
        }
        let shortfall =
            (1.0 - new.recorded_length as f64 / duplicate.recorded_length as f64) * 100.0;
        if shortfall > f64::from(settings.threshold) {
            ModuleResult::discard(format!(
                "new recording is {:.1}% shorter than the duplicate, threshold {}%",
                shortfall, settings.threshold
            ))
        } else {
            ModuleResult::no_change(format!(
                "recorded lengths {}m/{}m",
                new.recorded_length, duplicate.recorded_length
            ))
        }
    }
}

/// Replaces a duplicate that had more tuner errors than the new recording.
#[derive(Debug, Default)]
pub struct ErrorReplaceModule {
    config: Option<ModuleConfig<ThresholdSettings>>,
}

impl_module!(ErrorReplaceModule, MODULE_NAME_ERRORREPLACE, error_replace);

impl DuplicateModule for ErrorReplaceModule {
    fn run(&self, new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_ERRORREPLACE, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        if duplicate.errors > i64::from(settings.threshold)
            && new.errors >= 0
            && new.errors < duplicate.errors
        {
            ModuleResult::replace(format!(
                "duplicate has {} errors, new recording {}",
                duplicate.errors, new.errors
            ))
        } else {
            ModuleResult::no_change(format!(
                "errors new/duplicate {}/{}",
                new.errors, duplicate.errors
            ))
        }
    }
}

/// Replaces duplicates that only carry a legacy log.
#[derive(Debug, Default)]
pub struct LegacyModule {
    config: Option<ModuleConfig<NoSettings>>,
}

impl_module!(LegacyModule, MODULE_NAME_LEGACY, legacy);

impl DuplicateModule for LegacyModule {
    fn run(&self, _new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        if let Err(result) = enabled_settings(MODULE_NAME_LEGACY, &self.config) {
            return result;
        }
        if duplicate.legacy {
            ModuleResult::replace("duplicate has a legacy log")
        } else {
            ModuleResult::no_change("duplicate is not legacy")
        }
    }
}

/// Keeps duplicates that were written recently.
#[derive(Debug, Default)]
pub struct AgeModule {
    config: Option<ModuleConfig<AgeSettings>>,
}

impl_module!(AgeModule, MODULE_NAME_AGE, age);

impl DuplicateModule for AgeModule {
    fn run(&self, _new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_AGE, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        let modified = match fs::metadata(&duplicate.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => return ModuleResult::no_change(format!("could not stat duplicate: {}", e)),
        };
        let max_age = Duration::from_secs(u64::from(settings.max_age) * 3600);
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if modified > cutoff {
            ModuleResult::discard(format!(
                "duplicate is younger than {} hours",
                settings.max_age
            ))
        } else {
            ModuleResult::no_change(format!("duplicate is older than {} hours", settings.max_age))
        }
    }
}

/// Prefers multichannel audio, at the configured confidence.
#[derive(Debug, Default)]
pub struct AudioModule {
    config: Option<ModuleConfig<AudioSettings>>,
}

impl_module!(AudioModule, MODULE_NAME_AUDIO, audio);

/// Minimum absolute confidence for a classification to count.
fn required_confidence(accuracy: AudioAccuracy) -> i8 {
    match accuracy {
        AudioAccuracy::Low => 1,
        AudioAccuracy::Med => 2,
        AudioAccuracy::High => 3,
    }
}

impl DuplicateModule for AudioModule {
    fn run(&self, new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_AUDIO, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        if new.audio == AudioFormat::Unknown || duplicate.audio == AudioFormat::Unknown {
            return ModuleResult::discard(format!(
                "audio format unknown (new {}, duplicate {})",
                new.audio, duplicate.audio
            ));
        }
        let required = required_confidence(settings.accuracy);
        let is_multi = |f: AudioFormat| f.value() >= required;
        let is_stereo = |f: AudioFormat| f.value() <= -required;

        if is_multi(new.audio) && is_stereo(duplicate.audio) {
            ModuleResult::replace(format!(
                "new recording has multichannel audio ({} vs {})",
                new.audio, duplicate.audio
            ))
        } else if is_stereo(new.audio) && is_multi(duplicate.audio) {
            ModuleResult::discard(format!(
                "duplicate has multichannel audio ({} vs {})",
                new.audio, duplicate.audio
            ))
        } else {
            ModuleResult::no_change(format!(
                "no audio improvement ({} vs {})",
                new.audio, duplicate.audio
            ))
        }
    }
}

/// Replaces duplicates with a clearly lower resolution.
#[derive(Debug, Default)]
pub struct ResolutionModule {
    config: Option<ModuleConfig<ResolutionSettings>>,
}

impl_module!(ResolutionModule, MODULE_NAME_RESOLUTION, resolution);

impl DuplicateModule for ResolutionModule {
    fn run(&self, new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_RESOLUTION, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        let (Some(new_px), Some(dup_px)) = (new.resolution.pixels(), duplicate.resolution.pixels())
        else {
            return ModuleResult::no_change(format!(
                "resolution unknown (new '{}', duplicate '{}')",
                new.resolution.value, duplicate.resolution.value
            ));
        };
        if new_px == dup_px {
            return ModuleResult::no_change("resolution is the same");
        }
        if dup_px == 0 {
            return ModuleResult::replace("duplicate has no pixels");
        }
        let improvement = new_px as f64 / dup_px as f64 * 100.0 - 100.0;
        if improvement >= f64::from(settings.min_resolution) {
            ModuleResult::replace(format!(
                "resolution improved by {:.0}% ({} vs {})",
                improvement, new.resolution.value, duplicate.resolution.value
            ))
        } else if improvement > 0.0 {
            ModuleResult::no_change(format!(
                "resolution improvement {:.0}% is below {}%",
                improvement, settings.min_resolution
            ))
        } else {
            ModuleResult::discard(format!(
                "new resolution {} is lower than {}",
                new.resolution.value, duplicate.resolution.value
            ))
        }
    }
}

/// Matches the duplicate's logs against the include and exclude terms.
///
/// An include hit keeps the duplicate, an exclude hit replaces it.
#[derive(Debug, Default)]
pub struct LogMatchModule {
    config: Option<ModuleConfig<LogMatchSettings>>,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Module for LogMatchModule {
    fn name(&self) -> &'static str {
        MODULE_NAME_LOGMATCH
    }

    fn priority(&self) -> i32 {
        super::priority_of(&self.config)
    }

    fn init(&mut self, config: &Config) {
        self.config = Some(config.modules.log_match.clone());
        self.include = config.terms.log_include.clone();
        self.exclude = config.terms.log_exclude.clone();
    }
}

impl DuplicateModule for LogMatchModule {
    fn run(&self, _new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_LOGMATCH, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        let include = duplicate.logs_contain(&self.include, &[]);
        let exclude = duplicate.logs_contain(&self.exclude, &[]);

        match (include, exclude) {
            (Some(inc), Some(exc)) => match settings.mode {
                LogMatchMode::Include => {
                    ModuleResult::discard(format!("include term '{}' wins over '{}'", inc, exc))
                }
                LogMatchMode::Exclude => {
                    ModuleResult::replace(format!("exclude term '{}' wins over '{}'", exc, inc))
                }
                LogMatchMode::Neutral => ModuleResult::no_change(format!(
                    "include term '{}' and exclude term '{}' cancel out",
                    inc, exc
                )),
            },
            (Some(inc), None) => ModuleResult::discard(format!("include term '{}' found", inc)),
            (None, Some(exc)) => ModuleResult::replace(format!("exclude term '{}' found", exc)),
            (None, None) => ModuleResult::no_change("no log matches"),
        }
    }
}
