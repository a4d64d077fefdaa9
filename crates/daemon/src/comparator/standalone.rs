//! Modules that judge a recording on its own.

use super::{enabled_settings, ModuleResult, StandaloneModule};
use crate::config::{
    ErrorSkipSettings, LengthSettings, MaxSizeSettings, ModuleConfig, MODULE_NAME_ERRORSKIP,
    MODULE_NAME_LENGTH, MODULE_NAME_MAXSIZE,
};
use crate::media::MediaFile;
use std::fs;

const GIB: u64 = 1024 * 1024 * 1024;

/// Discards recordings that are too short compared to the EPG length.
#[derive(Debug, Default)]
pub struct LengthModule {
    config: Option<ModuleConfig<LengthSettings>>,
}

impl_module!(LengthModule, MODULE_NAME_LENGTH, length);

impl StandaloneModule for LengthModule {
    fn run(&self, file: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_LENGTH, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        if file.ignore_length {
            return ModuleResult::no_change("length check overridden by user");
        }
        match file.length_difference() {
            None => ModuleResult::no_change(format!(
                "length unknown ({}m/{}m)",
                file.recorded_length, file.length
            )),
            Some(diff) if diff > i64::from(settings.threshold) => ModuleResult::discard(format!(
                "recording is {}% shorter than announced, threshold {}%",
                diff, settings.threshold
            )),
            Some(diff) => ModuleResult::no_change(format!(
                "length difference {}% within threshold {}%",
                diff, settings.threshold
            )),
        }
    }
}

/// Discards sources larger than the configured size.
#[derive(Debug, Default)]
pub struct MaxSizeModule {
    config: Option<ModuleConfig<MaxSizeSettings>>,
}

impl_module!(MaxSizeModule, MODULE_NAME_MAXSIZE, max_size);

impl StandaloneModule for MaxSizeModule {
    fn run(&self, file: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_MAXSIZE, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        let size = match fs::metadata(&file.path) {
            Ok(meta) => meta.len(),
            Err(e) => return ModuleResult::no_change(format!("could not stat file: {}", e)),
        };
        let limit = settings.max_size.saturating_mul(GIB);
        if size > limit {
            ModuleResult::discard(format!(
                "file size {} bytes exceeds {} GiB",
                size, settings.max_size
            ))
        } else {
            ModuleResult::no_change(format!("file size within {} GiB", settings.max_size))
        }
    }
}

/// Discards recordings with too many tuner errors.
#[derive(Debug, Default)]
pub struct ErrorSkipModule {
    config: Option<ModuleConfig<ErrorSkipSettings>>,
}

impl_module!(ErrorSkipModule, MODULE_NAME_ERRORSKIP, error_skip);

impl StandaloneModule for ErrorSkipModule {
    fn run(&self, file: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_ERRORSKIP, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        if file.errors > i64::from(settings.threshold) {
            ModuleResult::discard(format!(
                "{} errors exceed threshold {}",
                file.errors, settings.threshold
            ))
        } else {
            ModuleResult::no_change(format!("{} errors", file.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{Module, Verdict};
    use crate::config::Config;
    use tempfile::TempDir;

    fn config_with(f: impl FnOnce(&mut Config)) -> Config {
        let mut config = Config::default();
        f(&mut config);
        config
    }

    fn lengths(recorded: i64, length: i64) -> MediaFile {
        let mut file = MediaFile::from_path("/rec/a.ts");
        file.recorded_length = recorded;
        file.length = length;
        file
    }

    #[test]
    fn test_length_module() {
        let config = config_with(|c| c.modules.length = ModuleConfig::enabled(0, LengthSettings::new(10)));
        let mut module = LengthModule::default();
        module.init(&config);

        assert_eq!(module.run(&lengths(90, 100)).verdict, Verdict::NoChange);
        assert_eq!(module.run(&lengths(80, 100)).verdict, Verdict::Discard);
        assert_eq!(module.run(&lengths(0, 100)).verdict, Verdict::Discard);
        assert_eq!(module.run(&lengths(90, -1)).verdict, Verdict::NoChange);
        assert_eq!(module.run(&lengths(90, 0)).verdict, Verdict::NoChange);

        let mut overridden = lengths(10, 100);
        overridden.ignore_length = true;
        assert_eq!(module.run(&overridden).verdict, Verdict::NoChange);
    }

    #[test]
    fn test_enabled_only_tables_use_default_thresholds() {
        let config = Config::parse_toml("[modules.LengthModule]\nenabled = true\n\n[modules.ErrorSkipModule]\nenabled = true\n")
            .unwrap();
        let mut length = LengthModule::default();
        length.init(&config);
        let mut error_skip = ErrorSkipModule::default();
        error_skip.init(&config);

        // 10 % short is inside the default 25 % tolerance
        assert_eq!(length.run(&lengths(90, 100)).verdict, Verdict::NoChange);
        assert_eq!(length.run(&lengths(70, 100)).verdict, Verdict::Discard);

        let mut file = MediaFile::from_path("/rec/a.ts");
        file.errors = 1;
        assert_eq!(error_skip.run(&file).verdict, Verdict::NoChange);
        file.errors = 4;
        assert_eq!(error_skip.run(&file).verdict, Verdict::Discard);
    }

    #[test]
    fn test_max_size_module() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.ts");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();

        let mut module = MaxSizeModule::default();
        module.init(&config_with(|c| c.modules.max_size = ModuleConfig::enabled(0, MaxSizeSettings { max_size: 0 })));
        assert_eq!(module.run(&MediaFile::from_path(&path)).verdict, Verdict::Discard);

        module.init(&config_with(|c| c.modules.max_size = ModuleConfig::enabled(0, MaxSizeSettings { max_size: 1 })));
        assert_eq!(module.run(&MediaFile::from_path(&path)).verdict, Verdict::NoChange);

        // missing file degrades to no change
        let missing = MediaFile::from_path(temp_dir.path().join("missing.ts"));
        assert_eq!(module.run(&missing).verdict, Verdict::NoChange);
    }

    #[test]
    fn test_error_skip_module() {
        let mut module = ErrorSkipModule::default();
        module.init(&config_with(|c| c.modules.error_skip.enabled = true));

        let mut file = MediaFile::from_path("/rec/a.ts");
        file.errors = 3;
        assert_eq!(module.run(&file).verdict, Verdict::NoChange);
        file.errors = 4;
        assert_eq!(module.run(&file).verdict, Verdict::Discard);
        file.errors = -1;
        assert_eq!(module.run(&file).verdict, Verdict::NoChange);
    }
}
