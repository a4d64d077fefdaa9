//! Comparator pipeline
//!
//! Independent decision modules, each enabled and prioritised on its own.
//! Standalone modules judge a single recording, duplicate modules judge a
//! recording against an already encoded file with the same output name. A
//! pass stops at the first module that returns something other than
//! `NoChange`.

use crate::config::{Config, ModuleConfig};
use crate::encode::Encoder;
use crate::media::MediaFile;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{info, warn};

/// Implements [`Module`] for a module holding `config: Option<ModuleConfig<_>>`.
macro_rules! impl_module {
    ($ty:ident, $name:expr, $field:ident) => {
        impl $crate::comparator::Module for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn priority(&self) -> i32 {
                $crate::comparator::priority_of(&self.config)
            }

            fn init(&mut self, config: &$crate::config::Config) {
                self.config = Some(config.modules.$field.clone());
            }
        }
    };
}

pub mod duplicate;
pub mod size_approx;
pub mod standalone;

pub use duplicate::{
    AgeModule, AudioModule, DuplicateLengthCheckModule, ErrorReplaceModule, LegacyModule,
    LogMatchModule, ResolutionModule,
};
pub use size_approx::{plan_samples, SampleSlice, SizeApproxModule};
pub use standalone::{ErrorSkipModule, LengthModule, MaxSizeModule};

/// Name recorded when the manual override short-circuits a pass
pub const MANUAL_OVERRIDE: &str = "AllowReplacement";

/// Outcome of a module or a whole pass.
///
/// In a duplicate pass `Discard` means the existing file is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoChange,
    Replace,
    Discard,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::NoChange => write!(f, "NoChange"),
            Verdict::Replace => write!(f, "Replace"),
            Verdict::Discard => write!(f, "Discard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleResult {
    pub verdict: Verdict,
    pub reason: String,
}

impl ModuleResult {
    pub fn no_change(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::NoChange,
            reason: reason.into(),
        }
    }

    pub fn replace(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Replace,
            reason: reason.into(),
        }
    }

    pub fn discard(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Discard,
            reason: reason.into(),
        }
    }
}

/// Common part of every comparator module.
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher runs first; -1 before `init`.
    fn priority(&self) -> i32;

    fn init(&mut self, config: &Config);
}

/// Judges one recording on its own.
pub trait StandaloneModule: Module {
    fn run(&self, file: &MediaFile) -> ModuleResult;
}

/// Judges a new recording against an existing duplicate.
pub trait DuplicateModule: Module {
    fn run(&self, new: &MediaFile, duplicate: &MediaFile) -> ModuleResult;
}

pub(crate) fn priority_of<S>(config: &Option<ModuleConfig<S>>) -> i32 {
    config.as_ref().map(|c| c.priority).unwrap_or(-1)
}

/// Settings of an enabled module, or the result to return right away.
pub(crate) fn enabled_settings<'a, S>(
    name: &str,
    config: &'a Option<ModuleConfig<S>>,
) -> Result<&'a S, ModuleResult> {
    match config {
        None => {
            warn!("{}: run before init, treating as disabled", name);
            Err(ModuleResult::no_change("err no init"))
        }
        Some(c) if !c.enabled => Err(ModuleResult::no_change("disabled")),
        Some(c) => Ok(&c.settings),
    }
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReport {
    pub module: &'static str,
    pub verdict: Verdict,
    pub reason: String,
}

impl std::fmt::Display for ModuleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} - {}", self.module, self.verdict, self.reason)
    }
}

/// Result of a whole pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub verdict: Verdict,
    /// Module that decided the pass, `None` when every module returned `NoChange`
    pub decided_by: Option<&'static str>,
    pub reason: String,
    /// Every module that ran, in order
    pub reports: Vec<ModuleReport>,
}

impl PassOutcome {
    fn manual_override() -> Self {
        Self {
            verdict: Verdict::Replace,
            decided_by: Some(MANUAL_OVERRIDE),
            reason: "manual user override".to_string(),
            reports: Vec::new(),
        }
    }

    /// `Module: Verdict - reason` of the deciding module.
    pub fn justification(&self) -> String {
        format!(
            "{}: {} - {}",
            self.decided_by.unwrap_or("none"),
            self.verdict,
            self.reason
        )
    }
}

/// The fixed module set, initialised and sorted by descending priority.
pub struct Pipeline {
    standalone: Vec<Box<dyn StandaloneModule>>,
    duplicate: Vec<Box<dyn DuplicateModule>>,
}

impl Pipeline {
    pub fn new(config: &Config, encoder: Arc<dyn Encoder>) -> Self {
        let (standalone, duplicate) = registered_modules(encoder);
        Self::with_modules(config, standalone, duplicate)
    }

    /// Initialise and sort an arbitrary module set. Ties keep registration order.
    pub fn with_modules(
        config: &Config,
        mut standalone: Vec<Box<dyn StandaloneModule>>,
        mut duplicate: Vec<Box<dyn DuplicateModule>>,
    ) -> Self {
        for module in standalone.iter_mut() {
            module.init(config);
        }
        for module in duplicate.iter_mut() {
            module.init(config);
        }
        standalone.sort_by_key(|m| Reverse(m.priority()));
        duplicate.sort_by_key(|m| Reverse(m.priority()));
        Self {
            standalone,
            duplicate,
        }
    }

    pub fn standalone_order(&self) -> Vec<&'static str> {
        self.standalone.iter().map(|m| m.name()).collect()
    }

    pub fn duplicate_order(&self) -> Vec<&'static str> {
        self.duplicate.iter().map(|m| m.name()).collect()
    }

    pub fn run_standalone(&self, file: &MediaFile) -> PassOutcome {
        if file.allow_replacement {
            info!("modules: manual user override, allow replacement");
            return PassOutcome::manual_override();
        }
        run_pass(self.standalone.iter().map(|m| (m.name(), m.run(file))))
    }

    pub fn run_duplicate(&self, new: &MediaFile, duplicate: &MediaFile) -> PassOutcome {
        if new.allow_replacement {
            info!("dupe modules: manual user override, allow replacement");
            return PassOutcome::manual_override();
        }
        run_pass(
            self.duplicate
                .iter()
                .map(|m| (m.name(), m.run(new, duplicate))),
        )
    }
}

/// Every module in registration order, not yet initialised.
pub(crate) fn registered_modules(
    encoder: Arc<dyn Encoder>,
) -> (Vec<Box<dyn StandaloneModule>>, Vec<Box<dyn DuplicateModule>>) {
    let standalone: Vec<Box<dyn StandaloneModule>> = vec![
        Box::new(LengthModule::default()),
        Box::new(MaxSizeModule::default()),
        Box::new(ErrorSkipModule::default()),
    ];
    let duplicate: Vec<Box<dyn DuplicateModule>> = vec![
        Box::new(DuplicateLengthCheckModule::default()),
        Box::new(ErrorReplaceModule::default()),
        Box::new(LegacyModule::default()),
        Box::new(AgeModule::default()),
        Box::new(AudioModule::default()),
        Box::new(ResolutionModule::default()),
        Box::new(LogMatchModule::default()),
        Box::new(SizeApproxModule::new(encoder)),
    ];
    (standalone, duplicate)
}

/// Consume results lazily so nothing runs after the deciding module.
fn run_pass(results: impl Iterator<Item = (&'static str, ModuleResult)>) -> PassOutcome {
    let mut reports = Vec::new();
    for (module, result) in results {
        info!("{}: {} - {}", module, result.verdict, result.reason);
        reports.push(ModuleReport {
            module,
            verdict: result.verdict,
            reason: result.reason.clone(),
        });
        if result.verdict != Verdict::NoChange {
            return PassOutcome {
                verdict: result.verdict,
                decided_by: Some(module),
                reason: result.reason,
                reports,
            };
        }
    }
    PassOutcome {
        verdict: Verdict::NoChange,
        decided_by: None,
        reason: String::new(),
        reports,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::encode::{EncodeError, EncodeRequest, EncodeStats};
    use crate::media::{AudioFormat, Resolution};
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Module with a fixed priority and verdict that counts its invocations.
    pub(crate) struct Fixed {
        pub name: &'static str,
        pub priority: i32,
        pub verdict: Verdict,
        pub calls: Arc<AtomicUsize>,
    }

    impl Fixed {
        pub fn boxed(name: &'static str, priority: i32, verdict: Verdict) -> (Box<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let module = Box::new(Self {
                name,
                priority,
                verdict,
                calls: calls.clone(),
            });
            (module, calls)
        }

        fn result(&self) -> ModuleResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ModuleResult {
                verdict: self.verdict,
                reason: format!("{} says so", self.name),
            }
        }
    }

    impl Module for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn init(&mut self, _config: &Config) {}
    }

    impl StandaloneModule for Fixed {
        fn run(&self, _file: &MediaFile) -> ModuleResult {
            self.result()
        }
    }

    impl DuplicateModule for Fixed {
        fn run(&self, _new: &MediaFile, _duplicate: &MediaFile) -> ModuleResult {
            self.result()
        }
    }

    /// Encoder that fails every request and counts them.
    #[derive(Default)]
    struct CountingEncoder {
        calls: AtomicUsize,
    }

    impl Encoder for CountingEncoder {
        fn encode(&self, _request: &EncodeRequest<'_>) -> Result<EncodeStats, EncodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EncodeError::NoEncoderConfig(String::new()))
        }
    }

    fn audio_format() -> impl Strategy<Value = AudioFormat> {
        prop::sample::select(vec![
            AudioFormat::Stereo,
            AudioFormat::StereoProbably,
            AudioFormat::StereoMaybe,
            AudioFormat::Unknown,
            AudioFormat::MultiMaybe,
            AudioFormat::MultiProbably,
            AudioFormat::Multi,
        ])
    }

    const NAMES: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

    // **Feature: avior, Property 1: Pipeline ordering is stable and descending**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_pipeline_sorted_descending_and_stable(priorities in prop::collection::vec(-3i32..3, 1..6)) {
            let modules: Vec<Box<dyn StandaloneModule>> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| Fixed::boxed(NAMES[i], *p, Verdict::NoChange).0 as Box<dyn StandaloneModule>)
                .collect();
            let pipeline = Pipeline::with_modules(&Config::default(), modules, Vec::new());
            let order = pipeline.standalone_order();

            let index_of = |name: &str| NAMES.iter().position(|n| *n == name).unwrap();
            for pair in order.windows(2) {
                let (a, b) = (index_of(pair[0]), index_of(pair[1]));
                prop_assert!(priorities[a] >= priorities[b]);
                if priorities[a] == priorities[b] {
                    prop_assert!(a < b, "ties must keep registration order");
                }
            }
        }

        #[test]
        fn prop_disabled_modules_never_decide(
            length in -1i64..300,
            recorded in -1i64..300,
            errors in -1i64..100,
            priority in -5i32..5,
            new_audio in audio_format(),
            dup_audio in audio_format(),
            new_res in prop::sample::select(vec!["720x576", "1280x720", "1920x1080", "broken"]),
            dup_res in prop::sample::select(vec!["720x576", "1280x720", "1920x1080", "broken"]),
        ) {
            let mut config = Config::default();
            config.terms.log_include = vec!["HD".to_string()];
            config.terms.log_exclude = vec!["SD".to_string()];
            config.modules.length.priority = priority;
            config.modules.age.priority = priority;
            config.modules.size_approx.priority = -priority;
            let encoder = Arc::new(CountingEncoder::default());
            let pipeline = Pipeline::new(&config, encoder.clone());

            let mut file = MediaFile::from_path("/nonexistent/rec/a.ts");
            file.length = length;
            file.recorded_length = recorded;
            file.errors = errors;
            file.audio = new_audio;
            file.resolution = Resolution::new("tag", new_res);
            let mut dup = file.clone();
            dup.path = PathBuf::from("/nonexistent/lib/a.mkv");
            dup.legacy = true;
            dup.errors = errors + 10;
            dup.audio = dup_audio;
            dup.resolution = Resolution::new("tag", dup_res);
            dup.tuner_log = vec!["HD SD".to_string()];

            let standalone = pipeline.run_standalone(&file);
            prop_assert_eq!(standalone.verdict, Verdict::NoChange);
            prop_assert_eq!(standalone.reports.len(), 3);
            prop_assert!(standalone.reports.iter().all(|r| r.reason == "disabled"));

            let duplicate = pipeline.run_duplicate(&file, &dup);
            prop_assert_eq!(duplicate.verdict, Verdict::NoChange);
            prop_assert_eq!(duplicate.reports.len(), 8);
            prop_assert!(duplicate.reports.iter().all(|r| r.reason == "disabled"));
            prop_assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn prop_uninitialised_modules_never_decide(
            errors in -1i64..100,
            new_audio in audio_format(),
            dup_audio in audio_format(),
        ) {
            let encoder = Arc::new(CountingEncoder::default());
            let (standalone, duplicate) = registered_modules(encoder.clone());
            let mut file = MediaFile::from_path("/nonexistent/rec/a.ts");
            file.errors = errors;
            file.audio = new_audio;
            let mut dup = file.clone();
            dup.legacy = true;
            dup.audio = dup_audio;

            for module in &standalone {
                prop_assert_eq!(module.run(&file), ModuleResult::no_change("err no init"));
            }
            for module in &duplicate {
                prop_assert_eq!(module.run(&file, &dup), ModuleResult::no_change("err no init"));
            }
            prop_assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_short_circuit_on_first_decision() {
        let (first, first_calls) = Fixed::boxed("First", 3, Verdict::NoChange);
        let (second, second_calls) = Fixed::boxed("Second", 2, Verdict::Discard);
        let (third, third_calls) = Fixed::boxed("Third", 1, Verdict::Replace);
        let pipeline = Pipeline::with_modules(
            &Config::default(),
            vec![third, first, second],
            Vec::new(),
        );

        let outcome = pipeline.run_standalone(&MediaFile::from_path("/rec/a.ts"));
        assert_eq!(outcome.verdict, Verdict::Discard);
        assert_eq!(outcome.decided_by, Some("Second"));
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
        assert!(!outcome.reports.iter().any(|r| r.module == "Third"));
    }

    #[test]
    fn test_manual_override_skips_modules() {
        let (module, calls) = Fixed::boxed("Discarder", 1, Verdict::Discard);
        let pipeline = Pipeline::with_modules(&Config::default(), Vec::new(), vec![module]);
        let mut file = MediaFile::from_path("/rec/a.ts");
        file.allow_replacement = true;

        let outcome = pipeline.run_duplicate(&file, &MediaFile::from_path("/lib/a.mkv"));
        assert_eq!(outcome.verdict, Verdict::Replace);
        assert_eq!(outcome.decided_by, Some(MANUAL_OVERRIDE));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_all_no_change() {
        let (a, _) = Fixed::boxed("A", 0, Verdict::NoChange);
        let (b, _) = Fixed::boxed("B", 0, Verdict::NoChange);
        let pipeline = Pipeline::with_modules(&Config::default(), Vec::new(), vec![a, b]);
        let outcome = pipeline.run_duplicate(
            &MediaFile::from_path("/rec/a.ts"),
            &MediaFile::from_path("/lib/a.mkv"),
        );
        assert_eq!(outcome.verdict, Verdict::NoChange);
        assert!(outcome.decided_by.is_none());
        assert_eq!(outcome.reports.len(), 2);
    }

    #[test]
    fn test_uninitialised_module_is_disabled() {
        let module = LengthModule::default();
        assert_eq!(module.priority(), -1);
        let result = StandaloneModule::run(&module, &MediaFile::from_path("/rec/a.ts"));
        assert_eq!(result, ModuleResult::no_change("err no init"));
    }

    #[test]
    fn test_default_registration_order() {
        let mut config = Config::default();
        config.modules.audio.priority = 5;
        let pipeline = Pipeline::new(&config, Arc::new(CountingEncoder::default()));
        assert_eq!(
            pipeline.standalone_order(),
            vec!["LengthModule", "MaxSizeModule", "ErrorSkipModule"]
        );
        assert_eq!(
            pipeline.duplicate_order(),
            vec![
                "AudioModule",
                "DuplicateLengthCheckModule",
                "ErrorReplaceModule",
                "LegacyModule",
                "AgeModule",
                "ResolutionModule",
                "LogMatchModule",
                "SizeApproxModule",
            ]
        );
    }
}
