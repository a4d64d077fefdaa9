//! Size approximation through sampled partial encodes.
//!
//! A few evenly spaced slices of the new recording are encoded, their sizes
//! extrapolated to the full recorded length and the estimate compared with
//! the size of the duplicate on disk.

use super::{enabled_settings, DuplicateModule, ModuleResult};
use crate::config::{ModuleConfig, SizeApproxSettings, MODULE_NAME_SIZEAPPROX};
use crate::encode::{EncodeError, EncodeRequest, Encoder};
use crate::media::MediaFile;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shortest slice worth encoding, in seconds
const MIN_SLICE_SECS: u64 = 60;

/// One slice of the recording to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSlice {
    pub start_secs: u64,
    pub duration_secs: u64,
}

/// Evenly spaced slices, starting half an interval in.
///
/// A slice that would run past the end is pulled back to end with the
/// recording. Collapses into a single full-length slice once the samples would cover the
/// whole recording. `None` for unknown lengths or unusable settings.
pub fn plan_samples(recorded_minutes: i64, sample_count: u32, fraction: u32) -> Option<Vec<SampleSlice>> {
    if recorded_minutes <= 0 || sample_count == 0 || fraction == 0 || fraction > 100 {
        return None;
    }
    let minutes = recorded_minutes as u64;
    let total_secs = minutes.checked_mul(60)?;
    let slice_secs = total_secs
        .checked_mul(u64::from(fraction))?
        .div_ceil(100)
        .max(MIN_SLICE_SECS);

    if u64::from(sample_count).saturating_mul(slice_secs) >= total_secs {
        return Some(vec![SampleSlice {
            start_secs: 0,
            duration_secs: total_secs,
        }]);
    }

    let interval = total_secs / u64::from(sample_count);
    let last_start = total_secs - slice_secs;
    Some(
        (0..u64::from(sample_count))
            .map(|i| SampleSlice {
                start_secs: (interval / 2 + i * interval).min(last_start),
                duration_secs: slice_secs,
            })
            .collect(),
    )
}

/// Removes a sample file when dropped.
struct SampleFile(PathBuf);

impl SampleFile {
    fn size(&self) -> std::io::Result<u64> {
        fs::metadata(&self.0).map(|m| m.len())
    }
}

impl Drop for SampleFile {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = fs::remove_file(&self.0) {
                warn!("could not remove sample {}: {}", self.0.display(), e);
            }
        }
    }
}

/// Replaces the duplicate when re-encoding would make it clearly smaller.
pub struct SizeApproxModule {
    config: Option<ModuleConfig<SizeApproxSettings>>,
    encoder: Arc<dyn Encoder>,
}

impl SizeApproxModule {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self {
            config: None,
            encoder,
        }
    }

    /// Average sample size in bytes, samples deleted on return.
    fn average_sample_bytes(&self, file: &MediaFile, slices: &[SampleSlice]) -> Result<f64, String> {
        let mut total = 0u64;
        for slice in slices {
            let request = EncodeRequest::sample(file, slice.start_secs, slice.duration_secs);
            let sample = match self.encoder.encode(&request) {
                Ok(stats) => SampleFile(stats.output_path),
                Err(EncodeError::Failed(stats)) => {
                    drop(SampleFile(stats.output_path));
                    return Err(format!("sample encode failed with exit code {:?}", stats.exit_code));
                }
                Err(e) => return Err(format!("sample encode failed: {}", e)),
            };
            total += sample
                .size()
                .map_err(|e| format!("could not stat sample: {}", e))?;
        }
        Ok(total as f64 / slices.len() as f64)
    }
}

impl_module!(SizeApproxModule, MODULE_NAME_SIZEAPPROX, size_approx);

fn file_size(path: &Path) -> Result<u64, String> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| format!("could not stat duplicate: {}", e))
}

impl DuplicateModule for SizeApproxModule {
    fn run(&self, new: &MediaFile, duplicate: &MediaFile) -> ModuleResult {
        let settings = match enabled_settings(MODULE_NAME_SIZEAPPROX, &self.config) {
            Ok(s) => s,
            Err(result) => return result,
        };
        let Some(slices) = plan_samples(new.recorded_length, settings.sample_count, settings.fraction) else {
            return ModuleResult::no_change(format!(
                "cannot plan samples for {}m with {} x {}%",
                new.recorded_length, settings.sample_count, settings.fraction
            ));
        };
        let actual = match file_size(&duplicate.path) {
            Ok(0) => return ModuleResult::no_change("duplicate is empty"),
            Ok(size) => size as f64,
            Err(reason) => return ModuleResult::no_change(reason),
        };
        let average = match self.average_sample_bytes(new, &slices) {
            Ok(avg) => avg,
            Err(reason) => return ModuleResult::no_change(reason),
        };

        let slice_secs = slices[0].duration_secs as f64;
        let bytes_per_minute = average / slice_secs * 60.0;
        let estimated = bytes_per_minute * new.recorded_length as f64;
        let difference = 100.0 - estimated / actual * 100.0;
        debug!(
            "size estimate {:.0} bytes vs duplicate {:.0} bytes ({:.1}%)",
            estimated, actual, difference
        );

        if difference >= settings.difference as f64 {
            ModuleResult::replace(format!(
                "estimated size is {:.1}% smaller than the duplicate",
                difference
            ))
        } else if difference >= 0.0 {
            ModuleResult::no_change(format!(
                "estimated size is {:.1}% smaller, below {}%",
                difference, settings.difference
            ))
        } else {
            ModuleResult::discard(format!(
                "estimated size is {:.1}% larger than the duplicate",
                -difference
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{Module, Verdict};
    use crate::config::Config;
    use crate::encode::EncodeStats;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes `bytes_per_sec * duration` bytes per sample.
    struct SampleEncoder {
        dir: PathBuf,
        bytes_per_sec: u64,
        fail: bool,
        written: Mutex<Vec<PathBuf>>,
    }

    impl Encoder for SampleEncoder {
        fn encode(&self, request: &EncodeRequest<'_>) -> Result<EncodeStats, EncodeError> {
            let mut written = self.written.lock();
            let path = self.dir.join(format!("{}.estimate.mkv", written.len()));
            fs::write(&path, vec![0u8; (self.bytes_per_sec * request.duration_secs) as usize])?;
            written.push(path.clone());
            let stats = EncodeStats {
                success: !self.fail,
                duration: Duration::from_millis(1),
                exit_code: Some(if self.fail { 1 } else { 0 }),
                output_path: path,
                invocation: "fake".to_string(),
                output_tail: Vec::new(),
            };
            if self.fail {
                Err(EncodeError::Failed(stats))
            } else {
                Ok(stats)
            }
        }
    }

    fn setup(bytes_per_sec: u64, fail: bool, dup_bytes: usize) -> (TempDir, Arc<SampleEncoder>, MediaFile, MediaFile) {
        let temp_dir = TempDir::new().unwrap();
        let encoder = Arc::new(SampleEncoder {
            dir: temp_dir.path().to_path_buf(),
            bytes_per_sec,
            fail,
            written: Mutex::new(Vec::new()),
        });
        let dup_path = temp_dir.path().join("dup.mkv");
        fs::write(&dup_path, vec![0u8; dup_bytes]).unwrap();
        let mut new = MediaFile::from_path(temp_dir.path().join("new.ts"));
        new.recorded_length = 100;
        (temp_dir, encoder, new, MediaFile::from_path(dup_path))
    }

    fn module(encoder: Arc<SampleEncoder>) -> SizeApproxModule {
        let mut config = Config::default();
        config.modules.size_approx = ModuleConfig::enabled(0, SizeApproxSettings::default());
        let mut module = SizeApproxModule::new(encoder);
        module.init(&config);
        module
    }

    fn assert_samples_removed(encoder: &SampleEncoder) {
        let written = encoder.written.lock();
        assert!(!written.is_empty());
        for path in written.iter() {
            assert!(!path.exists(), "sample {} left behind", path.display());
        }
    }

    #[test]
    fn test_plan_even_spacing() {
        // 100 minutes, 2 samples of 5% -> 300s slices every 3000s
        let plan = plan_samples(100, 2, 5).unwrap();
        assert_eq!(
            plan,
            vec![
                SampleSlice { start_secs: 1500, duration_secs: 300 },
                SampleSlice { start_secs: 4500, duration_secs: 300 },
            ]
        );
    }

    #[test]
    fn test_plan_minimum_slice_and_collapse() {
        // 10 minutes at 5% is 30s, raised to 60s
        let plan = plan_samples(10, 2, 5).unwrap();
        assert!(plan.iter().all(|s| s.duration_secs == 60));

        // 2 minutes cannot hold two 60s slices without covering everything
        let plan = plan_samples(2, 2, 5).unwrap();
        assert_eq!(plan, vec![SampleSlice { start_secs: 0, duration_secs: 120 }]);

        assert!(plan_samples(-1, 2, 5).is_none());
        assert!(plan_samples(100, 0, 5).is_none());
        assert!(plan_samples(100, 2, 0).is_none());
        assert!(plan_samples(i64::MAX, 2, 5).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_plan_stays_within_recording(minutes in 1i64..600, count in 1u32..10, fraction in 1u32..=100) {
            let plan = plan_samples(minutes, count, fraction).unwrap();
            let total = minutes as u64 * 60;
            prop_assert!(plan.len() == 1 || plan.len() == count as usize);
            for slice in &plan {
                prop_assert!(slice.duration_secs >= MIN_SLICE_SECS.min(total));
                prop_assert!(slice.start_secs + slice.duration_secs <= total);
            }
        }
    }

    #[test]
    fn test_smaller_estimate_replaces() {
        // 100 bytes/s over 100 minutes estimates 600_000 bytes, half the duplicate
        let (_dir, encoder, new, dup) = setup(100, false, 1_200_000);
        let result = module(encoder.clone()).run(&new, &dup);
        assert_eq!(result.verdict, Verdict::Replace);
        assert_samples_removed(&encoder);
    }

    #[test]
    fn test_slightly_smaller_estimate_is_no_change() {
        let (_dir, encoder, new, dup) = setup(100, false, 660_000);
        let result = module(encoder.clone()).run(&new, &dup);
        assert_eq!(result.verdict, Verdict::NoChange);
        assert_samples_removed(&encoder);
    }

    #[test]
    fn test_larger_estimate_keeps_duplicate() {
        let (_dir, encoder, new, dup) = setup(100, false, 300_000);
        let result = module(encoder.clone()).run(&new, &dup);
        assert_eq!(result.verdict, Verdict::Discard);
        assert_samples_removed(&encoder);
    }

    #[test]
    fn test_failed_sample_fails_closed() {
        let (_dir, encoder, new, dup) = setup(100, true, 1_200_000);
        let result = module(encoder.clone()).run(&new, &dup);
        assert_eq!(result.verdict, Verdict::NoChange);
        assert_samples_removed(&encoder);
    }

    #[test]
    fn test_unknown_length_is_no_change() {
        let (_dir, encoder, mut new, dup) = setup(100, false, 1_200_000);
        new.recorded_length = -1;
        let result = module(encoder.clone()).run(&new, &dup);
        assert_eq!(result.verdict, Verdict::NoChange);
        assert!(encoder.written.lock().is_empty());
    }
}
