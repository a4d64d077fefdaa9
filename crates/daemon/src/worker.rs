//! Job orchestrator.
//!
//! Runs one leased job to completion: builds the media file from its
//! sidecars, asks the comparator pipeline what to do, moves superseded or
//! rejected files, encodes and writes the audit trail. Blocking; the
//! scheduling loop runs it on a blocking thread.

use crate::broadcast::Broadcaster;
use crate::comparator::{PassOutcome, Pipeline, Verdict};
use crate::config::Config;
use crate::encode::{EncodeError, EncodeRequest, EncodeStats, Encoder};
use crate::joblog::{JobLog, INFO_LOG_SUFFIX};
use crate::library::{self, is_in_dir_named, SharedLibraryCache};
use crate::lifecycle::{
    copy_logs_to_output, lifecycle_name, move_unit, obsolete_dir, sibling_dir, MoveRecord,
    DONE_DIR, EXISTS_DIR,
};
use crate::media::{MediaFile, FLAG_SKIP_MODULES};
use crate::state::{current_config, PauseReason, SharedConfig, SharedStatus, Signal};
use crate::store::Job;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Audit log of encoded jobs, under the log directory
pub const PROCESSED_LOG: &str = "processed.log";
/// Audit log of skipped and failed jobs, under the log directory
pub const SKIPPED_LOG: &str = "skipped.log";

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Encoded to this path
    Encoded(PathBuf),
    /// Rejected or abandoned before encoding; audit-logged
    Skipped(String),
    /// Encode failed for good; audit-logged, duplicate restored
    Failed(String),
    /// The media file could not be built, nothing was logged or moved
    Aborted(String),
}

/// Clears per-job status and wakes the scheduling loop, however the job ends.
struct JobGuard<'a> {
    status: &'a SharedStatus,
    resume: &'a Signal,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.status.write().clear_job();
        self.resume.raise();
    }
}

pub struct Worker {
    config: SharedConfig,
    encoder: Arc<dyn Encoder>,
    broadcaster: Arc<dyn Broadcaster>,
    cache: SharedLibraryCache,
    status: SharedStatus,
    resume: Arc<Signal>,
    hostname: String,
}

impl Worker {
    pub fn new(
        config: SharedConfig,
        encoder: Arc<dyn Encoder>,
        broadcaster: Arc<dyn Broadcaster>,
        cache: SharedLibraryCache,
        status: SharedStatus,
        resume: Arc<Signal>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            config,
            encoder,
            broadcaster,
            cache,
            status,
            resume,
            hostname: hostname.into(),
        }
    }

    /// Process `job` and update the job counters.
    pub fn process_job(&self, job: &Job) -> JobOutcome {
        let _guard = JobGuard {
            status: &self.status,
            resume: &self.resume,
        };
        info!("processing job {}: {}", job.id, job.path.display());
        let outcome = self.run(job);

        let mut status = self.status.write();
        match &outcome {
            JobOutcome::Encoded(path) => {
                info!("job {} encoded to {}", job.id, path.display());
                status.completed_jobs += 1;
            }
            JobOutcome::Skipped(reason) => {
                info!("job {} skipped: {}", job.id, reason);
                status.skipped_jobs += 1;
            }
            JobOutcome::Failed(reason) | JobOutcome::Aborted(reason) => {
                error!("job {} failed: {}", job.id, reason);
                status.failed_jobs += 1;
            }
        }
        outcome
    }

    fn run(&self, job: &Job) -> JobOutcome {
        let config = current_config(&self.config);
        self.status.write().job.in_file = Some(job.path.clone());

        let mut file = MediaFile::new(
            &job.path,
            &job.name,
            &job.subtitle,
            job.custom_parameters.clone(),
        );
        if let Err(e) = file.update(&config) {
            return JobOutcome::Aborted(format!("could not read {}: {}", job.path.display(), e));
        }

        let mut log = JobLog::new();
        log.add_file_properties(&file);

        let pipeline = Pipeline::new(&config, self.encoder.clone());
        let standalone = pipeline.run_standalone(&file);
        add_reports(&mut log, "Module Results:", &standalone);
        if standalone.verdict == Verdict::Discard {
            let reason = standalone.justification();
            log.add(format!("Skipped: {}", reason));
            self.write_skipped(&config, job, &file.path, None, &log, &log);
            return JobOutcome::Skipped(reason);
        }

        let shared = self.broadcaster.is_active();
        let duplicates = match library::find_duplicates(&self.cache, &config, shared, &file.out_name()) {
            Ok(found) => found,
            Err(e) => {
                error!("duplicate scan failed, pausing: {}", e);
                self.status.write().pause(PauseReason::DuplicateScan);
                log.add(format!("Duplicate scan failed: {}", e));
                self.write_skipped(&config, job, &file.path, None, &log, &log);
                return JobOutcome::Skipped(format!("duplicate scan failed: {}", e));
            }
        };
        if duplicates.len() > 1 {
            warn!("{} duplicates found, comparing against {}", duplicates.len(), duplicates[0].display());
        }

        let mut obsolete: Option<MoveRecord> = None;
        let mut dest_dir: Option<PathBuf> = None;
        if let Some(dup_path) = duplicates.first() {
            if !dup_path.exists() {
                let reason = format!("duplicate {} disappeared", dup_path.display());
                log.add(format!("Skipped: {}", reason));
                self.write_skipped(&config, job, &file.path, None, &log, &log);
                return JobOutcome::Skipped(reason);
            }
            let mut duplicate = MediaFile::from_path(dup_path);
            if let Err(e) = duplicate.update(&config) {
                warn!("could not read duplicate logs: {}", e);
            }
            log.add(format!("Duplicate: {}", dup_path.display()));

            let pass = pipeline.run_duplicate(&file, &duplicate);
            add_reports(&mut log, "Duplicate Module Results:", &pass);
            if pass.verdict != Verdict::Replace {
                return self.reject(&config, job, &file, &mut log, &pass);
            }

            let reason = pass.justification();
            info!("replacing {}: {}", dup_path.display(), reason);
            self.status.write().job.replacement_reason = Some(reason.clone());
            log.add(format!("Replacing duplicate: {}", reason));

            let target = obsolete_dir(&config.obsolete_path, dup_path);
            match move_unit(&duplicate.path, &duplicate.log_paths, &target, pass.decided_by) {
                Ok(record) => obsolete = Some(record),
                Err(e) => {
                    log.add(format!("Could not move duplicate to {}: {}", target.display(), e));
                    self.write_skipped(&config, job, &file.path, None, &log, &log);
                    return JobOutcome::Skipped(format!("could not move duplicate: {}", e));
                }
            }
            dest_dir = dup_path.parent().map(Path::to_path_buf);
        }

        let stats = match self.encode(&file, dest_dir.as_deref(), &mut log) {
            Ok(stats) => stats,
            Err((e, retried)) => return self.encode_failed(&config, job, &file, log, obsolete, e, retried),
        };
        self.complete(&config, &mut file, &mut log, &stats, shared);
        JobOutcome::Encoded(stats.output_path)
    }

    /// Encode without overwriting, then once more with overwrite if the error allows it.
    fn encode(
        &self,
        file: &MediaFile,
        dest_dir: Option<&Path>,
        log: &mut JobLog,
    ) -> Result<EncodeStats, (EncodeError, bool)> {
        let result = self.encoder.encode(&EncodeRequest::full(file, false, dest_dir));
        let stats = match result {
            Ok(stats) => stats,
            Err(e) if !e.is_retriable() => return Err((e, false)),
            Err(e) => {
                warn!("encode failed, retrying with overwrite: {}", e);
                log.add(format!("First encode attempt failed: {}", e));
                self.encoder
                    .encode(&EncodeRequest::full(file, true, dest_dir))
                    .map_err(|e| (e, true))?
            }
        };
        let mut status = self.status.write();
        status.job.out_path = Some(stats.output_path.clone());
        status.job.invocation = Some(stats.invocation.clone());
        status.last_output_tail = stats.output_tail.clone();
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_failed(
        &self,
        config: &Config,
        job: &Job,
        file: &MediaFile,
        mut log: JobLog,
        obsolete: Option<MoveRecord>,
        error: EncodeError,
        retried: bool,
    ) -> JobOutcome {
        error!("encode of {} failed: {}", file.path.display(), error);
        log.add(format!("Encode failed: {}", error));
        if !self.broadcaster.is_active() {
            self.cache.lock().invalidate();
        }

        if let Some(record) = obsolete {
            let failures = record.rollback();
            if failures.is_empty() {
                log.add("Restored duplicate from obsolete directory");
            }
            for failure in failures {
                log.add(format!("Rollback failed: {}", failure));
            }
        }
        if config.pause_on_encode_error {
            warn!("pausing after encode error");
            self.status.write().pause(PauseReason::EncodeError);
            log.add("Service paused after encode error");
        }

        let mut info_log = log.clone();
        if let Some(stats) = error.stats() {
            self.status.write().last_output_tail = stats.output_tail.clone();
            if retried {
                info_log.add("Encoder output:");
                for line in &stats.output_tail {
                    info_log.add(line.clone());
                }
            }
        }
        self.write_skipped(config, job, &file.path, None, &info_log, &log);
        JobOutcome::Failed(error.to_string())
    }

    /// A better or equal duplicate exists: keep it and move the new file to `exists/`.
    fn reject(
        &self,
        config: &Config,
        job: &Job,
        file: &MediaFile,
        log: &mut JobLog,
        pass: &PassOutcome,
    ) -> JobOutcome {
        let reason = match pass.decided_by {
            Some(_) => pass.justification(),
            None => "no module found an improvement".to_string(),
        };
        log.add(format!("Keeping duplicate: {}", reason));
        let log: &JobLog = log;

        let already_rejected = is_in_dir_named(&file.path, EXISTS_DIR);
        let exists_dir = sibling_dir(&file.path, EXISTS_DIR);
        let moved_to = if already_rejected {
            None
        } else {
            Some(exists_dir.join(lifecycle_name(&file.path, None, "")))
        };
        let info_path = self.write_skipped(config, job, &file.path, moved_to.as_deref(), log, log);

        if !already_rejected {
            let mut logs = file.log_paths.clone();
            if let Some(info_path) = info_path {
                logs.push(info_path);
            }
            if let Err(e) = move_unit(&file.path, &logs, &exists_dir, None) {
                error!("could not move {} to {}: {}", file.path.display(), exists_dir.display(), e);
            }
        }
        JobOutcome::Skipped(reason)
    }

    /// Write the job log to `<media>.INFO.log` and `skipped.log`.
    ///
    /// Both carry the job as re-insertable JSON. Returns the INFO log path
    /// when it was written.
    fn write_skipped(
        &self,
        config: &Config,
        job: &Job,
        media: &Path,
        moved_to: Option<&Path>,
        info_log: &JobLog,
        summary: &JobLog,
    ) -> Option<PathBuf> {
        let template = job_template(job, moved_to);
        let mut info_log = info_log.clone();
        info_log.add("Job:");
        info_log.add(template.clone());
        let mut summary = summary.clone();
        summary.add("Job:");
        summary.add(template);

        let skipped = config.log_dir.join(SKIPPED_LOG);
        if let Err(e) = summary.append_to(&skipped, &self.hostname, false) {
            warn!("could not write {}: {}", skipped.display(), e);
        }
        let info_path = info_log_path(media);
        match info_log.append_to(&info_path, &self.hostname, false) {
            Ok(()) => Some(info_path),
            Err(e) => {
                warn!("could not write {}: {}", info_path.display(), e);
                None
            }
        }
    }

    /// Audit the encode and move the source to `done/`.
    fn complete(
        &self,
        config: &Config,
        file: &mut MediaFile,
        log: &mut JobLog,
        stats: &EncodeStats,
        shared: bool,
    ) {
        log.add(format!("Output: {}", stats.output_path.display()));
        log.add(format!("Encode Duration: {}s", stats.duration.as_secs()));
        log.add(format!("Invocation: {}", stats.invocation));

        let processed = config.log_dir.join(PROCESSED_LOG);
        if let Err(e) = log.append_to(&processed, &self.hostname, false) {
            warn!("could not write {}: {}", processed.display(), e);
        }
        if let Err(e) = file.sanitize_log() {
            warn!("could not sanitize tuner log: {}", e);
        }
        if let Some(tuner_log) = file.tuner_log_path() {
            if let Err(e) = log.append_to(tuner_log, &self.hostname, true) {
                warn!("could not append audit to {}: {}", tuner_log.display(), e);
            }
        }

        if let Some(out_dir) = stats.output_path.parent() {
            if let Err(e) = copy_logs_to_output(&file.log_paths, &file.out_name(), out_dir) {
                warn!("could not copy logs next to output: {}", e);
            }
        }
        let done = sibling_dir(&file.path, DONE_DIR);
        if let Err(e) = move_unit(&file.path, &file.log_paths, &done, None) {
            error!("could not move {} to {}: {}", file.path.display(), done.display(), e);
        }

        if shared {
            if let Err(e) = self.broadcaster.publish(&stats.output_path) {
                warn!("could not broadcast {}: {}", stats.output_path.display(), e);
            }
        } else {
            self.cache.lock().invalidate();
        }
    }
}

fn add_reports(log: &mut JobLog, heading: &str, pass: &PassOutcome) {
    log.add(heading);
    for report in &pass.reports {
        log.add(report.to_string());
    }
    if pass.reports.is_empty() {
        if let Some(module) = pass.decided_by {
            log.add(format!("{}: {} - {}", module, pass.verdict, pass.reason));
        }
    }
}

/// `<media>.INFO.log`
pub fn info_log_path(media: &Path) -> PathBuf {
    let mut name = OsString::from(media.as_os_str());
    name.push(INFO_LOG_SUFFIX);
    PathBuf::from(name)
}

/// The job as a pretty JSON array, forced through the modules on re-insert.
pub fn job_template(job: &Job, moved_to: Option<&Path>) -> String {
    let mut job = job.clone();
    if let Some(path) = moved_to {
        job.path = path.to_path_buf();
    }
    if !job.custom_parameters.iter().any(|p| p == FLAG_SKIP_MODULES) {
        job.custom_parameters.push(FLAG_SKIP_MODULES.to_string());
    }
    serde_json::to_string_pretty(&[job])
        .unwrap_or_else(|e| format!("could not serialize job: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NoBroadcast;
    use crate::config::{
        AgeSettings, AudioSettings, ErrorSkipSettings, LogMatchSettings, ModuleConfig,
        ResolutionSettings,
    };
    use crate::library::new_shared_cache;
    use crate::state::{new_shared_config, new_shared_status};
    use parking_lot::Mutex;
    use std::fs::{self, File};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Succeed,
        AlwaysFail,
        NoConfig,
    }

    /// Records every request and writes `<out_name>.mkv` into the destination.
    struct FakeEncoder {
        out_dir: PathBuf,
        behaviour: Behaviour,
        calls: Mutex<Vec<(bool, Option<PathBuf>)>>,
    }

    impl FakeEncoder {
        fn new(out_dir: &Path, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                out_dir: out_dir.to_path_buf(),
                behaviour,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(bool, Option<PathBuf>)> {
            self.calls.lock().clone()
        }
    }

    impl Encoder for FakeEncoder {
        fn encode(&self, request: &EncodeRequest<'_>) -> Result<EncodeStats, EncodeError> {
            self.calls
                .lock()
                .push((request.overwrite, request.dest_dir.map(Path::to_path_buf)));
            let dir = request.dest_dir.unwrap_or(&self.out_dir);
            let output_path = dir.join(format!("{}.mkv", request.file.out_name()));
            let stats = EncodeStats {
                success: true,
                duration: Duration::from_secs(3),
                exit_code: Some(0),
                output_path: output_path.clone(),
                invocation: "ffmpeg -i in out".to_string(),
                output_tail: vec!["frame=100".to_string()],
            };
            match self.behaviour {
                Behaviour::Succeed => {
                    fs::create_dir_all(dir)?;
                    fs::write(&output_path, b"encoded")?;
                    Ok(stats)
                }
                Behaviour::AlwaysFail => Err(EncodeError::Failed(EncodeStats {
                    success: false,
                    exit_code: Some(1),
                    output_tail: vec!["Conversion failed!".to_string()],
                    ..stats
                })),
                Behaviour::NoConfig => Err(EncodeError::NoEncoderConfig("fhd".to_string())),
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        encoder: Arc<FakeEncoder>,
        status: SharedStatus,
        resume: Arc<Signal>,
        worker: Worker,
    }

    impl Fixture {
        fn rec(&self) -> PathBuf {
            self.dir.path().join("rec")
        }

        fn shows(&self) -> PathBuf {
            self.dir.path().join("lib/shows")
        }

        fn log_dir(&self) -> PathBuf {
            self.dir.path().join("log")
        }

        fn job(&self) -> Job {
            Job::new(self.rec().join("Show.ts"), "Show", "", Vec::new(), Some("worker".into()))
        }
    }

    fn write_tuner_log(path: &Path, resolution: &str, errors: u32) {
        fs::write(
            path,
            format!(
                "Tuning channel 1\nVideo: {}\nAudio: Stereo\nSignal OK\nErrors: {}\n",
                resolution, errors
            ),
        )
        .unwrap();
    }

    fn base_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.media_paths = vec![root.join("lib")];
        config.log_dir = root.join("log");
        config.audio_formats.stereo_tags = vec!["Stereo".to_string()];
        config.audio_formats.multi_tags = vec!["5.1".to_string()];
        config
            .resolutions
            .insert("wide".to_string(), "1536x1080".to_string());
        config.terms.log_include = vec!["Bad signal".to_string()];
        config.modules.resolution = ModuleConfig::enabled(10, ResolutionSettings { min_resolution: 20 });
        config.modules.audio = ModuleConfig::enabled(5, AudioSettings::default());
        config.modules.age = ModuleConfig::enabled(1, AgeSettings { max_age: 90 });
        config.modules.log_match = ModuleConfig::enabled(0, LogMatchSettings::default());
        config.modules.error_skip = ModuleConfig::enabled(0, ErrorSkipSettings::new(3));
        config
    }

    /// A recording in `rec/` and, when `dup_resolution` is set, an older duplicate in `lib/shows/`.
    fn fixture(
        new_resolution: &str,
        dup_resolution: Option<&str>,
        behaviour: Behaviour,
        tweak: impl FnOnce(&mut Config),
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let rec = dir.path().join("rec");
        let shows = dir.path().join("lib/shows");
        fs::create_dir_all(&rec).unwrap();
        fs::create_dir_all(&shows).unwrap();

        fs::write(rec.join("Show.ts"), b"recording").unwrap();
        write_tuner_log(&rec.join("Show.log"), new_resolution, 0);
        fs::write(rec.join("Show.txt"), "Duration=1:00\n").unwrap();

        if let Some(resolution) = dup_resolution {
            let dup = shows.join("Show.mkv");
            fs::write(&dup, b"old encode").unwrap();
            write_tuner_log(&shows.join("Show.log"), resolution, 0);
            let old = SystemTime::now() - Duration::from_secs(200 * 3600);
            File::options().write(true).open(&dup).unwrap().set_modified(old).unwrap();
        }

        let mut config = base_config(dir.path());
        tweak(&mut config);
        let encoder = FakeEncoder::new(&dir.path().join("out"), behaviour);
        let status = new_shared_status();
        let resume = Arc::new(Signal::new());
        let worker = Worker::new(
            new_shared_config(config),
            encoder.clone(),
            Arc::new(NoBroadcast),
            new_shared_cache(),
            status.clone(),
            resume.clone(),
            "worker",
        );
        Fixture {
            dir,
            encoder,
            status,
            resume,
            worker,
        }
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap_or_default()
    }

    fn names_in(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_equal_duplicate_moves_new_file_to_exists() {
        let fx = fixture("1920x1080", Some("1920x1080"), Behaviour::Succeed, |_| {});
        let job = fx.job();

        let outcome = fx.worker.process_job(&job);

        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert!(fx.encoder.calls().is_empty(), "no encode may run");
        let exists = fx.rec().join(EXISTS_DIR);
        assert!(exists.join("Show.ts").exists());
        assert!(exists.join("Show.log").exists());
        assert!(exists.join("Show.txt").exists());
        assert!(exists.join("Show.ts.INFO.log").exists());
        assert!(!fx.rec().join("Show.ts").exists());
        assert!(fx.shows().join("Show.mkv").exists());

        let skipped = read(&fx.log_dir().join(SKIPPED_LOG));
        assert!(skipped.contains("ResolutionModule: NoChange - resolution is the same"));
        assert!(skipped.contains(FLAG_SKIP_MODULES));
        assert!(skipped.contains("exists"));
        assert_eq!(fx.status.read().skipped_jobs, 1);
    }

    #[test]
    fn test_better_resolution_replaces_duplicate() {
        let fx = fixture("1920x1080", Some("1536x1080"), Behaviour::Succeed, |_| {});
        let job = fx.job();

        let outcome = fx.worker.process_job(&job);

        let output = fx.shows().join("Show.mkv");
        assert_eq!(outcome, JobOutcome::Encoded(output.clone()));
        assert_eq!(fx.encoder.calls(), vec![(false, Some(fx.shows()))]);
        assert_eq!(read(&output), "encoded");

        let obsolete = names_in(&fx.shows().join(".obsolete"));
        assert_eq!(obsolete.len(), 2, "duplicate and its log: {:?}", obsolete);
        assert!(obsolete
            .iter()
            .any(|n| n.starts_with("Show ResolutionModule ") && n.ends_with(".mkv")));

        let done = fx.rec().join(DONE_DIR);
        assert!(done.join("Show.ts").exists());
        assert!(read(&done.join("Show.log")).contains("AviorAudit: worker"));
        assert!(read(&fx.shows().join("Show.log")).contains("Output:"));
        assert!(read(&fx.log_dir().join(PROCESSED_LOG)).contains("Invocation: ffmpeg -i in out"));

        let status = fx.status.read();
        assert_eq!(status.completed_jobs, 1);
        assert_eq!(status.job, Default::default());
        assert_eq!(status.last_output_tail, vec!["frame=100".to_string()]);
    }

    #[test]
    fn test_no_duplicate_encodes_to_configured_output() {
        let fx = fixture("1920x1080", None, Behaviour::Succeed, |_| {});
        let outcome = fx.worker.process_job(&fx.job());

        assert_eq!(
            outcome,
            JobOutcome::Encoded(fx.dir.path().join("out/Show.mkv"))
        );
        assert_eq!(fx.encoder.calls(), vec![(false, None)]);
        assert!(fx.rec().join("done/Show.ts").exists());
    }

    #[test]
    fn test_failed_retry_restores_duplicate() {
        let fx = fixture("1920x1080", Some("1536x1080"), Behaviour::AlwaysFail, |c| {
            c.pause_on_encode_error = true;
        });
        let outcome = fx.worker.process_job(&fx.job());

        assert!(matches!(outcome, JobOutcome::Failed(_)));
        assert_eq!(
            fx.encoder.calls(),
            vec![(false, Some(fx.shows())), (true, Some(fx.shows()))]
        );
        assert_eq!(read(&fx.shows().join("Show.mkv")), "old encode");
        assert!(names_in(&fx.shows().join(".obsolete")).is_empty());
        assert!(fx.rec().join("Show.ts").exists());

        let info = read(&fx.rec().join("Show.ts.INFO.log"));
        assert!(info.contains("Conversion failed!"));
        assert!(!read(&fx.log_dir().join(SKIPPED_LOG)).contains("Conversion failed!"));

        let status = fx.status.read();
        assert!(status.paused);
        assert_eq!(status.pause_reason, Some(PauseReason::EncodeError));
        assert_eq!(status.failed_jobs, 1);
    }

    #[test]
    fn test_config_error_is_not_retried() {
        let fx = fixture("1920x1080", None, Behaviour::NoConfig, |_| {});
        let outcome = fx.worker.process_job(&fx.job());

        assert!(matches!(outcome, JobOutcome::Failed(_)));
        assert_eq!(fx.encoder.calls().len(), 1);
        assert!(!fx.status.read().paused);
    }

    #[test]
    fn test_standalone_discard_skips_without_moving() {
        let fx = fixture("1920x1080", None, Behaviour::Succeed, |_| {});
        write_tuner_log(&fx.rec().join("Show.log"), "1920x1080", 7);

        let outcome = fx.worker.process_job(&fx.job());

        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert!(fx.encoder.calls().is_empty());
        assert!(fx.rec().join("Show.ts").exists());
        assert!(read(&fx.log_dir().join(SKIPPED_LOG)).contains("ErrorSkipModule: Discard"));
    }

    #[test]
    fn test_scan_failure_pauses_service() {
        let fx = fixture("1920x1080", None, Behaviour::Succeed, |c| {
            c.media_paths = vec![PathBuf::from("/nonexistent/avior/library")];
        });
        let outcome = fx.worker.process_job(&fx.job());

        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert!(fx.encoder.calls().is_empty());
        assert_eq!(fx.status.read().pause_reason, Some(PauseReason::DuplicateScan));
    }

    #[test]
    fn test_missing_sidecar_aborts_job() {
        let fx = fixture("1920x1080", None, Behaviour::Succeed, |_| {});
        fs::remove_file(fx.rec().join("Show.log")).unwrap();

        let outcome = fx.worker.process_job(&fx.job());
        assert!(matches!(outcome, JobOutcome::Aborted(_)));
        assert!(fx.encoder.calls().is_empty());
        assert!(!fx.log_dir().join(SKIPPED_LOG).exists());
    }

    #[tokio::test]
    async fn test_resume_raised_after_job() {
        let fx = fixture("1920x1080", None, Behaviour::NoConfig, |_| {});
        fx.worker.process_job(&fx.job());
        tokio::time::timeout(Duration::from_secs(1), fx.resume.wait())
            .await
            .expect("resume signal raised");
    }

    #[test]
    fn test_job_template() {
        let job = Job::new("/rec/Show.ts", "Show", "", vec!["-crf 20".into()], None);
        let template = job_template(&job, Some(Path::new("/rec/exists/Show.ts")));
        let parsed: Vec<Job> = serde_json::from_str(&template).unwrap();
        assert_eq!(parsed[0].path, PathBuf::from("/rec/exists/Show.ts"));
        assert_eq!(parsed[0].custom_parameters, vec!["-crf 20", FLAG_SKIP_MODULES]);
        assert_eq!(parsed[0].id, job.id);
    }

    #[test]
    fn test_info_log_path() {
        assert_eq!(
            info_log_path(Path::new("/rec/Show.ts")),
            PathBuf::from("/rec/Show.ts.INFO.log")
        );
    }
}
