//! Media file model built from a job and its sidecar logs.
//!
//! A recording arrives with a tuner log (`<stem>.log`) and an EPG metadata
//! log (`<stem>.txt`). Everything the comparator pipeline needs (length,
//! resolution, audio layout, error count) is derived from those two files.

use crate::config::Config;
use crate::probe;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Custom parameter: skip every module and allow replacement.
pub const FLAG_SKIP_MODULES: &str = "SkipModules";
/// Custom parameter: force replacement of an existing duplicate.
pub const FLAG_FORCE_REPLACE: &str = "ForceReplace";
/// Custom parameter: bypass the recorded length check.
pub const FLAG_LENGTH_OVERRIDE: &str = "LengthOverride";

/// Delimiter line around every audit block.
pub const LOG_DELIM: &str = "----------------";
/// Marker prefix for audit lines written into a tuner log.
pub const AUDIT_MARKER: &str = "AviorAudit:";

/// Errors while building a [`MediaFile`].
#[derive(Debug, Error)]
pub enum MediaError {
    /// No tuner log under any known suffix
    #[error("No tuner log found for {0}")]
    MissingTunerLog(PathBuf),

    #[error("Failed to read log {path}: {source}")]
    ReadLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to rewrite log {path}: {source}")]
    WriteLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Seven step confidence scale from certainly stereo to certainly multichannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
pub enum AudioFormat {
    Stereo,
    StereoProbably,
    StereoMaybe,
    #[default]
    Unknown,
    MultiMaybe,
    MultiProbably,
    Multi,
}

impl AudioFormat {
    /// Signed confidence: negative is stereo, positive multichannel.
    pub fn value(self) -> i8 {
        match self {
            AudioFormat::Stereo => -3,
            AudioFormat::StereoProbably => -2,
            AudioFormat::StereoMaybe => -1,
            AudioFormat::Unknown => 0,
            AudioFormat::MultiMaybe => 1,
            AudioFormat::MultiProbably => 2,
            AudioFormat::Multi => 3,
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AudioFormat::Stereo => "STEREO",
            AudioFormat::StereoProbably => "STEREO_PROBABLY",
            AudioFormat::StereoMaybe => "STEREO_MAYBE",
            AudioFormat::Unknown => "UNKNOWN",
            AudioFormat::MultiMaybe => "MULTI_MAYBE",
            AudioFormat::MultiProbably => "MULTI_PROBABLY",
            AudioFormat::Multi => "MULTI",
        };
        write!(f, "{}", name)
    }
}

/// Resolution tag and its `WIDTHxHEIGHT` value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Resolution {
    pub tag: String,
    pub value: String,
}

impl Resolution {
    pub fn new(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            value: value.into(),
        }
    }

    /// Pixel count, `None` when the value is not `WIDTHxHEIGHT`.
    pub fn pixels(&self) -> Option<u64> {
        pixels(&self.value)
    }
}

/// Multiply the dimensions of a `WIDTHxHEIGHT` string.
///
/// `None` when the value is malformed or the product does not fit.
pub fn pixels(value: &str) -> Option<u64> {
    let (w, h) = value.trim().split_once('x')?;
    let w: u64 = w.trim().parse().ok()?;
    let h: u64 = h.trim().parse().ok()?;
    w.checked_mul(h)
}

/// A recording and everything derived from its sidecar logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaFile {
    pub path: PathBuf,
    pub name: String,
    pub subtitle: String,
    pub resolution: Resolution,
    /// Minutes the tuner actually recorded, -1 when unknown
    pub recorded_length: i64,
    /// Minutes announced by the EPG, -1 when unknown
    pub length: i64,
    pub audio: AudioFormat,
    /// Accumulated tuner errors, -1 when unknown
    pub errors: i64,
    /// Parameters passed through to the encoder
    pub custom_params: Vec<String>,
    #[serde(skip)]
    pub tuner_log: Vec<String>,
    #[serde(skip)]
    pub metadata_log: Vec<String>,
    /// Sidecar logs, tuner log first
    pub log_paths: Vec<PathBuf>,
    pub allow_replacement: bool,
    pub ignore_length: bool,
    pub legacy: bool,
}

impl MediaFile {
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        subtitle: impl Into<String>,
        custom_params: Vec<String>,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            subtitle: subtitle.into(),
            resolution: Resolution::default(),
            recorded_length: -1,
            length: -1,
            audio: AudioFormat::Unknown,
            errors: -1,
            custom_params,
            tuner_log: Vec::new(),
            metadata_log: Vec::new(),
            log_paths: Vec::new(),
            allow_replacement: false,
            ignore_length: false,
            legacy: false,
        }
    }

    /// A previously encoded file known only by its path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(path, String::new(), String::new(), Vec::new())
    }

    /// Read the sidecar logs and fill in every derived field.
    pub fn update(&mut self, config: &Config) -> Result<(), MediaError> {
        self.recorded_length = -1;
        self.length = -1;
        self.read_logs()?;
        self.analyze(config);

        if self.audio == AudioFormat::Unknown {
            if let Some(format) = probe::probe_audio_format(&self.path) {
                debug!("ffprobe classified {} as {}", self.path.display(), format);
                self.audio = format;
            }
        }
        Ok(())
    }

    /// Derive fields from already loaded logs. Does no I/O.
    pub fn analyze(&mut self, config: &Config) {
        self.audio = classify_audio(
            &self.tuner_log,
            &self.metadata_log,
            &config.audio_formats.stereo_tags,
            &config.audio_formats.multi_tags,
        );
        if let Some((tag, value)) = match_resolution(&self.tuner_log, &config.resolutions) {
            self.resolution = Resolution::new(tag, value);
        }
        self.parse_lengths();
        self.errors = if self.legacy {
            -1
        } else {
            count_errors(&self.tuner_log)
        };
        self.name = trim_name(&self.name, &config.terms.name_exclude);
        self.subtitle = trim_subtitle(&self.subtitle, &config.terms.sub_exclude);
        self.apply_flags();
    }

    fn apply_flags(&mut self) {
        let mut remaining = Vec::with_capacity(self.custom_params.len());
        for param in self.custom_params.drain(..) {
            match param.as_str() {
                FLAG_SKIP_MODULES | FLAG_FORCE_REPLACE => self.allow_replacement = true,
                FLAG_LENGTH_OVERRIDE => self.ignore_length = true,
                _ => remaining.push(param),
            }
        }
        self.custom_params = remaining;
    }

    fn read_logs(&mut self) -> Result<(), MediaError> {
        let stem = self.path.with_extension("");
        let tuner_path = append_suffix(&stem, ".log");
        let metadata_path = append_suffix(&stem, ".txt");
        self.log_paths.clear();

        if tuner_path.is_file() {
            self.tuner_log = read_lines(&tuner_path)?;
            if self.tuner_log.len() <= 2 {
                warn!("tuner log {} seems to be empty, marking file as legacy", tuner_path.display());
                self.legacy = true;
            }
            self.log_paths.push(tuner_path);
        } else {
            let legacy = [".mkv.log", ".mpg.log"]
                .iter()
                .map(|suffix| append_suffix(&stem, suffix))
                .find(|p| p.is_file())
                .ok_or_else(|| MediaError::MissingTunerLog(self.path.clone()))?;
            info!("legacy log file detected: {}", legacy.display());
            self.tuner_log = read_lines(&legacy)?;
            self.legacy = true;
            self.log_paths.push(legacy);
            return Ok(());
        }

        match read_lines(&metadata_path) {
            Ok(lines) => {
                self.metadata_log = lines;
                self.log_paths.push(metadata_path);
            }
            Err(e) => warn!("could not read metadata log: {}", e),
        }
        Ok(())
    }

    fn parse_lengths(&mut self) {
        for line in &self.tuner_log {
            if !line.contains(") Stop") {
                continue;
            }
            if let (Some(start), Some(end)) = (line.find('/'), line.find('(')) {
                if start < end {
                    if let Some(minutes) = parse_hours_minutes(&line[start + 1..end]) {
                        self.recorded_length = minutes;
                    }
                }
            }
        }
        for line in &self.metadata_log {
            if let Some((_, value)) = line.split_once("Duration=") {
                if let Some(minutes) = parse_hours_minutes(value) {
                    self.length = minutes;
                }
            }
        }
    }

    /// Shortfall of the recording against the EPG length in percent.
    ///
    /// `None` when either length is unknown or the EPG length is not positive.
    pub fn length_difference(&self) -> Option<i64> {
        if self.length <= 0 || self.recorded_length < 0 {
            return None;
        }
        let ratio = self.recorded_length as f64 / self.length as f64 * 100.0;
        Some((100.0 - ratio).round() as i64)
    }

    /// Output file name without extension.
    pub fn out_name(&self) -> String {
        if self.subtitle.is_empty() {
            self.name.clone()
        } else {
            format!("{} - {}", self.name, self.subtitle)
        }
    }

    /// First term found in the tuner log, then the metadata log.
    ///
    /// Lines starting with one of `ignored_prefixes` are not searched.
    pub fn logs_contain(&self, terms: &[String], ignored_prefixes: &[String]) -> Option<String> {
        find_term(&self.tuner_log, terms, ignored_prefixes)
            .or_else(|| find_term(&self.metadata_log, terms, ignored_prefixes))
            .map(|(term, _)| term.to_string())
    }

    pub fn tuner_log_path(&self) -> Option<&Path> {
        self.log_paths.first().map(PathBuf::as_path)
    }

    /// Strip audit blocks appended by earlier runs from the tuner log.
    ///
    /// Returns whether the log file was rewritten.
    pub fn sanitize_log(&mut self) -> Result<bool, MediaError> {
        let cut = self
            .tuner_log
            .iter()
            .position(|line| line.trim_end() == LOG_DELIM || line.contains(AUDIT_MARKER));
        let Some(mut cut) = cut else {
            return Ok(false);
        };
        while cut > 0 && self.tuner_log[cut - 1].trim().is_empty() {
            cut -= 1;
        }
        self.tuner_log.truncate(cut);
        info!("removing previous statistics from tuner log");

        let Some(path) = self.log_paths.first().cloned() else {
            return Ok(true);
        };
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&path)?;
            for line in &self.tuner_log {
                writeln!(file, "{}", line)?;
            }
            file.flush()
        };
        write().map_err(|source| MediaError::WriteLog {
            path: path.clone(),
            source,
        })?;
        Ok(true)
    }
}

fn append_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut s = stem.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn read_lines(path: &Path) -> Result<Vec<String>, MediaError> {
    let bytes = fs::read(path).map_err(|source| MediaError::ReadLog {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect())
}

/// `H:MM` to minutes, `None` on overflow.
fn parse_hours_minutes(value: &str) -> Option<i64> {
    let (h, m) = value.trim().split_once(':')?;
    let h: i64 = h.trim().parse().ok()?;
    let m: i64 = m.trim().parse().ok()?;
    h.checked_mul(60)?.checked_add(m)
}

/// First `(term, line index)` where a non-empty term occurs.
pub(crate) fn find_term<'a>(
    lines: &[String],
    terms: &'a [String],
    ignored_prefixes: &[String],
) -> Option<(&'a str, usize)> {
    for (idx, line) in lines.iter().enumerate() {
        if ignored_prefixes.iter().any(|p| line.starts_with(p.as_str())) {
            continue;
        }
        if let Some(term) = terms.iter().find(|t| !t.is_empty() && line.contains(t.as_str())) {
            return Some((term.as_str(), idx));
        }
    }
    None
}

fn contains_any(lines: &[String], terms: &[String]) -> bool {
    find_term(lines, terms, &[]).is_some()
}

/// Classify the audio layout from tuner and metadata logs.
pub fn classify_audio(
    tuner: &[String],
    metadata: &[String],
    stereo_tags: &[String],
    multi_tags: &[String],
) -> AudioFormat {
    let tuner_stereo = contains_any(tuner, stereo_tags);
    let tuner_multi = contains_any(tuner, multi_tags);
    match (tuner_stereo, tuner_multi) {
        (true, false) => AudioFormat::Stereo,
        (false, true) => AudioFormat::Multi,
        (true, true) => {
            if contains_any(metadata, multi_tags) {
                AudioFormat::MultiProbably
            } else if contains_any(metadata, stereo_tags) {
                AudioFormat::StereoProbably
            } else {
                AudioFormat::MultiMaybe
            }
        }
        (false, false) => AudioFormat::Unknown,
    }
}

fn match_resolution<'a>(
    tuner: &[String],
    resolutions: &'a std::collections::BTreeMap<String, String>,
) -> Option<(&'a str, &'a str)> {
    tuner.iter().find_map(|line| {
        resolutions
            .iter()
            .find(|(_, value)| !value.is_empty() && line.contains(value.as_str()))
            .map(|(tag, value)| (tag.as_str(), value.as_str()))
    })
}

fn count_errors(tuner: &[String]) -> i64 {
    tuner
        .iter()
        .filter_map(|line| line.split_once("Errors:"))
        .filter_map(|(_, rest)| {
            let count = rest.split(':').next().unwrap_or_default();
            count.trim().parse::<i64>().ok()
        })
        .fold(0, i64::saturating_add)
}

fn matched_terms_longest_first<'a>(value: &str, terms: &'a [String]) -> Vec<&'a str> {
    let mut found: Vec<&str> = terms
        .iter()
        .filter(|t| !t.is_empty() && value.contains(t.as_str()))
        .map(String::as_str)
        .collect();
    found.sort_by(|a, b| b.len().cmp(&a.len()));
    found
}

/// Keep the text after each matched exclude term.
pub fn trim_name(name: &str, exclude: &[String]) -> String {
    let mut name = name.to_string();
    for term in matched_terms_longest_first(&name, exclude) {
        if let Some(idx) = name.find(term) {
            name = name[idx + term.len()..].trim().to_string();
        }
    }
    remove_illegal_chars(&name).trim().to_string()
}

/// Keep the text before each matched exclude term.
pub fn trim_subtitle(subtitle: &str, exclude: &[String]) -> String {
    let mut subtitle = subtitle.to_string();
    let mut trimmed = false;
    for term in matched_terms_longest_first(&subtitle, exclude) {
        if let Some(idx) = subtitle.find(term) {
            trimmed = true;
            subtitle = subtitle[..idx].trim().to_string();
        }
    }
    if trimmed {
        if let Some(stripped) = subtitle.strip_suffix('-') {
            subtitle = stripped.to_string();
        }
    }
    remove_illegal_chars(&subtitle).trim().to_string()
}

/// Replace characters that are not allowed in file names.
pub fn remove_illegal_chars(value: &str) -> String {
    value
        .chars()
        .filter_map(|c| match c {
            '\\' | '<' | '>' | '|' => Some(' '),
            ':' | '?' | '*' | '"' => None,
            '/' => Some('_'),
            other => Some(other),
        })
        .collect()
}
