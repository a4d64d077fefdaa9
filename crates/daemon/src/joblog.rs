//! Audit trail of a single job.
//!
//! Appended to `processed.log` or `skipped.log`, to the source's tuner log
//! and to the `<media>.INFO.log` sidecar of skipped recordings.

use crate::media::{MediaFile, AUDIT_MARKER, LOG_DELIM};
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Suffix of the info sidecar written for skipped recordings
pub const INFO_LOG_SUFFIX: &str = ".INFO.log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLog {
    lines: Vec<String>,
}

impl JobLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn add_file_properties(&mut self, file: &MediaFile) {
        self.add(format!("Original Path: {}", file.path.display()));
        self.add(format!("Output Name: {}", file.out_name()));
        self.add(format!(
            "Recorded/Length: {}m/{}m",
            file.recorded_length, file.length
        ));
        self.add(format!(
            "Resolution: {} ({})",
            file.resolution.tag, file.resolution.value
        ));
        self.add(format!("Audio: {}", file.audio));
        self.add(format!("Errors: {}", file.errors));
        self.add(format!("EncodeParams: {:?}", file.custom_params));
    }

    /// One delimited block. `marked` blocks carry the audit marker in their header.
    pub fn render(&self, host: &str, at: DateTime<Local>, marked: bool) -> String {
        let mut out = String::new();
        out.push_str(LOG_DELIM);
        out.push('\n');
        if marked {
            out.push_str(AUDIT_MARKER);
            out.push(' ');
        }
        out.push_str(&format!("{} - {}\n\n", host, at.format("%Y-%m-%d %H:%M:%S")));
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(LOG_DELIM);
        out.push('\n');
        out
    }

    /// Append a block to `path`, creating the file and its directory.
    pub fn append_to(&self, path: &Path, host: &str, marked: bool) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(self.render(host, Local::now(), marked).as_bytes())?;
        file.flush()
    }
}
