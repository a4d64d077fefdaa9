//! Encoder contract used by the worker and the size estimator

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, FfmpegEncoder};

use crate::media::MediaFile;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// One encode of `file`, either complete or a time slice.
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub file: &'a MediaFile,
    pub start_secs: u64,
    /// 0 encodes until the end of the input
    pub duration_secs: u64,
    pub overwrite: bool,
    /// Replaces the configured output directory
    pub dest_dir: Option<&'a Path>,
}

impl<'a> EncodeRequest<'a> {
    /// Full encode with the configured output directory
    pub fn full(file: &'a MediaFile, overwrite: bool, dest_dir: Option<&'a Path>) -> Self {
        Self {
            file,
            start_secs: 0,
            duration_secs: 0,
            overwrite,
            dest_dir,
        }
    }

    pub fn sample(file: &'a MediaFile, start_secs: u64, duration_secs: u64) -> Self {
        Self {
            file,
            start_secs,
            duration_secs,
            overwrite: true,
            dest_dir: None,
        }
    }

    pub fn is_sample(&self) -> bool {
        self.duration_secs > 0
    }
}

/// Result of a finished encoder run
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeStats {
    pub success: bool,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub output_path: PathBuf,
    /// Full command line, for audit
    pub invocation: String,
    /// Last lines the encoder wrote to stderr
    pub output_tail: Vec<String>,
}

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// No encoder arguments configured for the resolution tag
    #[error("No encoder config found for tag '{0}'")]
    NoEncoderConfig(String),

    /// Output exists and overwriting is disabled
    #[error("Output file already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("Failed to start encoder: {0}")]
    Spawn(#[from] std::io::Error),

    /// Encoder exited unsuccessfully
    #[error("Encoder failed with exit code {:?}", .0.exit_code)]
    Failed(EncodeStats),
}

impl EncodeError {
    /// Errors a second attempt with overwrite enabled cannot fix are not retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EncodeError::Spawn(_) | EncodeError::Failed(_))
    }

    /// Stats of the failed run, when the encoder got that far.
    pub fn stats(&self) -> Option<&EncodeStats> {
        match self {
            EncodeError::Failed(stats) => Some(stats),
            _ => None,
        }
    }
}

/// External encoder. Blocks for the duration of the encode.
pub trait Encoder: Send + Sync {
    fn encode(&self, request: &EncodeRequest<'_>) -> Result<EncodeStats, EncodeError>;
}
