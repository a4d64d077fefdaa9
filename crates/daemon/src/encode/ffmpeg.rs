//! ffmpeg encoder
//!
//! Builds an ffmpeg invocation from the encoder arguments configured for the
//! recording's resolution tag and runs it to completion.

use super::{EncodeError, EncodeRequest, EncodeStats, Encoder};
use crate::config::{Config, EncoderConfig};
use crate::state::{current_config, SharedConfig};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lines of encoder stderr kept for the audit log
const OUTPUT_TAIL_LINES: usize = 20;

/// Suffix of sample encodes written by the size estimator
pub const SAMPLE_SUFFIX: &str = ".estimate";

pub struct FfmpegEncoder {
    config: SharedConfig,
}

impl FfmpegEncoder {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

/// Split each configured value with shell quoting rules, so
/// `-vf "scale=1280:-2, fps=25"` stays one argument. A value with unbalanced
/// quotes falls back to splitting on whitespace.
fn split_args(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| match shell_words::split(value) {
            Ok(words) => words,
            Err(e) => {
                warn!("could not parse arguments '{}': {}, splitting on whitespace", value, e);
                value.split_whitespace().map(str::to_string).collect()
            }
        })
        .collect()
}

/// Where `request` writes its output.
///
/// Samples get a unique name so concurrent estimates never collide.
pub fn output_path(
    config: &Config,
    encoder: &EncoderConfig,
    request: &EncodeRequest<'_>,
) -> PathBuf {
    let dir = request
        .dest_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| encoder.out_directory.clone());
    if request.is_sample() {
        dir.join(format!("{}{}{}", Uuid::new_v4(), SAMPLE_SUFFIX, config.ext))
    } else {
        dir.join(format!("{}{}", request.file.out_name(), config.ext))
    }
}

/// Build an ffmpeg command for `request`
///
/// Argument order: overwrite flag, pre arguments, seek, input, duration,
/// post arguments, the job's remaining custom parameters, output.
pub fn build_ffmpeg_command(
    binary: &str,
    encoder: &EncoderConfig,
    request: &EncodeRequest<'_>,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg(if request.overwrite { "-y" } else { "-n" });
    cmd.args(split_args(&encoder.pre_arguments));
    if request.start_secs > 0 {
        cmd.arg("-ss").arg(request.start_secs.to_string());
    }
    cmd.arg("-i").arg(&request.file.path);
    if request.duration_secs > 0 {
        cmd.arg("-t").arg(request.duration_secs.to_string());
    }
    cmd.args(split_args(&encoder.post_arguments));
    cmd.args(split_args(&request.file.custom_params));
    cmd.arg(output);
    cmd
}

fn render_invocation(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl Encoder for FfmpegEncoder {
    fn encode(&self, request: &EncodeRequest<'_>) -> Result<EncodeStats, EncodeError> {
        let config = current_config(&self.config);
        let tag = &request.file.resolution.tag;
        let encoder = config
            .encoder
            .configs
            .get(tag)
            .ok_or_else(|| EncodeError::NoEncoderConfig(tag.clone()))?;

        let output = output_path(&config, encoder, request);
        if !request.overwrite && output.exists() {
            return Err(EncodeError::OutputExists(output));
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut cmd = build_ffmpeg_command(&config.encoder.binary, encoder, request, &output);
        let invocation = render_invocation(&cmd);
        if request.is_sample() {
            debug!("sample encode: {}", invocation);
        } else {
            info!("encoding: {}", invocation);
        }

        let started = Instant::now();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        let status = child.wait()?;

        let stats = EncodeStats {
            success: status.success(),
            duration: started.elapsed(),
            exit_code: status.code(),
            output_path: output,
            invocation,
            output_tail: tail.into(),
        };
        if stats.success {
            Ok(stats)
        } else {
            Err(EncodeError::Failed(stats))
        }
    }
}
