//! ffprobe fallback for the audio layout of a recording.

use crate::media::AudioFormat;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// ffprobe JSON output (`-show_streams`)
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    channel_layout: Option<String>,
}

/// Probe the first audio stream. Any failure yields `None`.
pub fn probe_audio_format(path: &Path) -> Option<AudioFormat> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-select_streams",
            "a:0",
            "-show_entries",
            "stream=channels,channel_layout",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .ok()?;
    if !output.status.success() {
        debug!("ffprobe failed for {}", path.display());
        return None;
    }
    parse_ffprobe_audio(&String::from_utf8_lossy(&output.stdout))
}

/// Classify ffprobe JSON output.
pub fn parse_ffprobe_audio(json: &str) -> Option<AudioFormat> {
    let parsed: FfprobeOutput = serde_json::from_str(json).ok()?;
    let stream = parsed.streams.first()?;
    let channels = stream.channels.unwrap_or(0);
    let layout = stream.channel_layout.as_deref().unwrap_or("unknown");

    if channels > 2 || layout.starts_with("5.1") || layout.starts_with("7.1") {
        Some(AudioFormat::Multi)
    } else if channels == 2 || layout == "stereo" {
        Some(AudioFormat::Stereo)
    } else {
        None
    }
}
