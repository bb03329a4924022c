//! Media compression before upload.
//!
//! Transcoding is an external tool: it reads one path and writes another. The
//! engine only decides *whether* a file is compressed and where the output goes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TranscodeConfig;
use crate::error::{DepotError, DepotResult};

const VIDEO_EXTS: &[&str] = &[".mp4", ".avi", ".mov", ".mkv", ".flv", ".wmv", ".webm", ".m4v"];
const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    /// Classify by lowercased extension with leading dot. `None` means upload as is.
    pub fn from_ext(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        if VIDEO_EXTS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if IMAGE_EXTS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else {
            None
        }
    }

    /// Extension of the compressed output. Video is always re-muxed to MP4.
    pub fn output_ext<'a>(&self, input_ext: &'a str) -> &'a str {
        match self {
            Self::Video => ".mp4",
            Self::Image => input_ext,
        }
    }
}

/// Settings passed to a single `compress` call.
#[derive(Debug, Clone)]
pub struct CompressOptions {
    pub kind: MediaKind,
    pub video_crf: u8,
    pub audio_bitrate: String,
    pub max_width: u32,
    pub max_height: u32,
    /// 1-100.
    pub quality: u8,
}

impl CompressOptions {
    pub fn from_config(kind: MediaKind, config: &TranscodeConfig) -> Self {
        Self {
            kind,
            video_crf: config.video_crf.min(51),
            audio_bitrate: config.audio_bitrate.clone(),
            max_width: config.image_max_width,
            max_height: config.image_max_height,
            quality: config.image_quality.clamp(1, 100),
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write a compressed copy of `input` to `output`.
    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        options: &CompressOptions,
    ) -> DepotResult<()>;
}

/// Runs the `ffmpeg` binary.
pub struct FfmpegTranscoder {
    bin: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn args(input: &Path, output: &Path, options: &CompressOptions) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
        ];
        match options.kind {
            MediaKind::Video => {
                args.extend([
                    "-c:v".into(),
                    "libx264".into(),
                    "-crf".into(),
                    options.video_crf.to_string(),
                    "-c:a".into(),
                    "aac".into(),
                    "-b:a".into(),
                    options.audio_bitrate.clone(),
                ]);
            }
            MediaKind::Image => {
                // Shrink to fit the bounding box, never upscale.
                let scale = format!(
                    "scale='min({w},iw)':'min({h},ih)':force_original_aspect_ratio=decrease",
                    w = options.max_width,
                    h = options.max_height,
                );
                args.extend([
                    "-vf".into(),
                    scale,
                    "-q:v".into(),
                    image_qscale(options.quality).to_string(),
                    "-frames:v".into(),
                    "1".into(),
                ]);
            }
        }
        args.push(output.display().to_string());
        args
    }
}

/// Map a 1-100 quality to ffmpeg's 2-31 qscale, where lower is better.
fn image_qscale(quality: u8) -> u32 {
    let quality = quality.clamp(1, 100) as u32;
    2 + (100 - quality) * 29 / 99
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        options: &CompressOptions,
    ) -> DepotResult<()> {
        let args = Self::args(input, output, options);
        debug!(bin = %self.bin.display(), ?args, "Running transcoder");

        let result = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DepotError::Transcode(format!("failed to run {}: {e}", self.bin.display())))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(DepotError::Transcode(format!(
                "{} exited with {}: {}",
                self.bin.display(),
                result.status,
                stderr.trim()
            )));
        }

        info!(
            input = %input.display(),
            output = %output.display(),
            kind = ?options.kind,
            "Compressed media"
        );
        Ok(())
    }
}
