use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Result, RtspError};

/// Locations of the external media tools.
#[derive(Debug, Clone)]
pub struct MediaTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for MediaTools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// A transcoded transport stream on disk, removed when dropped.
#[derive(Debug)]
pub struct TranscodedFile {
    path: PathBuf,
}

impl TranscodedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TranscodedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed transcoded file"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to remove transcoded file"),
        }
    }
}

/// Arguments passed to `ffmpeg` between the input and output paths.
///
/// Re-encodes with a fixed 30-frame GOP and a keyframe at t=0 so readers
/// joining at any point wait at most one second for an IDR.
pub(crate) fn transcode_args() -> &'static [&'static str] {
    &[
        "-c:v",
        "libx264",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-x264-params",
        "keyint=30:min-keyint=30",
        "-force_key_frames",
        "expr:gte(t,0)",
        "-bsf:v",
        "h264_mp4toannexb",
        "-avoid_negative_ts",
        "make_zero",
        "-fflags",
        "+genpts",
        "-an",
        "-f",
        "mpegts",
        "-y",
    ]
}

/// Transcode a container file into a temporary MPEG-TS file.
///
/// Runs synchronously. A nonzero exit, or an `ffmpeg` that cannot be
/// started, is reported as [`RtspError::TranscodeFailed`] carrying the
/// combined stdout/stderr text.
pub fn to_transport_stream(tools: &MediaTools, input: &Path) -> Result<TranscodedFile> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("input");
    let output = std::env::temp_dir().join(format!(
        "vidcast-{}-{:08x}.ts",
        stem,
        rand::random::<u32>()
    ));

    tracing::info!(input = %input.display(), output = %output.display(), "transcoding to MPEG-TS");

    let result = Command::new(&tools.ffmpeg)
        .arg("-i")
        .arg(input)
        .args(transcode_args())
        .arg(&output)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| RtspError::TranscodeFailed {
            status: "not started".into(),
            output: format!("failed to run {}: {e}", tools.ffmpeg.display()),
        })?;

    // Owned from here so a failed run still cleans up partial output.
    let file = TranscodedFile { path: output };

    if !result.status.success() {
        let mut text = String::from_utf8_lossy(&result.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&result.stderr));
        return Err(RtspError::TranscodeFailed {
            status: result.status.to_string(),
            output: text,
        });
    }

    tracing::info!(output = %file.path.display(), "transcode complete");
    Ok(file)
}
