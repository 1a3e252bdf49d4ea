use anyhow::{Context, Result};
use devscan_proto::Frame;
use tokio::process::Command;
use tracing::debug;

use crate::{Camera, CaptureQuality};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CameraConfig {
    pub mode: String,   // "libcamera-jpeg" | "v4l2-mjpeg"
    pub device: String, // /dev/video0 (v4l2)
    /// Low-res geometry for the continuous detection loop.
    pub detect_width: u32,
    pub detect_height: u32,
    /// Full-res geometry for user/auto angle captures.
    pub full_width: u32,
    pub full_height: u32,
}

impl CameraConfig {
    fn dims(&self, quality: CaptureQuality) -> (u32, u32) {
        match quality {
            CaptureQuality::Low => (self.detect_width, self.detect_height),
            CaptureQuality::Full => (self.full_width, self.full_height),
        }
    }
}

/// Pragmatic single-frame grab through external tooling:
/// - libcamera-jpeg: `libcamera-still -n -t 1 ... -o -` (simple, robust on Pi)
/// - v4l2-mjpeg: one MJPEG frame via `ffmpeg` (keeps Rust dependencies small)
///
/// Exclusive use of the device is the caller's problem; the capture gate
/// guarantees these never run concurrently.
#[derive(Debug, Clone)]
pub struct ShellCamera {
    cfg: CameraConfig,
}

impl ShellCamera {
    pub fn new(cfg: CameraConfig) -> Self {
        Self { cfg }
    }

    async fn grab(&self, w: u32, h: u32) -> Result<Vec<u8>> {
        match self.cfg.mode.as_str() {
            "libcamera-jpeg" => self.grab_libcamera(w, h).await,
            "v4l2-mjpeg" => self.grab_v4l2_ffmpeg(w, h).await,
            other => anyhow::bail!("unknown camera.mode: {}", other),
        }
    }

    async fn grab_libcamera(&self, w: u32, h: u32) -> Result<Vec<u8>> {
        let mut cmd = Command::new("libcamera-still");
        cmd.args([
            "-n",
            "-t", "1",
            "--width", &w.to_string(),
            "--height", &h.to_string(),
            "-o", "-",
        ]);

        debug!("capture: libcamera-still {}x{}", w, h);
        let out = cmd.output().await.context("run libcamera-still")?;
        anyhow::ensure!(out.status.success(), "libcamera-still failed");
        Ok(out.stdout)
    }

    async fn grab_v4l2_ffmpeg(&self, w: u32, h: u32) -> Result<Vec<u8>> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args([
            "-hide_banner", "-loglevel", "error",
            "-f", "video4linux2",
            "-input_format", "mjpeg",
            "-video_size", &format!("{}x{}", w, h),
            "-i", &self.cfg.device,
            "-vframes", "1",
            "-f", "image2pipe",
            "-vcodec", "mjpeg",
            "-",
        ]);

        debug!("capture: ffmpeg v4l2 {}x{}", w, h);
        let out = cmd.output().await.context("run ffmpeg capture")?;
        anyhow::ensure!(out.status.success(), "ffmpeg capture failed");
        Ok(out.stdout)
    }
}

impl Camera for ShellCamera {
    async fn capture(&self, quality: CaptureQuality) -> Result<Frame> {
        let (w, h) = self.cfg.dims(quality);
        let jpeg = self.grab(w, h).await?;
        Ok(Frame { jpeg, width: w, height: h })
    }
}
