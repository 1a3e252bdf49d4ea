pub mod angle;
pub mod camera;
pub mod crop;
pub mod error;
pub mod gate;

use std::cell::{Cell, RefCell};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use devscan_proto::{CaptureSet, Frame, ProductInfo};
use devscan_vision::{suppress, Detection, OverlapPolicy, TrackedObject, Tracker, TrackerConfig};

use crate::angle::{AngleConfig, AngleSessions};
use crate::gate::CaptureGate;

pub use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureQuality {
    /// Low-res frame for the continuous detection loop.
    Low,
    /// Full-res frame for angle captures handed downstream.
    Full,
}

/// Opaque detector collaborator. A throw is treated as zero detections by
/// the scheduler; it never aborts the loop.
#[allow(async_fn_in_trait)]
pub trait Detector {
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Single logical camera device. Must never be invoked concurrently; the
/// capture gate enforces that.
#[allow(async_fn_in_trait)]
pub trait Camera {
    async fn capture(&self, quality: CaptureQuality) -> Result<Frame>;
}

/// Pure crop transform used when finalizing angle images.
pub trait Cropper {
    fn crop(&self, frame: &Frame, bbox: &devscan_vision::BBox, padding_ratio: f32) -> Result<Frame>;
}

/// Downstream identification queue. Fire-and-forget from this side.
pub trait QueueSink {
    fn submit(&self, set: CaptureSet);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Detection loop only; captures happen on explicit shutter calls.
    Scan,
    /// User selects a track and presses the shutter per angle.
    Manual,
    /// Angle diversity evaluated across all visible tracks on a timer.
    Auto,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: ScanMode,
    pub detect_period_ms: u64,
    pub auto_capture_period_ms: u64,
    pub drain_poll_ms: u64,
    pub drain_poll_max: u32,
    pub nms: OverlapPolicy,
    pub tracker: TrackerConfig,
    pub angle: AngleConfig,
}

impl SessionConfig {
    /// Mode presets. Track lifetimes differ: the plain scan loop drops stale
    /// tracks fast, capture modes keep them alive across camera pauses so a
    /// half-collected angle session still has its track when the loop resumes.
    pub fn for_mode(mode: ScanMode) -> Self {
        let max_missed_frames = match mode {
            ScanMode::Scan => 5,
            ScanMode::Manual => 10,
            ScanMode::Auto => 30,
        };
        Self {
            mode,
            detect_period_ms: 800,
            auto_capture_period_ms: 2500,
            drain_poll_ms: 50,
            drain_poll_max: 20,
            nms: OverlapPolicy::detection_nms(),
            tracker: TrackerConfig {
                iou_match_threshold: 0.3,
                max_missed_frames,
                prune: Some(OverlapPolicy::track_pruning()),
            },
            angle: AngleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Angle accepted; the session holds this many images now.
    Collected(usize),
    /// Session reached its target; a capture set went to the sink.
    Completed,
}

/// Owner of everything a scan session mutates: the capture gate, the track
/// set, and the angle-session map. Interior mutability keeps the public
/// methods `&self` so the timer loop and a shutter press can interleave on
/// one thread; `Cell`/`RefCell` keep the whole thing off other threads.
pub struct TrackerSession<C, D, P, Q> {
    cfg: SessionConfig,
    gate: CaptureGate,
    tracker: RefCell<Tracker>,
    sessions: RefCell<AngleSessions>,
    // dims of the last frame the tracker saw; crops from full-res frames
    // scale track boxes through this
    detect_dims: Cell<Option<(u32, u32)>>,
    camera: C,
    detector: RefCell<D>,
    cropper: P,
    sink: Q,
}

impl<C, D, P, Q> TrackerSession<C, D, P, Q>
where
    C: Camera,
    D: Detector,
    P: Cropper,
    Q: QueueSink,
{
    pub fn new(cfg: SessionConfig, camera: C, detector: D, cropper: P, sink: Q) -> Self {
        Self {
            tracker: RefCell::new(Tracker::new(cfg.tracker.clone())),
            sessions: RefCell::new(AngleSessions::new(cfg.angle.clone())),
            detect_dims: Cell::new(None),
            gate: CaptureGate::new(),
            cfg,
            camera,
            detector: RefCell::new(detector),
            cropper,
            sink,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    /// One cycle of the periodic detection loop: capture low-res, detect,
    /// NMS, track update. Skipped outright while any capture is mid-flight.
    /// Camera/detector failures degrade to an empty frame for this tick.
    pub async fn detection_tick(&self) {
        let Some(_guard) = self.gate.try_begin_detection() else {
            debug!("detection tick skipped: camera busy");
            return;
        };

        let dets = match self.capture_and_detect().await {
            Ok(d) => d,
            Err(e) => {
                warn!("detection cycle failed, treating as empty: {:#}", e);
                Vec::new()
            }
        };

        let dets = suppress(dets, &self.cfg.nms);
        self.tracker.borrow_mut().update(&dets);
    }

    async fn capture_and_detect(&self) -> Result<Vec<Detection>> {
        let frame = self
            .camera
            .capture(CaptureQuality::Low)
            .await
            .context("camera capture")?;
        self.detect_dims.set(Some((frame.width, frame.height)));
        // The detection guard serializes this path; nothing else touches the
        // detector while the inference await is pending.
        let mut detector = self.detector.borrow_mut();
        detector.detect(&frame).await.context("detector inference")
    }

    /// Shutter press for one selected track. The press itself is the angle
    /// signal, so the diversity rule is bypassed. Waits for any in-flight
    /// detection to drain before touching the camera.
    pub async fn manual_capture(&self, track_id: u64) -> Result<CaptureOutcome, CaptureError> {
        let Some(_guard) = self.gate.try_begin_capture() else {
            return Err(CaptureError::CameraBusy);
        };
        self.drain_detection().await?;

        let track = self
            .tracker
            .borrow()
            .get(track_id)
            .ok_or(CaptureError::UnknownTrack(track_id))?;

        let frame = self
            .camera
            .capture(CaptureQuality::Full)
            .await
            .map_err(CaptureError::Camera)?;
        let crop = self.crop_track(&frame, &track)?;

        let now = Instant::now();
        let mut sessions = self.sessions.borrow_mut();
        match sessions.accept(&track, crop, now) {
            Some(set) => {
                self.sink.submit(set);
                Ok(CaptureOutcome::Completed)
            }
            None => Ok(CaptureOutcome::Collected(
                sessions.progress(track_id).unwrap_or(0),
            )),
        }
    }

    /// Auto-mode pass: evaluate the diversity rule across all currently
    /// visible tracks, and if anything qualifies, take one full-res frame
    /// and crop an angle per qualifying track. Returns accepted count.
    pub async fn auto_capture_tick(&self) -> Result<usize, CaptureError> {
        let now = Instant::now();
        let wanted: Vec<TrackedObject> = {
            let tracker = self.tracker.borrow();
            let sessions = self.sessions.borrow();
            tracker
                .snapshot()
                .into_iter()
                .filter(|t| t.frames_since_last_seen == 0)
                .filter(|t| sessions.wants_capture(t.id, &t.bbox, now))
                .collect()
        };
        if wanted.is_empty() {
            return Ok(0);
        }

        let Some(_guard) = self.gate.try_begin_capture() else {
            return Err(CaptureError::CameraBusy);
        };
        self.drain_detection().await?;

        let frame = self
            .camera
            .capture(CaptureQuality::Full)
            .await
            .map_err(CaptureError::Camera)?;

        let now = Instant::now();
        let mut accepted = 0;
        for track in &wanted {
            let crop = match self.crop_track(&frame, track) {
                Ok(c) => c,
                Err(e) => {
                    warn!("crop failed for track {}: {}", track.id, e);
                    continue;
                }
            };
            accepted += 1;
            if let Some(set) = self.sessions.borrow_mut().accept(track, crop, now) {
                self.sink.submit(set);
            }
        }
        Ok(accepted)
    }

    fn crop_track(&self, frame: &Frame, track: &TrackedObject) -> Result<Frame, CaptureError> {
        // Track boxes live in detection-frame pixel space; rescale when the
        // capture frame has different geometry.
        let bbox = match self.detect_dims.get() {
            Some((dw, dh)) if dw > 0 && dh > 0 => track
                .bbox
                .scaled(frame.width as f32 / dw as f32, frame.height as f32 / dh as f32),
            _ => track.bbox,
        };
        self.cropper
            .crop(frame, &bbox, self.cfg.angle.crop_padding_ratio)
            .map_err(CaptureError::Crop)
    }

    /// Bounded poll for the detection flag to clear before a capture may use
    /// the camera. A hung detector call surfaces here as a drain timeout and
    /// the capture attempt is abandoned for this tick.
    async fn drain_detection(&self) -> Result<(), CaptureError> {
        for _ in 0..self.cfg.drain_poll_max {
            if !self.gate.detecting() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.drain_poll_ms)).await;
        }
        if self.gate.detecting() {
            Err(CaptureError::DrainTimeout(Duration::from_millis(
                self.cfg.drain_poll_ms * self.cfg.drain_poll_max as u64,
            )))
        } else {
            Ok(())
        }
    }

    /// Drive the repeating timers until the stop signal flips. An in-flight
    /// cycle is never aborted; it finishes as the last cycle and its guard
    /// releases normally.
    pub async fn run(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        info!("scan session started (mode {:?})", self.cfg.mode);
        let mut detect = tokio::time::interval(Duration::from_millis(self.cfg.detect_period_ms));
        detect.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut auto = tokio::time::interval(Duration::from_millis(self.cfg.auto_capture_period_ms));
        auto.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = detect.tick() => self.detection_tick().await,
                _ = auto.tick(), if self.cfg.mode == ScanMode::Auto => {
                    match self.auto_capture_tick().await {
                        Ok(n) if n > 0 => debug!("auto capture accepted {} angle(s)", n),
                        Ok(_) => {}
                        Err(e) => debug!("auto capture deferred: {}", e),
                    }
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        self.stop();
        info!("scan session stopped");
    }

    /// Teardown on focus loss/unmount: flags cleared, angle sessions dropped.
    /// The track set stays readable for a final snapshot.
    pub fn stop(&self) {
        self.gate.reset();
        self.sessions.borrow_mut().clear();
    }

    pub fn snapshot(&self) -> Vec<TrackedObject> {
        self.tracker.borrow().snapshot()
    }

    pub fn get_track(&self, id: u64) -> Option<TrackedObject> {
        self.tracker.borrow().get(id)
    }

    pub fn session_progress(&self, track_id: u64) -> Option<usize> {
        self.sessions.borrow().progress(track_id)
    }

    pub fn cancel_session(&self, track_id: u64) -> bool {
        self.sessions.borrow_mut().cancel(track_id)
    }

    pub fn mark_identification_attempted(&self, track_id: u64) -> bool {
        self.tracker.borrow_mut().mark_identification_attempted(track_id)
    }

    pub fn set_product_info(&self, track_id: u64, info: ProductInfo) -> bool {
        self.tracker.borrow_mut().set_product_info(track_id, info)
    }

    pub fn is_idle(&self) -> bool {
        self.gate.idle()
    }
}
