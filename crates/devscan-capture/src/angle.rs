use std::collections::HashMap;

use tokio::time::Instant;

use devscan_proto::{CaptureSet, Frame};
use devscan_vision::{iou, BBox, TrackedObject};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct AngleConfig {
    /// Accepted angles needed before a session finalizes.
    pub target_count: usize,
    /// Below this elapsed time a candidate must also have moved to count.
    pub min_interval_ms: u64,
    /// At or above this IoU against the last accepted box, the object has
    /// not moved enough on its own.
    pub diversity_iou: f32,
    /// Padding applied when cropping an accepted angle out of the frame.
    pub crop_padding_ratio: f32,
}

impl Default for AngleConfig {
    fn default() -> Self {
        Self {
            target_count: 4,
            min_interval_ms: 3000,
            diversity_iou: 0.7,
            crop_padding_ratio: 0.2,
        }
    }
}

/// Accumulating capture state for one tracked object.
#[derive(Debug)]
struct MultiAngleSession {
    images: Vec<Frame>,
    last_bbox: BBox,
    last_capture: Instant,
    label: String,
    best_score: f32,
}

/// Per-track multi-angle sessions, keyed by track id. Created lazily on the
/// first accepted capture, removed on finalization or cancellation.
#[derive(Debug)]
pub struct AngleSessions {
    cfg: AngleConfig,
    active: HashMap<u64, MultiAngleSession>,
}

impl AngleSessions {
    pub fn new(cfg: AngleConfig) -> Self {
        Self { cfg, active: HashMap::new() }
    }

    pub fn config(&self) -> &AngleConfig {
        &self.cfg
    }

    /// Auto-mode diversity rule. A candidate is rejected only when the box is
    /// nearly where it was AND not enough time has passed; either enough
    /// elapsed time or enough movement qualifies it as a new angle. A track
    /// with no session yet always qualifies.
    pub fn wants_capture(&self, track_id: u64, bbox: &BBox, now: Instant) -> bool {
        let Some(s) = self.active.get(&track_id) else {
            return true;
        };
        let elapsed_ms = now.duration_since(s.last_capture).as_millis() as u64;
        !(elapsed_ms < self.cfg.min_interval_ms && iou(&s.last_bbox, bbox) >= self.cfg.diversity_iou)
    }

    /// Record an accepted angle. Manual mode calls this directly (the shutter
    /// press itself is the diversity signal); auto mode goes through
    /// `wants_capture` first. Returns the finalized set once the target count
    /// is reached, at which point the session leaves the active map and a
    /// later capture for the same id starts from scratch.
    pub fn accept(&mut self, track: &TrackedObject, image: Frame, now: Instant) -> Option<CaptureSet> {
        let s = self.active.entry(track.id).or_insert_with(|| {
            debug!("angle session opened for track {}", track.id);
            MultiAngleSession {
                images: Vec::new(),
                last_bbox: track.bbox,
                last_capture: now,
                label: track.label.clone(),
                best_score: track.score,
            }
        });

        s.images.push(image);
        s.last_bbox = track.bbox;
        s.last_capture = now;
        s.best_score = s.best_score.max(track.score);
        debug!(
            "angle session track {}: {}/{} images",
            track.id,
            s.images.len(),
            self.cfg.target_count
        );

        if s.images.len() < self.cfg.target_count {
            return None;
        }

        let s = self.active.remove(&track.id)?;
        info!(
            "angle session complete for track {} ({} images, label {})",
            track.id,
            s.images.len(),
            s.label
        );
        Some(CaptureSet {
            ts_unix_ms: time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000,
            label: s.label,
            confidence: s.best_score,
            images: s.images,
        })
    }

    /// Number of images collected so far, if a session is open.
    pub fn progress(&self, track_id: u64) -> Option<usize> {
        self.active.get(&track_id).map(|s| s.images.len())
    }

    /// Explicit user cancellation of a starving session.
    pub fn cancel(&mut self, track_id: u64) -> bool {
        self.active.remove(&track_id).is_some()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn track(id: u64, bbox: BBox, score: f32) -> TrackedObject {
        TrackedObject {
            id,
            bbox,
            label: "device".into(),
            score,
            frames_since_last_seen: 0,
            identification_attempted: false,
            product_info: None,
        }
    }

    fn frame() -> Frame {
        Frame { jpeg: vec![0xff, 0xd8], width: 8, height: 8 }
    }

    // boxes tuned so iou(base, nudged) ~= 0.9 / 0.4 against (0,0,100,100)
    fn base() -> BBox {
        BBox::new(0.0, 0.0, 100.0, 100.0)
    }

    #[test]
    fn diversity_rule_worked_examples() {
        let mut gate = AngleSessions::new(AngleConfig::default());
        let t0 = Instant::now();
        let tr = track(1, base(), 0.8);
        assert!(gate.wants_capture(1, &base(), t0)); // no session yet
        gate.accept(&tr, frame(), t0);

        let near = BBox::new(0.0, 0.0, 100.0, 95.0); // iou ~0.95
        let far = BBox::new(0.0, 0.0, 100.0, 40.0); // iou 0.4

        // 1000ms later, barely moved: rejected
        assert!(!gate.wants_capture(1, &near, t0 + Duration::from_millis(1000)));
        // 1000ms later, moved a lot: accepted
        assert!(gate.wants_capture(1, &far, t0 + Duration::from_millis(1000)));
        // 4000ms later, barely moved: accepted on time alone
        assert!(gate.wants_capture(1, &near, t0 + Duration::from_millis(4000)));
    }

    #[test]
    fn session_finalizes_at_target_and_restarts_after() {
        let mut gate = AngleSessions::new(AngleConfig { target_count: 4, ..Default::default() });
        let t0 = Instant::now();
        let tr = track(7, base(), 0.6);

        for i in 0..3 {
            let out = gate.accept(&tr, frame(), t0 + Duration::from_secs(i));
            assert!(out.is_none());
        }
        assert_eq!(gate.progress(7), Some(3));

        let done = gate.accept(&tr, frame(), t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(done.images.len(), 4);
        assert_eq!(done.label, "device");
        assert_eq!(gate.progress(7), None);
        assert_eq!(gate.active_count(), 0);

        // a 5th qualifying capture opens a fresh session, not a 6-image one
        assert!(gate.accept(&tr, frame(), t0 + Duration::from_secs(10)).is_none());
        assert_eq!(gate.progress(7), Some(1));
    }

    #[test]
    fn best_score_tracks_the_maximum_seen() {
        let mut gate = AngleSessions::new(AngleConfig { target_count: 2, ..Default::default() });
        let t0 = Instant::now();
        gate.accept(&track(3, base(), 0.5), frame(), t0);
        let done = gate
            .accept(&track(3, base(), 0.9), frame(), t0 + Duration::from_secs(5))
            .unwrap();
        assert!((done.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn cancel_abandons_a_starving_session() {
        let mut gate = AngleSessions::new(AngleConfig::default());
        let t0 = Instant::now();
        gate.accept(&track(5, base(), 0.5), frame(), t0);
        assert!(gate.cancel(5));
        assert!(!gate.cancel(5));
        assert_eq!(gate.active_count(), 0);
    }
}
