use devscan_proto::ProductInfo;
use tracing::debug;

use crate::geometry::{iou, BBox};
use crate::overlap::{suppress, OverlapPolicy, Scored};

/// One frame's raw detector output. Ephemeral: produced and consumed within
/// a single frame cycle.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
    pub score: f32,
}

impl Scored for Detection {
    fn bbox(&self) -> &BBox {
        &self.bbox
    }
    fn score(&self) -> f32 {
        self.score
    }
}

/// A persistent identity that survives across frames. Owned exclusively by
/// the `Tracker`; callers only ever see cloned snapshots.
#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub id: u64,
    pub bbox: BBox,
    pub label: String,
    pub score: f32,
    pub frames_since_last_seen: u32,
    pub identification_attempted: bool,
    pub product_info: Option<ProductInfo>,
}

impl Scored for TrackedObject {
    fn bbox(&self) -> &BBox {
        &self.bbox
    }
    fn score(&self) -> f32 {
        self.score
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub iou_match_threshold: f32,
    /// Ceiling on consecutive unseen frames before a track is dropped.
    /// Tunable per mode: short for the plain scan loop, longer when a
    /// multi-angle workflow needs tracks to survive camera pauses.
    pub max_missed_frames: u32,
    pub prune: Option<OverlapPolicy>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_match_threshold: 0.3,
            max_missed_frames: 5,
            prune: Some(OverlapPolicy::track_pruning()),
        }
    }
}

#[derive(Debug)]
pub struct Tracker {
    cfg: TrackerConfig,
    next_id: u64,
    tracks: Vec<TrackedObject>,
}

impl Tracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self { cfg, next_id: 1, tracks: Vec::new() }
    }

    /// One frame step: greedy IoU assignment, aging, spawning, then the
    /// optional pruning pass. The track set is replaced wholesale.
    pub fn update(&mut self, detections: &[Detection]) {
        // All (track, detection) pairs above the match threshold, best first.
        // Stable sort keeps enumeration order on ties, so the tie-break is
        // deterministic: track-major, detection-minor.
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, t) in self.tracks.iter().enumerate() {
            for (di, d) in detections.iter().enumerate() {
                let v = iou(&t.bbox, &d.bbox);
                if v >= self.cfg.iou_match_threshold {
                    pairs.push((ti, di, v));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut matched: Vec<Option<usize>> = vec![None; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        for (ti, di, _) in pairs {
            if matched[ti].is_some() || det_used[di] {
                continue;
            }
            matched[ti] = Some(di);
            det_used[di] = true;
        }

        let mut next: Vec<TrackedObject> = Vec::with_capacity(self.tracks.len() + detections.len());
        for (ti, t) in std::mem::take(&mut self.tracks).into_iter().enumerate() {
            match matched[ti] {
                Some(di) => {
                    let d = &detections[di];
                    next.push(TrackedObject {
                        bbox: d.bbox,
                        label: d.label.clone(),
                        score: d.score,
                        frames_since_last_seen: 0,
                        ..t
                    });
                }
                None => {
                    let missed = t.frames_since_last_seen + 1;
                    if missed > self.cfg.max_missed_frames {
                        debug!("track {} aged out after {} missed frames", t.id, missed);
                    } else {
                        next.push(TrackedObject { frames_since_last_seen: missed, ..t });
                    }
                }
            }
        }

        for (di, d) in detections.iter().enumerate() {
            if det_used[di] {
                continue;
            }
            next.push(TrackedObject {
                id: self.alloc_id(),
                bbox: d.bbox,
                label: d.label.clone(),
                score: d.score,
                frames_since_last_seen: 0,
                identification_attempted: false,
                product_info: None,
            });
        }

        self.tracks = match self.cfg.prune {
            Some(policy) => suppress(next, &policy),
            None => next,
        };
    }

    /// Read-only snapshot of the current track set.
    pub fn snapshot(&self) -> Vec<TrackedObject> {
        self.tracks.clone()
    }

    pub fn get(&self, id: u64) -> Option<TrackedObject> {
        self.tracks.iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Downstream identification reports back through these. Return false if
    /// the track is already gone.
    pub fn mark_identification_attempted(&mut self, id: u64) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == id) {
            Some(t) => {
                t.identification_attempted = true;
                true
            }
            None => false,
        }
    }

    pub fn set_product_info(&mut self, id: u64, info: ProductInfo) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == id) {
            Some(t) => {
                t.product_info = Some(info);
                true
            }
            None => false,
        }
    }

    // Ids are monotonic and never reused within a session.
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x2, y2),
            label: "device".into(),
            score,
        }
    }

    fn cfg(max_missed: u32) -> TrackerConfig {
        TrackerConfig {
            iou_match_threshold: 0.3,
            max_missed_frames: max_missed,
            prune: None,
        }
    }

    #[test]
    fn spawns_tracks_for_unmatched_detections() {
        let mut tr = Tracker::new(cfg(5));
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.8), det(50.0, 50.0, 60.0, 60.0, 0.6)]);
        let snap = tr.snapshot();
        assert_eq!(snap.len(), 2);
        assert_ne!(snap[0].id, snap[1].id);
        assert!(snap.iter().all(|t| t.frames_since_last_seen == 0));
        assert!(snap.iter().all(|t| !t.identification_attempted));
    }

    #[test]
    fn greedy_assignment_prefers_higher_iou_pair() {
        let mut tr = Tracker::new(cfg(5));
        // two tracks side by side
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.8), det(6.0, 0.0, 16.0, 10.0, 0.8)]);
        let before = tr.snapshot();
        let left_id = before
            .iter()
            .find(|t| t.bbox.x1 == 0.0)
            .map(|t| t.id)
            .unwrap();

        // one detection overlapping both, but much closer to the left track
        tr.update(&[det(1.0, 0.0, 11.0, 10.0, 0.9)]);
        let after = tr.snapshot();
        assert_eq!(after.len(), 2);

        let left = after.iter().find(|t| t.id == left_id).unwrap();
        assert_eq!(left.frames_since_last_seen, 0);
        assert_eq!(left.bbox.x1, 1.0);
        assert!((left.score - 0.9).abs() < 1e-6);

        // the other track aged, never matched twice
        let other = after.iter().find(|t| t.id != left_id).unwrap();
        assert_eq!(other.frames_since_last_seen, 1);
    }

    #[test]
    fn track_past_ceiling_disappears_from_snapshot() {
        let mut tr = Tracker::new(cfg(2));
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.8)]);
        assert_eq!(tr.len(), 1);
        tr.update(&[]); // missed 1
        tr.update(&[]); // missed 2
        assert_eq!(tr.len(), 1);
        tr.update(&[]); // missed 3 > ceiling
        assert!(tr.is_empty());
    }

    #[test]
    fn rematch_resets_age_and_keeps_metadata() {
        let mut tr = Tracker::new(cfg(5));
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.8)]);
        let id = tr.snapshot()[0].id;
        assert!(tr.mark_identification_attempted(id));
        assert!(tr.set_product_info(
            id,
            ProductInfo { brand: Some("acme".into()), model: None, power_watts: Some(12.0) }
        ));

        tr.update(&[]); // miss
        tr.update(&[det(1.0, 0.0, 11.0, 10.0, 0.7)]); // rematch
        let t = tr.get(id).unwrap();
        assert_eq!(t.frames_since_last_seen, 0);
        assert!(t.identification_attempted);
        assert_eq!(t.product_info.as_ref().unwrap().brand.as_deref(), Some("acme"));
    }

    #[test]
    fn ids_are_never_reused_after_removal() {
        let mut tr = Tracker::new(cfg(0));
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.8)]);
        let first = tr.snapshot()[0].id;
        tr.update(&[]); // drops immediately with ceiling 0
        assert!(tr.is_empty());
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.8)]);
        let second = tr.snapshot()[0].id;
        assert!(second > first);
    }

    #[test]
    fn pruning_drops_drifted_duplicate_track() {
        let mut tr = Tracker::new(TrackerConfig {
            iou_match_threshold: 0.3,
            max_missed_frames: 10,
            prune: Some(OverlapPolicy::track_pruning()),
        });
        // two distinct objects
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.9), det(40.0, 0.0, 50.0, 10.0, 0.5)]);
        assert_eq!(tr.len(), 2);
        // the weaker one drifts on top of the stronger one
        tr.update(&[det(0.0, 0.0, 10.0, 10.0, 0.9), det(2.0, 0.0, 12.0, 10.0, 0.5)]);
        let snap = tr.snapshot();
        assert_eq!(snap.len(), 1);
        assert!((snap[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn report_back_on_missing_track_is_rejected() {
        let mut tr = Tracker::new(cfg(5));
        assert!(!tr.mark_identification_attempted(99));
        assert!(!tr.set_product_info(
            99,
            ProductInfo { brand: None, model: None, power_watts: None }
        ));
    }
}
