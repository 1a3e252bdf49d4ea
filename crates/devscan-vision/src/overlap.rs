use crate::geometry::{containment, iou, BBox};

/// Anything with a box and a confidence can go through suppression: raw
/// detections before tracking, persistent tracks after assignment.
pub trait Scored {
    fn bbox(&self) -> &BBox;
    fn score(&self) -> f32;
}

#[derive(Debug, Clone, Copy)]
pub struct OverlapPolicy {
    pub iou_threshold: f32,
    pub containment_threshold: f32,
}

impl OverlapPolicy {
    /// NMS on raw detections within a single frame.
    pub fn detection_nms() -> Self {
        Self { iou_threshold: 0.55, containment_threshold: 0.85 }
    }

    /// Pruning on the persistent track set. Lower thresholds: a track that
    /// drifted onto a higher-confidence one is dropped immediately instead of
    /// lingering as a ghost until it ages out.
    pub fn track_pruning() -> Self {
        Self { iou_threshold: 0.35, containment_threshold: 0.6 }
    }
}

/// Greedy suppression: sort by score descending (stable, ties keep input
/// order), keep the best, drop any later item that overlaps a kept one above
/// the IoU threshold or sits inside it above the containment threshold.
pub fn suppress<T: Scored>(items: Vec<T>, policy: &OverlapPolicy) -> Vec<T> {
    let mut items = items;
    items.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    'outer: for item in items {
        for k in &kept {
            if iou(k.bbox(), item.bbox()) >= policy.iou_threshold
                || containment(k.bbox(), item.bbox()) >= policy.containment_threshold
            {
                continue 'outer;
            }
        }
        kept.push(item);
    }
    kept
}
