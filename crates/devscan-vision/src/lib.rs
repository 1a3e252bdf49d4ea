pub mod geometry;
pub mod overlap;
pub mod tracker;

pub use geometry::{containment, iou, BBox};
pub use overlap::{suppress, OverlapPolicy, Scored};
pub use tracker::{Detection, TrackedObject, Tracker, TrackerConfig};
