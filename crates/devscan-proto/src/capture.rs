use serde::{Deserialize, Serialize};

/// One captured image: encoded bytes plus pixel dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Result of downstream identification, reported back onto a track.
/// Opaque to the tracking core beyond display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInfo {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub power_watts: Option<f32>,
}

/// A finalized multi-angle capture of one physical object, ready for the
/// downstream identification queue. `images` preserves acceptance order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSet {
    pub ts_unix_ms: i64,
    pub label: String,
    pub confidence: f32,
    pub images: Vec<Frame>,
}
