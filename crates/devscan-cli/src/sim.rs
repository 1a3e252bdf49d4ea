//! Synthetic scene standing in for the camera + classifier pair, so the full
//! pipeline can run without hardware. The scene is the ground truth: the
//! camera renders it, the detector reads it back with noise.

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use devscan_capture::{Camera, CaptureQuality, Detector};
use devscan_proto::Frame;
use devscan_vision::{BBox, Detection};

const LABELS: &[&str] = &["laptop", "monitor", "kettle", "router", "lamp"];

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SimConfig {
    pub objects: usize,
    /// Per-frame random walk amplitude, scene pixels.
    pub walk_px: f32,
    /// Extra per-detection jitter, scene pixels.
    pub jitter_px: f32,
    /// Probability the detector misses an object on a given frame.
    pub miss_rate: f64,
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            objects: 3,
            walk_px: 3.0,
            jitter_px: 2.0,
            miss_rate: 0.1,
            seed: None,
        }
    }
}

// Scene space equals the low-res detection geometry.
const SCENE_W: u32 = 640;
const SCENE_H: u32 = 480;

#[derive(Debug)]
struct SimObject {
    bbox: BBox,
    label: String,
    color: [u8; 3],
}

#[derive(Debug)]
pub struct Scene {
    cfg: SimConfig,
    rng: StdRng,
    objects: Vec<SimObject>,
}

impl Scene {
    pub fn new(cfg: SimConfig) -> Self {
        let mut rng = match cfg.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let objects = (0..cfg.objects)
            .map(|i| {
                let w = rng.gen_range(60.0..140.0);
                let h = rng.gen_range(60.0..140.0);
                let x = rng.gen_range(0.0..(SCENE_W as f32 - w));
                let y = rng.gen_range(0.0..(SCENE_H as f32 - h));
                SimObject {
                    bbox: BBox::new(x, y, x + w, y + h),
                    label: LABELS[i % LABELS.len()].to_string(),
                    color: [rng.gen(), rng.gen(), rng.gen()],
                }
            })
            .collect();
        Self { cfg, rng, objects }
    }

    /// Advance the world one frame: each object random-walks a little,
    /// clamped to the scene.
    fn step(&mut self) {
        let amp = self.cfg.walk_px;
        for o in &mut self.objects {
            let dx = self.rng.gen_range(-amp..=amp);
            let dy = self.rng.gen_range(-amp..=amp);
            let (w, h) = (o.bbox.width(), o.bbox.height());
            let x = (o.bbox.x1 + dx).clamp(0.0, SCENE_W as f32 - w);
            let y = (o.bbox.y1 + dy).clamp(0.0, SCENE_H as f32 - h);
            o.bbox = BBox::new(x, y, x + w, y + h);
        }
    }

    fn detections(&mut self) -> Vec<Detection> {
        let mut out = Vec::new();
        for i in 0..self.objects.len() {
            if self.rng.gen_bool(self.cfg.miss_rate) {
                continue;
            }
            let j = self.cfg.jitter_px;
            let jx = self.rng.gen_range(-j..=j);
            let jy = self.rng.gen_range(-j..=j);
            let o = &self.objects[i];
            out.push(Detection {
                bbox: BBox::new(o.bbox.x1 + jx, o.bbox.y1 + jy, o.bbox.x2 + jx, o.bbox.y2 + jy),
                label: o.label.clone(),
                score: self.rng.gen_range(0.55..0.95),
            });
        }
        out
    }

    fn render(&self, w: u32, h: u32) -> Result<Frame> {
        let sx = w as f32 / SCENE_W as f32;
        let sy = h as f32 / SCENE_H as f32;
        let mut img = image::RgbImage::from_pixel(w, h, image::Rgb([24, 24, 24]));
        for o in &self.objects {
            let b = o.bbox.scaled(sx, sy);
            let x1 = b.x1.max(0.0) as u32;
            let y1 = b.y1.max(0.0) as u32;
            let x2 = (b.x2 as u32).min(w.saturating_sub(1));
            let y2 = (b.y2 as u32).min(h.saturating_sub(1));
            for y in y1..=y2 {
                for x in x1..=x2 {
                    img.put_pixel(x, y, image::Rgb(o.color));
                }
            }
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .context("encode sim frame")?;
        Ok(Frame { jpeg: buf, width: w, height: h })
    }
}

pub struct SimCamera {
    scene: Rc<RefCell<Scene>>,
}

impl SimCamera {
    pub fn new(scene: Rc<RefCell<Scene>>) -> Self {
        Self { scene }
    }
}

impl Camera for SimCamera {
    async fn capture(&self, quality: CaptureQuality) -> Result<Frame> {
        // modest shutter latency, keeps the gate arithmetic honest
        tokio::time::sleep(Duration::from_millis(25)).await;
        let mut scene = self.scene.borrow_mut();
        match quality {
            CaptureQuality::Low => {
                scene.step();
                scene.render(SCENE_W, SCENE_H)
            }
            CaptureQuality::Full => scene.render(SCENE_W * 2, SCENE_H * 2),
        }
    }
}

pub struct SimDetector {
    scene: Rc<RefCell<Scene>>,
}

impl SimDetector {
    pub fn new(scene: Rc<RefCell<Scene>>) -> Self {
        Self { scene }
    }
}

impl Detector for SimDetector {
    async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(self.scene.borrow_mut().detections())
    }
}
