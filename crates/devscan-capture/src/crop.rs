use std::io::Cursor;

use anyhow::{Context, Result};
use devscan_proto::Frame;
use devscan_vision::BBox;

use crate::Cropper;

/// Decode, crop with padding, re-encode. The padding gives downstream
/// identification some context around the object (logos, labels, cables).
#[derive(Debug, Clone, Default)]
pub struct JpegCropper;

impl Cropper for JpegCropper {
    fn crop(&self, frame: &Frame, bbox: &BBox, padding_ratio: f32) -> Result<Frame> {
        let img = image::load_from_memory(&frame.jpeg).context("decode frame")?;
        let (iw, ih) = (img.width() as f32, img.height() as f32);

        let p = bbox.padded(padding_ratio, iw, ih);
        let x = (p.x1.floor().max(0.0) as u32).min(img.width().saturating_sub(1));
        let y = (p.y1.floor().max(0.0) as u32).min(img.height().saturating_sub(1));
        let w = (p.width().ceil() as u32).clamp(1, img.width().saturating_sub(x).max(1));
        let h = (p.height().ceil() as u32).clamp(1, img.height().saturating_sub(y).max(1));

        let out = img.crop_imm(x, y, w, h);
        let mut buf = Vec::new();
        out.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .context("encode crop")?;
        Ok(Frame { jpeg: buf, width: out.width(), height: out.height() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_frame(w: u32, h: u32) -> Frame {
        let img = image::DynamicImage::new_rgb8(w, h);
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        Frame { jpeg: buf, width: w, height: h }
    }

    #[test]
    fn crop_stays_within_image_bounds() {
        let frame = jpeg_frame(64, 48);
        let bbox = BBox::new(50.0, 30.0, 70.0, 60.0); // spills past the edge
        let out = JpegCropper.crop(&frame, &bbox, 0.2).unwrap();
        assert!(out.width <= 64);
        assert!(out.height <= 48);
        assert!(!out.jpeg.is_empty());
    }

    #[test]
    fn degenerate_bbox_still_yields_a_pixel() {
        let frame = jpeg_frame(32, 32);
        let bbox = BBox::new(10.0, 10.0, 10.0, 10.0);
        let out = JpegCropper.crop(&frame, &bbox, 0.0).unwrap();
        assert!(out.width >= 1);
        assert!(out.height >= 1);
    }
}
