use std::cmp::Ordering;

use image::{GrayImage, Luma, imageops::FilterType};
use ndarray::{ArrayViewD, Axis, s};

use crate::TextBlock;

/// Geometry of the top-left anchored resize into the square network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub width: u32,
    pub height: u32,
    pub input_size: u32,
    pub ratio: f32,
    pub resized_width: u32,
    pub resized_height: u32,
}

impl Letterbox {
    pub fn new(width: u32, height: u32, input_size: u32) -> Self {
        let ratio = input_size as f32 / width.max(height) as f32;
        let max_side = input_size.max(1);
        let resized_width = ((width as f32 * ratio).round() as u32).clamp(1, max_side);
        let resized_height = ((height as f32 * ratio).round() as u32).clamp(1, max_side);

        Self {
            width,
            height,
            input_size,
            ratio,
            resized_width,
            resized_height,
        }
    }

    /// Maps a box from network space back to the original image, clamped to its bounds.
    fn unscale(&self, [x1, y1, x2, y2]: [f32; 4]) -> [f32; 4] {
        let w = self.width as f32;
        let h = self.height as f32;
        [
            (x1 / self.ratio).clamp(0.0, w),
            (y1 / self.ratio).clamp(0.0, h),
            (x2 / self.ratio).clamp(0.0, w),
            (y2 / self.ratio).clamp(0.0, h),
        ]
    }
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);

    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;

    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy NMS: keeps the highest scoring box of every overlapping cluster.
pub fn non_max_suppression(mut candidates: Vec<([f32; 4], f32)>, threshold: f32) -> Vec<([f32; 4], f32)> {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut kept: Vec<([f32; 4], f32)> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(&k.0, &candidate.0) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Decodes the `blk` head: `[1, N, 5 + C]` rows of `cx, cy, w, h, obj, cls...`.
pub(crate) fn decode_blocks(
    pred: ArrayViewD<f32>,
    letterbox: &Letterbox,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> anyhow::Result<Vec<TextBlock>> {
    let shape = pred.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[2] < 5 {
        anyhow::bail!("unexpected blk output shape: {:?}", shape);
    }

    let rows = pred.index_axis(Axis(0), 0);
    let mut candidates = Vec::new();
    for row in rows.outer_iter() {
        let objectness = row[4];
        let score = if row.len() > 5 {
            let class = row.slice(s![5..]).iter().copied().fold(f32::MIN, f32::max);
            objectness * class
        } else {
            objectness
        };
        if score.is_nan() || score < confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        candidates.push((
            [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
        ));
    }

    let mut blocks: Vec<TextBlock> = non_max_suppression(candidates, nms_threshold)
        .into_iter()
        .map(|(xyxy, score)| TextBlock {
            xyxy: letterbox.unscale(xyxy),
            confidence: Some(score.clamp(0.0, 1.0)),
            lines: None,
        })
        .filter(|block| block.width() > 0.0 && block.height() > 0.0)
        .collect();

    // reading order: top to bottom, then left to right
    blocks.sort_by(|a, b| {
        a.xyxy[1]
            .partial_cmp(&b.xyxy[1])
            .unwrap_or(Ordering::Equal)
            .then(a.xyxy[0].partial_cmp(&b.xyxy[0]).unwrap_or(Ordering::Equal))
    });

    Ok(blocks)
}

/// Decodes the `seg` head into a mask at the original image resolution.
pub(crate) fn decode_mask(seg: ArrayViewD<f32>, letterbox: &Letterbox) -> anyhow::Result<GrayImage> {
    let shape = seg.shape();
    if shape.len() < 2 {
        anyhow::bail!("unexpected seg output shape: {:?}", shape);
    }
    let mask_height = shape[shape.len() - 2];
    let mask_width = shape[shape.len() - 1];
    if mask_height == 0 || mask_width == 0 {
        anyhow::bail!("empty seg output: {:?}", shape);
    }

    let values: Vec<u8> = seg
        .iter()
        .take(mask_width * mask_height)
        .map(|&p| (p.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let full = GrayImage::from_raw(mask_width as u32, mask_height as u32, values)
        .ok_or_else(|| anyhow::anyhow!("seg output shorter than {:?}", shape))?;

    let scale_x = mask_width as f32 / letterbox.input_size as f32;
    let scale_y = mask_height as f32 / letterbox.input_size as f32;
    let crop_width = ((letterbox.resized_width as f32 * scale_x).round() as u32).clamp(1, mask_width as u32);
    let crop_height = ((letterbox.resized_height as f32 * scale_y).round() as u32).clamp(1, mask_height as u32);

    let cropped = image::imageops::crop_imm(&full, 0, 0, crop_width, crop_height).to_image();
    Ok(image::imageops::resize(
        &cropped,
        letterbox.width,
        letterbox.height,
        FilterType::Triangle,
    ))
}

pub(crate) fn binarize(mask: &GrayImage, threshold: f32) -> GrayImage {
    let cutoff = (threshold.clamp(0.0, 1.0) * 255.0).round() as u8;
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_pixel(x, y)[0] > cutoff {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
