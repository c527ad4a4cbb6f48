//! Motion filter over frame batches.
//!
//! Classical frame differencing: each frame is compared against its
//! predecessor in grayscale, the difference is denoised (box blur, then a
//! morphological open/close), thresholded, and the fraction of changed
//! pixels decides whether the frame carries motion. Frames without motion
//! are dropped before detection dispatch, which is where most of the GPU
//! budget is saved on static scenes.
//!
//! The first frame of every batch is always part of the result (at index 0)
//! so downstream stages have an anchor even when nothing moved.

use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::filter::box_filter;
use imageproc::map::map_colors2;
use imageproc::morphology::{close, open};
use tracing::debug;
use video_analytics_common::{Frame, MotionResult};

/// Default motion sensitivity.
pub const DEFAULT_SENSITIVITY: u32 = 80;

/// Pixel delta below which a difference is treated as noise.
const DIFF_THRESHOLD: u8 = 10;

/// Detect motion between consecutive frames of a batch.
///
/// `sensitivity` ranges from 1 (almost everything must change) to 100
/// (any change counts); out-of-range values are clamped. Frame `i` (i ≥ 1)
/// is included when the percentage of changed pixels against frame `i − 1`
/// reaches `(100 − sensitivity) × 0.05`. Output preserves input order and
/// records each kept frame's position in the input batch.
#[must_use]
pub fn detect_motion(frames: &[Frame], sensitivity: u32) -> MotionResult {
    let mut result = MotionResult::default();
    if frames.is_empty() {
        return result;
    }

    let sensitivity = sensitivity.clamp(1, 100);
    let threshold = f64::from(100 - sensitivity) * 0.05;

    result.frames.push(frames[0].clone());
    result.index.push(0);

    let mut last = image::imageops::grayscale(&*frames[0].image);
    for (i, frame) in frames.iter().enumerate().skip(1) {
        let current = image::imageops::grayscale(&*frame.image);
        let changed = changed_pixel_ratio(&last, &current);
        if changed >= threshold {
            result.frames.push(frame.clone());
            result.index.push(i);
        }
        last = current;
    }

    debug!(
        input = frames.len(),
        kept = result.frames.len(),
        "motion filter pass"
    );
    result
}

/// Percentage of pixels that changed between two grayscale frames.
///
/// Absolute difference, 5×5 box blur, morphological open then close with a
/// 3×3 structuring element, then the share of pixels whose residual exceeds
/// the noise threshold.
fn changed_pixel_ratio(last: &GrayImage, current: &GrayImage) -> f64 {
    let diff = map_colors2(last, current, |a, b| image::Luma([a[0].abs_diff(b[0])]));
    let blurred = box_filter(&diff, 2, 2);
    let opened = open(&blurred, Norm::LInf, 1);
    let cleaned = close(&opened, Norm::LInf, 1);

    let moved = cleaned.pixels().filter(|p| p[0] > DIFF_THRESHOLD).count();
    let size = u64::from(current.width()) * u64::from(current.height());
    if size == 0 {
        return 0.0;
    }
    moved as f64 * 100.0 / size as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    const W: u32 = 64;
    const H: u32 = 48;

    fn flat_frame(value: u8, ts: f64) -> Frame {
        Frame::new(RgbImage::from_pixel(W, H, image::Rgb([value; 3])), ts)
    }

    /// A dark frame with a bright square whose top-left corner is at `offset`.
    fn square_frame(offset: u32, ts: f64) -> Frame {
        let mut img = RgbImage::from_pixel(W, H, image::Rgb([10; 3]));
        for y in offset..(offset + 16).min(H) {
            for x in offset..(offset + 16).min(W) {
                img.put_pixel(x, y, image::Rgb([240; 3]));
            }
        }
        Frame::new(img, ts)
    }

    #[test]
    fn test_empty_batch() {
        let result = detect_motion(&[], DEFAULT_SENSITIVITY);
        assert!(result.is_empty());
    }

    #[test]
    fn test_single_frame_is_anchor() {
        let result = detect_motion(&[flat_frame(50, 0.0)], DEFAULT_SENSITIVITY);
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.index, vec![0]);
    }

    #[test]
    fn test_static_scene_keeps_only_anchor() {
        let batch: Vec<Frame> = (0..10).map(|i| flat_frame(80, f64::from(i))).collect();
        let result = detect_motion(&batch, DEFAULT_SENSITIVITY);
        assert_eq!(result.index, vec![0]);
    }

    #[test]
    fn test_moving_square_is_kept() {
        let batch = vec![
            square_frame(0, 0.0),
            square_frame(20, 1.0),
            square_frame(20, 2.0), // square stops: no change against previous
            square_frame(0, 3.0),
        ];
        let result = detect_motion(&batch, DEFAULT_SENSITIVITY);
        assert_eq!(result.index, vec![0, 1, 3]);
        // Output order follows input order.
        assert!(result.index.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sensitivity_is_clamped() {
        let batch = vec![flat_frame(0, 0.0), flat_frame(255, 1.0)];
        // 0 clamps to 1; a full-frame change still clears the strictest bar.
        let result = detect_motion(&batch, 0);
        assert_eq!(result.index, vec![0, 1]);
    }

    #[test]
    fn test_low_sensitivity_drops_small_motion() {
        // A 16x16 square moving in a 64x48 frame changes well under half the
        // pixels, so sensitivity 1 (threshold 4.95%) keeps it but only just;
        // a tiny 2x2 change must be dropped.
        let a = RgbImage::from_pixel(W, H, image::Rgb([10; 3]));
        let mut b = a.clone();
        for y in 0..2 {
            for x in 0..2 {
                b.put_pixel(x, y, image::Rgb([240; 3]));
            }
        }
        let batch = vec![Frame::new(a, 0.0), Frame::new(b, 1.0)];
        let result = detect_motion(&batch, 1);
        assert_eq!(result.index, vec![0]);
    }

    #[test]
    fn test_refilter_keeps_anchor_at_zero() {
        let batch = vec![
            square_frame(0, 0.0),
            square_frame(8, 1.0),
            square_frame(16, 2.0),
        ];
        let first = detect_motion(&batch, DEFAULT_SENSITIVITY);
        let second = detect_motion(&first.frames, DEFAULT_SENSITIVITY);
        assert_eq!(second.index[0], 0);
    }
}
