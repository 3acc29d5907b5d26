use crate::common::config::CaptureConfig;
use crate::sensor::Frame;
use serde::{Deserialize, Serialize};

/// Per-frame quality measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySignal {
    /// Laplacian-variance sharpness rescaled to 0..=100.
    pub sharpness: u8,
    /// Mean intensity, used as a pressure proxy.
    pub mean_intensity: f32,
    /// Population standard deviation, used as a contact signal.
    pub contrast_std: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressureHint {
    TooLight,
    Good,
    TooHard,
}

impl QualitySignal {
    /// Analyze a frame. Pure function of the pixel content.
    pub fn analyze(frame: &Frame) -> Self {
        let (mean_intensity, contrast_std) = mean_and_std(frame.pixels());
        let lap_var = laplacian_variance(frame.pixels(), frame.width() as usize, frame.height() as usize);
        let sharpness = (lap_var / 20.0).clamp(0.0, 100.0) as u8;

        Self {
            sharpness,
            mean_intensity,
            contrast_std,
        }
    }

    pub fn finger_present(&self, config: &CaptureConfig) -> bool {
        self.contrast_std >= config.finger_present_std
    }

    pub fn finger_removed(&self, config: &CaptureConfig) -> bool {
        self.contrast_std <= config.finger_removed_std
    }

    pub fn meets_minimum_quality(&self, min_quality: u8) -> bool {
        self.sharpness >= min_quality
    }

    pub fn pressure_hint(&self, config: &CaptureConfig) -> PressureHint {
        if self.mean_intensity > config.pressure_high {
            PressureHint::TooHard
        } else if self.mean_intensity < config.pressure_low {
            PressureHint::TooLight
        } else {
            PressureHint::Good
        }
    }

    /// Short operator-facing status line.
    pub fn get_quality_assessment(&self, config: &CaptureConfig) -> String {
        let pressure = self.mean_intensity as i32;
        let hint = match self.pressure_hint(config) {
            PressureHint::TooHard => format!("Lift slightly (pressure={})", pressure),
            PressureHint::TooLight => format!("Press a little harder (pressure={})", pressure),
            PressureHint::Good => format!("Perfect (pressure={})", pressure),
        };
        format!("Quality: {}% | {}", self.sharpness, hint)
    }
}

fn mean_and_std(pixels: &[u8]) -> (f32, f32) {
    if pixels.is_empty() {
        return (0.0, 0.0);
    }

    let mut sum = 0u64;
    let mut sum_sq = 0u64;
    for &p in pixels {
        let p = p as u64;
        sum += p;
        sum_sq += p * p;
    }

    let n = pixels.len() as f64;
    let mean = sum as f64 / n;
    let variance = (sum_sq as f64 / n - mean * mean).max(0.0);
    (mean as f32, variance.sqrt() as f32)
}

/// Variance of the 4-neighbour Laplacian with reflect-101 borders.
fn laplacian_variance(pixels: &[u8], width: usize, height: usize) -> f32 {
    if width == 0 || height == 0 {
        return 0.0;
    }

    let at = |x: usize, y: usize| pixels[y * width + x] as f64;
    let mut sum = 0f64;
    let mut sum_sq = 0f64;

    for y in 0..height {
        let up = reflect101(y as isize - 1, height);
        let down = reflect101(y as isize + 1, height);
        for x in 0..width {
            let left = reflect101(x as isize - 1, width);
            let right = reflect101(x as isize + 1, width);
            let lap = at(x, up) + at(x, down) + at(left, y) + at(right, y) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let n = (width * height) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

fn reflect101(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i > last {
        i = 2 * last - i;
    }
    i.clamp(0, last) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8) -> Frame {
        Frame::from_raw(16, 16, vec![value; 256]).unwrap()
    }

    fn checkerboard() -> Frame {
        let data = (0..256)
            .map(|i| if (i % 16 + i / 16) % 2 == 0 { 0 } else { 255 })
            .collect();
        Frame::from_raw(16, 16, data).unwrap()
    }

    #[test]
    fn flat_frame_has_no_contrast_or_sharpness() {
        let q = QualitySignal::analyze(&flat(200));
        assert_eq!(q.sharpness, 0);
        assert_eq!(q.contrast_std, 0.0);
        assert_eq!(q.mean_intensity, 200.0);
        assert!(!q.finger_present(&CaptureConfig::default()));
        assert!(q.finger_removed(&CaptureConfig::default()));
    }

    #[test]
    fn checkerboard_is_maximally_sharp() {
        let q = QualitySignal::analyze(&checkerboard());
        assert_eq!(q.sharpness, 100);
        assert!((q.contrast_std - 127.5).abs() < 0.01);
        assert!(q.finger_present(&CaptureConfig::default()));
    }

    #[test]
    fn pressure_hint_uses_target_band() {
        let config = CaptureConfig::default();
        assert_eq!(QualitySignal::analyze(&flat(30)).pressure_hint(&config), PressureHint::TooLight);
        assert_eq!(QualitySignal::analyze(&flat(100)).pressure_hint(&config), PressureHint::Good);
        assert_eq!(QualitySignal::analyze(&flat(220)).pressure_hint(&config), PressureHint::TooHard);
    }

    #[test]
    fn reflect101_mirrors_without_repeating_edge() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(2, 5), 2);
    }
}
