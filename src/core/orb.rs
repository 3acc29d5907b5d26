//! Oriented FAST keypoints with rotated BRIEF descriptors.
//!
//! Keypoints are FAST-9 corners found on a scale pyramid, ranked by Harris
//! response and capped per level. Each keypoint gets an intensity-centroid
//! orientation, and its 256-bit descriptor is sampled from a smoothed copy of
//! its level along a fixed, rotated test pattern.

use crate::common::config::ExtractorConfig;
use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::OnceLock;

pub const DESCRIPTOR_BYTES: usize = 32;
pub type Descriptor = [u8; DESCRIPTOR_BYTES];

const PATTERN_SEED: u64 = 0x6f72_625f_7061_7474;
const PATTERN_EXTENT: i32 = 13;
const HARRIS_BLOCK: i32 = 7;
const HARRIS_K: f32 = 0.04;
const DESCRIPTOR_SIGMA: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in full-resolution coordinates.
    pub x: f32,
    pub y: f32,
    pub level: u32,
    /// Orientation in radians.
    pub angle: f32,
    pub response: f32,
}

/// Pyramid and detector settings, taken from the extractor config.
#[derive(Debug, Clone)]
pub struct OrbParams {
    pub n_features: usize,
    pub scale_factor: f32,
    pub n_levels: u32,
    pub edge_threshold: u32,
    pub patch_size: u32,
    pub fast_threshold: u8,
}

impl From<&ExtractorConfig> for OrbParams {
    fn from(config: &ExtractorConfig) -> Self {
        Self {
            n_features: config.n_features,
            scale_factor: config.scale_factor,
            n_levels: config.n_levels,
            edge_threshold: config.edge_threshold,
            patch_size: config.patch_size,
            fast_threshold: config.fast_threshold,
        }
    }
}

/// Pairs of sample offsets `(x1, y1, x2, y2)`, one per descriptor bit.
fn pattern() -> &'static [[i8; 4]; 256] {
    static PATTERN: OnceLock<[[i8; 4]; 256]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut pairs = [[0i8; 4]; 256];
        for pair in pairs.iter_mut() {
            loop {
                let p: [i8; 4] =
                    std::array::from_fn(|_| rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT) as i8);
                if (p[0], p[1]) != (p[2], p[3]) {
                    *pair = p;
                    break;
                }
            }
        }
        pairs
    })
}

/// Split the feature budget across levels, geometrically decreasing with
/// scale so every level gets a share proportional to its area.
fn features_per_level(n_features: usize, scale_factor: f32, n_levels: u32) -> Vec<usize> {
    let n_levels = n_levels.max(1) as usize;
    let factor = 1.0 / scale_factor;
    let mut per_scale =
        n_features as f32 * (1.0 - factor) / (1.0 - factor.powi(n_levels as i32));

    let mut budget = Vec::with_capacity(n_levels);
    let mut sum = 0usize;
    for _ in 0..n_levels - 1 {
        let n = per_scale.round() as usize;
        budget.push(n);
        sum += n;
        per_scale *= factor;
    }
    budget.push(n_features.saturating_sub(sum));
    budget
}

fn build_pyramid(image: &GrayImage, params: &OrbParams) -> Vec<(f32, GrayImage)> {
    let min_side = 2 * params.edge_threshold + 1;
    let mut levels = Vec::with_capacity(params.n_levels as usize);

    for level in 0..params.n_levels {
        let scale = params.scale_factor.powi(level as i32);
        let w = (image.width() as f32 / scale).round() as u32;
        let h = (image.height() as f32 / scale).round() as u32;
        if w < min_side || h < min_side {
            break;
        }
        let img = if level == 0 {
            image.clone()
        } else {
            imageops::resize(image, w, h, FilterType::Triangle)
        };
        levels.push((scale, img));
    }
    levels
}

/// 3x3 non-maximum suppression over FAST scores. Equal neighbours are
/// resolved in favour of the earlier one in raster order.
fn non_max_suppress(corners: Vec<Corner>, width: u32, height: u32) -> Vec<Corner> {
    let mut scores = vec![f32::NEG_INFINITY; (width * height) as usize];
    for c in &corners {
        scores[(c.y * width + c.x) as usize] = c.score;
    }

    corners
        .into_iter()
        .filter(|c| {
            let own = c.y * width + c.x;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = c.x as i32 + dx;
                    let ny = c.y as i32 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                        continue;
                    }
                    let idx = ny as u32 * width + nx as u32;
                    let s = scores[idx as usize];
                    if s > c.score || (s == c.score && idx < own) {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

#[inline]
fn pixel(image: &GrayImage, x: i32, y: i32) -> f32 {
    let x = x.clamp(0, image.width() as i32 - 1) as u32;
    let y = y.clamp(0, image.height() as i32 - 1) as u32;
    image.get_pixel(x, y)[0] as f32
}

fn harris_response(image: &GrayImage, x: i32, y: i32) -> f32 {
    let r = HARRIS_BLOCK / 2;
    let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
    for v in -r..=r {
        for u in -r..=r {
            let px = x + u;
            let py = y + v;
            let dx = pixel(image, px + 1, py) - pixel(image, px - 1, py);
            let dy = pixel(image, px, py + 1) - pixel(image, px, py - 1);
            a += dx * dx;
            b += dy * dy;
            c += dx * dy;
        }
    }
    a * b - c * c - HARRIS_K * (a + b) * (a + b)
}

/// Angle of the vector from the keypoint to the intensity centroid of the
/// surrounding disc.
fn orientation(image: &GrayImage, x: i32, y: i32, radius: i32) -> f32 {
    let (mut m01, mut m10) = (0f32, 0f32);
    for v in -radius..=radius {
        for u in -radius..=radius {
            if u * u + v * v > radius * radius {
                continue;
            }
            let i = pixel(image, x + u, y + v);
            m10 += u as f32 * i;
            m01 += v as f32 * i;
        }
    }
    m01.atan2(m10)
}

fn describe(smoothed: &GrayImage, x: i32, y: i32, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let rotate = |px: i8, py: i8| {
        let (px, py) = (px as f32, py as f32);
        let rx = (cos * px - sin * py).round() as i32;
        let ry = (sin * px + cos * py).round() as i32;
        (x + rx, y + ry)
    };

    let mut desc = [0u8; DESCRIPTOR_BYTES];
    for (bit, p) in pattern().iter().enumerate() {
        let (ax, ay) = rotate(p[0], p[1]);
        let (bx, by) = rotate(p[2], p[3]);
        if pixel(smoothed, ax, ay) < pixel(smoothed, bx, by) {
            desc[bit / 8] |= 1 << (bit % 8);
        }
    }
    desc
}

/// Detect keypoints and compute one descriptor per keypoint.
pub fn detect_and_compute(image: &GrayImage, params: &OrbParams) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let budget = features_per_level(params.n_features, params.scale_factor, params.n_levels);
    let border = params.edge_threshold;
    let radius = (params.patch_size / 2) as i32;

    let mut keypoints = Vec::new();
    let mut descriptors = Vec::new();

    for (level, (scale, img)) in build_pyramid(image, params).into_iter().enumerate() {
        let (w, h) = img.dimensions();
        let corners: Vec<Corner> = corners_fast9(&img, params.fast_threshold)
            .into_iter()
            .filter(|c| c.x >= border && c.y >= border && c.x < w - border && c.y < h - border)
            .collect();
        let corners = non_max_suppress(corners, w, h);

        let mut ranked: Vec<(f32, Corner)> = corners
            .into_iter()
            .map(|c| (harris_response(&img, c.x as i32, c.y as i32), c))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        ranked.truncate(budget[level]);

        if ranked.is_empty() {
            continue;
        }

        let smoothed = gaussian_blur_f32(&img, DESCRIPTOR_SIGMA);
        for (response, c) in ranked {
            let (x, y) = (c.x as i32, c.y as i32);
            let angle = orientation(&img, x, y, radius);
            descriptors.push(describe(&smoothed, x, y, angle));
            keypoints.push(Keypoint {
                x: c.x as f32 * scale,
                y: c.y as f32 * scale,
                level: level as u32,
                angle,
                response,
            });
        }
    }

    tracing::trace!("ORB: {} keypoints", keypoints.len());
    (keypoints, descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn params() -> OrbParams {
        OrbParams::from(&ExtractorConfig::default())
    }

    fn blocks(seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let cells: Vec<u8> = (0..40 * 60).map(|_| rng.gen()).collect();
        GrayImage::from_fn(200, 300, |x, y| Luma([cells[((y / 6) * 40 + x / 6) as usize]]))
    }

    #[test]
    fn level_budget_sums_to_total() {
        let budget = features_per_level(900, 1.2, 8);
        assert_eq!(budget.len(), 8);
        assert_eq!(budget.iter().sum::<usize>(), 900);
        assert!(budget[0] > budget[7]);
    }

    #[test]
    fn pattern_is_stable_and_bounded() {
        let a = pattern();
        let b = pattern();
        assert!(std::ptr::eq(a, b));
        assert!(a.iter().flatten().all(|&v| (-13..=13).contains(&v)));
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(200, 300, Luma([128]));
        let (kps, descs) = detect_and_compute(&img, &params());
        assert!(kps.is_empty());
        assert!(descs.is_empty());
    }

    #[test]
    fn textured_image_yields_deterministic_features() {
        let img = blocks(7);
        let (kps, first) = detect_and_compute(&img, &params());
        let (_, second) = detect_and_compute(&img, &params());
        assert!(first.len() >= 20, "only {} descriptors", first.len());
        assert!(first.len() <= 900);
        assert_eq!(kps.len(), first.len());
        assert_eq!(first, second);
    }

    #[test]
    fn suppression_keeps_one_of_equal_neighbours() {
        let corners = vec![
            Corner::new(5, 5, 10.0),
            Corner::new(6, 5, 10.0),
            Corner::new(9, 9, 3.0),
        ];
        let kept = non_max_suppress(corners, 16, 16);
        let coords: Vec<_> = kept.iter().map(|c| (c.x, c.y)).collect();
        assert_eq!(coords, vec![(5, 5), (9, 9)]);
    }
}
