//! Image enhancement applied before feature extraction.
//!
//! Every frame, whether enrolled or probed, goes through the same chain:
//! center crop, CLAHE, light denoise, unsharp mask. Rotated probe variants
//! are produced from the enhanced image.

use crate::common::config::ExtractorConfig;
use image::{imageops, GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::filter::gaussian_blur_f32;
use imageproc::map::map_subpixels;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

/// Sigma equivalent to a 3x3 Gaussian kernel.
const DENOISE_SIGMA: f32 = 0.8;
const UNSHARP_SIGMA: f32 = 1.0;
const UNSHARP_AMOUNT: f32 = 1.6;

/// Keep the central region, dropping `crop_x` of the width and `crop_y` of
/// the height on each side.
pub fn center_crop(image: &GrayImage, crop_x: f32, crop_y: f32) -> GrayImage {
    let (w, h) = image.dimensions();
    let x0 = (w as f32 * crop_x) as u32;
    let x1 = (w as f32 * (1.0 - crop_x)) as u32;
    let y0 = (h as f32 * crop_y) as u32;
    let y1 = (h as f32 * (1.0 - crop_y)) as u32;
    let cw = x1.saturating_sub(x0).max(1).min(w);
    let ch = y1.saturating_sub(y0).max(1).min(h);
    imageops::crop_imm(image, x0.min(w - cw), y0.min(h - ch), cw, ch).to_image()
}

/// Contrast-limited adaptive histogram equalization over a `tiles x tiles`
/// grid, with bilinear blending between neighbouring tile mappings.
pub fn clahe(image: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let tiles_x = tiles.clamp(1, w);
    let tiles_y = tiles.clamp(1, h);

    let bounds = |i: u32, n: u32, len: u32| (i * len / n, (i + 1) * len / n);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        let (y0, y1) = bounds(ty, tiles_y, h);
        for tx in 0..tiles_x {
            let (x0, x1) = bounds(tx, tiles_x, w);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            luts[(ty * tiles_x + tx) as usize] = clipped_lut(&mut hist, area, clip_limit);
        }
    }

    let tile_w = w as f32 / tiles_x as f32;
    let tile_h = h as f32 / tiles_y as f32;
    let mut out = GrayImage::new(w, h);

    for y in 0..h {
        let fy = (y as f32 + 0.5) / tile_h - 0.5;
        let ty0 = fy.floor().max(0.0) as u32;
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let wy = (fy - ty0 as f32).clamp(0.0, 1.0);

        for x in 0..w {
            let fx = (x as f32 + 0.5) / tile_w - 0.5;
            let tx0 = fx.floor().max(0.0) as u32;
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let wx = (fx - tx0 as f32).clamp(0.0, 1.0);

            let v = image.get_pixel(x, y)[0] as usize;
            let at = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f32;
            let top = at(tx0, ty0) * (1.0 - wx) + at(tx1, ty0) * wx;
            let bottom = at(tx0, ty1) * (1.0 - wx) + at(tx1, ty1) * wx;
            let value = top * (1.0 - wy) + bottom * wy;
            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }

    out
}

fn clipped_lut(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if area == 0 {
        return lut;
    }

    let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let per_bin = excess / 256;
    let residual = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += per_bin + u32::from(i < residual);
    }

    let scale = 255.0 / area as f32;
    let mut cdf = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[i] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Light denoise followed by an unsharp mask that lifts ridge edges. Both
/// blurs run in f32 and the result is rounded once.
pub fn sharpen(image: &GrayImage) -> GrayImage {
    let image: Image<Luma<f32>> = map_subpixels(image, |x| x as f32);
    let denoised = gaussian_blur_f32(&image, DENOISE_SIGMA);
    let blurred = gaussian_blur_f32(&denoised, UNSHARP_SIGMA);

    let mut out = GrayImage::new(image.width(), image.height());
    for ((o, d), b) in out.pixels_mut().zip(denoised.pixels()).zip(blurred.pixels()) {
        let v = UNSHARP_AMOUNT * d[0] - (UNSHARP_AMOUNT - 1.0) * b[0];
        *o = Luma([v.round().clamp(0.0, 255.0) as u8]);
    }
    out
}

/// Full enhancement chain for one raw sensor image.
pub fn enhance(image: &GrayImage, config: &ExtractorConfig) -> GrayImage {
    let cropped = center_crop(image, config.crop_x, config.crop_y);
    let equalized = clahe(&cropped, config.clahe_clip_limit, config.clahe_tiles);
    sharpen(&equalized)
}

/// Rotate about the image center by `degrees` (counter-clockwise), filling
/// exposed corners with white so they read as empty sensor glass.
pub fn rotate(image: &GrayImage, degrees: f32) -> GrayImage {
    if degrees == 0.0 {
        return image.clone();
    }
    rotate_about_center(
        image,
        -degrees.to_radians(),
        Interpolation::Bilinear,
        Luma([255u8]),
    )
}
