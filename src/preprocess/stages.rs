//! Individual pixel transforms.
//!
//! Each stage mutates a [`PixelBuffer`] in place, except for resizing, which
//! has to allocate a buffer of the new size anyway. Stages that look at a 3×3
//! neighbourhood copy the source pixels into a caller-supplied scratch buffer
//! first, so that a pipeline can reuse one allocation for all of them.
//!
//! Neighbourhood stages only touch interior pixels. The first and last rows and
//! columns are left exactly as they were.

use image::imageops::{self, FilterType};

use super::{
    PreprocessConfig,
    pixel_buffer::{CHANNELS, PixelBuffer},
};
use crate::prelude::*;

/// The capture DPI we assume for every input image.
pub const BASELINE_DPI: f64 = 72.0;

/// Kernel used by [`sharpen`].
const SHARPEN_KERNEL: [[i32; 3]; 3] = [[0, -1, 0], [-1, 5, -1], [0, -1, 0]];

/// Compute the output size of [`resize_for_dpi`].
///
/// We scale by `target_dpi / 72`, then shrink uniformly if either side would
/// exceed `max_dimension`.
pub fn target_dimensions(width: u32, height: u32, config: &PreprocessConfig) -> (u32, u32) {
    let scale = f64::from(config.target_dpi) / BASELINE_DPI;
    let max = f64::from(config.max_dimension.max(1));
    let mut new_width = (f64::from(width) * scale).round().max(1.0);
    let mut new_height = (f64::from(height) * scale).round().max(1.0);
    if new_width > max || new_height > max {
        let ratio = max / new_width.max(new_height);
        new_width = (new_width * ratio).round();
        new_height = (new_height * ratio).round();
    }
    (
        new_width.clamp(1.0, max) as u32,
        new_height.clamp(1.0, max) as u32,
    )
}

/// Resample `buffer` to the resolution requested by `config`.
///
/// Uses Catmull-Rom (bicubic) filtering, which keeps glyph edges crisp without
/// the ringing Lanczos produces around text.
pub fn resize_for_dpi(buffer: &PixelBuffer, config: &PreprocessConfig) -> Result<PixelBuffer> {
    let (width, height) = target_dimensions(buffer.width(), buffer.height(), config);
    if (width, height) == (buffer.width(), buffer.height()) {
        return Ok(buffer.clone());
    }
    debug!(
        from_width = buffer.width(),
        from_height = buffer.height(),
        width,
        height,
        "Resizing image"
    );
    let source = buffer.clone().into_rgba_image()?;
    let resized = imageops::resize(&source, width, height, FilterType::CatmullRom);
    Ok(PixelBuffer::from(resized))
}

/// ITU-R BT.601 luma.
#[inline]
fn luminance(r: u8, g: u8, b: u8) -> u8 {
    let gray = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
    gray.round().clamp(0.0, 255.0) as u8
}

/// Replace R, G and B with the pixel's luminance. Alpha is untouched.
pub fn grayscale(buffer: &mut PixelBuffer) {
    for px in buffer.pixels_mut().chunks_exact_mut(CHANNELS) {
        let gray = luminance(px[0], px[1], px[2]);
        px[..3].fill(gray);
    }
}

/// Stretch each colour channel away from mid-gray by `factor`.
pub fn enhance_contrast(buffer: &mut PixelBuffer, factor: f32) {
    let offset = 128.0 * (1.0 - factor);
    for px in buffer.pixels_mut().chunks_exact_mut(CHANNELS) {
        for value in &mut px[..3] {
            *value = (f32::from(*value) * factor + offset).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// 3×3 median filter over the intensity (red) channel.
pub fn denoise(buffer: &mut PixelBuffer, scratch: &mut Vec<u8>) {
    let (width, height) = (buffer.width(), buffer.height());
    if width < 3 || height < 3 {
        return;
    }
    scratch.clear();
    scratch.extend_from_slice(buffer.pixels());

    let stride = width as usize * CHANNELS;
    let mut window = [0u8; 9];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut k = 0;
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    window[k] = scratch[ny as usize * stride + nx as usize * CHANNELS];
                    k += 1;
                }
            }
            window.sort_unstable();
            let i = buffer.offset(x, y);
            buffer.pixels_mut()[i..i + 3].fill(window[4]);
        }
    }
}

/// Find a global threshold with Otsu's method, using the red channel.
///
/// Only a strictly larger between-class variance moves the threshold, so on a
/// plateau we keep the smallest candidate.
pub fn otsu_threshold(buffer: &PixelBuffer) -> u8 {
    let mut histogram = [0u64; 256];
    for px in buffer.pixels().chunks_exact(CHANNELS) {
        histogram[px[0] as usize] += 1;
    }

    let total = (buffer.pixels().len() / CHANNELS) as f64;
    let sum = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum::<f64>();

    let mut weight_background = 0.0;
    let mut sum_background = 0.0;
    let mut max_variance = 0.0;
    let mut threshold = 0u8;
    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }
        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum - sum_background) / weight_foreground;
        let variance = weight_background
            * weight_foreground
            * (mean_background - mean_foreground).powi(2);
        if variance > max_variance {
            max_variance = variance;
            threshold = t as u8;
        }
    }
    threshold
}

/// Binarize with an Otsu threshold. Returns the threshold used.
pub fn binarize(buffer: &mut PixelBuffer) -> u8 {
    let threshold = otsu_threshold(buffer);
    for px in buffer.pixels_mut().chunks_exact_mut(CHANNELS) {
        let value = if px[0] > threshold { 255 } else { 0 };
        px[..3].fill(value);
    }
    threshold
}

/// Convolve R, G and B with [`SHARPEN_KERNEL`].
pub fn sharpen(buffer: &mut PixelBuffer, scratch: &mut Vec<u8>) {
    let (width, height) = (buffer.width(), buffer.height());
    if width < 3 || height < 3 {
        return;
    }
    scratch.clear();
    scratch.extend_from_slice(buffer.pixels());

    let stride = width as usize * CHANNELS;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let i = buffer.offset(x, y);
            for channel in 0..3 {
                let mut acc = 0i32;
                for (ky, row) in SHARPEN_KERNEL.iter().enumerate() {
                    for (kx, &weight) in row.iter().enumerate() {
                        if weight == 0 {
                            continue;
                        }
                        let n = (y as usize + ky - 1) * stride
                            + (x as usize + kx - 1) * CHANNELS
                            + channel;
                        acc += weight * i32::from(scratch[n]);
                    }
                }
                buffer.pixels_mut()[i + channel] = acc.clamp(0, 255) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A small colourful image with an uneven alpha channel.
    fn rainbow(width: u32, height: u32) -> PixelBuffer {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[
                    (x * 37 % 256) as u8,
                    (y * 91 % 256) as u8,
                    ((x + y) * 53 % 256) as u8,
                    (200 + x % 50) as u8,
                ]);
            }
        }
        PixelBuffer::from_rgba(width, height, pixels).unwrap()
    }

    fn reds(buffer: &PixelBuffer) -> Vec<u8> {
        buffer.pixels().chunks_exact(CHANNELS).map(|px| px[0]).collect()
    }

    #[test]
    fn grayscale_equalizes_channels_and_keeps_alpha() {
        let original = rainbow(9, 7);
        let mut buffer = original.clone();
        grayscale(&mut buffer);
        for (px, before) in buffer
            .pixels()
            .chunks_exact(CHANNELS)
            .zip(original.pixels().chunks_exact(CHANNELS))
        {
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
            assert_eq!(px[3], before[3]);
        }
    }

    #[test]
    fn grayscale_is_idempotent() {
        let mut once = rainbow(8, 8);
        grayscale(&mut once);
        let mut twice = once.clone();
        grayscale(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn grayscale_uses_bt601_weights() {
        let mut buffer = PixelBuffer::from_rgba(1, 1, vec![255, 0, 0, 255]).unwrap();
        grayscale(&mut buffer);
        assert_eq!(buffer.get(0, 0), [76, 76, 76, 255]);
    }

    #[test]
    fn contrast_factor_one_is_identity() {
        let original = rainbow(10, 6);
        let mut buffer = original.clone();
        enhance_contrast(&mut buffer, 1.0);
        assert_eq!(buffer, original);
    }

    #[test]
    fn contrast_pushes_away_from_mid_gray_and_clamps() {
        let mut buffer = PixelBuffer::from_gray(4, 1, &[0, 100, 128, 250]).unwrap();
        enhance_contrast(&mut buffer, 1.5);
        // 100 * 1.5 - 64 = 86, 128 stays put, the ends clamp.
        assert_eq!(reds(&buffer), vec![0, 86, 128, 255]);
    }

    #[test]
    fn denoise_removes_salt_and_leaves_border() {
        let mut values = vec![10u8; 25];
        values[12] = 255; // center of a 5×5 image
        values[0] = 255; // corner, on the border
        let mut buffer = PixelBuffer::from_gray(5, 5, &values).unwrap();
        let mut scratch = Vec::new();
        denoise(&mut buffer, &mut scratch);
        assert_eq!(buffer.get(2, 2), [10, 10, 10, 255]);
        assert_eq!(buffer.get(0, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn denoise_ignores_tiny_images() {
        let original = PixelBuffer::from_gray(2, 2, &[0, 255, 255, 0]).unwrap();
        let mut buffer = original.clone();
        denoise(&mut buffer, &mut Vec::new());
        assert_eq!(buffer, original);
    }

    #[test]
    fn otsu_separates_two_clusters() {
        #[rustfmt::skip]
        let values = [
            0, 0, 50, 50,
            0, 0, 50, 50,
            200, 200, 250, 250,
            200, 200, 250, 250,
        ];
        let mut buffer = PixelBuffer::from_gray(4, 4, &values).unwrap();
        let threshold = otsu_threshold(&buffer);
        assert!((50..200).contains(&threshold), "threshold was {threshold}");

        binarize(&mut buffer);
        for (value, px) in values.iter().zip(buffer.pixels().chunks_exact(CHANNELS)) {
            let expected = if *value <= 50 { 0 } else { 255 };
            assert_eq!(px[..3], [expected; 3]);
        }
    }

    #[test]
    fn otsu_keeps_first_threshold_on_ties() {
        // Everything between the two clusters gives the same variance.
        let buffer = PixelBuffer::from_gray(2, 1, &[10, 240]).unwrap();
        assert_eq!(otsu_threshold(&buffer), 10);
    }

    #[test]
    fn otsu_on_flat_image_is_zero() {
        let buffer = PixelBuffer::from_gray(3, 3, &[77; 9]).unwrap();
        assert_eq!(otsu_threshold(&buffer), 0);
    }

    #[test]
    fn binarize_outputs_only_black_and_white() {
        let mut buffer = rainbow(16, 16);
        grayscale(&mut buffer);
        binarize(&mut buffer);
        for px in buffer.pixels().chunks_exact(CHANNELS) {
            for &value in &px[..3] {
                assert!(value == 0 || value == 255, "unexpected value {value}");
            }
        }
    }

    #[test]
    fn sharpen_amplifies_a_bright_dot() {
        let mut values = vec![100u8; 9];
        values[4] = 120;
        let mut buffer = PixelBuffer::from_gray(3, 3, &values).unwrap();
        sharpen(&mut buffer, &mut Vec::new());
        // 5 * 120 - 4 * 100 = 200
        assert_eq!(buffer.get(1, 1), [200, 200, 200, 255]);
        assert_eq!(buffer.get(0, 1), [100, 100, 100, 255]);
    }

    #[test]
    fn sharpen_clamps() {
        let mut values = vec![255u8; 9];
        values[4] = 0;
        let mut buffer = PixelBuffer::from_gray(3, 3, &values).unwrap();
        sharpen(&mut buffer, &mut Vec::new());
        assert_eq!(buffer.get(1, 1)[0], 0);
    }

    #[test]
    fn target_dimensions_fit_and_keep_aspect_ratio() {
        let config = PreprocessConfig::default();
        for (width, height) in [
            (100, 100),
            (640, 480),
            (1000, 500),
            (2480, 3508),
            (37, 2000),
            (5000, 5000),
            (1, 1),
        ] {
            let (out_width, out_height) = target_dimensions(width, height, &config);
            assert!(out_width.max(out_height) <= config.max_dimension);
            let expected = f64::from(width) / f64::from(height);
            let actual = f64::from(out_width) / f64::from(out_height);
            // One pixel of rounding on the short side.
            let tolerance = expected / f64::from(out_height.min(out_width)) + 1e-9;
            assert!(
                (expected - actual).abs() <= tolerance.max(expected * 0.02),
                "{width}x{height} became {out_width}x{out_height}"
            );
        }
    }

    #[test]
    fn target_dimensions_scale_from_72_dpi() {
        let config = PreprocessConfig {
            target_dpi: 144,
            ..PreprocessConfig::default()
        };
        assert_eq!(target_dimensions(30, 20, &config), (60, 40));
    }

    #[test]
    fn resize_produces_target_size() {
        let config = PreprocessConfig {
            target_dpi: 144,
            ..PreprocessConfig::default()
        };
        let resized = resize_for_dpi(&rainbow(5, 3), &config).unwrap();
        assert_eq!((resized.width(), resized.height()), (10, 6));
        assert_eq!(resized.pixels().len(), 10 * 6 * CHANNELS);
    }
}
