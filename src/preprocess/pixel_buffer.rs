//! In-memory RGBA rasters.

use std::{fmt, io::Cursor};

use image::{DynamicImage, ImageFormat, RgbaImage};

use crate::prelude::*;

/// Number of bytes per pixel. Channels are always stored as R, G, B, A.
pub const CHANNELS: usize = 4;

/// A mutable 8-bit-per-channel RGBA raster.
///
/// `pixels.len()` is always `width * height * 4`. Every preprocessing stage
/// works on one of these, in place.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGBA bytes, checking that the length matches the dimensions.
    #[cfg(test)]
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("image dimensions {width}x{height} are too large"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "pixel buffer for {width}x{height} image should have {expected} bytes, found {}",
                pixels.len()
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Build a buffer where every pixel has `R = G = B = value` and full alpha.
    ///
    /// `values` holds one intensity per pixel, row by row.
    #[cfg(test)]
    pub fn from_gray(width: u32, height: u32, values: &[u8]) -> Result<Self> {
        let pixels = values
            .iter()
            .flat_map(|&v| [v, v, v, u8::MAX])
            .collect::<Vec<_>>();
        Self::from_rgba(width, height, pixels)
    }

    /// Decode an encoded image file (PNG, JPEG, WebP, GIF or TIFF).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let image =
            image::load_from_memory(data).context("could not decode image data")?;
        Ok(Self::from(image.to_rgba8()))
    }

    /// Encode this buffer as a PNG file.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let image = RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("pixel buffer does not match its dimensions"))?;
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .context("could not encode PNG")?;
        Ok(out.into_inner())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Mutable raw RGBA bytes. The length can't change, so the invariant holds.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Byte offset of the pixel at `(x, y)`.
    #[inline]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    /// The RGBA value at `(x, y)`.
    #[cfg(test)]
    pub fn get(&self, x: u32, y: u32) -> [u8; 4] {
        let i = self.offset(x, y);
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    /// Is there anything to process?
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Convert into an [`RgbaImage`] without copying.
    pub fn into_rgba_image(self) -> Result<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match its dimensions"))
    }
}

impl From<RgbaImage> for PixelBuffer {
    fn from(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }
}

// Images are big, so we don't want to print every byte.
impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_length() {
        assert!(PixelBuffer::from_rgba(2, 2, vec![0; 15]).is_err());
        assert!(PixelBuffer::from_rgba(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn png_round_trip_preserves_pixels() {
        let buffer = PixelBuffer::from_gray(3, 2, &[0, 10, 20, 30, 40, 250]).unwrap();
        let png = buffer.to_png().unwrap();
        let decoded = PixelBuffer::decode(&png).unwrap();
        assert_eq!(decoded, buffer);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PixelBuffer::decode(b"definitely not an image").is_err());
    }
}
