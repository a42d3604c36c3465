//! Pixel buffers and JPEG codec glue.
//!
//! A [`Frame`] is always RGB24 (3 bytes per pixel, row-major). Encoding and
//! decoding go through the `image` crate; quality is the usual JPEG 0-100
//! scale.

use anyhow::Result;
use image::imageops::FilterType;
use image::{ImageBuffer, Rgb};

/// A captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Raw RGB data (3 bytes per pixel, row-major).
    pub data: Vec<u8>,
    /// Frame timestamp in microseconds since capture start.
    pub timestamp_us: u64,
}

impl Frame {
    /// Encode the frame to JPEG bytes at the given quality (0-100).
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let img = self.as_image_buffer()?;

        let mut jpeg_data = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, quality.min(100));
        encoder.encode_image(&img)?;

        Ok(jpeg_data)
    }

    /// Decode JPEG bytes into a frame.
    pub fn from_jpeg(jpeg_data: &[u8]) -> Result<Self> {
        use image::ImageReader;
        use std::io::Cursor;

        let img = ImageReader::new(Cursor::new(jpeg_data))
            .with_guessed_format()?
            .decode()?
            .to_rgb8();

        Ok(Frame {
            width: img.width(),
            height: img.height(),
            data: img.into_raw(),
            timestamp_us: 0,
        })
    }

    /// Return a copy of the frame resized to exactly `width`×`height`.
    ///
    /// Returns the frame unchanged if the dimensions already match.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            anyhow::bail!("Cannot resize to {}x{}", width, height);
        }
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }

        let img = self.as_image_buffer()?;
        let resized = image::imageops::resize(&img, width, height, FilterType::Triangle);

        Ok(Frame {
            width,
            height,
            data: resized.into_raw(),
            timestamp_us: self.timestamp_us,
        })
    }

    fn as_image_buffer(&self) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>> {
        ImageBuffer::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow::anyhow!("Frame buffer does not match {}x{}", self.width, self.height))
    }
}
