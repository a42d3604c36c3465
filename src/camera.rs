//! V4L2 camera capture (feature `camera`).
//!
//! Frames come off the device as MJPEG, YUYV or GREY and are converted to
//! RGB24 before they leave this module. The v4l crate's types are Send, so
//! the capture loop can live on a plain thread.

use anyhow::Result;
use std::path::PathBuf;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::frame::Frame;
use crate::producer::FrameSource;

/// Information about an available capture device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Camera index (used to open the camera).
    pub index: u32,
    /// Human-readable camera name.
    pub name: String,
    /// Device path (e.g., /dev/video0).
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PixelFormat {
    Mjpeg,
    Yuyv,
    Grey,
}

/// A camera capture device.
pub struct Camera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    format: PixelFormat,
    start_time: std::time::Instant,
}

// v4l types are Send; the stream borrows a leaked device.
unsafe impl Send for Camera {}

impl Camera {
    /// Open a camera by index at the requested resolution.
    ///
    /// The driver may adjust the resolution; the negotiated values are
    /// reported by [`width`](Self::width) and [`height`](Self::height).
    pub fn open(index: u32, width: u32, height: u32) -> Result<Self> {
        let path = format!("/dev/video{}", index);
        Self::open_path(&path, width, height)
    }

    /// Open a camera by device path at the requested resolution.
    pub fn open_path(path: &str, width: u32, height: u32) -> Result<Self> {
        let device = Device::with_path(path)?;
        let (negotiated, format) = negotiate_format(&device, width, height)?;

        tracing::debug!(
            "Opened {} at {}x{} ({})",
            path,
            negotiated.width,
            negotiated.height,
            format_name(format),
        );

        // The stream needs a 'static device reference.
        let device = Box::leak(Box::new(device));
        let stream = Stream::with_buffers(device, Type::VideoCapture, 4)?;

        Ok(Camera {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            format,
            start_time: std::time::Instant::now(),
        })
    }

    /// Negotiated frame width.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Negotiated frame height.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Read one frame from the device and convert it to RGB24.
    pub fn capture(&mut self) -> Result<Frame> {
        let (data, _meta) = self.stream.next()?;
        let timestamp_us = self.start_time.elapsed().as_micros() as u64;

        let rgb = match self.format {
            PixelFormat::Mjpeg => mjpeg_to_rgb(data)?,
            PixelFormat::Yuyv => yuyv_to_rgb(data, self.width, self.height),
            PixelFormat::Grey => grey_to_rgb(data, self.width, self.height),
        };

        Ok(Frame {
            width: self.width,
            height: self.height,
            data: rgb,
            timestamp_us,
        })
    }
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame> {
        Camera::capture(self)
    }
}

fn format_name(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Mjpeg => "MJPEG",
        PixelFormat::Yuyv => "YUYV",
        PixelFormat::Grey => "GREY",
    }
}

/// Ask the driver for MJPEG at the requested size, falling back to YUYV and
/// then to whatever the device reports.
fn negotiate_format(device: &Device, width: u32, height: u32) -> Result<(v4l::Format, PixelFormat)> {
    let mjpg = FourCC::new(b"MJPG");
    let yuyv = FourCC::new(b"YUYV");

    let mut wanted = device.format()?;
    wanted.width = width;
    wanted.height = height;

    wanted.fourcc = mjpg;
    if let Ok(f) = device.set_format(&wanted) {
        if f.fourcc == mjpg {
            return Ok((f, PixelFormat::Mjpeg));
        }
    }

    wanted.fourcc = yuyv;
    if let Ok(f) = device.set_format(&wanted) {
        if f.fourcc == yuyv {
            return Ok((f, PixelFormat::Yuyv));
        }
    }

    // Take what the device gives us.
    let f = device.format()?;
    let format = if f.fourcc == yuyv {
        PixelFormat::Yuyv
    } else if f.fourcc == FourCC::new(b"GREY")
        || f.fourcc == FourCC::new(b"Y8  ")
        || f.fourcc == FourCC::new(b"Y800")
    {
        PixelFormat::Grey
    } else {
        PixelFormat::Mjpeg
    };
    Ok((f, format))
}

fn mjpeg_to_rgb(data: &[u8]) -> Result<Vec<u8>> {
    use image::ImageReader;
    use std::io::Cursor;

    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .decode()?
        .to_rgb8();
    Ok(img.into_raw())
}

fn grey_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width as usize) * (height as usize);
    let mut rgb = vec![0u8; pixels * 3];
    for (i, chunk) in rgb.chunks_exact_mut(3).enumerate().take(pixels) {
        let y = data.get(i).copied().unwrap_or(0);
        chunk.fill(y);
    }
    rgb
}

/// YUYV 4:2:2 to RGB24, BT.601.
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let width = width as usize;
    let height = height as usize;
    let mut rgb = vec![0u8; width * height * 3];

    for row in 0..height {
        for col in (0..width).step_by(2) {
            let i = (row * width + col) * 2;
            let y0 = yuyv.get(i).copied().unwrap_or(0) as f32;
            let u = yuyv.get(i + 1).copied().unwrap_or(128) as f32;
            let y1 = yuyv.get(i + 2).copied().unwrap_or(0) as f32;
            let v = yuyv.get(i + 3).copied().unwrap_or(128) as f32;

            let d = u - 128.0;
            let e = v - 128.0;

            for (k, y) in [y0, y1].into_iter().enumerate() {
                let c = y - 16.0;
                let r = (1.164 * c + 1.596 * e).clamp(0.0, 255.0) as u8;
                let g = (1.164 * c - 0.392 * d - 0.813 * e).clamp(0.0, 255.0) as u8;
                let b = (1.164 * c + 2.017 * d).clamp(0.0, 255.0) as u8;

                let out = (row * width + col + k) * 3;
                if out + 2 < rgb.len() {
                    rgb[out] = r;
                    rgb[out + 1] = g;
                    rgb[out + 2] = b;
                }
            }
        }
    }

    rgb
}

/// List all available cameras under /dev.
pub fn list_cameras() -> Result<Vec<CameraInfo>> {
    let mut cameras = Vec::new();

    for entry in std::fs::read_dir("/dev")? {
        let entry = entry?;
        let path = entry.path();

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(index) = name.strip_prefix("video").and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        let device_name = Device::with_path(&path)
            .and_then(|d| d.query_caps())
            .map(|c| c.card)
            .unwrap_or_else(|_| format!("Camera {}", index));

        cameras.push(CameraInfo {
            index,
            name: device_name,
            path,
        });
    }

    cameras.sort_by_key(|c| c.index);
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grey_to_rgb_replicates_luma() {
        let grey = vec![0u8, 128, 255, 64];
        let rgb = grey_to_rgb(&grey, 2, 2);
        assert_eq!(rgb.len(), 12);
        assert_eq!(&rgb[0..3], &[0, 0, 0]);
        assert_eq!(&rgb[3..6], &[128, 128, 128]);
        assert_eq!(&rgb[6..9], &[255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma_is_greyish() {
        // Y=235 (white), U=V=128 (no chroma) for a 2x1 image.
        let yuyv = vec![235, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1);
        assert_eq!(rgb.len(), 6);
        for &c in &rgb {
            assert!(c > 240, "expected near-white, got {}", c);
        }
    }

    #[test]
    fn test_yuyv_to_rgb_short_input_does_not_panic() {
        let rgb = yuyv_to_rgb(&[10, 20], 4, 2);
        assert_eq!(rgb.len(), 4 * 2 * 3);
    }
}
