//! Frames and payload decoding.
//!
//! - `FrameGeometry`: dimensions and pixel format, fixed for a session.
//! - `Frame`: timestamped pixel buffer. Bytes are private and immutable; the
//!   buffer is zeroized on drop.
//! - `FrameDecoder`: turns one inbound payload into a `Frame`. Raw payloads are
//!   always supported; JPEG needs the `decode-jpeg` feature.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use zeroize::Zeroize;

use crate::transport::wire::MAX_PAYLOAD_BYTES;
use crate::PipelineError;

/// Largest accepted frame edge, in pixels.
pub const MAX_DIMENSION: u32 = 4096;

// ----------------------------------------------------------------------------
// Pixel formats / geometry
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    #[default]
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
        }
    }

    /// Rec.601 luma from one pixel's bytes.
    fn luma(&self, px: &[u8]) -> u8 {
        let (r, g, b) = match self {
            PixelFormat::Gray8 => return px[0],
            PixelFormat::Rgb24 => (px[0], px[1], px[2]),
            PixelFormat::Bgr24 => (px[2], px[1], px[0]),
        };
        ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gray8" | "gray" => Ok(PixelFormat::Gray8),
            "rgb24" | "rgb" => Ok(PixelFormat::Rgb24),
            "bgr24" | "bgr" => Ok(PixelFormat::Bgr24),
            other => Err(anyhow!("unsupported pixel format '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    #[default]
    Raw,
    Jpeg,
}

/// Dimensions and layout negotiated at connect time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidGeometry(format!(
                "frame dimensions must be non-zero (got {}x{})",
                width, height
            ))
            .into());
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(PipelineError::InvalidGeometry(format!(
                "frame dimensions {}x{} exceed {}",
                width, height, MAX_DIMENSION
            ))
            .into());
        }
        let geometry = Self {
            width,
            height,
            format,
        };
        // Annotated replies are raw, so the raw size must fit one wire message.
        if geometry.payload_len() > MAX_PAYLOAD_BYTES {
            return Err(PipelineError::InvalidGeometry(format!(
                "{}x{} {} frames need {} bytes, over the {} byte message limit",
                width,
                height,
                format.as_str(),
                geometry.payload_len(),
                MAX_PAYLOAD_BYTES
            ))
            .into());
        }
        Ok(geometry)
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn payload_len(&self) -> usize {
        self.area() * self.format.bytes_per_pixel()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Timestamped pixel buffer. No `Clone`, no mutable access to pixels.
pub struct Frame {
    data: Vec<u8>,
    geometry: FrameGeometry,
    timestamp_s: f64,
}

impl Frame {
    /// Wrap a raw buffer laid out per `geometry`.
    pub fn from_pixels(geometry: FrameGeometry, data: Vec<u8>, timestamp_s: f64) -> Result<Self> {
        if data.len() != geometry.payload_len() {
            let got = data.len();
            let mut data = data;
            data.zeroize();
            return Err(PipelineError::FrameDecode(format!(
                "payload is {} bytes, expected {} for {}x{} {}",
                got,
                geometry.payload_len(),
                geometry.width,
                geometry.height,
                geometry.format.as_str()
            ))
            .into());
        }
        Ok(Self {
            data,
            geometry,
            timestamp_s,
        })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_s
    }

    /// Luma per pixel, row-major.
    pub fn luma(&self) -> impl Iterator<Item = u8> + '_ {
        let format = self.geometry.format;
        self.data
            .chunks_exact(format.bytes_per_pixel())
            .map(move |px| format.luma(px))
    }

    /// Copy of the pixels for rendering an outbound frame.
    pub(crate) fn copy_pixels(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("geometry", &self.geometry)
            .field("timestamp_s", &self.timestamp_s)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Decoders
// ----------------------------------------------------------------------------

pub trait FrameDecoder: Send + Sync {
    fn decode(&self, payload: &[u8], geometry: &FrameGeometry, timestamp_s: f64) -> Result<Frame>;
}

/// Payload is the pixel buffer itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawDecoder;

impl FrameDecoder for RawDecoder {
    fn decode(&self, payload: &[u8], geometry: &FrameGeometry, timestamp_s: f64) -> Result<Frame> {
        Frame::from_pixels(*geometry, payload.to_vec(), timestamp_s)
    }
}

#[cfg(feature = "decode-jpeg")]
#[derive(Clone, Copy, Debug, Default)]
pub struct JpegDecoder;

#[cfg(feature = "decode-jpeg")]
impl FrameDecoder for JpegDecoder {
    fn decode(&self, payload: &[u8], geometry: &FrameGeometry, timestamp_s: f64) -> Result<Frame> {
        let decoded = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
            .map_err(|e| PipelineError::FrameDecode(format!("jpeg decode failed: {}", e)))?;
        if decoded.width() != geometry.width || decoded.height() != geometry.height {
            return Err(PipelineError::FrameDecode(format!(
                "jpeg is {}x{}, session expects {}x{}",
                decoded.width(),
                decoded.height(),
                geometry.width,
                geometry.height
            ))
            .into());
        }
        let data = match geometry.format {
            PixelFormat::Gray8 => decoded.to_luma8().into_raw(),
            PixelFormat::Rgb24 => decoded.to_rgb8().into_raw(),
            PixelFormat::Bgr24 => {
                let mut rgb = decoded.to_rgb8().into_raw();
                for px in rgb.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                rgb
            }
        };
        Frame::from_pixels(*geometry, data, timestamp_s)
    }
}

/// Decoder for a negotiated encoding.
pub fn decoder_for(encoding: FrameEncoding) -> Result<Box<dyn FrameDecoder>> {
    match encoding {
        FrameEncoding::Raw => Ok(Box::new(RawDecoder)),
        #[cfg(feature = "decode-jpeg")]
        FrameEncoding::Jpeg => Ok(Box::new(JpegDecoder)),
        #[cfg(not(feature = "decode-jpeg"))]
        FrameEncoding::Jpeg => Err(PipelineError::InvalidGeometry(
            "jpeg encoding requires the decode-jpeg feature".to_string(),
        )
        .into()),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_zero_and_oversized_dimensions() {
        assert!(FrameGeometry::new(0, 10, PixelFormat::Gray8).is_err());
        assert!(FrameGeometry::new(10, MAX_DIMENSION + 1, PixelFormat::Gray8).is_err());
        let geometry = FrameGeometry::new(640, 480, PixelFormat::Bgr24).unwrap();
        assert_eq!(geometry.payload_len(), 640 * 480 * 3);
    }

    #[test]
    fn geometry_must_fit_one_wire_message() {
        let err = FrameGeometry::new(MAX_DIMENSION, MAX_DIMENSION, PixelFormat::Rgb24).unwrap_err();
        let classified = PipelineError::classify(&err).expect("classified");
        assert_eq!(classified.code(), "INVALID_GEOMETRY");
        assert!(err.to_string().contains("message limit"));

        let gray = FrameGeometry::new(MAX_DIMENSION, MAX_DIMENSION, PixelFormat::Gray8).unwrap();
        assert!(gray.payload_len() <= MAX_PAYLOAD_BYTES);
    }

    #[test]
    fn raw_decoder_rejects_wrong_length() {
        let geometry = FrameGeometry::new(4, 4, PixelFormat::Gray8).unwrap();
        let err = RawDecoder.decode(&[0u8; 15], &geometry, 0.0).unwrap_err();
        let classified = PipelineError::classify(&err).expect("classified");
        assert_eq!(classified.code(), "FRAME_DECODE_FAILURE");
    }

    #[test]
    fn luma_respects_channel_order() {
        let rgb = FrameGeometry::new(1, 1, PixelFormat::Rgb24).unwrap();
        let bgr = FrameGeometry::new(1, 1, PixelFormat::Bgr24).unwrap();
        let red_rgb = Frame::from_pixels(rgb, vec![255, 0, 0], 0.0).unwrap();
        let red_bgr = Frame::from_pixels(bgr, vec![0, 0, 255], 0.0).unwrap();
        let a: Vec<u8> = red_rgb.luma().collect();
        let b: Vec<u8> = red_bgr.luma().collect();
        assert_eq!(a, b);
        assert_eq!(a[0], (77 * 255 >> 8) as u8);
    }

    #[test]
    fn gray_luma_is_identity() {
        let geometry = FrameGeometry::new(3, 1, PixelFormat::Gray8).unwrap();
        let frame = Frame::from_pixels(geometry, vec![1, 128, 255], 2.5).unwrap();
        assert_eq!(frame.luma().collect::<Vec<_>>(), vec![1, 128, 255]);
        assert_eq!(frame.timestamp_s(), 2.5);
    }

    #[cfg(not(feature = "decode-jpeg"))]
    #[test]
    fn jpeg_needs_feature() {
        assert!(decoder_for(FrameEncoding::Jpeg).is_err());
        assert!(decoder_for(FrameEncoding::Raw).is_ok());
    }
}
