//! Frame acquisition boundary.
//!
//! The core never talks to hardware directly. Anything that can hand back a
//! fixed-size 8-bit grayscale buffer implements [`FrameSource`]; the capture
//! loop owns the source exclusively for a whole capture-to-removal cycle.

pub mod replay;
pub mod scripted;
pub mod v4l2;

use crate::common::{FingertimeError, Result};
use image::GrayImage;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use replay::ReplaySensor;
pub use scripted::{ScriptStep, ScriptedSensor};
pub use v4l2::V4lSensor;

/// One immutable grayscale frame as delivered by the sensor.
#[derive(Clone)]
pub struct Frame {
    image: Arc<GrayImage>,
}

impl Frame {
    /// Wraps a raw row-major buffer. The buffer must hold exactly
    /// `width * height` bytes.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize;
        let actual = data.len();
        let image = GrayImage::from_raw(width, height, data)
            .filter(|_| actual == expected)
            .ok_or(FingertimeError::InvalidFrame { expected, actual })?;
        Ok(Self { image: Arc::new(image) })
    }

    pub fn from_image(image: GrayImage) -> Self {
        Self { image: Arc::new(image) }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// SHA-256 of the raw pixel buffer, used to spot re-delivered buffers.
    pub fn content_hash(&self) -> [u8; 32] {
        Sha256::digest(self.pixels()).into()
    }

    /// Mean absolute per-pixel difference. Frames of different geometry are
    /// infinitely far apart.
    pub fn mean_abs_diff(&self, other: &Frame) -> f32 {
        if self.width() != other.width() || self.height() != other.height() {
            return f32::INFINITY;
        }
        let a = self.pixels();
        let b = other.pixels();
        if a.is_empty() {
            return 0.0;
        }
        let total: u64 = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| (x as i16 - y as i16).unsigned_abs() as u64)
            .sum();
        total as f32 / a.len() as f32
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// A pollable source of raw sensor frames.
///
/// `Ok(None)` means no frame arrived within `timeout`; `Err` means the
/// hardware itself is unavailable and the current cycle cannot continue.
pub trait FrameSource {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        (**self).poll(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_rejects_wrong_length() {
        let err = Frame::from_raw(4, 4, vec![0; 15]).unwrap_err();
        assert!(matches!(err, FingertimeError::InvalidFrame { expected: 16, actual: 15 }));
    }

    #[test]
    fn mean_abs_diff_counts_every_pixel() {
        let a = Frame::from_raw(2, 2, vec![10, 10, 10, 10]).unwrap();
        let b = Frame::from_raw(2, 2, vec![14, 6, 10, 10]).unwrap();
        assert_eq!(a.mean_abs_diff(&b), 2.0);
        assert_eq!(a.mean_abs_diff(&a), 0.0);
    }

    #[test]
    fn identical_content_hashes_match() {
        let a = Frame::from_raw(2, 2, vec![1, 2, 3, 4]).unwrap();
        let b = Frame::from_raw(2, 2, vec![1, 2, 3, 4]).unwrap();
        let c = Frame::from_raw(2, 2, vec![1, 2, 3, 5]).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }
}
