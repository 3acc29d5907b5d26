use super::{Frame, FrameSource};
use crate::common::{FingertimeError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Plays back frames recorded to a directory.
///
/// Accepts `.png` files (converted to 8-bit luma) and `.raw` dumps of exactly
/// `width * height` bytes, visited in file-name order.
pub struct ReplaySensor {
    files: Vec<PathBuf>,
    cursor: usize,
    width: u32,
    height: u32,
    looping: bool,
}

impl ReplaySensor {
    pub fn open(dir: &Path, width: u32, height: u32, looping: bool) -> Result<Self> {
        if !dir.is_dir() {
            return Err(FingertimeError::SensorUnavailable(format!(
                "Replay directory not found: {}", dir.display()
            )));
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            if matches!(ext.as_deref(), Some("png") | Some("raw")) {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(FingertimeError::SensorUnavailable(format!(
                "No .png or .raw frames in {}", dir.display()
            )));
        }

        tracing::info!("Replaying {} frames from {}", files.len(), dir.display());

        Ok(Self { files, cursor: 0, width, height, looping })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn load(&self, path: &Path) -> Result<Frame> {
        let is_raw = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("raw"))
            .unwrap_or(false);

        if is_raw {
            return Frame::from_raw(self.width, self.height, fs::read(path)?);
        }

        let gray = image::open(path)?.to_luma8();
        if gray.dimensions() != (self.width, self.height) {
            return Err(FingertimeError::InvalidFrame {
                expected: self.width as usize * self.height as usize,
                actual: gray.as_raw().len(),
            });
        }
        Ok(Frame::from_image(gray))
    }
}

impl FrameSource for ReplaySensor {
    fn poll(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
        if self.cursor >= self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }

        let path = self.files[self.cursor].clone();
        self.cursor += 1;

        match self.load(&path) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                // A single bad file is a dropped frame, not a dead sensor
                tracing::warn!("Skipping replay frame {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}
