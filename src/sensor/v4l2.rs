use super::{Frame, FrameSource};
use crate::common::{Config, FingertimeError, Result};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};
use std::fs;
use std::io;
use std::time::Duration;

/// A fingerprint reader exposed as a V4L2 capture device with a GREY format.
pub struct V4lSensor {
    _device: Device,
    stream: Stream<'static>,
    width: u32,
    height: u32,
}

/// One `/dev/video*` node as reported by [`V4lSensor::list_devices`].
#[derive(Debug, Clone)]
pub struct SensorInfo {
    pub index: u32,
    pub name: String,
    pub features: Vec<String>,
    pub grayscale: bool,
}

impl V4lSensor {
    pub fn new(config: &Config) -> Result<Self> {
        let device_index = if config.sensor.device_index == 999 {
            // Special value 999 means auto-detect
            Self::detect_grey_device()?
        } else {
            config.sensor.device_index
        };
        Self::new_with_device(device_index, config)
    }

    /// List all capture devices with the formats that matter to us.
    pub fn list_devices() -> Result<Vec<SensorInfo>> {
        let mut sensors = Vec::new();

        for index in video_indices()? {
            let Ok(device) = Device::new(index as usize) else { continue };
            let Ok(caps) = device.query_caps() else { continue };

            let mut features = Vec::new();
            let mut grayscale = false;

            if caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                features.push("VIDEO_CAPTURE".to_string());
            }

            for fmt in device.enum_formats().unwrap_or_default() {
                let fourcc_str = fmt.fourcc.str().unwrap_or("UNKNOWN");
                if fourcc_str == "GREY" || fourcc_str == "Y8" {
                    features.push(format!("Grayscale ({})", fourcc_str));
                    grayscale = true;
                } else {
                    features.push(format!("Other ({})", fourcc_str));
                }
            }

            sensors.push(SensorInfo {
                index,
                name: caps.card.clone(),
                features,
                grayscale,
            });
        }

        sensors.sort_by_key(|s| s.index);
        Ok(sensors)
    }

    /// First device that can stream 8-bit grayscale.
    pub fn detect_grey_device() -> Result<u32> {
        tracing::info!("Auto-detecting grayscale sensor...");

        let found = Self::list_devices()?
            .into_iter()
            .find(|s| s.grayscale && s.features.iter().any(|f| f == "VIDEO_CAPTURE"));

        match found {
            Some(sensor) => {
                tracing::info!("Selected sensor: /dev/video{} ({})", sensor.index, sensor.name);
                Ok(sensor.index)
            }
            None => Err(FingertimeError::SensorUnavailable(
                "No grayscale V4L2 capture device found".into(),
            )),
        }
    }

    pub fn new_with_device(index: u32, config: &Config) -> Result<Self> {
        tracing::info!("Opening sensor device {}...", index);

        let mut device = Device::new(index as usize)
            .map_err(|e| FingertimeError::SensorUnavailable(format!("Failed to open sensor {}: {}", index, e)))?;

        let mut fmt = device.format()
            .map_err(|e| FingertimeError::Sensor(format!("Failed to get format: {}", e)))?;

        fmt.width = config.sensor.width;
        fmt.height = config.sensor.height;
        fmt.fourcc = FourCC::new(b"GREY");

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set exact format: {}. Using device defaults.", e);
        }

        let final_fmt = device.format()
            .map_err(|e| FingertimeError::Sensor(format!("Failed to get final format: {}", e)))?;

        if final_fmt.fourcc != FourCC::new(b"GREY") {
            return Err(FingertimeError::Sensor(format!(
                "Sensor {} does not stream GREY (got {})",
                index,
                final_fmt.fourcc.str().unwrap_or("UNKNOWN")
            )));
        }
        if final_fmt.width != config.sensor.width || final_fmt.height != config.sensor.height {
            return Err(FingertimeError::Sensor(format!(
                "Sensor resolution {}x{} differs from configured {}x{}",
                final_fmt.width, final_fmt.height, config.sensor.width, config.sensor.height
            )));
        }

        let mut stream = Stream::with_buffers(&mut device, Type::VideoCapture, 4)
            .map_err(|e| FingertimeError::Sensor(format!("Failed to create stream: {}", e)))?;

        for i in 0..config.sensor.warmup_frames {
            stream.next()
                .map_err(|e| FingertimeError::Sensor(format!("Failed to capture warmup frame {}: {}", i, e)))?;
        }

        tracing::info!("Sensor ready: {}x{} GREY", final_fmt.width, final_fmt.height);

        Ok(Self {
            _device: device,
            stream,
            width: final_fmt.width,
            height: final_fmt.height,
        })
    }
}

impl FrameSource for V4lSensor {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        self.stream.set_timeout(driver_timeout(timeout));
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) => return capture_error(e),
        };

        let expected = self.width as usize * self.height as usize;
        let used = (meta.bytesused as usize).min(buf.len());
        if used < expected {
            tracing::debug!("Dropping short buffer: {} of {} bytes", used, expected);
            return Ok(None);
        }

        Frame::from_raw(self.width, self.height, buf[..expected].to_vec()).map(Some)
    }
}

/// The driver poll takes whole milliseconds in an `i32`, and zero would mean
/// "return at once" rather than "wait a little".
fn driver_timeout(timeout: Duration) -> Duration {
    Duration::from_millis(timeout.as_millis().clamp(1, i32::MAX as u128) as u64)
}

/// No buffer within the timeout is an empty poll; anything else means the
/// device is gone.
fn capture_error(e: io::Error) -> Result<Option<Frame>> {
    if e.kind() == io::ErrorKind::TimedOut {
        tracing::trace!("No frame before the poll timeout");
        return Ok(None);
    }
    Err(FingertimeError::SensorUnavailable(format!("Failed to capture: {}", e)))
}

fn video_indices() -> Result<Vec<u32>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir("/dev")? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix("video"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            indices.push(index);
        }
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_timeout_is_bounded() {
        assert_eq!(driver_timeout(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(driver_timeout(Duration::from_millis(250)), Duration::from_millis(250));
        assert_eq!(
            driver_timeout(Duration::from_secs(u64::MAX / 4)),
            Duration::from_millis(i32::MAX as u64)
        );
    }

    #[test]
    fn timed_out_capture_is_an_empty_poll() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF");
        assert!(matches!(capture_error(timed_out), Ok(None)));

        let gone = io::Error::new(io::ErrorKind::NotFound, "no such device");
        assert!(matches!(capture_error(gone), Err(FingertimeError::SensorUnavailable(_))));
    }
}
