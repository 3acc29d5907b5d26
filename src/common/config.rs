use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{FingertimeError, Result};
use crate::common::paths;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub attendance: AttendanceConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub kiosk: KioskConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// V4L2 device index; 999 auto-detects the first grayscale device.
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub warmup_frames: u32,
}

fn default_width() -> u32 { 256 }
fn default_height() -> u32 { 360 }
fn default_poll_timeout() -> u64 { 1000 }

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            device_index: 0,
            poll_timeout_ms: default_poll_timeout(),
            warmup_frames: 0,
        }
    }
}

impl SensorConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Which frame a successful stability run hands back.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapturePolicy {
    /// The frame that completed the run of stable frames.
    #[default]
    LastStable,
    /// The sharpest frame seen since contact began.
    BestQuality,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,
    #[serde(default = "default_stable_frames")]
    pub stable_frames: u32,
    #[serde(default = "default_stable_diff_max")]
    pub stable_diff_max: f32,
    #[serde(default = "default_present_std")]
    pub finger_present_std: f32,
    #[serde(default = "default_removed_std")]
    pub finger_removed_std: f32,
    #[serde(default = "default_removed_frames")]
    pub removed_frames: u32,
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_ms: u64,
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: f32,
    #[serde(default = "default_removal_timeout")]
    pub removal_timeout_secs: f32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub policy: CapturePolicy,
    #[serde(default = "default_pressure_low")]
    pub pressure_low: f32,
    #[serde(default = "default_pressure_high")]
    pub pressure_high: f32,
}

fn default_min_quality() -> u8 { 20 }
fn default_stable_frames() -> u32 { 2 }
fn default_stable_diff_max() -> f32 { 5.0 }
fn default_present_std() -> f32 { 28.0 }
fn default_removed_std() -> f32 { 14.0 }
fn default_removed_frames() -> u32 { 3 }
fn default_duplicate_window() -> u64 { 2000 }
fn default_capture_timeout() -> f32 { 20.0 }
fn default_removal_timeout() -> f32 { 8.0 }
fn default_poll_interval() -> u64 { 80 }
fn default_pressure_low() -> f32 { 60.0 }
fn default_pressure_high() -> f32 { 150.0 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_quality: default_min_quality(),
            stable_frames: default_stable_frames(),
            stable_diff_max: default_stable_diff_max(),
            finger_present_std: default_present_std(),
            finger_removed_std: default_removed_std(),
            removed_frames: default_removed_frames(),
            duplicate_window_ms: default_duplicate_window(),
            capture_timeout_secs: default_capture_timeout(),
            removal_timeout_secs: default_removal_timeout(),
            poll_interval_ms: default_poll_interval(),
            policy: CapturePolicy::default(),
            pressure_low: default_pressure_low(),
            pressure_high: default_pressure_high(),
        }
    }
}

impl CaptureConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.capture_timeout_secs)
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.removal_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractorConfig {
    /// Fraction trimmed from the left and right edges.
    #[serde(default = "default_crop_x")]
    pub crop_x: f32,
    /// Fraction trimmed from the top and bottom edges.
    #[serde(default = "default_crop_y")]
    pub crop_y: f32,
    #[serde(default = "default_clahe_clip")]
    pub clahe_clip_limit: f32,
    #[serde(default = "default_clahe_tiles")]
    pub clahe_tiles: u32,
    #[serde(default = "default_n_features")]
    pub n_features: usize,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
    #[serde(default = "default_n_levels")]
    pub n_levels: u32,
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: u32,
    #[serde(default = "default_patch_size")]
    pub patch_size: u32,
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: u8,
    #[serde(default = "default_rotation_angles")]
    pub rotation_angles: Vec<f32>,
}

fn default_crop_x() -> f32 { 0.10 }
fn default_crop_y() -> f32 { 0.08 }
fn default_clahe_clip() -> f32 { 2.0 }
fn default_clahe_tiles() -> u32 { 8 }
fn default_n_features() -> usize { 900 }
fn default_scale_factor() -> f32 { 1.2 }
fn default_n_levels() -> u32 { 8 }
fn default_edge_threshold() -> u32 { 15 }
fn default_patch_size() -> u32 { 31 }
fn default_fast_threshold() -> u8 { 20 }
fn default_rotation_angles() -> Vec<f32> { vec![-10.0, -5.0, 0.0, 5.0, 10.0] }

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            crop_x: default_crop_x(),
            crop_y: default_crop_y(),
            clahe_clip_limit: default_clahe_clip(),
            clahe_tiles: default_clahe_tiles(),
            n_features: default_n_features(),
            scale_factor: default_scale_factor(),
            n_levels: default_n_levels(),
            edge_threshold: default_edge_threshold(),
            patch_size: default_patch_size(),
            fast_threshold: default_fast_threshold(),
            rotation_angles: default_rotation_angles(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatcherConfig {
    #[serde(default = "default_max_distance")]
    pub max_distance: u32,
    #[serde(default = "default_min_descriptors")]
    pub min_descriptors: usize,
}

fn default_max_distance() -> u32 { 50 }
fn default_min_descriptors() -> usize { 10 }

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_distance: default_max_distance(),
            min_descriptors: default_min_descriptors(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AttendanceConfig {
    #[serde(default = "default_score_accept")]
    pub score_accept: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub one_mark_per_day: bool,
    /// Record the best candidate on NO_MATCH rows and count them as attempts
    /// for cooldown and daily-cap bookkeeping.
    #[serde(default)]
    pub no_match_counts_toward_limits: bool,
}

fn default_score_accept() -> u32 { 20 }
fn default_cooldown() -> u64 { 30 }

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            score_accept: default_score_accept(),
            cooldown_secs: default_cooldown(),
            one_mark_per_day: false,
            no_match_counts_toward_limits: false,
        }
    }
}

impl AttendanceConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_templates_per_identity")]
    pub templates_per_identity: usize,
    #[serde(default = "default_capture_timeout")]
    pub stage_timeout_secs: f32,
    #[serde(default = "default_enroll_removal_timeout")]
    pub removal_timeout_secs: f32,
}

fn default_templates_per_identity() -> usize { 3 }
fn default_enroll_removal_timeout() -> f32 { 10.0 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            templates_per_identity: default_templates_per_identity(),
            stage_timeout_secs: default_capture_timeout(),
            removal_timeout_secs: default_enroll_removal_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KioskConfig {
    /// Capture deadline per pass of the continuous attendance loop.
    #[serde(default = "default_loop_capture_timeout")]
    pub loop_capture_timeout_secs: f32,
    #[serde(default = "default_loop_removal_timeout")]
    pub loop_removal_timeout_secs: f32,
    #[serde(default = "default_identify_removal_timeout")]
    pub identify_removal_timeout_secs: f32,
    /// Back-off while the gallery is empty.
    #[serde(default = "default_idle_backoff")]
    pub idle_backoff_ms: u64,
}

fn default_loop_capture_timeout() -> f32 { 1.2 }
fn default_loop_removal_timeout() -> f32 { 12.0 }
fn default_identify_removal_timeout() -> f32 { 6.0 }
fn default_idle_backoff() -> u64 { 800 }

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            loop_capture_timeout_secs: default_loop_capture_timeout(),
            loop_removal_timeout_secs: default_loop_removal_timeout(),
            identify_removal_timeout_secs: default_identify_removal_timeout(),
            idle_backoff_ms: default_idle_backoff(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Loads `configs/fingertime.toml`, then the system config, falling back
    /// to defaults when neither exists.
    pub fn load() -> Result<Self> {
        for path in [paths::local_config_file(), paths::system_config_file()] {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }
        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FingertimeError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| FingertimeError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sensor.width == 0 || self.sensor.width > 4096 {
            return Err(FingertimeError::Config(format!(
                "Sensor width must be between 1 and 4096, got {}", self.sensor.width
            )));
        }
        if self.sensor.height == 0 || self.sensor.height > 4096 {
            return Err(FingertimeError::Config(format!(
                "Sensor height must be between 1 and 4096, got {}", self.sensor.height
            )));
        }

        if self.capture.min_quality > 100 {
            return Err(FingertimeError::Config(format!(
                "Minimum quality must be between 0 and 100, got {}", self.capture.min_quality
            )));
        }
        if self.capture.stable_frames == 0 {
            return Err(FingertimeError::Config("stable_frames must be at least 1".into()));
        }
        if self.capture.removed_frames == 0 {
            return Err(FingertimeError::Config("removed_frames must be at least 1".into()));
        }
        // Hysteresis: the removal threshold sits strictly below the presence one
        if self.capture.finger_removed_std >= self.capture.finger_present_std {
            return Err(FingertimeError::Config(format!(
                "finger_removed_std ({}) must be below finger_present_std ({})",
                self.capture.finger_removed_std, self.capture.finger_present_std
            )));
        }
        if self.capture.capture_timeout_secs <= 0.0 || self.capture.removal_timeout_secs <= 0.0 {
            return Err(FingertimeError::Config("Capture timeouts must be positive".into()));
        }
        if self.capture.pressure_low >= self.capture.pressure_high {
            return Err(FingertimeError::Config(format!(
                "pressure_low ({}) must be below pressure_high ({})",
                self.capture.pressure_low, self.capture.pressure_high
            )));
        }

        let ex = &self.extractor;
        if !(0.0..0.5).contains(&ex.crop_x) || !(0.0..0.5).contains(&ex.crop_y) {
            return Err(FingertimeError::Config(format!(
                "Crop fractions must be in [0, 0.5), got x={} y={}", ex.crop_x, ex.crop_y
            )));
        }
        if ex.clahe_tiles == 0 || ex.clahe_clip_limit <= 0.0 {
            return Err(FingertimeError::Config("CLAHE tiles and clip limit must be positive".into()));
        }
        if ex.n_levels == 0 || ex.scale_factor <= 1.0 {
            return Err(FingertimeError::Config(format!(
                "Pyramid needs at least one level and scale > 1.0, got {} levels at {}",
                ex.n_levels, ex.scale_factor
            )));
        }
        if ex.patch_size < 7 || ex.patch_size % 2 == 0 {
            return Err(FingertimeError::Config(format!(
                "Patch size must be odd and at least 7, got {}", ex.patch_size
            )));
        }
        if ex.rotation_angles.is_empty() {
            return Err(FingertimeError::Config("rotation_angles must not be empty".into()));
        }

        if self.matcher.max_distance > 256 {
            return Err(FingertimeError::Config(format!(
                "Hamming max_distance cannot exceed 256, got {}", self.matcher.max_distance
            )));
        }

        if self.enrollment.templates_per_identity == 0 {
            return Err(FingertimeError::Config("templates_per_identity must be at least 1".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [attendance]
            cooldown_secs = 45

            [capture]
            policy = "best_quality"
            "#,
        )
        .unwrap();

        assert_eq!(config.attendance.cooldown_secs, 45);
        assert_eq!(config.attendance.score_accept, 20);
        assert_eq!(config.capture.policy, CapturePolicy::BestQuality);
        assert_eq!(config.sensor.width, 256);
        assert_eq!(config.extractor.rotation_angles, vec![-10.0, -5.0, 0.0, 5.0, 10.0]);
    }

    #[test]
    fn rejects_inverted_hysteresis() {
        let mut config = Config::default();
        config.capture.finger_removed_std = 30.0;
        assert!(matches!(config.validate(), Err(FingertimeError::Config(_))));
    }

    #[test]
    fn rejects_empty_rotation_list() {
        let mut config = Config::default();
        config.extractor.rotation_angles.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shipped_config_parses() {
        let config: Config = toml::from_str(include_str!("../../configs/fingertime.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sensor.device_index, 999);
        assert_eq!(config.kiosk.idle_backoff_ms, 800);
    }
}
