//! The kiosk: one sensor, one gallery, one ledger.
//!
//! A [`Kiosk`] owns its frame source by value, so every capture-to-removal
//! cycle runs with exclusive access to the hardware. Observers get progress
//! and [`CycleReport`]s through the configured [`StatusSink`].

use crate::common::{Config, FingertimeError, Result};
use crate::core::attendance::{AttendanceToggle, Decision};
use crate::core::descriptor::{DescriptorExtractor, DescriptorSet};
use crate::core::matcher::{Identification, Matcher};
use crate::core::notify::{self, StatusSink, SyncSink};
use crate::core::stability::{Acquisition, CaptureOutcome, CapturedFrame, FrameDeduplicator, RemovalOutcome};
use crate::core::timing::{Clock, StopSignal, SystemClock};
use crate::sensor::FrameSource;
use crate::storage::{AttendanceEvent, EventKind, Gallery, GalleryEntry, Identity, Ledger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// The sensor failed or disappeared.
    HardwareUnavailable,
    NoStableCapture,
    /// The capture produced no usable descriptors.
    NoFeatures,
    NoEnrolledTemplates,
    Suppressed { remaining_secs: u64 },
    DailyLimitReached,
    NoMatch,
    Recorded { kind: EventKind },
    Cancelled,
    Enrolled { templates: usize },
    /// Enrollment only: the finger was not lifted between stages.
    RemovalTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub score: u32,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    pub fn bare(outcome: CycleOutcome) -> Self {
        Self {
            identity_id: None,
            display_name: None,
            score: 0,
            outcome,
        }
    }

    fn from_identification(id: &Identification, outcome: CycleOutcome) -> Self {
        Self {
            identity_id: id.identity_id.clone(),
            display_name: id.display_name.clone(),
            score: id.score,
            outcome,
        }
    }

    /// One-line operator message.
    pub fn message(&self) -> String {
        let who = self
            .display_name
            .as_deref()
            .or(self.identity_id.as_deref())
            .unwrap_or("unknown");
        match &self.outcome {
            CycleOutcome::HardwareUnavailable => "Sensor unavailable".to_string(),
            CycleOutcome::NoStableCapture => "No stable scan".to_string(),
            CycleOutcome::NoFeatures => "Could not extract features".to_string(),
            CycleOutcome::NoEnrolledTemplates => "No users enrolled".to_string(),
            CycleOutcome::Suppressed { remaining_secs } => {
                format!("Please wait, {} ({}s)", who, remaining_secs)
            }
            CycleOutcome::DailyLimitReached => format!("{} already marked today", who),
            CycleOutcome::NoMatch => format!("Not recognized (score={})", self.score),
            CycleOutcome::Recorded { kind } => {
                let verb = if *kind == EventKind::ClockedOut { "Clocked out" } else { "Clocked in" };
                format!("{}: {} | Score: {}", verb, who, self.score)
            }
            CycleOutcome::Cancelled => "Cancelled".to_string(),
            CycleOutcome::Enrolled { templates } => {
                format!("{} enrolled with {} templates", who, templates)
            }
            CycleOutcome::RemovalTimeout => "Lift finger fully".to_string(),
        }
    }
}

enum Capture {
    Frame(CapturedFrame),
    Ended(CycleOutcome),
}

pub struct Kiosk<S: FrameSource> {
    sensor: S,
    config: Config,
    extractor: DescriptorExtractor,
    matcher: Matcher,
    toggle: Arc<AttendanceToggle>,
    gallery: Arc<dyn Gallery>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
    dedup: FrameDeduplicator,
    sync: Option<Arc<dyn SyncSink>>,
    status: Arc<dyn StatusSink + Send + Sync>,
}

impl<S: FrameSource> Kiosk<S> {
    pub fn new(sensor: S, config: Config, gallery: Arc<dyn Gallery>, ledger: Arc<dyn Ledger>) -> Self {
        let extractor = DescriptorExtractor::new(config.extractor.clone());
        let matcher = Matcher::new(config.matcher.clone());
        let toggle = Arc::new(AttendanceToggle::new(config.attendance.clone(), Arc::clone(&ledger)));
        let dedup = FrameDeduplicator::new(config.capture.duplicate_window());

        Self {
            sensor,
            config,
            extractor,
            matcher,
            toggle,
            gallery,
            ledger,
            clock: Arc::new(SystemClock),
            stop: StopSignal::new(),
            dedup,
            sync: None,
            status: Arc::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share one toggle between kiosks writing the same ledger so their
    /// decisions are serialized. The toggle must wrap this kiosk's ledger.
    pub fn with_toggle(mut self, toggle: Arc<AttendanceToggle>) -> Self {
        self.toggle = toggle;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_sync(mut self, sync: Arc<dyn SyncSink>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSink + Send + Sync>) -> Self {
        self.status = status;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn toggle(&self) -> &Arc<AttendanceToggle> {
        &self.toggle
    }

    pub fn extractor(&self) -> &DescriptorExtractor {
        &self.extractor
    }

    pub fn into_sensor(self) -> S {
        self.sensor
    }

    fn acquisition(&mut self) -> Acquisition<'_, S> {
        Acquisition::new(
            &mut self.sensor,
            self.clock.as_ref(),
            &self.stop,
            &mut self.dedup,
            &self.config.capture,
            self.config.sensor.poll_timeout(),
        )
    }

    /// Wait for one stable frame. Sensor failures end the cycle as
    /// `HardwareUnavailable` rather than an error.
    pub fn capture_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>> {
        match self.capture(timeout)? {
            Capture::Frame(captured) => Ok(Some(captured)),
            Capture::Ended(_) => Ok(None),
        }
    }

    fn capture(&mut self, timeout: Duration) -> Result<Capture> {
        let status = Arc::clone(&self.status);
        let outcome = self.acquisition().capture_when_stable(timeout, status.as_ref());
        Ok(match hardware_tolerant(outcome)? {
            Some(CaptureOutcome::Stable(captured)) => Capture::Frame(captured),
            Some(CaptureOutcome::Timeout) => Capture::Ended(CycleOutcome::NoStableCapture),
            Some(CaptureOutcome::Cancelled) => Capture::Ended(CycleOutcome::Cancelled),
            None => Capture::Ended(CycleOutcome::HardwareUnavailable),
        })
    }

    fn wait_removed(&mut self, timeout: Duration) -> Result<Option<RemovalOutcome>> {
        let status = Arc::clone(&self.status);
        let outcome = self.acquisition().wait_finger_removed(timeout, status.as_ref());
        hardware_tolerant(outcome)
    }

    fn publish(&self, report: CycleReport) -> CycleReport {
        if let CycleOutcome::Suppressed { remaining_secs } = report.outcome {
            // Cooldown hits are returned to the caller but not announced
            tracing::debug!("{:?} in cooldown for {}s", report.identity_id, remaining_secs);
            return report;
        }
        tracing::info!("{}", report.message());
        self.status.report(&report);
        report
    }

    /// Identify the captured frame against the gallery and run the toggle.
    fn resolve(&self, captured: &CapturedFrame, gallery: &[GalleryEntry]) -> Result<CycleReport> {
        let probes = self.extractor.extract_rotations(&captured.frame);
        let featureless = probes.iter().all(DescriptorSet::is_empty);
        let identification = self.matcher.identify(&probes, gallery);

        let outcome = match self.toggle.decide(&identification, self.clock.utc_now())? {
            Decision::Recorded(event) => {
                let kind = event.kind;
                if let Some(sync) = &self.sync {
                    notify::dispatch_attendance(sync, event);
                }
                CycleOutcome::Recorded { kind }
            }
            Decision::NoMatch(_) if featureless => CycleOutcome::NoFeatures,
            Decision::NoMatch(_) => CycleOutcome::NoMatch,
            Decision::Suppressed { remaining } => CycleOutcome::Suppressed {
                remaining_secs: remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0),
            },
            Decision::DailyLimitReached => CycleOutcome::DailyLimitReached,
        };

        Ok(CycleReport::from_identification(&identification, outcome))
    }

    /// One capture, identify and decide cycle, then a best-effort wait for
    /// the finger to lift.
    pub fn identify_once(&mut self) -> Result<CycleReport> {
        let gallery = self.gallery.all_templates()?;
        if gallery.is_empty() {
            return Ok(self.publish(CycleReport::bare(CycleOutcome::NoEnrolledTemplates)));
        }

        let captured = match self.capture(self.config.capture.capture_timeout())? {
            Capture::Frame(captured) => captured,
            Capture::Ended(outcome) => return Ok(self.publish(CycleReport::bare(outcome))),
        };

        let report = self.publish(self.resolve(&captured, &gallery)?);

        let removal = Duration::from_secs_f32(self.config.kiosk.identify_removal_timeout_secs);
        self.wait_removed(removal)?;
        Ok(report)
    }

    /// Capture `templates_per_identity` stages with a lift between each,
    /// then store the identity, its templates and an `ENROLL` row.
    /// Nothing is written unless every stage succeeds, and the templates
    /// are withdrawn again if the `ENROLL` row cannot be appended.
    pub fn enroll(&mut self, identity_id: &str, display_name: &str) -> Result<CycleReport> {
        let identity_id = identity_id.trim();
        let display_name = display_name.trim();
        if identity_id.is_empty() || display_name.is_empty() {
            return Err(FingertimeError::InvalidIdentity(
                "identity id and display name are required".into(),
            ));
        }

        let stages = self.config.enrollment.templates_per_identity;
        let stage_timeout = Duration::from_secs_f32(self.config.enrollment.stage_timeout_secs);
        let removal_timeout = Duration::from_secs_f32(self.config.enrollment.removal_timeout_secs);
        let report = |outcome| CycleReport {
            identity_id: Some(identity_id.to_string()),
            display_name: Some(display_name.to_string()),
            score: 0,
            outcome,
        };

        let mut templates = Vec::with_capacity(stages);
        for stage in 1..=stages {
            tracing::info!("Stage {}/{}: position finger", stage, stages);

            let captured = match self.capture(stage_timeout)? {
                Capture::Frame(captured) => captured,
                Capture::Ended(outcome) => return Ok(self.publish(report(outcome))),
            };

            let descriptors = self.extractor.extract(&captured.frame);
            if descriptors.is_empty() {
                return Ok(self.publish(report(CycleOutcome::NoFeatures)));
            }
            tracing::info!("Scan {}/{} captured ({} descriptors)", stage, stages, descriptors.len());
            templates.push(descriptors);

            match self.wait_removed(removal_timeout)? {
                Some(RemovalOutcome::Removed) => {}
                Some(RemovalOutcome::Timeout) => {
                    return Ok(self.publish(report(CycleOutcome::RemovalTimeout)))
                }
                Some(RemovalOutcome::Cancelled) => {
                    return Ok(self.publish(report(CycleOutcome::Cancelled)))
                }
                None => return Ok(self.publish(report(CycleOutcome::HardwareUnavailable))),
            }
        }

        let identity = Identity::new(identity_id, display_name);
        let now = self.clock.utc_now();
        self.gallery.enroll(&identity, &templates, now)?;
        let row = AttendanceEvent::new(now, EventKind::Enroll)
            .with_identity(identity_id, Some(display_name.to_string()));
        if let Err(e) = self.ledger.append(row) {
            tracing::error!("ENROLL row for {} not written, withdrawing templates: {}", identity_id, e);
            if let Err(undo) = self.gallery.withdraw(identity_id, now) {
                tracing::error!("Could not withdraw templates for {}: {}", identity_id, undo);
            }
            return Err(e);
        }

        if let Some(sync) = &self.sync {
            let blobs = templates.iter().map(DescriptorSet::to_bytes).collect();
            notify::dispatch_identity(sync, identity, blobs);
        }

        Ok(self.publish(report(CycleOutcome::Enrolled { templates: templates.len() })))
    }

    /// Continuous attendance until the stop signal fires or the sensor
    /// fails. Idles while the gallery has no templates.
    pub fn run_attendance_loop(&mut self) -> Result<()> {
        let capture_timeout = Duration::from_secs_f32(self.config.kiosk.loop_capture_timeout_secs);
        let removal_timeout = Duration::from_secs_f32(self.config.kiosk.loop_removal_timeout_secs);
        let idle = Duration::from_millis(self.config.kiosk.idle_backoff_ms);
        let mut idle_reported = false;

        tracing::info!("Attendance loop started");
        while !self.stop.is_stopped() {
            let gallery = self.gallery.all_templates()?;
            if gallery.is_empty() {
                if !idle_reported {
                    self.publish(CycleReport::bare(CycleOutcome::NoEnrolledTemplates));
                    idle_reported = true;
                }
                self.clock.sleep(idle);
                continue;
            }
            idle_reported = false;

            let captured = match self.capture(capture_timeout)? {
                Capture::Frame(captured) => captured,
                Capture::Ended(CycleOutcome::NoStableCapture) => continue,
                Capture::Ended(CycleOutcome::HardwareUnavailable) => {
                    self.publish(CycleReport::bare(CycleOutcome::HardwareUnavailable));
                    break;
                }
                Capture::Ended(_) => break,
            };

            self.publish(self.resolve(&captured, &gallery)?);

            if self.wait_removed(removal_timeout)?.is_none() {
                self.publish(CycleReport::bare(CycleOutcome::HardwareUnavailable));
                break;
            }
        }
        tracing::info!("Attendance loop stopped");
        Ok(())
    }
}

/// Sensor errors become `None`; everything else propagates.
fn hardware_tolerant<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(FingertimeError::Sensor(msg)) | Err(FingertimeError::SensorUnavailable(msg)) => {
            tracing::warn!("Sensor failure: {}", msg);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timing::ManualClock;
    use crate::sensor::{Frame, ScriptStep, ScriptedSensor};
    use crate::storage::{EventFilter, MemoryStore};

    fn small_config() -> Config {
        let mut config = Config::default();
        config.sensor.width = 32;
        config.sensor.height = 32;
        config
    }

    fn kiosk(sensor: ScriptedSensor) -> (Kiosk<ScriptedSensor>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let kiosk = Kiosk::new(sensor, small_config(), store.clone(), store.clone())
            .with_clock(Arc::new(ManualClock::new()));
        (kiosk, store)
    }

    #[test]
    fn identify_with_empty_gallery_skips_capture() {
        let (mut kiosk, store) = kiosk(ScriptedSensor::default());
        let report = kiosk.identify_once().unwrap();
        assert_eq!(report.outcome, CycleOutcome::NoEnrolledTemplates);
        assert!(store.events(&EventFilter::default()).unwrap().is_empty());
        assert_eq!(kiosk.into_sensor().polls(), 0);
    }

    #[test]
    fn sensor_failure_during_enroll_is_reported_not_raised() {
        let mut sensor = ScriptedSensor::default();
        sensor.push(ScriptStep::Fail("unplugged".into()));
        let (mut kiosk, store) = kiosk(sensor);

        let report = kiosk.enroll("E1", "Ada").unwrap();
        assert_eq!(report.outcome, CycleOutcome::HardwareUnavailable);
        assert!(store.identities().unwrap().is_empty());
    }

    #[test]
    fn enroll_requires_id_and_name() {
        let (mut kiosk, _) = kiosk(ScriptedSensor::default());
        assert!(matches!(
            kiosk.enroll("  ", "Ada"),
            Err(FingertimeError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn enroll_without_contact_times_out_cleanly() {
        let flat = Frame::from_raw(32, 32, vec![200; 32 * 32]).unwrap();
        let (mut kiosk, store) = kiosk(ScriptedSensor::from_frames(vec![flat]));
        let report = kiosk.enroll("E1", "Ada").unwrap();
        assert_eq!(report.outcome, CycleOutcome::NoStableCapture);
        assert!(store.events(&EventFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn stopped_kiosk_cancels_without_writes() {
        let (mut kiosk, store) = kiosk(ScriptedSensor::default());
        store.upsert_identity(&Identity::new("E1", "Ada")).unwrap();
        store
            .add_template("E1", &DescriptorSet::new(vec![[1u8; 32]; 12]), chrono::Utc::now())
            .unwrap();
        kiosk.stop_signal().stop();

        let report = kiosk.identify_once().unwrap();
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert!(store.events(&EventFilter::default()).unwrap().is_empty());

        kiosk.run_attendance_loop().unwrap();
    }

    #[test]
    fn report_messages_name_the_person() {
        let report = CycleReport {
            identity_id: Some("E1".into()),
            display_name: Some("Ada".into()),
            score: 42,
            outcome: CycleOutcome::Recorded { kind: EventKind::ClockedOut },
        };
        assert_eq!(report.message(), "Clocked out: Ada | Score: 42");
    }
}
