//! Capture stabilization and finger-lift detection.
//!
//! [`StabilityGate`] and [`RemovalGate`] are pure state machines fed one
//! fresh frame at a time. [`Acquisition`] is the polling driver: it owns the
//! sensor borrow for the cycle, drops re-delivered buffers through a
//! [`FrameDeduplicator`], enforces deadlines and honours the stop signal.

use crate::common::config::{CaptureConfig, CapturePolicy};
use crate::common::Result;
use crate::core::notify::StatusSink;
use crate::core::quality::{PressureHint, QualitySignal};
use crate::core::timing::{Clock, StopSignal};
use crate::sensor::{Frame, FrameSource};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    AwaitingContact,
    Measuring,
    Stable,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalState {
    AwaitingRemoval,
    Removed,
    Timeout,
}

/// A frame that passed the stability gate, with the quality it was judged on.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: Frame,
    pub quality: QualitySignal,
}

/// What a single frame did to the capture state machine.
#[derive(Debug, Clone)]
pub enum GateStep {
    AwaitingContact(QualitySignal),
    /// Finger present but below the minimum sharpness.
    Rejected(QualitySignal),
    Measuring { quality: QualitySignal, stable_count: u32 },
    Stable(CapturedFrame),
}

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Stable(CapturedFrame),
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed,
    Timeout,
    Cancelled,
}

/// Progress published to observers while a capture or removal wait runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaptureStatus {
    WaitingForContact,
    Measuring {
        quality: QualitySignal,
        hint: PressureHint,
        stable_count: u32,
        remaining_secs: u64,
    },
    Captured { quality: QualitySignal },
    LiftFinger,
    FingerRemoved,
}

/// Drops frames whose content hash matches the last accepted frame inside a
/// short window: the sensor re-delivering a stale buffer is not a new frame.
#[derive(Debug, Clone)]
pub struct FrameDeduplicator {
    window: Duration,
    last: Option<([u8; 32], Instant)>,
}

impl FrameDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns `true` if the frame is fresh and records it as the last one.
    pub fn admit(&mut self, frame: &Frame, now: Instant) -> bool {
        let hash = frame.content_hash();
        if let Some((last_hash, seen_at)) = self.last {
            if last_hash == hash && now.saturating_duration_since(seen_at) < self.window {
                return false;
            }
        }
        self.last = Some((hash, now));
        true
    }
}

/// Contact → quality → stability state machine for one capture.
#[derive(Debug, Clone)]
pub struct StabilityGate {
    config: CaptureConfig,
    state: CaptureState,
    prev: Option<Frame>,
    stable_count: u32,
    best: Option<CapturedFrame>,
}

impl StabilityGate {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: CaptureState::Idle,
            prev: None,
            stable_count: 0,
            best: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    pub fn start(&mut self) {
        self.state = CaptureState::AwaitingContact;
        self.reset_run();
        self.best = None;
    }

    pub fn expire(&mut self) {
        if self.state != CaptureState::Stable {
            self.state = CaptureState::Timeout;
        }
    }

    /// Feed one fresh frame. Feeding a gate that is idle or already
    /// terminal starts a new capture.
    pub fn feed(&mut self, frame: &Frame) -> GateStep {
        if matches!(self.state, CaptureState::Idle | CaptureState::Stable | CaptureState::Timeout) {
            self.start();
        }

        let quality = QualitySignal::analyze(frame);

        if !quality.finger_present(&self.config) {
            self.state = CaptureState::AwaitingContact;
            self.reset_run();
            self.best = None;
            return GateStep::AwaitingContact(quality);
        }

        self.state = CaptureState::Measuring;

        let sharper = self
            .best
            .as_ref()
            .map_or(true, |b| quality.sharpness > b.quality.sharpness);
        if sharper {
            self.best = Some(CapturedFrame { frame: frame.clone(), quality });
        }

        if !quality.meets_minimum_quality(self.config.min_quality) {
            self.reset_run();
            return GateStep::Rejected(quality);
        }

        if let Some(prev) = &self.prev {
            let diff = frame.mean_abs_diff(prev);
            if diff <= self.config.stable_diff_max {
                self.stable_count += 1;
            } else {
                self.stable_count = 0;
            }
        }
        self.prev = Some(frame.clone());

        if self.stable_count >= self.config.stable_frames {
            self.state = CaptureState::Stable;
            let last = CapturedFrame { frame: frame.clone(), quality };
            let captured = match self.config.policy {
                CapturePolicy::LastStable => last,
                CapturePolicy::BestQuality => self.best.clone().unwrap_or(last),
            };
            return GateStep::Stable(captured);
        }

        GateStep::Measuring { quality, stable_count: self.stable_count }
    }

    fn reset_run(&mut self) {
        self.stable_count = 0;
        self.prev = None;
    }
}

/// Waits for a run of low-contrast frames after a capture.
#[derive(Debug, Clone)]
pub struct RemovalGate {
    config: CaptureConfig,
    state: RemovalState,
    run: u32,
}

impl RemovalGate {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: RemovalState::AwaitingRemoval,
            run: 0,
        }
    }

    pub fn state(&self) -> RemovalState {
        self.state
    }

    pub fn expire(&mut self) {
        if self.state != RemovalState::Removed {
            self.state = RemovalState::Timeout;
        }
    }

    pub fn feed(&mut self, frame: &Frame) -> RemovalState {
        if self.state == RemovalState::Removed {
            return self.state;
        }
        let quality = QualitySignal::analyze(frame);
        if quality.finger_removed(&self.config) {
            self.run += 1;
            if self.run >= self.config.removed_frames {
                self.state = RemovalState::Removed;
            }
        } else {
            self.run = 0;
        }
        self.state
    }
}

/// Polling driver for one capture-to-removal cycle on an exclusively
/// borrowed sensor.
pub struct Acquisition<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
    clock: &'a dyn Clock,
    stop: &'a StopSignal,
    dedup: &'a mut FrameDeduplicator,
    config: &'a CaptureConfig,
    poll_timeout: Duration,
}

impl<'a, S: FrameSource + ?Sized> Acquisition<'a, S> {
    pub fn new(
        source: &'a mut S,
        clock: &'a dyn Clock,
        stop: &'a StopSignal,
        dedup: &'a mut FrameDeduplicator,
        config: &'a CaptureConfig,
        poll_timeout: Duration,
    ) -> Self {
        Self { source, clock, stop, dedup, config, poll_timeout }
    }

    /// Poll once. Stale re-deliveries come back as `None`.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(frame) = self.source.poll(self.poll_timeout)? else {
            return Ok(None);
        };
        if !self.dedup.admit(&frame, self.clock.now()) {
            tracing::trace!("Dropping duplicate frame");
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Poll until the finger is held still with good quality, the deadline
    /// passes, or the stop signal fires.
    pub fn capture_when_stable(&mut self, timeout: Duration, status: &dyn StatusSink) -> Result<CaptureOutcome> {
        let start = self.clock.now();
        let mut gate = StabilityGate::new(self.config.clone());
        gate.start();
        status.publish(CaptureStatus::WaitingForContact);

        loop {
            if self.stop.is_stopped() {
                return Ok(CaptureOutcome::Cancelled);
            }
            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= timeout {
                gate.expire();
                tracing::debug!("No stable capture within {:.1}s", timeout.as_secs_f32());
                return Ok(CaptureOutcome::Timeout);
            }

            let Some(frame) = self.read_frame()? else {
                self.clock.sleep(self.config.poll_interval());
                continue;
            };

            let was_waiting = gate.state() == CaptureState::AwaitingContact;
            match gate.feed(&frame) {
                GateStep::AwaitingContact(_) => {
                    if !was_waiting {
                        status.publish(CaptureStatus::WaitingForContact);
                    }
                }
                GateStep::Rejected(quality) => {
                    tracing::debug!("Frame below minimum quality: {}", quality.sharpness);
                    status.publish(self.measuring_status(quality, 0, timeout - elapsed));
                }
                GateStep::Measuring { quality, stable_count } => {
                    status.publish(self.measuring_status(quality, stable_count, timeout - elapsed));
                }
                GateStep::Stable(captured) => {
                    tracing::debug!(
                        "Stable capture: sharpness={} mean={:.1} std={:.1}",
                        captured.quality.sharpness,
                        captured.quality.mean_intensity,
                        captured.quality.contrast_std
                    );
                    status.publish(CaptureStatus::Captured { quality: captured.quality });
                    return Ok(CaptureOutcome::Stable(captured));
                }
            }

            self.clock.sleep(self.config.poll_interval());
        }
    }

    /// Poll until the sensor reads empty for several consecutive frames.
    /// A timeout here is best-effort; callers usually carry on.
    pub fn wait_finger_removed(&mut self, timeout: Duration, status: &dyn StatusSink) -> Result<RemovalOutcome> {
        let start = self.clock.now();
        let mut gate = RemovalGate::new(self.config.clone());
        status.publish(CaptureStatus::LiftFinger);

        loop {
            if self.stop.is_stopped() {
                return Ok(RemovalOutcome::Cancelled);
            }
            if self.clock.now().saturating_duration_since(start) >= timeout {
                gate.expire();
                return Ok(RemovalOutcome::Timeout);
            }

            if let Some(frame) = self.read_frame()? {
                if gate.feed(&frame) == RemovalState::Removed {
                    status.publish(CaptureStatus::FingerRemoved);
                    return Ok(RemovalOutcome::Removed);
                }
            }

            self.clock.sleep(self.config.poll_interval());
        }
    }

    fn measuring_status(&self, quality: QualitySignal, stable_count: u32, remaining: Duration) -> CaptureStatus {
        CaptureStatus::Measuring {
            quality,
            hint: quality.pressure_hint(self.config),
            stable_count,
            remaining_secs: remaining.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timing::ManualClock;
    use crate::sensor::{ScriptStep, ScriptedSensor};

    const W: u32 = 32;
    const H: u32 = 32;

    fn flat(value: u8) -> Frame {
        Frame::from_raw(W, H, vec![value; (W * H) as usize]).unwrap()
    }

    /// High-contrast stripes; `shift` nudges one pixel so hashes differ while
    /// the mean difference stays tiny.
    fn textured(shift: u8) -> Frame {
        let mut data: Vec<u8> = (0..W * H)
            .map(|i| if (i % W / 2 + i / W / 2) % 2 == 0 { 20 } else { 230 })
            .collect();
        data[0] = data[0].wrapping_add(shift);
        Frame::from_raw(W, H, data).unwrap()
    }

    /// Same contrast as `textured` but far from it pixel-wise.
    fn inverted() -> Frame {
        let data = textured(0).pixels().iter().map(|&p| 250 - p).collect();
        Frame::from_raw(W, H, data).unwrap()
    }

    /// Low sharpness but high contrast: a smooth horizontal gradient.
    fn blurry(shift: u8) -> Frame {
        let mut data: Vec<u8> = (0..W * H).map(|i| ((i % W) * 8) as u8).collect();
        data[0] = shift;
        Frame::from_raw(W, H, data).unwrap()
    }

    fn config() -> CaptureConfig {
        CaptureConfig::default()
    }

    #[test]
    fn low_contrast_frames_never_stabilize() {
        let mut gate = StabilityGate::new(config());
        gate.start();
        for v in 0..50u8 {
            let step = gate.feed(&flat(100 + v));
            assert!(matches!(step, GateStep::AwaitingContact(_)));
            assert_eq!(gate.state(), CaptureState::AwaitingContact);
        }
    }

    #[test]
    fn three_still_frames_reach_stable() {
        let mut gate = StabilityGate::new(config());
        gate.start();
        assert!(matches!(gate.feed(&textured(0)), GateStep::Measuring { stable_count: 0, .. }));
        assert!(matches!(gate.feed(&textured(1)), GateStep::Measuring { stable_count: 1, .. }));
        assert!(matches!(gate.feed(&textured(2)), GateStep::Stable(_)));
        assert_eq!(gate.state(), CaptureState::Stable);
    }

    #[test]
    fn movement_resets_the_run() {
        let mut gate = StabilityGate::new(config());
        gate.start();
        gate.feed(&textured(0));
        gate.feed(&textured(1));
        assert_eq!(gate.stable_count(), 1);
        gate.feed(&inverted());
        assert_eq!(gate.stable_count(), 0);
        assert_eq!(gate.state(), CaptureState::Measuring);
    }

    #[test]
    fn low_quality_resets_without_leaving_measuring() {
        let mut gate = StabilityGate::new(config());
        gate.start();
        gate.feed(&textured(0));
        gate.feed(&textured(1));
        assert!(matches!(gate.feed(&blurry(0)), GateStep::Rejected(_)));
        assert_eq!(gate.stable_count(), 0);
        assert_eq!(gate.state(), CaptureState::Measuring);
    }

    #[test]
    fn lost_contact_returns_to_awaiting() {
        let mut gate = StabilityGate::new(config());
        gate.start();
        gate.feed(&textured(0));
        gate.feed(&textured(1));
        gate.feed(&flat(200));
        assert_eq!(gate.state(), CaptureState::AwaitingContact);
        assert_eq!(gate.stable_count(), 0);
    }

    #[test]
    fn best_quality_policy_returns_sharpest_frame() {
        let mut cfg = config();
        cfg.policy = CapturePolicy::BestQuality;
        cfg.min_quality = 0;
        cfg.stable_diff_max = 255.0;
        let mut gate = StabilityGate::new(cfg);
        gate.start();

        gate.feed(&blurry(1));
        gate.feed(&textured(0));
        let GateStep::Stable(captured) = gate.feed(&blurry(2)) else {
            panic!("expected stable");
        };
        assert_eq!(captured.frame.pixels(), textured(0).pixels());
    }

    #[test]
    fn deduplicator_blocks_repeats_inside_window_only() {
        let clock = ManualClock::new();
        let mut dedup = FrameDeduplicator::new(Duration::from_secs(2));
        let frame = textured(0);

        assert!(dedup.admit(&frame, clock.now()));
        clock.advance(Duration::from_millis(500));
        assert!(!dedup.admit(&frame, clock.now()));
        clock.advance(Duration::from_secs(2));
        assert!(dedup.admit(&frame, clock.now()));
        assert!(dedup.admit(&textured(1), clock.now()));
    }

    #[test]
    fn removal_needs_consecutive_empty_frames() {
        let mut gate = RemovalGate::new(config());
        assert_eq!(gate.feed(&flat(200)), RemovalState::AwaitingRemoval);
        assert_eq!(gate.feed(&flat(201)), RemovalState::AwaitingRemoval);
        // A transient dip back to contact restarts the count
        assert_eq!(gate.feed(&textured(0)), RemovalState::AwaitingRemoval);
        gate.feed(&flat(202));
        gate.feed(&flat(203));
        assert_eq!(gate.feed(&flat(204)), RemovalState::Removed);
    }

    fn acquire<'a>(
        sensor: &'a mut ScriptedSensor,
        clock: &'a ManualClock,
        stop: &'a StopSignal,
        dedup: &'a mut FrameDeduplicator,
        cfg: &'a CaptureConfig,
    ) -> Acquisition<'a, ScriptedSensor> {
        Acquisition::new(sensor, clock, stop, dedup, cfg, Duration::from_millis(100))
    }

    #[test]
    fn stale_redeliveries_do_not_advance_the_gate() {
        let cfg = config();
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        let mut dedup = FrameDeduplicator::new(cfg.duplicate_window());
        // The same buffer delivered many times inside the window counts once
        let mut sensor = ScriptedSensor::from_frames(std::iter::repeat(textured(0)).take(10));

        let outcome = acquire(&mut sensor, &clock, &stop, &mut dedup, &cfg)
            .capture_when_stable(Duration::from_millis(700), &())
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::Timeout));
    }

    #[test]
    fn capture_loop_returns_stable_frame() {
        let cfg = config();
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        let mut dedup = FrameDeduplicator::new(cfg.duplicate_window());
        let mut sensor = ScriptedSensor::new(vec![
            ScriptStep::Empty,
            ScriptStep::Frame(flat(200)),
            ScriptStep::Frame(textured(0)),
            ScriptStep::Frame(textured(1)),
            ScriptStep::Frame(textured(2)),
        ]);

        let outcome = acquire(&mut sensor, &clock, &stop, &mut dedup, &cfg)
            .capture_when_stable(Duration::from_secs(20), &())
            .unwrap();
        let CaptureOutcome::Stable(captured) = outcome else {
            panic!("expected stable capture");
        };
        assert_eq!(captured.frame.pixels(), textured(2).pixels());
    }

    #[test]
    fn capture_loop_times_out_without_frames() {
        let cfg = config();
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        let mut dedup = FrameDeduplicator::new(cfg.duplicate_window());
        let mut sensor = ScriptedSensor::default();

        let outcome = acquire(&mut sensor, &clock, &stop, &mut dedup, &cfg)
            .capture_when_stable(Duration::from_secs(3), &())
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::Timeout));
        assert!(clock.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn stop_signal_cancels_before_polling() {
        let cfg = config();
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        stop.stop();
        let mut dedup = FrameDeduplicator::new(cfg.duplicate_window());
        let mut sensor = ScriptedSensor::from_frames(vec![textured(0)]);

        let outcome = acquire(&mut sensor, &clock, &stop, &mut dedup, &cfg)
            .capture_when_stable(Duration::from_secs(20), &())
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::Cancelled));
        assert_eq!(sensor.polls(), 0);
    }

    #[test]
    fn sensor_failure_propagates() {
        let cfg = config();
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        let mut dedup = FrameDeduplicator::new(cfg.duplicate_window());
        let mut sensor = ScriptedSensor::new(vec![ScriptStep::Fail("unplugged".into())]);

        let result = acquire(&mut sensor, &clock, &stop, &mut dedup, &cfg)
            .capture_when_stable(Duration::from_secs(20), &());
        assert!(result.is_err());
    }

    #[test]
    fn removal_wait_times_out_while_finger_stays() {
        let cfg = config();
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        let mut dedup = FrameDeduplicator::new(cfg.duplicate_window());
        let mut sensor = ScriptedSensor::from_frames((0..200u8).map(textured));

        let outcome = acquire(&mut sensor, &clock, &stop, &mut dedup, &cfg)
            .wait_finger_removed(Duration::from_secs(2), &())
            .unwrap();
        assert_eq!(outcome, RemovalOutcome::Timeout);
    }

    #[test]
    fn removal_wait_sees_lift() {
        let cfg = config();
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        let mut dedup = FrameDeduplicator::new(cfg.duplicate_window());
        let mut sensor = ScriptedSensor::from_frames(vec![
            textured(0),
            flat(200),
            flat(201),
            flat(202),
        ]);

        let outcome = acquire(&mut sensor, &clock, &stop, &mut dedup, &cfg)
            .wait_finger_removed(Duration::from_secs(8), &())
            .unwrap();
        assert_eq!(outcome, RemovalOutcome::Removed);
    }
}
