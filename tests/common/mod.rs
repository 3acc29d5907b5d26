//! Synthetic sensor data shared by the integration tests.

#![allow(dead_code)]

use fingertime::core::{CaptureStatus, CycleReport, StatusSink, StopSignal};
use fingertime::sensor::{Frame, ScriptedSensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

pub const WIDTH: u32 = 256;
pub const HEIGHT: u32 = 360;
const CELL: u32 = 6;

/// A high-contrast blocky texture standing in for a pressed finger. The
/// same seed always yields the same print; `jitter` only touches the top-left
/// pixel, which the extractor crops away, so hashes differ while descriptors
/// do not.
pub fn finger_frame(seed: u64, jitter: u8) -> Frame {
    let cols = WIDTH.div_ceil(CELL);
    let rows = HEIGHT.div_ceil(CELL);
    let mut rng = StdRng::seed_from_u64(seed);
    let cells: Vec<u8> = (0..cols * rows).map(|_| rng.gen()).collect();

    let mut data: Vec<u8> = (0..WIDTH * HEIGHT)
        .map(|i| {
            let (x, y) = (i % WIDTH, i / WIDTH);
            cells[((y / CELL) * cols + x / CELL) as usize]
        })
        .collect();
    data[0] = data[0].wrapping_add(jitter);
    Frame::from_raw(WIDTH, HEIGHT, data).unwrap()
}

/// Empty sensor glass.
pub fn blank_frame(jitter: u8) -> Frame {
    let mut data = vec![250u8; (WIDTH * HEIGHT) as usize];
    data[0] = 250 - jitter;
    Frame::from_raw(WIDTH, HEIGHT, data).unwrap()
}

/// Enough steady frames for the stability gate to fire.
pub fn press(seed: u64) -> Vec<Frame> {
    (0..3).map(|j| finger_frame(seed, j)).collect()
}

/// Enough empty frames for removal detection.
pub fn lift() -> Vec<Frame> {
    (0..3).map(blank_frame).collect()
}

/// Presses of the same finger, each followed by a lift.
pub fn script(seed: u64, presses: usize) -> ScriptedSensor {
    let mut sensor = ScriptedSensor::default();
    for _ in 0..presses {
        sensor.extend_frames(press(seed));
        sensor.extend_frames(lift());
    }
    sensor
}

/// Records cycle reports and fires the stop signal after `stop_after`
/// reports, or after `stop_after_lifts` finger removals when set.
pub struct Collector {
    reports: Mutex<Vec<CycleReport>>,
    lifts: Mutex<usize>,
    stop_after: usize,
    stop_after_lifts: Option<usize>,
    stop: StopSignal,
}

impl Collector {
    pub fn new(stop: StopSignal, stop_after: usize) -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            lifts: Mutex::new(0),
            stop_after,
            stop_after_lifts: None,
            stop,
        }
    }

    /// Never stops on reports; stops once the finger has been lifted `lifts`
    /// times.
    pub fn until_lifts(stop: StopSignal, lifts: usize) -> Self {
        Self {
            stop_after_lifts: Some(lifts),
            ..Self::new(stop, usize::MAX)
        }
    }

    pub fn reports(&self) -> Vec<CycleReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl StatusSink for Collector {
    fn publish(&self, status: CaptureStatus) {
        if let (CaptureStatus::FingerRemoved, Some(limit)) = (&status, self.stop_after_lifts) {
            let mut lifts = self.lifts.lock().unwrap();
            *lifts += 1;
            if *lifts >= limit {
                self.stop.stop();
            }
        }
    }

    fn report(&self, report: &CycleReport) {
        let mut reports = self.reports.lock().unwrap();
        reports.push(report.clone());
        if reports.len() >= self.stop_after {
            self.stop.stop();
        }
    }
}
