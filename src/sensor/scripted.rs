use super::{Frame, FrameSource};
use crate::common::{FingertimeError, Result};
use std::collections::VecDeque;
use std::time::Duration;

/// One scripted answer to a poll.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Frame(Frame),
    Empty,
    Fail(String),
}

/// In-memory frame source that replays a fixed script, then reports no
/// frames. Useful for tests and for driving the pipeline without hardware.
#[derive(Debug, Default)]
pub struct ScriptedSensor {
    steps: VecDeque<ScriptStep>,
    polls: usize,
}

impl ScriptedSensor {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            polls: 0,
        }
    }

    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self::new(frames.into_iter().map(ScriptStep::Frame))
    }

    pub fn push(&mut self, step: ScriptStep) {
        self.steps.push_back(step);
    }

    pub fn extend_frames(&mut self, frames: impl IntoIterator<Item = Frame>) {
        self.steps.extend(frames.into_iter().map(ScriptStep::Frame));
    }

    /// Number of polls served so far.
    pub fn polls(&self) -> usize {
        self.polls
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl FrameSource for ScriptedSensor {
    fn poll(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
        self.polls += 1;
        match self.steps.pop_front() {
            Some(ScriptStep::Frame(frame)) => Ok(Some(frame)),
            Some(ScriptStep::Empty) | None => Ok(None),
            Some(ScriptStep::Fail(msg)) => Err(FingertimeError::SensorUnavailable(msg)),
        }
    }
}
