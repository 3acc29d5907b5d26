pub mod attendance;
pub mod descriptor;
pub mod kiosk;
pub mod matcher;
pub mod notify;
pub mod orb;
pub mod preprocess;
pub mod quality;
pub mod stability;
pub mod timing;

pub use attendance::{AttendanceToggle, Decision};
pub use descriptor::{DescriptorExtractor, DescriptorSet};
pub use kiosk::{CycleOutcome, CycleReport, Kiosk};
pub use matcher::{hamming, Identification, Matcher};
pub use notify::{KioskEvent, LogSync, StatusSink, SyncSink};
pub use quality::{PressureHint, QualitySignal};
pub use stability::{CaptureOutcome, CaptureStatus, RemovalOutcome, StabilityGate};
pub use timing::{Clock, ManualClock, StopSignal, SystemClock};
