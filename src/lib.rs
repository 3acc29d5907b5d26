// Core modules
pub mod core;
pub mod sensor;
pub mod storage;
pub mod cli;
pub mod common;

// Re-export commonly used types
pub use common::{CapturePolicy, Config, DevMode, FingertimeError, Result};
pub use core::{
    AttendanceToggle, CycleOutcome, CycleReport, Decision, DescriptorExtractor, DescriptorSet,
    Identification, Kiosk, KioskEvent, Matcher, QualitySignal, StatusSink, SyncSink,
};
pub use sensor::{Frame, FrameSource, ReplaySensor, ScriptedSensor, V4lSensor};
pub use storage::{
    AttendanceEvent, EventFilter, EventKind, FileStore, Gallery, GalleryEntry, Identity, Ledger,
    MemoryStore,
};
