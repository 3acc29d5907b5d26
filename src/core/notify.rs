//! Outbound notifications: capture status for observers, completed-cycle
//! reports, and fire-and-forget pushes to an external sync collaborator.

use crate::core::kiosk::CycleReport;
use crate::core::stability::CaptureStatus;
use crate::storage::{AttendanceEvent, Identity};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Everything a UI-side observer can receive from a running kiosk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KioskEvent {
    Status(CaptureStatus),
    Report(CycleReport),
}

/// Receives live capture progress. Implementations must not block.
pub trait StatusSink {
    fn publish(&self, status: CaptureStatus);

    fn report(&self, _report: &CycleReport) {}
}

impl StatusSink for () {
    fn publish(&self, _status: CaptureStatus) {}
}

impl StatusSink for Sender<KioskEvent> {
    fn publish(&self, status: CaptureStatus) {
        // A dropped receiver just means nobody is watching
        let _ = self.send(KioskEvent::Status(status));
    }

    fn report(&self, report: &CycleReport) {
        let _ = self.send(KioskEvent::Report(report.clone()));
    }
}

/// External replica (cloud or backend) that mirrors enrollments and events.
pub trait SyncSink: Send + Sync {
    fn push_identity(&self, identity: &Identity, templates: &[Vec<u8>]) -> anyhow::Result<()>;

    fn push_attendance(&self, event: &AttendanceEvent) -> anyhow::Result<()>;
}

/// Sync sink that only logs, for installs without a replica.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSync;

impl SyncSink for LogSync {
    fn push_identity(&self, identity: &Identity, templates: &[Vec<u8>]) -> anyhow::Result<()> {
        tracing::info!("sync: identity {} with {} templates", identity.identity_id, templates.len());
        Ok(())
    }

    fn push_attendance(&self, event: &AttendanceEvent) -> anyhow::Result<()> {
        tracing::info!("sync: {:?} for {:?}", event.kind, event.identity_id);
        Ok(())
    }
}

/// Push an attendance event on its own thread. Failures are logged, never
/// retried, and never reach the capture loop.
pub fn dispatch_attendance(sync: &Arc<dyn SyncSink>, event: AttendanceEvent) {
    let sync = Arc::clone(sync);
    let spawned = std::thread::Builder::new()
        .name("fingertime-sync".into())
        .spawn(move || {
            if let Err(e) = sync.push_attendance(&event) {
                tracing::warn!("Attendance sync failed for event {}: {:#}", event.sequence, e);
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Could not spawn sync thread: {}", e);
    }
}

pub fn dispatch_identity(sync: &Arc<dyn SyncSink>, identity: Identity, templates: Vec<Vec<u8>>) {
    let sync = Arc::clone(sync);
    let spawned = std::thread::Builder::new()
        .name("fingertime-sync".into())
        .spawn(move || {
            if let Err(e) = sync.push_identity(&identity, &templates) {
                tracing::warn!("Enrollment sync failed for {}: {:#}", identity.identity_id, e);
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Could not spawn sync thread: {}", e);
    }
}
