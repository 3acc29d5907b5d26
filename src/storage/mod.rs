//! Gallery and ledger storage.
//!
//! The core only depends on the [`Gallery`] and [`Ledger`] traits. Two
//! backends ship with the crate: [`MemoryStore`] and the on-disk
//! [`FileStore`]. The ledger is append-only; toggle and cooldown state are
//! always derived by reading it back, never cached beside it.

pub mod file_store;
pub mod memory;

use crate::common::Result;
use crate::core::descriptor::DescriptorSet;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use file_store::FileStore;
pub use memory::MemoryStore;

// ─── Model ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(identity_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// One enrolled descriptor set. Never updated once written.
#[derive(Debug, Clone)]
pub struct Template {
    pub identity_id: String,
    pub descriptors: DescriptorSet,
    pub created_at: DateTime<Utc>,
}

/// A template joined with its owner's display name, as the matcher sees it.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub display_name: String,
    pub template: Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Enroll,
    ClockedIn,
    ClockedOut,
    NoMatch,
    /// Written by older kiosks for an accepted clock-in. Read-only.
    Match,
}

impl EventKind {
    /// Kinds that come from an accepted identification.
    pub fn is_accepted(self) -> bool {
        matches!(self, EventKind::ClockedIn | EventKind::ClockedOut | EventKind::Match)
    }

    /// Kinds that leave the identity clocked in.
    pub fn is_in(self) -> bool {
        matches!(self, EventKind::ClockedIn | EventKind::Match)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Enroll => "ENROLL",
            EventKind::ClockedIn => "CLOCKED_IN",
            EventKind::ClockedOut => "CLOCKED_OUT",
            EventKind::NoMatch => "NO_MATCH",
            EventKind::Match => "MATCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    /// Insertion order, assigned by the ledger on append.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub match_score: Option<u32>,
    pub kind: EventKind,
}

impl AttendanceEvent {
    pub fn new(timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            sequence: 0,
            timestamp,
            identity_id: None,
            display_name: None,
            match_score: None,
            kind,
        }
    }

    pub fn with_identity(mut self, identity_id: impl Into<String>, display_name: Option<String>) -> Self {
        self.identity_id = Some(identity_id.into());
        self.display_name = display_name;
        self
    }

    pub fn with_score(mut self, score: u32) -> Self {
        self.match_score = Some(score);
        self
    }

    pub fn local_date(&self) -> NaiveDate {
        self.timestamp.with_timezone(&Local).date_naive()
    }

    fn counts_as_attempt(&self, include_no_match: bool) -> bool {
        self.kind.is_accepted() || (include_no_match && self.kind == EventKind::NoMatch)
    }
}

/// Filter for [`Ledger::events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub identity_id: Option<String>,
    pub kind: Option<EventKind>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn matches(&self, event: &AttendanceEvent) -> bool {
        if let Some(id) = &self.identity_id {
            if event.identity_id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, events: impl IntoIterator<Item = AttendanceEvent>) -> Vec<AttendanceEvent> {
        let mut out: Vec<_> = events.into_iter().filter(|e| self.matches(e)).collect();
        if let Some(limit) = self.limit {
            let skip = out.len().saturating_sub(limit);
            out.drain(..skip);
        }
        out
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Enrolled identities and their templates.
pub trait Gallery: Send + Sync {
    /// Create the identity or refresh its display name.
    fn upsert_identity(&self, identity: &Identity) -> Result<()>;

    /// Append a template. Fails with `IdentityNotFound` for unknown owners.
    fn add_template(
        &self,
        identity_id: &str,
        descriptors: &DescriptorSet,
        created_at: DateTime<Utc>,
    ) -> Result<Template>;

    /// Create or refresh the identity and attach all of `templates` in one
    /// step. Either every template becomes visible or none does.
    fn enroll(
        &self,
        identity: &Identity,
        templates: &[DescriptorSet],
        created_at: DateTime<Utc>,
    ) -> Result<Vec<Template>>;

    /// Undo an `enroll`: drop the identity's templates stamped `created_at`,
    /// and the identity itself once it has no templates left.
    fn withdraw(&self, identity_id: &str, created_at: DateTime<Utc>) -> Result<()>;

    fn identities(&self) -> Result<Vec<Identity>>;

    /// Every usable template in a stable order. Malformed templates are
    /// skipped, not reported as errors.
    fn all_templates(&self) -> Result<Vec<GalleryEntry>>;
}

/// Append-only attendance history, in insertion order.
pub trait Ledger: Send + Sync {
    /// Durably append and return the event with its assigned sequence.
    fn append(&self, event: AttendanceEvent) -> Result<AttendanceEvent>;

    /// All events for one identity, oldest first.
    fn events_for(&self, identity_id: &str) -> Result<Vec<AttendanceEvent>>;

    fn events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>>;

    fn last_event(&self, identity_id: &str) -> Result<Option<AttendanceEvent>> {
        Ok(self.events_for(identity_id)?.pop())
    }

    /// Kind of the last event that bears on the in/out toggle. `NO_MATCH`
    /// audit rows are skipped.
    fn last_event_kind(&self, identity_id: &str) -> Result<Option<EventKind>> {
        Ok(self
            .events_for(identity_id)?
            .into_iter()
            .rev()
            .find(|e| e.kind != EventKind::NoMatch)
            .map(|e| e.kind))
    }

    fn last_accepted_event(&self, identity_id: &str, include_no_match: bool) -> Result<Option<AttendanceEvent>> {
        Ok(self
            .events_for(identity_id)?
            .into_iter()
            .rev()
            .find(|e| e.counts_as_attempt(include_no_match)))
    }

    /// Whether an accepted event exists on the given local calendar date.
    fn has_accepted_event_on(&self, identity_id: &str, date: NaiveDate, include_no_match: bool) -> Result<bool> {
        Ok(self
            .events_for(identity_id)?
            .iter()
            .any(|e| e.counts_as_attempt(include_no_match) && e.local_date() == date))
    }
}
