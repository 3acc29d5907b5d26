use super::{AttendanceEvent, EventFilter, Gallery, GalleryEntry, Identity, Ledger, Template};
use crate::common::{FingertimeError, Result};
use crate::core::descriptor::DescriptorSet;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    identities: Vec<Identity>,
    templates: Vec<Template>,
    events: Vec<AttendanceEvent>,
}

/// Volatile gallery + ledger. Iterates in insertion order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Gallery for MemoryStore {
    fn upsert_identity(&self, identity: &Identity) -> Result<()> {
        let mut inner = self.lock();
        match inner.identities.iter_mut().find(|i| i.identity_id == identity.identity_id) {
            Some(existing) => existing.display_name = identity.display_name.clone(),
            None => inner.identities.push(identity.clone()),
        }
        Ok(())
    }

    fn add_template(
        &self,
        identity_id: &str,
        descriptors: &DescriptorSet,
        created_at: DateTime<Utc>,
    ) -> Result<Template> {
        let mut inner = self.lock();
        if !inner.identities.iter().any(|i| i.identity_id == identity_id) {
            return Err(FingertimeError::IdentityNotFound(identity_id.to_string()));
        }
        let template = Template {
            identity_id: identity_id.to_string(),
            descriptors: descriptors.clone(),
            created_at,
        };
        inner.templates.push(template.clone());
        Ok(template)
    }

    fn enroll(
        &self,
        identity: &Identity,
        templates: &[DescriptorSet],
        created_at: DateTime<Utc>,
    ) -> Result<Vec<Template>> {
        let mut inner = self.lock();
        match inner.identities.iter_mut().find(|i| i.identity_id == identity.identity_id) {
            Some(existing) => existing.display_name = identity.display_name.clone(),
            None => inner.identities.push(identity.clone()),
        }
        let added: Vec<Template> = templates
            .iter()
            .map(|descriptors| Template {
                identity_id: identity.identity_id.clone(),
                descriptors: descriptors.clone(),
                created_at,
            })
            .collect();
        inner.templates.extend(added.iter().cloned());
        Ok(added)
    }

    fn withdraw(&self, identity_id: &str, created_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        inner
            .templates
            .retain(|t| !(t.identity_id == identity_id && t.created_at == created_at));
        if !inner.templates.iter().any(|t| t.identity_id == identity_id) {
            inner.identities.retain(|i| i.identity_id != identity_id);
        }
        Ok(())
    }

    fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.lock().identities.clone())
    }

    fn all_templates(&self) -> Result<Vec<GalleryEntry>> {
        let inner = self.lock();
        Ok(inner
            .templates
            .iter()
            .filter_map(|t| {
                let owner = inner.identities.iter().find(|i| i.identity_id == t.identity_id)?;
                Some(GalleryEntry {
                    identity_id: owner.identity_id.clone(),
                    display_name: owner.display_name.clone(),
                    template: t.clone(),
                })
            })
            .collect())
    }
}

impl Ledger for MemoryStore {
    fn append(&self, mut event: AttendanceEvent) -> Result<AttendanceEvent> {
        let mut inner = self.lock();
        event.sequence = inner.events.len() as u64 + 1;
        inner.events.push(event.clone());
        Ok(event)
    }

    fn events_for(&self, identity_id: &str) -> Result<Vec<AttendanceEvent>> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.identity_id.as_deref() == Some(identity_id))
            .cloned()
            .collect())
    }

    fn events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>> {
        Ok(filter.apply(self.lock().events.iter().cloned()))
    }
}
