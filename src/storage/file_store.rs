use super::{AttendanceEvent, EventFilter, Gallery, GalleryEntry, Identity, Ledger, Template};
use crate::common::{Config, DevMode, FingertimeError, Result};
use crate::core::descriptor::DescriptorSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const STORAGE_VERSION: u32 = 1;
const LEDGER_FILE: &str = "ledger.bin";
const GALLERY_DIR: &str = "gallery";

#[derive(Serialize, Deserialize)]
struct StoredTemplate {
    blob: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    version: u32,
    identity: Identity,
    templates: Vec<StoredTemplate>,
}

/// On-disk gallery and ledger.
///
/// Layout under the data directory:
/// - `gallery/<identity_id>.bincode`: one record per identity holding its
///   display name and raw template blobs.
/// - `ledger.bin`: length-prefixed bincode events, appended and synced one
///   at a time.
pub struct FileStore {
    gallery_dir: PathBuf,
    ledger_path: PathBuf,
    gallery_lock: Mutex<()>,
    ledger: Mutex<LedgerState>,
}

struct LedgerState {
    file: File,
    events: Vec<AttendanceEvent>,
}

impl FileStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let gallery_dir = data_dir.join(GALLERY_DIR);
        fs::create_dir_all(&gallery_dir)?;

        let ledger_path = data_dir.join(LEDGER_FILE);
        let events = read_ledger(&ledger_path)?;
        let file = OpenOptions::new().create(true).append(true).open(&ledger_path)?;

        tracing::debug!(
            "FileStore opened at {:?} ({} ledger events)",
            data_dir,
            events.len()
        );

        Ok(Self {
            gallery_dir,
            ledger_path,
            gallery_lock: Mutex::new(()),
            ledger: Mutex::new(LedgerState { file, events }),
        })
    }

    pub fn new_with_dev_mode(dev_mode: &DevMode, config: &Config) -> Result<Self> {
        let data_dir = dev_mode.data_dir(config);
        if dev_mode.is_enabled() {
            tracing::debug!("FileStore using dev directories: {:?}", data_dir);
        }
        Self::open(data_dir)
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    fn record_path(&self, identity_id: &str) -> Result<PathBuf> {
        validate_identity_id(identity_id)?;
        Ok(self.gallery_dir.join(format!("{}.bincode", identity_id)))
    }

    fn load_record(&self, path: &Path) -> Result<IdentityRecord> {
        let data = fs::read(path)?;
        let mut record: IdentityRecord = bincode::deserialize(&data)
            .map_err(|e| FingertimeError::Storage(format!("Failed to deserialize {:?}: {}", path, e)))?;

        if record.version < STORAGE_VERSION {
            record.version = STORAGE_VERSION;
        }
        Ok(record)
    }

    fn save_record(&self, path: &Path, record: &IdentityRecord) -> Result<()> {
        let encoded = bincode::serialize(record)
            .map_err(|e| FingertimeError::Storage(format!("Failed to serialize: {}", e)))?;

        // Write-then-rename so a crash never leaves a half-written record
        let tmp = path.with_extension("bincode.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<IdentityRecord>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.gallery_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("bincode"))
            .collect();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable gallery record {:?}: {}", path, e),
            }
        }
        Ok(records)
    }

    fn lock_gallery(&self) -> MutexGuard<'_, ()> {
        self.gallery_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_ledger(&self) -> MutexGuard<'_, LedgerState> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Gallery for FileStore {
    fn upsert_identity(&self, identity: &Identity) -> Result<()> {
        let _guard = self.lock_gallery();
        let path = self.record_path(&identity.identity_id)?;
        let record = if path.exists() {
            let mut record = self.load_record(&path)?;
            record.identity.display_name = identity.display_name.clone();
            record
        } else {
            IdentityRecord {
                version: STORAGE_VERSION,
                identity: identity.clone(),
                templates: Vec::new(),
            }
        };
        self.save_record(&path, &record)
    }

    fn add_template(
        &self,
        identity_id: &str,
        descriptors: &DescriptorSet,
        created_at: DateTime<Utc>,
    ) -> Result<Template> {
        let _guard = self.lock_gallery();
        let path = self.record_path(identity_id)?;
        if !path.exists() {
            return Err(FingertimeError::IdentityNotFound(identity_id.to_string()));
        }

        let mut record = self.load_record(&path)?;
        record.templates.push(StoredTemplate {
            blob: descriptors.to_bytes(),
            created_at,
        });
        self.save_record(&path, &record)?;

        Ok(Template {
            identity_id: identity_id.to_string(),
            descriptors: descriptors.clone(),
            created_at,
        })
    }

    fn enroll(
        &self,
        identity: &Identity,
        templates: &[DescriptorSet],
        created_at: DateTime<Utc>,
    ) -> Result<Vec<Template>> {
        let _guard = self.lock_gallery();
        let path = self.record_path(&identity.identity_id)?;
        let mut record = if path.exists() {
            let mut record = self.load_record(&path)?;
            record.identity.display_name = identity.display_name.clone();
            record
        } else {
            IdentityRecord {
                version: STORAGE_VERSION,
                identity: identity.clone(),
                templates: Vec::new(),
            }
        };
        record.templates.extend(templates.iter().map(|descriptors| StoredTemplate {
            blob: descriptors.to_bytes(),
            created_at,
        }));
        // One rename publishes the identity and all of its new templates
        self.save_record(&path, &record)?;

        Ok(templates
            .iter()
            .map(|descriptors| Template {
                identity_id: identity.identity_id.clone(),
                descriptors: descriptors.clone(),
                created_at,
            })
            .collect())
    }

    fn withdraw(&self, identity_id: &str, created_at: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock_gallery();
        let path = self.record_path(identity_id)?;
        if !path.exists() {
            return Ok(());
        }
        let mut record = self.load_record(&path)?;
        record.templates.retain(|t| t.created_at != created_at);
        if record.templates.is_empty() {
            fs::remove_file(&path)?;
            tracing::info!("Removed identity {} after withdrawn enrollment", identity_id);
            Ok(())
        } else {
            self.save_record(&path, &record)
        }
    }

    fn identities(&self) -> Result<Vec<Identity>> {
        let _guard = self.lock_gallery();
        Ok(self.records()?.into_iter().map(|r| r.identity).collect())
    }

    fn all_templates(&self) -> Result<Vec<GalleryEntry>> {
        let _guard = self.lock_gallery();
        let mut entries = Vec::new();
        for record in self.records()? {
            for stored in record.templates {
                match DescriptorSet::from_bytes(&stored.blob) {
                    Ok(descriptors) => entries.push(GalleryEntry {
                        identity_id: record.identity.identity_id.clone(),
                        display_name: record.identity.display_name.clone(),
                        template: Template {
                            identity_id: record.identity.identity_id.clone(),
                            descriptors,
                            created_at: stored.created_at,
                        },
                    }),
                    Err(e) => tracing::warn!(
                        "Skipping template for {}: {}",
                        record.identity.identity_id,
                        e
                    ),
                }
            }
        }
        Ok(entries)
    }
}

impl Ledger for FileStore {
    fn append(&self, mut event: AttendanceEvent) -> Result<AttendanceEvent> {
        let mut state = self.lock_ledger();
        event.sequence = state.events.last().map_or(1, |e| e.sequence + 1);

        let encoded = bincode::serialize(&event)
            .map_err(|e| FingertimeError::Storage(format!("Failed to serialize event: {}", e)))?;
        let len = u32::try_from(encoded.len())
            .map_err(|_| FingertimeError::Storage("Event too large".into()))?;

        let mut buf = Vec::with_capacity(4 + encoded.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&encoded);
        state.file.write_all(&buf)?;
        state.file.sync_data()?;

        state.events.push(event.clone());
        Ok(event)
    }

    fn events_for(&self, identity_id: &str) -> Result<Vec<AttendanceEvent>> {
        Ok(self
            .lock_ledger()
            .events
            .iter()
            .filter(|e| e.identity_id.as_deref() == Some(identity_id))
            .cloned()
            .collect())
    }

    fn events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>> {
        Ok(filter.apply(self.lock_ledger().events.iter().cloned()))
    }
}

/// Identity ids become file names, so keep them to a safe alphabet.
fn validate_identity_id(identity_id: &str) -> Result<()> {
    let ok = !identity_id.is_empty()
        && identity_id.len() <= 64
        && identity_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !identity_id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(FingertimeError::InvalidIdentity(format!("{:?} is not a valid identity id", identity_id)))
    }
}

/// Read every complete record. A complete frame that fails to decode is
/// skipped and left in place; only a torn tail from an interrupted append is
/// cut off, so later appends start on a record boundary.
fn read_ledger(path: &Path) -> Result<Vec<AttendanceEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut events = Vec::new();
    let mut skipped = 0usize;
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[offset..offset + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let end = match offset.checked_add(4 + len) {
            Some(end) if end <= data.len() => end,
            _ => break,
        };
        match bincode::deserialize::<AttendanceEvent>(&data[offset + 4..end]) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("Skipping unreadable ledger record at byte {}: {}", offset, e);
                skipped += 1;
            }
        }
        offset = end;
    }

    if skipped > 0 {
        tracing::warn!("{} unreadable ledger records kept in {:?}", skipped, path);
    }

    if offset < data.len() {
        tracing::warn!(
            "Truncating {} trailing ledger bytes in {:?}",
            data.len() - offset,
            path
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
    }

    Ok(events)
}
