use crate::common::config::AttendanceConfig;
use crate::common::Result;
use crate::core::matcher::Identification;
use crate::storage::{AttendanceEvent, EventKind, Ledger};
use chrono::{DateTime, Local, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of one attendance decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// An in/out event was appended.
    Recorded(AttendanceEvent),
    /// Score below threshold or no candidate. A `NO_MATCH` row was appended.
    NoMatch(AttendanceEvent),
    /// Within the cooldown of the identity's last accepted event. Nothing written.
    Suppressed { remaining: Duration },
    /// Identity already has an accepted event today. Nothing written.
    DailyLimitReached,
}

/// Turns an identification into at most one ledger append.
///
/// All state is read back from the ledger on each call. The internal lock
/// is held across read, decide and append so two concurrent decisions for
/// the same identity cannot both toggle.
pub struct AttendanceToggle {
    config: AttendanceConfig,
    ledger: Arc<dyn Ledger>,
    lock: Mutex<()>,
}

impl AttendanceToggle {
    pub fn new(config: AttendanceConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            config,
            ledger,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AttendanceConfig {
        &self.config
    }

    pub fn decide(&self, identification: &Identification, now: DateTime<Utc>) -> Result<Decision> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let include_no_match = self.config.no_match_counts_toward_limits;

        let identity_id = match &identification.identity_id {
            Some(id) if identification.score >= self.config.score_accept => id.clone(),
            _ => {
                let mut event = AttendanceEvent::new(now, EventKind::NoMatch);
                if include_no_match {
                    if let Some(id) = &identification.identity_id {
                        event = event
                            .with_identity(id.clone(), identification.display_name.clone())
                            .with_score(identification.score);
                    }
                }
                let event = self.ledger.append(event)?;
                tracing::info!(
                    "No match (best {:?}, score {} < {})",
                    identification.identity_id,
                    identification.score,
                    self.config.score_accept
                );
                return Ok(Decision::NoMatch(event));
            }
        };

        if let Some(last) = self.ledger.last_accepted_event(&identity_id, include_no_match)? {
            let cooldown = self.config.cooldown();
            let elapsed = now.signed_duration_since(last.timestamp);
            if elapsed < cooldown {
                let remaining = (cooldown - elapsed)
                    .min(cooldown)
                    .to_std()
                    .unwrap_or_default();
                tracing::debug!("{} suppressed, {:?} of cooldown left", identity_id, remaining);
                return Ok(Decision::Suppressed { remaining });
            }
        }

        if self.config.one_mark_per_day {
            let today = now.with_timezone(&Local).date_naive();
            if self.ledger.has_accepted_event_on(&identity_id, today, include_no_match)? {
                tracing::info!("{} already marked on {}", identity_id, today);
                return Ok(Decision::DailyLimitReached);
            }
        }

        let kind = match self.ledger.last_event_kind(&identity_id)? {
            Some(k) if k.is_in() => EventKind::ClockedOut,
            _ => EventKind::ClockedIn,
        };

        let event = self.ledger.append(
            AttendanceEvent::new(now, kind)
                .with_identity(identity_id, identification.display_name.clone())
                .with_score(identification.score),
        )?;
        tracing::info!(
            "{} {:?} {} (score {})",
            event.kind.as_str(),
            event.identity_id,
            event.display_name.as_deref().unwrap_or(""),
            identification.score
        );
        Ok(Decision::Recorded(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EventFilter, MemoryStore};
    use chrono::TimeZone;

    fn matched(id: &str, score: u32) -> Identification {
        Identification {
            identity_id: Some(id.into()),
            display_name: Some(format!("Name {}", id)),
            score,
        }
    }

    fn toggle_with(config: AttendanceConfig) -> (AttendanceToggle, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger: Arc<dyn Ledger> = store.clone();
        (AttendanceToggle::new(config, ledger), store)
    }

    fn noon() -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2026, 3, 2, 12, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn score_threshold_is_inclusive() {
        let (toggle, store) = toggle_with(AttendanceConfig::default());
        let t0 = noon();

        let below = toggle.decide(&matched("E1", 19), t0).unwrap();
        assert!(matches!(below, Decision::NoMatch(ref e) if e.identity_id.is_none()));

        let at = toggle.decide(&matched("E1", 20), t0).unwrap();
        assert!(matches!(at, Decision::Recorded(ref e) if e.kind == EventKind::ClockedIn));
        assert_eq!(store.events(&EventFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn missing_identity_is_no_match() {
        let (toggle, _) = toggle_with(AttendanceConfig::default());
        let decision = toggle.decide(&Identification::none(), noon()).unwrap();
        assert!(matches!(decision, Decision::NoMatch(_)));
    }

    #[test]
    fn cooldown_suppresses_without_writing() {
        let (toggle, store) = toggle_with(AttendanceConfig::default());
        let t0 = noon();
        toggle.decide(&matched("E1", 40), t0).unwrap();

        let again = toggle.decide(&matched("E1", 40), t0 + secs(10)).unwrap();
        assert_eq!(again, Decision::Suppressed { remaining: Duration::from_secs(20) });
        let again = toggle.decide(&matched("E1", 40), t0 + secs(29)).unwrap();
        assert!(matches!(again, Decision::Suppressed { .. }));
        assert_eq!(store.events_for("E1").unwrap().len(), 1);

        // Exactly at the window edge the cooldown has elapsed
        let out = toggle.decide(&matched("E1", 40), t0 + secs(30)).unwrap();
        assert!(matches!(out, Decision::Recorded(ref e) if e.kind == EventKind::ClockedOut));
    }

    #[test]
    fn toggle_alternates_and_ignores_other_identities() {
        let (toggle, _) = toggle_with(AttendanceConfig::default());
        let t0 = noon();
        let kinds: Vec<EventKind> = (0..4)
            .map(|i| match toggle.decide(&matched("E1", 25), t0 + secs(i * 60)).unwrap() {
                Decision::Recorded(e) => e.kind,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::ClockedIn, EventKind::ClockedOut, EventKind::ClockedIn, EventKind::ClockedOut]
        );

        let other = toggle.decide(&matched("E2", 25), t0 + secs(5)).unwrap();
        assert!(matches!(other, Decision::Recorded(ref e) if e.kind == EventKind::ClockedIn));
    }

    #[test]
    fn enroll_and_legacy_rows_drive_toggle() {
        let (toggle, store) = toggle_with(AttendanceConfig::default());
        let t0 = noon();
        store
            .append(AttendanceEvent::new(t0 - secs(3600), EventKind::Enroll).with_identity("E1", None))
            .unwrap();
        store
            .append(AttendanceEvent::new(t0 - secs(3600), EventKind::Match).with_identity("E2", None))
            .unwrap();

        let e1 = toggle.decide(&matched("E1", 30), t0).unwrap();
        assert!(matches!(e1, Decision::Recorded(ref e) if e.kind == EventKind::ClockedIn));
        let e2 = toggle.decide(&matched("E2", 30), t0).unwrap();
        assert!(matches!(e2, Decision::Recorded(ref e) if e.kind == EventKind::ClockedOut));
    }

    #[test]
    fn daily_cap_blocks_second_mark_same_day() {
        let config = AttendanceConfig {
            one_mark_per_day: true,
            ..AttendanceConfig::default()
        };
        let (toggle, store) = toggle_with(config);
        let t0 = noon();
        toggle.decide(&matched("E1", 30), t0).unwrap();

        let later = toggle.decide(&matched("E1", 30), t0 + secs(3600)).unwrap();
        assert_eq!(later, Decision::DailyLimitReached);
        assert_eq!(store.events_for("E1").unwrap().len(), 1);

        let tomorrow = toggle.decide(&matched("E1", 30), t0 + secs(24 * 3600)).unwrap();
        assert!(matches!(tomorrow, Decision::Recorded(_)));
    }

    #[test]
    fn no_match_rows_can_count_toward_cooldown() {
        let config = AttendanceConfig {
            no_match_counts_toward_limits: true,
            ..AttendanceConfig::default()
        };
        let (toggle, store) = toggle_with(config);
        let t0 = noon();

        let miss = toggle.decide(&matched("E1", 5), t0).unwrap();
        assert!(matches!(miss, Decision::NoMatch(ref e) if e.identity_id.as_deref() == Some("E1")));

        let soon = toggle.decide(&matched("E1", 30), t0 + secs(5)).unwrap();
        assert!(matches!(soon, Decision::Suppressed { .. }));

        // The audit row never flips the toggle
        let later = toggle.decide(&matched("E1", 30), t0 + secs(40)).unwrap();
        assert!(matches!(later, Decision::Recorded(ref e) if e.kind == EventKind::ClockedIn));
        assert_eq!(store.events_for("E1").unwrap().len(), 2);
    }

    #[test]
    fn concurrent_decisions_record_once() {
        let (toggle, store) = toggle_with(AttendanceConfig::default());
        let toggle = Arc::new(toggle);
        let t0 = noon();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let toggle = Arc::clone(&toggle);
                std::thread::spawn(move || toggle.decide(&matched("E1", 30), t0).unwrap())
            })
            .collect();
        let recorded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|d| matches!(d, Decision::Recorded(_)))
            .count();

        assert_eq!(recorded, 1);
        assert_eq!(store.events_for("E1").unwrap().len(), 1);
    }
}
