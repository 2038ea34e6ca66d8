//! Time-boxed administrative phases.
//!
//! A window's `is_active` flag is a cache refreshed by reconciliation.
//! Between refreshes the cached flag is authoritative; a window created or
//! edited after the most recent refresh falls back to comparing its interval
//! against the clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::models::{PhaseKind, SubAssessment, Track, Window, WindowKey};
use crate::store::{Store, WindowFilter};

/// When the last full status refresh completed, shared between the gate and
/// whoever drives refreshes.
#[derive(Debug, Clone, Default)]
pub struct RefreshMarker(Arc<RwLock<Option<DateTime<Utc>>>>);

impl RefreshMarker {
    pub fn last(&self) -> Option<DateTime<Utc>> {
        *self.0.read()
    }

    pub fn mark(&self, at: DateTime<Utc>) {
        *self.0.write() = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWindow {
    pub phase_kind: PhaseKind,
    pub track: Track,
    pub sub_assessment: Option<SubAssessment>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowPatch {
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub examined: usize,
    pub updated: usize,
    /// Windows deleted between our read and our write.
    pub vanished: usize,
}

pub struct WindowGate {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    refresh: RefreshMarker,
}

impl WindowGate {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            refresh: RefreshMarker::default(),
        }
    }

    pub fn refresh_marker(&self) -> &RefreshMarker {
        &self.refresh
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn is_open(
        &self,
        phase_kind: PhaseKind,
        track: Track,
        sub_assessment: Option<SubAssessment>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let last_refresh = self.refresh.last();
        let windows = self.siblings(phase_kind, track, sub_assessment).await?;

        Ok(windows.iter().any(|window| {
            let stale = last_refresh.map_or(true, |at| window.updated_at > at);
            if stale {
                window.contains(now)
            } else {
                window.is_active
            }
        }))
    }

    pub async fn require_open(
        &self,
        phase_kind: PhaseKind,
        track: Track,
        sub_assessment: Option<SubAssessment>,
    ) -> Result<()> {
        if self.is_open(phase_kind, track, sub_assessment).await? {
            return Ok(());
        }
        let key = WindowKey {
            phase_kind,
            track,
            sub_assessment,
        };
        Err(EngineError::WindowClosed(key.to_string()))
    }

    pub async fn create(&self, request: NewWindow, actor_id: Uuid) -> Result<Window> {
        validate_sub_assessment(request.phase_kind, request.sub_assessment)?;
        validate_ordering(request.starts_at, request.ends_at)?;
        self.ensure_no_overlap(
            request.phase_kind,
            request.track,
            request.sub_assessment,
            request.starts_at,
            request.ends_at,
            None,
        )
        .await?;

        let now = self.clock.now();
        let mut window = Window {
            id: Uuid::new_v4(),
            phase_kind: request.phase_kind,
            track: request.track,
            sub_assessment: request.sub_assessment,
            starts_at: request.starts_at,
            ends_at: request.ends_at,
            is_active: false,
            created_by: actor_id,
            created_at: now,
            updated_at: now,
        };
        window.is_active = window.contains(now);

        self.store.insert_window(&window).await?;
        info!(window_id = %window.id, key = %window.key(), "window created");
        Ok(window)
    }

    /// Re-validates ordering and re-runs the overlap check against sibling
    /// windows, excluding the window being edited.
    pub async fn update(&self, window_id: Uuid, patch: WindowPatch) -> Result<Window> {
        let mut window = self.get(window_id).await?;
        if let Some(starts_at) = patch.starts_at {
            window.starts_at = starts_at;
        }
        if let Some(ends_at) = patch.ends_at {
            window.ends_at = ends_at;
        }
        validate_ordering(window.starts_at, window.ends_at)?;
        self.ensure_no_overlap(
            window.phase_kind,
            window.track,
            window.sub_assessment,
            window.starts_at,
            window.ends_at,
            Some(window.id),
        )
        .await?;

        let now = self.clock.now();
        window.is_active = window.contains(now);
        window.updated_at = now;

        if !self.store.update_window(&window).await? {
            return Err(EngineError::not_found("window", window_id));
        }
        info!(window_id = %window.id, key = %window.key(), "window updated");
        Ok(window)
    }

    pub async fn delete(&self, window_id: Uuid) -> Result<()> {
        if !self.store.delete_window(window_id).await? {
            return Err(EngineError::not_found("window", window_id));
        }
        info!(window_id = %window_id, "window deleted");
        Ok(())
    }

    /// Removes windows that ended strictly before `as_of` (default: now).
    /// Upcoming windows are untouched.
    pub async fn bulk_delete_expired(&self, as_of: Option<DateTime<Utc>>) -> Result<u64> {
        let as_of = as_of.unwrap_or_else(|| self.clock.now());
        let removed = self.store.delete_windows_ended_before(as_of).await?;
        if removed > 0 {
            info!(removed, %as_of, "expired windows deleted");
        }
        Ok(removed)
    }

    pub async fn get(&self, window_id: Uuid) -> Result<Window> {
        self.store
            .get_window(window_id)
            .await?
            .ok_or_else(|| EngineError::not_found("window", window_id))
    }

    /// Lists windows after refreshing every cached status flag.
    pub async fn list(&self, filter: &WindowFilter) -> Result<Vec<Window>> {
        self.refresh_statuses().await?;
        self.store.list_windows(filter).await
    }

    pub async fn list_upcoming(
        &self,
        track: Option<Track>,
        limit: Option<usize>,
    ) -> Result<Vec<Window>> {
        let now = self.clock.now();
        let filter = WindowFilter {
            track,
            ..WindowFilter::default()
        };
        let mut upcoming: Vec<Window> = self
            .store
            .list_windows(&filter)
            .await?
            .into_iter()
            .filter(|window| window.starts_at > now)
            .collect();
        upcoming.sort_by_key(|window| (window.starts_at, window.id));
        if let Some(limit) = limit {
            upcoming.truncate(limit);
        }
        Ok(upcoming)
    }

    /// Recomputes `is_active` for every window and writes back only the
    /// flags that changed.
    pub async fn refresh_statuses(&self) -> Result<RefreshOutcome> {
        let now = self.clock.now();
        let windows = self.store.list_windows(&WindowFilter::default()).await?;
        let mut outcome = RefreshOutcome {
            examined: windows.len(),
            ..RefreshOutcome::default()
        };

        for window in windows {
            let computed = window.contains(now);
            if computed == window.is_active {
                continue;
            }
            if self.store.set_window_active(window.id, computed).await? {
                outcome.updated += 1;
            } else {
                debug!(window_id = %window.id, "window vanished during status refresh");
                outcome.vanished += 1;
            }
        }

        self.refresh.mark(now);
        if outcome.updated > 0 {
            info!(
                examined = outcome.examined,
                updated = outcome.updated,
                "window statuses refreshed"
            );
        }
        Ok(outcome)
    }

    async fn siblings(
        &self,
        phase_kind: PhaseKind,
        track: Track,
        sub_assessment: Option<SubAssessment>,
    ) -> Result<Vec<Window>> {
        let filter = WindowFilter {
            track: Some(track),
            phase_kind: Some(phase_kind),
            is_active: None,
        };
        let windows = self.store.list_windows(&filter).await?;
        Ok(windows
            .into_iter()
            .filter(|window| window.sub_assessment == sub_assessment)
            .collect())
    }

    async fn ensure_no_overlap(
        &self,
        phase_kind: PhaseKind,
        track: Track,
        sub_assessment: Option<SubAssessment>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<()> {
        let siblings = self.siblings(phase_kind, track, sub_assessment).await?;
        let clash = siblings
            .iter()
            .filter(|window| Some(window.id) != exclude)
            .find(|window| window.overlaps(starts_at, ends_at));

        match clash {
            Some(existing) => Err(EngineError::Conflict(format!(
                "{} window overlaps existing window {} ({} to {})",
                existing.key(),
                existing.id,
                existing.starts_at,
                existing.ends_at
            ))),
            None => Ok(()),
        }
    }
}

fn validate_ordering(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<()> {
    if ends_at <= starts_at {
        return Err(EngineError::validation(format!(
            "window must end after it starts (starts {starts_at}, ends {ends_at})"
        )));
    }
    Ok(())
}

fn validate_sub_assessment(phase_kind: PhaseKind, sub: Option<SubAssessment>) -> Result<()> {
    match (phase_kind, sub) {
        (PhaseKind::Submission | PhaseKind::Assessment, None) => Err(EngineError::validation(
            format!("{phase_kind} windows require a sub-assessment"),
        )),
        (PhaseKind::Proposal | PhaseKind::Application, Some(sub)) => Err(EngineError::validation(
            format!("{phase_kind} windows do not take a sub-assessment ({sub})"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn jan(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap()
    }

    fn setup(now: DateTime<Utc>) -> (WindowGate, Arc<FixedClock>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(now));
        let gate = WindowGate::new(store.clone(), clock.clone());
        (gate, clock, store)
    }

    fn submission(start: u32, end: u32) -> NewWindow {
        NewWindow {
            phase_kind: PhaseKind::Submission,
            track: Track::Idp,
            sub_assessment: Some(SubAssessment::Cla1),
            starts_at: jan(start),
            ends_at: jan(end),
        }
    }

    #[tokio::test]
    async fn overlapping_windows_are_rejected() {
        let (gate, _, _) = setup(jan(1));
        gate.create(submission(1, 10), Uuid::new_v4()).await.unwrap();

        let err = gate.create(submission(5, 15), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let err = gate.create(submission(10, 20), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn adjacent_but_disjoint_windows_are_accepted() {
        let (gate, _, _) = setup(jan(1));
        gate.create(submission(1, 9), Uuid::new_v4()).await.unwrap();
        gate.create(submission(10, 20), Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_never_conflict() {
        let (gate, _, _) = setup(jan(1));
        gate.create(submission(1, 10), Uuid::new_v4()).await.unwrap();

        let mut other_sub = submission(1, 10);
        other_sub.sub_assessment = Some(SubAssessment::Cla2);
        gate.create(other_sub, Uuid::new_v4()).await.unwrap();

        let mut other_track = submission(1, 10);
        other_track.track = Track::Urop;
        gate.create(other_track, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn end_must_follow_start() {
        let (gate, _, _) = setup(jan(1));
        let err = gate.create(submission(5, 5), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn sub_assessment_rules_follow_phase() {
        let (gate, _, _) = setup(jan(1));
        let mut missing = submission(1, 2);
        missing.sub_assessment = None;
        assert!(gate.create(missing, Uuid::new_v4()).await.is_err());

        let proposal = NewWindow {
            phase_kind: PhaseKind::Proposal,
            track: Track::Capstone,
            sub_assessment: Some(SubAssessment::External),
            starts_at: jan(1),
            ends_at: jan(2),
        };
        assert!(gate.create(proposal, Uuid::new_v4()).await.is_err());

        let release = NewWindow {
            phase_kind: PhaseKind::GradeRelease,
            track: Track::Capstone,
            sub_assessment: None,
            starts_at: jan(1),
            ends_at: jan(2),
        };
        gate.create(release, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn is_open_falls_back_to_interval_before_first_refresh() {
        let (gate, clock, _) = setup(jan(1));
        gate.create(submission(3, 6), Uuid::new_v4()).await.unwrap();

        let key = (PhaseKind::Submission, Track::Idp, Some(SubAssessment::Cla1));
        assert!(!gate.is_open(key.0, key.1, key.2).await.unwrap());

        // Cached flag is still false, but no refresh has happened yet.
        clock.set(jan(4));
        assert!(gate.is_open(key.0, key.1, key.2).await.unwrap());
    }

    #[tokio::test]
    async fn cached_flag_is_authoritative_between_refreshes() {
        let (gate, clock, _) = setup(jan(1));
        gate.create(submission(3, 6), Uuid::new_v4()).await.unwrap();

        clock.set(jan(2));
        gate.refresh_statuses().await.unwrap();

        clock.set(jan(4));
        let key = (PhaseKind::Submission, Track::Idp, Some(SubAssessment::Cla1));
        assert!(!gate.is_open(key.0, key.1, key.2).await.unwrap());

        let outcome = gate.refresh_statuses().await.unwrap();
        assert_eq!(outcome.updated, 1);
        assert!(gate.is_open(key.0, key.1, key.2).await.unwrap());
        assert!(gate.require_open(key.0, key.1, key.2).await.is_ok());

        clock.set(jan(7));
        gate.refresh_statuses().await.unwrap();
        let err = gate.require_open(key.0, key.1, key.2).await.unwrap_err();
        assert!(matches!(err, EngineError::WindowClosed(_)));
    }

    #[tokio::test]
    async fn refresh_only_writes_changed_flags() {
        let (gate, clock, _) = setup(jan(1));
        gate.create(submission(1, 3), Uuid::new_v4()).await.unwrap();
        let mut later = submission(10, 12);
        later.sub_assessment = Some(SubAssessment::Cla2);
        gate.create(later, Uuid::new_v4()).await.unwrap();

        let outcome = gate.refresh_statuses().await.unwrap();
        assert_eq!(outcome.examined, 2);
        assert_eq!(outcome.updated, 0);

        clock.set(jan(11));
        let outcome = gate.refresh_statuses().await.unwrap();
        assert_eq!(outcome.updated, 2);
    }

    #[tokio::test]
    async fn update_revalidates_order_and_overlap() {
        let (gate, _, _) = setup(jan(1));
        let first = gate.create(submission(1, 5), Uuid::new_v4()).await.unwrap();
        gate.create(submission(10, 15), Uuid::new_v4()).await.unwrap();

        let err = gate
            .update(
                first.id,
                WindowPatch {
                    starts_at: None,
                    ends_at: Some(jan(12)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let err = gate
            .update(
                first.id,
                WindowPatch {
                    starts_at: Some(jan(6)),
                    ends_at: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Growing into its own old interval is fine.
        let updated = gate
            .update(
                first.id,
                WindowPatch {
                    starts_at: None,
                    ends_at: Some(jan(8)),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.ends_at, jan(8));
    }

    #[tokio::test]
    async fn cleanup_keeps_upcoming_and_running_windows() {
        let (gate, _, _) = setup(jan(10));
        let ended = gate.create(submission(1, 5), Uuid::new_v4()).await.unwrap();
        let mut running = submission(8, 12);
        running.sub_assessment = Some(SubAssessment::Cla2);
        let running = gate.create(running, Uuid::new_v4()).await.unwrap();
        let mut upcoming = submission(20, 25);
        upcoming.sub_assessment = Some(SubAssessment::Cla3);
        let upcoming = gate.create(upcoming, Uuid::new_v4()).await.unwrap();

        assert_eq!(gate.bulk_delete_expired(None).await.unwrap(), 1);
        assert!(gate.get(ended.id).await.is_err());
        assert!(gate.get(running.id).await.is_ok());
        assert!(gate.get(upcoming.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_missing_window_is_not_found() {
        let (gate, _, _) = setup(jan(1));
        let err = gate.delete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn upcoming_is_sorted_and_capped() {
        let (gate, clock, _) = setup(jan(1));
        let subs = [SubAssessment::Cla3, SubAssessment::Cla1, SubAssessment::Cla2];
        for (offset, sub) in subs.into_iter().enumerate() {
            let start = jan(20) - Duration::days(offset as i64 * 5);
            gate.create(
                NewWindow {
                    phase_kind: PhaseKind::Assessment,
                    track: Track::Urop,
                    sub_assessment: Some(sub),
                    starts_at: start,
                    ends_at: start + Duration::days(2),
                },
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        }
        clock.set(jan(11));

        let upcoming = gate.list_upcoming(Some(Track::Urop), Some(1)).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].starts_at, jan(15));

        let all = gate.list_upcoming(None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].starts_at < all[1].starts_at);
    }

    #[tokio::test]
    async fn list_refreshes_before_reading() {
        let (gate, clock, _) = setup(jan(1));
        gate.create(submission(3, 6), Uuid::new_v4()).await.unwrap();
        clock.set(jan(4));

        let active = gate
            .list(&WindowFilter {
                is_active: Some(true),
                ..WindowFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert!(gate.refresh_marker().last().is_some());
    }
}
