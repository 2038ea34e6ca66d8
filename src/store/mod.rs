//! Persistence boundary.
//!
//! The engine only needs key and filter lookups, so the store is a narrow
//! trait. [`PgStore`] backs production; [`MemoryStore`] backs tests.
//!
//! Writes that must not tear are expressed as single conditional calls:
//! [`Store::write_component`] refuses published records and
//! [`Store::set_publication`] swaps the publication triple only when the
//! record is still in the expected state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ComponentScore, EvaluationRecord, Group, PhaseKind, Publication, SoloStudent, SubAssessment,
    Track, User, Window,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowFilter {
    pub track: Option<Track>,
    pub phase_kind: Option<PhaseKind>,
    pub is_active: Option<bool>,
}

impl WindowFilter {
    pub fn matches(&self, window: &Window) -> bool {
        self.track.map_or(true, |track| window.track == track)
            && self.phase_kind.map_or(true, |phase| window.phase_kind == phase)
            && self.is_active.map_or(true, |active| window.is_active == active)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationFilter {
    pub group_ids: Option<Vec<Uuid>>,
    pub student_id: Option<Uuid>,
    /// `Some(true)` keeps only records without a group.
    pub solo: Option<bool>,
}

impl EvaluationFilter {
    pub fn for_groups(group_ids: Vec<Uuid>) -> Self {
        Self {
            group_ids: Some(group_ids),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &EvaluationRecord) -> bool {
        let group_ok = match (&self.group_ids, record.group_id) {
            (None, _) => true,
            (Some(ids), Some(group_id)) => ids.contains(&group_id),
            (Some(_), None) => false,
        };
        group_ok
            && self.student_id.map_or(true, |id| record.student_id == id)
            && self.solo.map_or(true, |solo| record.group_id.is_none() == solo)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_windows(&self, filter: &WindowFilter) -> Result<Vec<Window>>;
    async fn get_window(&self, id: Uuid) -> Result<Option<Window>>;
    async fn insert_window(&self, window: &Window) -> Result<()>;
    /// Returns `false` when the window no longer exists.
    async fn update_window(&self, window: &Window) -> Result<bool>;
    /// Returns `false` when the window no longer exists.
    async fn set_window_active(&self, id: Uuid, is_active: bool) -> Result<bool>;
    async fn delete_window(&self, id: Uuid) -> Result<bool>;
    async fn delete_windows_ended_before(&self, as_of: DateTime<Utc>) -> Result<u64>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;
    /// Inserts or refreshes a user keyed by email, returning the stored id.
    async fn upsert_user(&self, user: &User) -> Result<Uuid>;
    /// Users flagged as external-evaluator eligible, in creation order.
    async fn list_external_evaluators(&self) -> Result<Vec<User>>;

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>>;
    /// Inserts or refreshes a group keyed by code, returning the stored id.
    /// An existing group keeps its id and external evaluator binding.
    async fn upsert_group(&self, group: &Group) -> Result<Uuid>;
    async fn list_groups(&self, track: Option<Track>) -> Result<Vec<Group>>;
    async fn set_group_evaluator(&self, group_id: Uuid, evaluator_id: Option<Uuid>)
        -> Result<bool>;

    async fn get_solo_student(&self, student_id: Uuid) -> Result<Option<SoloStudent>>;
    async fn upsert_solo_student(&self, solo: &SoloStudent) -> Result<()>;
    async fn list_solo_students(&self, track: Option<Track>) -> Result<Vec<SoloStudent>>;
    async fn set_solo_evaluator(
        &self,
        student_id: Uuid,
        evaluator_id: Option<Uuid>,
    ) -> Result<bool>;

    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationRecord>>;
    async fn find_evaluation(
        &self,
        student_id: Uuid,
        group_id: Option<Uuid>,
        project_id: Uuid,
    ) -> Result<Option<EvaluationRecord>>;
    async fn list_evaluations(&self, filter: &EvaluationFilter) -> Result<Vec<EvaluationRecord>>;
    /// Fails with `Conflict` if a record for the same triple already exists.
    async fn insert_evaluation(&self, record: &EvaluationRecord) -> Result<()>;
    /// Writes one component and recomputes the totals in the same step.
    /// Returns `None` if the record is missing or already published.
    async fn write_component(
        &self,
        record_id: Uuid,
        slot: SubAssessment,
        score: ComponentScore,
        at: DateTime<Utc>,
    ) -> Result<Option<EvaluationRecord>>;
    async fn set_external_evaluator(&self, record_id: Uuid, evaluator_id: Option<Uuid>)
        -> Result<bool>;
    /// Swaps the publication triple when the record's current flag equals
    /// `expected_published`. Returns whether a swap happened.
    async fn set_publication(
        &self,
        record_id: Uuid,
        expected_published: bool,
        publication: &Publication,
    ) -> Result<bool>;
}
