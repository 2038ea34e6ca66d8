use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{EvaluationFilter, Store, WindowFilter};
use crate::error::{EngineError, Result};
use crate::models::{
    ComponentScore, EvaluationRecord, Group, Publication, SoloStudent, SubAssessment, Track, User,
    Window,
};

#[derive(Default)]
struct Tables {
    windows: Vec<Window>,
    users: Vec<User>,
    groups: Vec<Group>,
    solos: Vec<SoloStudent>,
    evaluations: Vec<EvaluationRecord>,
}

/// In-process store. Rows keep insertion order, which doubles as the
/// stable tie-break order the balancer relies on.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_windows(&self, filter: &WindowFilter) -> Result<Vec<Window>> {
        let tables = self.tables.read();
        Ok(tables
            .windows
            .iter()
            .filter(|window| filter.matches(window))
            .cloned()
            .collect())
    }

    async fn get_window(&self, id: Uuid) -> Result<Option<Window>> {
        let tables = self.tables.read();
        Ok(tables.windows.iter().find(|w| w.id == id).cloned())
    }

    async fn insert_window(&self, window: &Window) -> Result<()> {
        self.tables.write().windows.push(window.clone());
        Ok(())
    }

    async fn update_window(&self, window: &Window) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.windows.iter_mut().find(|w| w.id == window.id) {
            Some(existing) => {
                *existing = window.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_window_active(&self, id: Uuid, is_active: bool) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.windows.iter_mut().find(|w| w.id == id) {
            Some(existing) => {
                existing.is_active = is_active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_window(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write();
        let before = tables.windows.len();
        tables.windows.retain(|w| w.id != id);
        Ok(tables.windows.len() < before)
    }

    async fn delete_windows_ended_before(&self, as_of: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let before = tables.windows.len();
        tables.windows.retain(|w| w.ends_at >= as_of);
        Ok((before - tables.windows.len()) as u64)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.tables.read().users.iter().find(|u| u.id == id).cloned())
    }

    async fn upsert_user(&self, user: &User) -> Result<Uuid> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.users.iter_mut().find(|u| u.email == user.email) {
            existing.full_name = user.full_name.clone();
            existing.role = user.role;
            existing.external_eligible = user.external_eligible;
            return Ok(existing.id);
        }
        tables.users.push(user.clone());
        Ok(user.id)
    }

    async fn list_external_evaluators(&self) -> Result<Vec<User>> {
        let tables = self.tables.read();
        let mut users: Vec<User> = tables
            .users
            .iter()
            .filter(|u| u.external_eligible)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        Ok(self.tables.read().groups.iter().find(|g| g.id == id).cloned())
    }

    async fn upsert_group(&self, group: &Group) -> Result<Uuid> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.groups.iter_mut().find(|g| g.code == group.code) {
            existing.track = group.track;
            existing.status = group.status;
            existing.project_id = group.project_id;
            existing.internal_faculty_id = group.internal_faculty_id;
            existing.member_ids = group.member_ids.clone();
            return Ok(existing.id);
        }
        tables.groups.push(group.clone());
        Ok(group.id)
    }

    async fn list_groups(&self, track: Option<Track>) -> Result<Vec<Group>> {
        let tables = self.tables.read();
        let mut groups: Vec<Group> = tables
            .groups
            .iter()
            .filter(|g| track.map_or(true, |t| g.track == t))
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn set_group_evaluator(
        &self,
        group_id: Uuid,
        evaluator_id: Option<Uuid>,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.groups.iter_mut().find(|g| g.id == group_id) {
            Some(group) => {
                group.external_evaluator_id = evaluator_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_solo_student(&self, student_id: Uuid) -> Result<Option<SoloStudent>> {
        let tables = self.tables.read();
        Ok(tables
            .solos
            .iter()
            .find(|s| s.student_id == student_id)
            .cloned())
    }

    async fn upsert_solo_student(&self, solo: &SoloStudent) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables
            .solos
            .iter_mut()
            .find(|s| s.student_id == solo.student_id)
        {
            existing.track = solo.track;
            existing.project_id = solo.project_id;
            existing.internal_faculty_id = solo.internal_faculty_id;
            return Ok(());
        }
        tables.solos.push(solo.clone());
        Ok(())
    }

    async fn list_solo_students(&self, track: Option<Track>) -> Result<Vec<SoloStudent>> {
        let tables = self.tables.read();
        let mut solos: Vec<SoloStudent> = tables
            .solos
            .iter()
            .filter(|s| track.map_or(true, |t| s.track == t))
            .cloned()
            .collect();
        solos.sort_by_key(|s| s.created_at);
        Ok(solos)
    }

    async fn set_solo_evaluator(
        &self,
        student_id: Uuid,
        evaluator_id: Option<Uuid>,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.solos.iter_mut().find(|s| s.student_id == student_id) {
            Some(solo) => {
                solo.external_evaluator_id = evaluator_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationRecord>> {
        let tables = self.tables.read();
        Ok(tables.evaluations.iter().find(|r| r.id == id).cloned())
    }

    async fn find_evaluation(
        &self,
        student_id: Uuid,
        group_id: Option<Uuid>,
        project_id: Uuid,
    ) -> Result<Option<EvaluationRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .evaluations
            .iter()
            .find(|r| {
                r.student_id == student_id && r.group_id == group_id && r.project_id == project_id
            })
            .cloned())
    }

    async fn list_evaluations(&self, filter: &EvaluationFilter) -> Result<Vec<EvaluationRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .evaluations
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn insert_evaluation(&self, record: &EvaluationRecord) -> Result<()> {
        let mut tables = self.tables.write();
        let duplicate = tables.evaluations.iter().any(|r| {
            r.student_id == record.student_id
                && r.group_id == record.group_id
                && r.project_id == record.project_id
        });
        if duplicate {
            return Err(EngineError::Conflict(format!(
                "evaluation record for student {} already exists",
                record.student_id
            )));
        }
        tables.evaluations.push(record.clone());
        Ok(())
    }

    async fn write_component(
        &self,
        record_id: Uuid,
        slot: SubAssessment,
        score: ComponentScore,
        at: DateTime<Utc>,
    ) -> Result<Option<EvaluationRecord>> {
        let mut tables = self.tables.write();
        let Some(record) = tables
            .evaluations
            .iter_mut()
            .find(|r| r.id == record_id && !r.is_published)
        else {
            return Ok(None);
        };
        *record.component_mut(slot) = Some(score);
        record.recompute_totals();
        record.updated_at = at;
        Ok(Some(record.clone()))
    }

    async fn set_external_evaluator(
        &self,
        record_id: Uuid,
        evaluator_id: Option<Uuid>,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.evaluations.iter_mut().find(|r| r.id == record_id) {
            Some(record) => {
                record.external_evaluator_id = evaluator_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_publication(
        &self,
        record_id: Uuid,
        expected_published: bool,
        publication: &Publication,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(record) = tables
            .evaluations
            .iter_mut()
            .find(|r| r.id == record_id && r.is_published == expected_published)
        else {
            return Ok(false);
        };
        record.is_published = publication.is_published;
        record.published_at = publication.published_at;
        record.published_by = publication.published_by;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn evaluators_imported_together_keep_roster_order() {
        let store = MemoryStore::new();
        let created_at = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let mut ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        ids.sort_by(|a, b| b.cmp(a));
        for (n, id) in ids.iter().enumerate() {
            let user = User {
                id: *id,
                full_name: format!("Evaluator {n}"),
                email: format!("evaluator-{n}@univ.edu"),
                role: Role::Faculty,
                external_eligible: true,
                created_at,
            };
            store.upsert_user(&user).await.unwrap();
        }

        let listed: Vec<Uuid> = store
            .list_external_evaluators()
            .await
            .unwrap()
            .into_iter()
            .map(|user| user.id)
            .collect();
        assert_eq!(listed, ids);
    }
}
