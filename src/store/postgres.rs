use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{EvaluationFilter, Store, WindowFilter};
use crate::error::{EngineError, Result};
use crate::models::{
    ComponentScore, EvaluationRecord, Group, Publication, SoloStudent, SubAssessment, Track, User,
    Window,
};

const WINDOW_COLUMNS: &str = "id, phase_kind, track, sub_assessment, starts_at, ends_at, \
     is_active, created_by, created_at, updated_at";

const USER_COLUMNS: &str = "id, full_name, email, role, external_eligible, created_at";

const GROUP_SELECT: &str = "SELECT g.id, g.code, g.track, g.status, g.project_id, \
     g.internal_faculty_id, g.external_evaluator_id, g.created_at, \
     COALESCE(array_agg(m.student_id ORDER BY m.position) \
     FILTER (WHERE m.student_id IS NOT NULL), '{}') AS member_ids \
     FROM project_evaluation.groups g \
     LEFT JOIN project_evaluation.group_members m ON m.group_id = g.id";

const SOLO_COLUMNS: &str =
    "student_id, track, project_id, internal_faculty_id, external_evaluator_id, created_at";

const EVALUATION_COLUMNS: &str = "id, student_id, group_id, project_id, \
     internal_evaluator_id, external_evaluator_id, \
     cla1_raw, cla1_converted, cla2_raw, cla2_converted, cla3_raw, cla3_converted, \
     external_raw, external_converted, total_internal, total_external, total, \
     is_published, published_at, published_by, created_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_db(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn window_from_row(row: &PgRow) -> Result<Window> {
    let sub: Option<String> = row.get("sub_assessment");
    Ok(Window {
        id: row.get("id"),
        phase_kind: row.get::<String, _>("phase_kind").parse()?,
        track: row.get::<String, _>("track").parse()?,
        sub_assessment: sub.map(|value| value.parse()).transpose()?,
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        is_active: row.get("is_active"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        role: row.get::<String, _>("role").parse()?,
        external_eligible: row.get("external_eligible"),
        created_at: row.get("created_at"),
    })
}

fn group_from_row(row: &PgRow) -> Result<Group> {
    Ok(Group {
        id: row.get("id"),
        code: row.get("code"),
        track: row.get::<String, _>("track").parse()?,
        status: row.get::<String, _>("status").parse()?,
        project_id: row.get("project_id"),
        internal_faculty_id: row.get("internal_faculty_id"),
        member_ids: row.get("member_ids"),
        external_evaluator_id: row.get("external_evaluator_id"),
        created_at: row.get("created_at"),
    })
}

fn solo_from_row(row: &PgRow) -> Result<SoloStudent> {
    Ok(SoloStudent {
        student_id: row.get("student_id"),
        track: row.get::<String, _>("track").parse()?,
        project_id: row.get("project_id"),
        internal_faculty_id: row.get("internal_faculty_id"),
        external_evaluator_id: row.get("external_evaluator_id"),
        created_at: row.get("created_at"),
    })
}

fn component_from_row(row: &PgRow, prefix: &str) -> Option<ComponentScore> {
    let raw: Option<f64> = row.get(format!("{prefix}_raw").as_str());
    let converted: Option<i32> = row.get(format!("{prefix}_converted").as_str());
    match (raw, converted) {
        (Some(raw_score), Some(converted)) => Some(ComponentScore {
            raw_score,
            converted_score: converted.max(0) as u32,
        }),
        _ => None,
    }
}

fn evaluation_from_row(row: &PgRow) -> EvaluationRecord {
    let total = |column: &str| row.get::<i32, _>(column).max(0) as u32;
    EvaluationRecord {
        id: row.get("id"),
        student_id: row.get("student_id"),
        group_id: row.get("group_id"),
        project_id: row.get("project_id"),
        internal_evaluator_id: row.get("internal_evaluator_id"),
        external_evaluator_id: row.get("external_evaluator_id"),
        cla1: component_from_row(row, "cla1"),
        cla2: component_from_row(row, "cla2"),
        cla3: component_from_row(row, "cla3"),
        external: component_from_row(row, "external"),
        total_internal: total("total_internal"),
        total_external: total("total_external"),
        total: total("total"),
        is_published: row.get("is_published"),
        published_at: row.get("published_at"),
        published_by: row.get("published_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn raw_of(score: Option<ComponentScore>) -> Option<f64> {
    score.map(|s| s.raw_score)
}

fn converted_of(score: Option<ComponentScore>) -> Option<i32> {
    score.map(|s| s.converted_score as i32)
}

fn slot_column(slot: SubAssessment) -> &'static str {
    match slot {
        SubAssessment::Cla1 => "cla1",
        SubAssessment::Cla2 => "cla2",
        SubAssessment::Cla3 => "cla3",
        SubAssessment::External => "external",
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

#[async_trait]
impl Store for PgStore {
    async fn list_windows(&self, filter: &WindowFilter) -> Result<Vec<Window>> {
        let mut query =
            format!("SELECT {WINDOW_COLUMNS} FROM project_evaluation.windows WHERE TRUE");
        let mut position = 0;
        if filter.track.is_some() {
            position += 1;
            query.push_str(&format!(" AND track = ${position}"));
        }
        if filter.phase_kind.is_some() {
            position += 1;
            query.push_str(&format!(" AND phase_kind = ${position}"));
        }
        if filter.is_active.is_some() {
            position += 1;
            query.push_str(&format!(" AND is_active = ${position}"));
        }
        query.push_str(" ORDER BY starts_at, id");

        let mut rows = sqlx::query(&query);
        if let Some(track) = filter.track {
            rows = rows.bind(track.as_str());
        }
        if let Some(phase) = filter.phase_kind {
            rows = rows.bind(phase.as_str());
        }
        if let Some(active) = filter.is_active {
            rows = rows.bind(active);
        }

        let records = rows.fetch_all(&self.pool).await?;
        records.iter().map(window_from_row).collect()
    }

    async fn get_window(&self, id: Uuid) -> Result<Option<Window>> {
        let row = sqlx::query(&format!(
            "SELECT {WINDOW_COLUMNS} FROM project_evaluation.windows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(window_from_row).transpose()
    }

    async fn insert_window(&self, window: &Window) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_evaluation.windows
            (id, phase_kind, track, sub_assessment, starts_at, ends_at,
             is_active, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(window.id)
        .bind(window.phase_kind.as_str())
        .bind(window.track.as_str())
        .bind(window.sub_assessment.map(|sub| sub.as_str()))
        .bind(window.starts_at)
        .bind(window.ends_at)
        .bind(window.is_active)
        .bind(window.created_by)
        .bind(window.created_at)
        .bind(window.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_window(&self, window: &Window) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE project_evaluation.windows
            SET starts_at = $2, ends_at = $3, is_active = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(window.id)
        .bind(window.starts_at)
        .bind(window.ends_at)
        .bind(window.is_active)
        .bind(window.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_window_active(&self, id: Uuid, is_active: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE project_evaluation.windows SET is_active = $2 WHERE id = $1")
                .bind(id)
                .bind(is_active)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_window(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM project_evaluation.windows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_windows_ended_before(&self, as_of: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM project_evaluation.windows WHERE ends_at < $1")
            .bind(as_of)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM project_evaluation.users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn upsert_user(&self, user: &User) -> Result<Uuid> {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO project_evaluation.users
            (id, full_name, email, role, external_eligible, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                role = EXCLUDED.role,
                external_eligible = EXCLUDED.external_eligible
            RETURNING id
            "#,
        )
        .bind(user.id)
        .bind(&user.full_name)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.external_eligible)
        .bind(user.created_at)
        .fetch_one(&self.pool)
        .await?
        .get("id");
        Ok(id)
    }

    async fn list_external_evaluators(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM project_evaluation.users \
             WHERE external_eligible ORDER BY created_at, seq"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        let row = sqlx::query(&format!("{GROUP_SELECT} WHERE g.id = $1 GROUP BY g.id"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn upsert_group(&self, group: &Group) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO project_evaluation.groups
            (id, code, track, status, project_id, internal_faculty_id,
             external_evaluator_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (code) DO UPDATE
            SET track = EXCLUDED.track,
                status = EXCLUDED.status,
                project_id = EXCLUDED.project_id,
                internal_faculty_id = EXCLUDED.internal_faculty_id
            RETURNING id
            "#,
        )
        .bind(group.id)
        .bind(&group.code)
        .bind(group.track.as_str())
        .bind(group.status.as_str())
        .bind(group.project_id)
        .bind(group.internal_faculty_id)
        .bind(group.external_evaluator_id)
        .bind(group.created_at)
        .fetch_one(&mut *tx)
        .await?
        .get("id");

        sqlx::query("DELETE FROM project_evaluation.group_members WHERE group_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for (position, student_id) in group.member_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO project_evaluation.group_members (group_id, student_id, position)
                VALUES ($1, $2, $3)
                ON CONFLICT (group_id, student_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(student_id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn list_groups(&self, track: Option<Track>) -> Result<Vec<Group>> {
        let rows = sqlx::query(&format!(
            "{GROUP_SELECT} WHERE ($1::text IS NULL OR g.track = $1) \
             GROUP BY g.id ORDER BY g.created_at, g.seq"
        ))
        .bind(track.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }

    async fn set_group_evaluator(
        &self,
        group_id: Uuid,
        evaluator_id: Option<Uuid>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE project_evaluation.groups SET external_evaluator_id = $2 WHERE id = $1",
        )
        .bind(group_id)
        .bind(evaluator_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_solo_student(&self, student_id: Uuid) -> Result<Option<SoloStudent>> {
        let row = sqlx::query(&format!(
            "SELECT {SOLO_COLUMNS} FROM project_evaluation.solo_students WHERE student_id = $1"
        ))
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(solo_from_row).transpose()
    }

    async fn upsert_solo_student(&self, solo: &SoloStudent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_evaluation.solo_students
            (student_id, track, project_id, internal_faculty_id, external_evaluator_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student_id) DO UPDATE
            SET track = EXCLUDED.track,
                project_id = EXCLUDED.project_id,
                internal_faculty_id = EXCLUDED.internal_faculty_id
            "#,
        )
        .bind(solo.student_id)
        .bind(solo.track.as_str())
        .bind(solo.project_id)
        .bind(solo.internal_faculty_id)
        .bind(solo.external_evaluator_id)
        .bind(solo.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_solo_students(&self, track: Option<Track>) -> Result<Vec<SoloStudent>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOLO_COLUMNS} FROM project_evaluation.solo_students \
             WHERE ($1::text IS NULL OR track = $1) ORDER BY created_at, seq"
        ))
        .bind(track.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(solo_from_row).collect()
    }

    async fn set_solo_evaluator(
        &self,
        student_id: Uuid,
        evaluator_id: Option<Uuid>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE project_evaluation.solo_students SET external_evaluator_id = $2 \
             WHERE student_id = $1",
        )
        .bind(student_id)
        .bind(evaluator_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {EVALUATION_COLUMNS} FROM project_evaluation.evaluations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(evaluation_from_row))
    }

    async fn find_evaluation(
        &self,
        student_id: Uuid,
        group_id: Option<Uuid>,
        project_id: Uuid,
    ) -> Result<Option<EvaluationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {EVALUATION_COLUMNS} FROM project_evaluation.evaluations \
             WHERE student_id = $1 AND group_id IS NOT DISTINCT FROM $2 AND project_id = $3"
        ))
        .bind(student_id)
        .bind(group_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(evaluation_from_row))
    }

    async fn list_evaluations(&self, filter: &EvaluationFilter) -> Result<Vec<EvaluationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVALUATION_COLUMNS} FROM project_evaluation.evaluations \
             WHERE ($1::uuid[] IS NULL OR group_id = ANY($1)) \
             AND ($2::uuid IS NULL OR student_id = $2) \
             AND ($3::boolean IS NULL OR (group_id IS NULL) = $3) \
             ORDER BY created_at, seq"
        ))
        .bind(filter.group_ids.clone())
        .bind(filter.student_id)
        .bind(filter.solo)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(evaluation_from_row).collect())
    }

    async fn insert_evaluation(&self, record: &EvaluationRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO project_evaluation.evaluations
            (id, student_id, group_id, project_id, internal_evaluator_id, external_evaluator_id,
             cla1_raw, cla1_converted, cla2_raw, cla2_converted, cla3_raw, cla3_converted,
             external_raw, external_converted, total_internal, total_external, total,
             is_published, published_at, published_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(record.id)
        .bind(record.student_id)
        .bind(record.group_id)
        .bind(record.project_id)
        .bind(record.internal_evaluator_id)
        .bind(record.external_evaluator_id)
        .bind(raw_of(record.cla1))
        .bind(converted_of(record.cla1))
        .bind(raw_of(record.cla2))
        .bind(converted_of(record.cla2))
        .bind(raw_of(record.cla3))
        .bind(converted_of(record.cla3))
        .bind(raw_of(record.external))
        .bind(converted_of(record.external))
        .bind(record.total_internal as i32)
        .bind(record.total_external as i32)
        .bind(record.total as i32)
        .bind(record.is_published)
        .bind(record.published_at)
        .bind(record.published_by)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(EngineError::Conflict(format!(
                "evaluation record for student {} already exists",
                record.student_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_component(
        &self,
        record_id: Uuid,
        slot: SubAssessment,
        score: ComponentScore,
        at: DateTime<Utc>,
    ) -> Result<Option<EvaluationRecord>> {
        let column = slot_column(slot);
        let converted_or = |candidate: &str| {
            if candidate == column {
                "$3".to_string()
            } else {
                format!("COALESCE({candidate}_converted, 0)")
            }
        };
        let internal = ["cla1", "cla2", "cla3"]
            .iter()
            .map(|candidate| converted_or(*candidate))
            .collect::<Vec<_>>()
            .join(" + ");
        let external = converted_or("external");

        let row = sqlx::query(&format!(
            "UPDATE project_evaluation.evaluations \
             SET {column}_raw = $2, {column}_converted = $3, \
             total_internal = {internal}, total_external = {external}, \
             total = ({internal}) + ({external}), updated_at = $4 \
             WHERE id = $1 AND NOT is_published \
             RETURNING {EVALUATION_COLUMNS}"
        ))
        .bind(record_id)
        .bind(score.raw_score)
        .bind(score.converted_score as i32)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(evaluation_from_row))
    }

    async fn set_external_evaluator(
        &self,
        record_id: Uuid,
        evaluator_id: Option<Uuid>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE project_evaluation.evaluations SET external_evaluator_id = $2 WHERE id = $1",
        )
        .bind(record_id)
        .bind(evaluator_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_publication(
        &self,
        record_id: Uuid,
        expected_published: bool,
        publication: &Publication,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE project_evaluation.evaluations
            SET is_published = $3, published_at = $4, published_by = $5
            WHERE id = $1 AND is_published = $2
            "#,
        )
        .bind(record_id)
        .bind(expected_published)
        .bind(publication.is_published)
        .bind(publication.published_at)
        .bind(publication.published_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a scratch Postgres"]
    async fn evaluators_imported_together_keep_roster_order() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PgStore::connect(&url, 2).await.unwrap();
        store.init_db().await.unwrap();

        let created_at = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let batch = Uuid::new_v4().simple().to_string();
        let mut ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        ids.sort_by(|a, b| b.cmp(a));
        for (n, id) in ids.iter().enumerate() {
            let user = User {
                id: *id,
                full_name: format!("Evaluator {n}"),
                email: format!("evaluator-{n}-{batch}@univ.edu"),
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
            .filter(|id| ids.contains(id))
            .collect();
        assert_eq!(listed, ids);
    }
}
