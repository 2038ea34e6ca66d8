//! Per-student evaluation records.
//!
//! Every score write follows `validate -> derive -> persist`: the caller's
//! authority and the record's state are checked first, the converted score
//! is derived from the raw one, and the store applies the component write
//! together with the totals. Published records are frozen.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::convert::{Scale, EXTERNAL_SCALE};
use crate::error::{EngineError, Result};
use crate::models::{
    Actor, ComponentScore, EvaluationRecord, Group, GroupStatus, InternalComponent, Publication,
    SoloStudent, SubAssessment, Track,
};
use crate::store::{EvaluationFilter, Store};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    pub changed: Vec<Uuid>,
    /// Records already in the requested state.
    pub skipped: Vec<Uuid>,
    pub missing: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutcome {
    pub track: Track,
    pub sub_assessment: Option<SubAssessment>,
    pub final_release: bool,
    pub published: Vec<Uuid>,
    /// Unpublished records left alone because the released component is unscored.
    pub not_ready: usize,
}

pub struct EvaluationService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl EvaluationService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn load_group(&self, group_id: Uuid) -> Result<Group> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| EngineError::not_found("group", group_id))
    }

    pub async fn get(&self, record_id: Uuid) -> Result<EvaluationRecord> {
        self.store
            .get_evaluation(record_id)
            .await?
            .ok_or_else(|| EngineError::not_found("evaluation record", record_id))
    }

    pub async fn list_for_group(&self, group_id: Uuid) -> Result<Vec<EvaluationRecord>> {
        self.store
            .list_evaluations(&EvaluationFilter::for_groups(vec![group_id]))
            .await
    }

    /// Records of every group in the track plus its solo students.
    pub async fn list_for_track(&self, track: Track) -> Result<Vec<EvaluationRecord>> {
        let group_ids: Vec<Uuid> = self
            .store
            .list_groups(Some(track))
            .await?
            .into_iter()
            .map(|group| group.id)
            .collect();
        let mut records = self
            .store
            .list_evaluations(&EvaluationFilter::for_groups(group_ids))
            .await?;

        for solo in self.store.list_solo_students(Some(track)).await? {
            let filter = EvaluationFilter {
                student_id: Some(solo.student_id),
                solo: Some(true),
                ..EvaluationFilter::default()
            };
            records.extend(self.store.list_evaluations(&filter).await?);
        }
        Ok(records)
    }

    pub async fn update_internal_component(
        &self,
        student_id: Uuid,
        group_id: Uuid,
        component: InternalComponent,
        raw_score: f64,
        actor: Actor,
    ) -> Result<EvaluationRecord> {
        let placement = self.group_placement(student_id, group_id).await?;
        self.score_internal(&placement, student_id, component, raw_score, actor).await
    }

    /// Internal scoring for a student enrolled without a group.
    pub async fn update_solo_internal_component(
        &self,
        student_id: Uuid,
        component: InternalComponent,
        raw_score: f64,
        actor: Actor,
    ) -> Result<EvaluationRecord> {
        let placement = self.solo_placement(student_id).await?;
        self.score_internal(&placement, student_id, component, raw_score, actor).await
    }

    pub async fn update_external_component(
        &self,
        student_id: Uuid,
        group_id: Uuid,
        raw_score: f64,
        actor: Actor,
    ) -> Result<EvaluationRecord> {
        let placement = self.group_placement(student_id, group_id).await?;
        self.score_external(&placement, student_id, raw_score, actor).await
    }

    pub async fn update_solo_external_component(
        &self,
        student_id: Uuid,
        raw_score: f64,
        actor: Actor,
    ) -> Result<EvaluationRecord> {
        let placement = self.solo_placement(student_id).await?;
        self.score_external(&placement, student_id, raw_score, actor).await
    }

    /// Track a score write is gated on: the group's, or the solo
    /// enrolment's when no group is given.
    pub async fn track_of(&self, student_id: Uuid, group_id: Option<Uuid>) -> Result<Track> {
        match group_id {
            Some(group_id) => Ok(self.load_group(group_id).await?.track),
            None => Ok(self.load_solo(student_id).await?.track),
        }
    }

    /// Publishes records that are not yet published. Already-published
    /// records keep their original timestamp.
    pub async fn publish(&self, record_ids: &[Uuid], actor: Actor) -> Result<PublishOutcome> {
        actor.require_elevated("publish evaluation records")?;
        let publication = Publication {
            is_published: true,
            published_at: Some(self.clock.now()),
            published_by: Some(actor.id),
        };
        let outcome = self.swap_publication(record_ids, false, &publication).await?;
        if !outcome.changed.is_empty() {
            info!(count = outcome.changed.len(), actor = %actor.id, "evaluation records published");
        }
        Ok(outcome)
    }

    pub async fn unpublish(&self, record_ids: &[Uuid], actor: Actor) -> Result<PublishOutcome> {
        actor.require_elevated("unpublish evaluation records")?;
        let publication = Publication {
            is_published: false,
            published_at: None,
            published_by: None,
        };
        let outcome = self.swap_publication(record_ids, true, &publication).await?;
        if !outcome.changed.is_empty() {
            info!(
                count = outcome.changed.len(),
                actor = %actor.id,
                "evaluation records unpublished"
            );
        }
        Ok(outcome)
    }

    pub async fn set_published(
        &self,
        record_ids: &[Uuid],
        is_published: bool,
        actor: Actor,
    ) -> Result<PublishOutcome> {
        if is_published {
            self.publish(record_ids, actor).await
        } else {
            self.unpublish(record_ids, actor).await
        }
    }

    /// Publishes the unpublished records of the track's approved groups.
    ///
    /// With a sub-assessment only records whose matching component has been
    /// scored are released. Without one this is the track-wide final release.
    pub async fn bulk_release_for_track(
        &self,
        track: Track,
        sub_assessment: Option<SubAssessment>,
        actor: Actor,
    ) -> Result<ReleaseOutcome> {
        actor.require_elevated("release grades")?;

        let group_ids: Vec<Uuid> = self
            .store
            .list_groups(Some(track))
            .await?
            .into_iter()
            .filter(|group| group.status == GroupStatus::Approved)
            .map(|group| group.id)
            .collect();
        let records = self
            .store
            .list_evaluations(&EvaluationFilter::for_groups(group_ids))
            .await?;

        let mut ready = Vec::new();
        let mut not_ready = 0;
        for record in records.iter().filter(|record| !record.is_published) {
            match sub_assessment {
                Some(sub) if record.component(sub).is_none() => not_ready += 1,
                _ => ready.push(record.id),
            }
        }

        let outcome = self.publish(&ready, actor).await?;
        info!(
            %track,
            sub_assessment = sub_assessment.map(|sub| sub.as_str()),
            published = outcome.changed.len(),
            not_ready,
            "grades released"
        );
        Ok(ReleaseOutcome {
            track,
            sub_assessment,
            final_release: sub_assessment.is_none(),
            published: outcome.changed,
            not_ready,
        })
    }

    /// Returns the record for the triple, creating an unscored one if absent.
    pub(crate) async fn get_or_create(
        &self,
        student_id: Uuid,
        group_id: Option<Uuid>,
        project_id: Uuid,
        internal_evaluator_id: Uuid,
        external_evaluator_id: Option<Uuid>,
    ) -> Result<EvaluationRecord> {
        if let Some(record) = self
            .store
            .find_evaluation(student_id, group_id, project_id)
            .await?
        {
            return Ok(record);
        }

        let record = new_record(
            student_id,
            group_id,
            project_id,
            internal_evaluator_id,
            external_evaluator_id,
            self.clock.now(),
        );
        match self.store.insert_evaluation(&record).await {
            Ok(()) => Ok(record),
            // Someone else created it between our read and our insert.
            Err(EngineError::Conflict(_)) => self
                .store
                .find_evaluation(student_id, group_id, project_id)
                .await?
                .ok_or_else(|| EngineError::not_found("evaluation record", student_id)),
            Err(err) => Err(err),
        }
    }

    async fn load_solo(&self, student_id: Uuid) -> Result<SoloStudent> {
        self.store
            .get_solo_student(student_id)
            .await?
            .ok_or_else(|| EngineError::not_found("solo student", student_id))
    }

    async fn group_placement(&self, student_id: Uuid, group_id: Uuid) -> Result<Placement> {
        let group = self.load_group(group_id).await?;
        if !group.member_ids.contains(&student_id) {
            return Err(EngineError::not_found("group member", student_id));
        }
        Placement::resolve(
            format!("group {}", group.code),
            Some(group.id),
            group.project_id,
            group.internal_faculty_id,
            group.external_evaluator_id,
        )
    }

    async fn solo_placement(&self, student_id: Uuid) -> Result<Placement> {
        let solo = self.load_solo(student_id).await?;
        Placement::resolve(
            format!("solo student {student_id}"),
            None,
            solo.project_id,
            solo.internal_faculty_id,
            solo.external_evaluator_id,
        )
    }

    /// The existing record for the placement. A published record refuses
    /// every further write, whoever asks and whatever the score.
    async fn unfrozen_record(
        &self,
        placement: &Placement,
        student_id: Uuid,
    ) -> Result<Option<EvaluationRecord>> {
        let existing = self
            .store
            .find_evaluation(student_id, placement.group_id, placement.project_id)
            .await?;
        match existing {
            Some(record) if record.is_published => Err(EngineError::Frozen(record.id)),
            other => Ok(other),
        }
    }

    async fn score_internal(
        &self,
        placement: &Placement,
        student_id: Uuid,
        component: InternalComponent,
        raw_score: f64,
        actor: Actor,
    ) -> Result<EvaluationRecord> {
        let existing = self.unfrozen_record(placement, student_id).await?;

        if !actor.role.is_elevated() && actor.id != placement.internal_id {
            return Err(EngineError::Authorization(format!(
                "only the internal faculty of {} may enter {component} scores",
                placement.label
            )));
        }

        let score = Scale::for_internal(component).score(raw_score)?;
        let record = match existing {
            Some(record) => record,
            None => {
                self.get_or_create(
                    student_id,
                    placement.group_id,
                    placement.project_id,
                    placement.internal_id,
                    placement.external_id,
                )
                .await?
            }
        };

        let updated = self.write(&record, component.sub_assessment(), score).await?;
        debug!(
            record_id = %updated.id,
            component = %component,
            converted = score.converted_score,
            "internal component scored"
        );
        Ok(updated)
    }

    async fn score_external(
        &self,
        placement: &Placement,
        student_id: Uuid,
        raw_score: f64,
        actor: Actor,
    ) -> Result<EvaluationRecord> {
        let existing = self.unfrozen_record(placement, student_id).await?;
        let assigned = existing
            .as_ref()
            .and_then(|record| record.external_evaluator_id)
            .or(placement.external_id);

        if !actor.role.is_elevated() && assigned != Some(actor.id) {
            return Err(EngineError::Authorization(match assigned {
                Some(_) => format!(
                    "only the assigned external evaluator of {} may enter external scores",
                    placement.label
                ),
                None => format!("{} has no external evaluator assigned", placement.label),
            }));
        }

        let score = EXTERNAL_SCALE.score(raw_score)?;
        let record = match existing {
            Some(record) => record,
            None => {
                self.get_or_create(
                    student_id,
                    placement.group_id,
                    placement.project_id,
                    placement.internal_id,
                    assigned,
                )
                .await?
            }
        };

        let updated = self.write(&record, SubAssessment::External, score).await?;
        debug!(
            record_id = %updated.id,
            converted = score.converted_score,
            "external component scored"
        );
        Ok(updated)
    }

    async fn write(
        &self,
        record: &EvaluationRecord,
        slot: SubAssessment,
        score: ComponentScore,
    ) -> Result<EvaluationRecord> {
        if record.is_published {
            return Err(EngineError::Frozen(record.id));
        }
        match self
            .store
            .write_component(record.id, slot, score, self.clock.now())
            .await?
        {
            Some(updated) => Ok(updated),
            None => match self.store.get_evaluation(record.id).await? {
                Some(current) if current.is_published => Err(EngineError::Frozen(record.id)),
                _ => Err(EngineError::not_found("evaluation record", record.id)),
            },
        }
    }

    async fn swap_publication(
        &self,
        record_ids: &[Uuid],
        expected_published: bool,
        publication: &Publication,
    ) -> Result<PublishOutcome> {
        let mut outcome = PublishOutcome::default();
        for &record_id in record_ids {
            if self
                .store
                .set_publication(record_id, expected_published, publication)
                .await?
            {
                outcome.changed.push(record_id);
                continue;
            }
            match self.store.get_evaluation(record_id).await? {
                Some(_) => outcome.skipped.push(record_id),
                None => outcome.missing.push(record_id),
            }
        }
        Ok(outcome)
    }
}

pub fn new_record(
    student_id: Uuid,
    group_id: Option<Uuid>,
    project_id: Uuid,
    internal_evaluator_id: Uuid,
    external_evaluator_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> EvaluationRecord {
    EvaluationRecord {
        id: Uuid::new_v4(),
        student_id,
        group_id,
        project_id,
        internal_evaluator_id,
        external_evaluator_id,
        cla1: None,
        cla2: None,
        cla3: None,
        external: None,
        total_internal: 0,
        total_external: 0,
        total: 0,
        is_published: false,
        published_at: None,
        published_by: None,
        created_at: now,
        updated_at: now,
    }
}

/// Where a student's record lives, with the bindings scoring needs.
struct Placement {
    label: String,
    group_id: Option<Uuid>,
    project_id: Uuid,
    internal_id: Uuid,
    external_id: Option<Uuid>,
}

impl Placement {
    fn resolve(
        label: String,
        group_id: Option<Uuid>,
        project_id: Option<Uuid>,
        internal_id: Option<Uuid>,
        external_id: Option<Uuid>,
    ) -> Result<Self> {
        let project_id = project_id
            .ok_or_else(|| EngineError::validation(format!("{label} is not bound to a project")))?;
        let internal_id = internal_id
            .ok_or_else(|| EngineError::validation(format!("{label} has no internal faculty")))?;
        Ok(Self {
            label,
            group_id,
            project_id,
            internal_id,
            external_id,
        })
    }
}
