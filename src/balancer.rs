//! External evaluator assignment.
//!
//! Load is the number of groups plus solo students bound to an evaluator.
//! Both `auto_assign` and `rebalance` use the same greedy rule: hand the next
//! unit to the least-loaded eligible evaluator, ties going to the earliest
//! evaluator in creation order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::evaluation::EvaluationService;
use crate::models::{Actor, EvaluatorLoad, Group, GroupStatus, SoloStudent, Track, User};
use crate::store::{EvaluationFilter, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AssignmentUnit {
    Group(Uuid),
    /// Keyed by the student id.
    Solo(Uuid),
}

impl fmt::Display for AssignmentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentUnit::Group(id) => write!(f, "group {id}"),
            AssignmentUnit::Solo(id) => write!(f, "solo student {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub unit: AssignmentUnit,
    pub evaluator_id: Uuid,
    pub previous: Option<Uuid>,
    /// Member records that now carry the evaluator binding.
    pub records_bound: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    MissingProjectOrFaculty,
    AlreadyScored,
    NoEligibleEvaluator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unassigned {
    pub unit: AssignmentUnit,
    pub reason: UnassignedReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAssignOutcome {
    pub assigned: Vec<Assignment>,
    pub unassigned: Vec<Unassigned>,
    pub loads: Vec<EvaluatorLoad>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceChange {
    pub unit: AssignmentUnit,
    pub from: Option<Uuid>,
    pub to: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceOutcome {
    pub changes: Vec<RebalanceChange>,
    pub gap_before: usize,
    pub gap_after: usize,
    /// `false` when the computed plan would have widened the gap.
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintViolation {
    #[serde(rename_all = "camelCase")]
    EvaluatorIsInternalFaculty {
        unit: AssignmentUnit,
        evaluator_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    IneligibleEvaluator {
        unit: AssignmentUnit,
        evaluator_id: Uuid,
    },
    LoadImbalance {
        max: usize,
        min: usize,
        threshold: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintReport {
    pub is_valid: bool,
    pub violations: Vec<ConstraintViolation>,
    pub loads: Vec<EvaluatorLoad>,
}

/// A group or solo student, flattened to what assignment needs.
#[derive(Debug, Clone)]
struct Unit {
    key: AssignmentUnit,
    group_id: Option<Uuid>,
    students: Vec<Uuid>,
    project_id: Option<Uuid>,
    internal_faculty_id: Option<Uuid>,
    current: Option<Uuid>,
    approved: bool,
}

impl Unit {
    fn from_group(group: &Group) -> Self {
        Self {
            key: AssignmentUnit::Group(group.id),
            group_id: Some(group.id),
            students: group.member_ids.clone(),
            project_id: group.project_id,
            internal_faculty_id: group.internal_faculty_id,
            current: group.external_evaluator_id,
            approved: group.status == GroupStatus::Approved,
        }
    }

    fn from_solo(solo: &SoloStudent) -> Self {
        Self {
            key: AssignmentUnit::Solo(solo.student_id),
            group_id: None,
            students: vec![solo.student_id],
            project_id: solo.project_id,
            internal_faculty_id: solo.internal_faculty_id,
            current: solo.external_evaluator_id,
            approved: true,
        }
    }

    fn bindable(&self) -> bool {
        self.project_id.is_some() && self.internal_faculty_id.is_some()
    }
}

/// Running per-evaluator counts, kept in evaluator creation order.
struct LoadBook {
    evaluators: Vec<User>,
    counts: HashMap<Uuid, usize>,
}

impl LoadBook {
    fn empty(evaluators: Vec<User>) -> Self {
        let counts = evaluators.iter().map(|user| (user.id, 0)).collect();
        Self { evaluators, counts }
    }

    fn from_units<'a>(evaluators: Vec<User>, units: impl IntoIterator<Item = &'a Unit>) -> Self {
        let mut book = Self::empty(evaluators);
        for evaluator_id in units.into_iter().filter_map(|unit| unit.current) {
            book.bump(evaluator_id);
        }
        book
    }

    /// Counts only eligible evaluators; stale bindings are ignored.
    fn bump(&mut self, evaluator_id: Uuid) {
        if let Some(count) = self.counts.get_mut(&evaluator_id) {
            *count += 1;
        }
    }

    fn gap(&self) -> usize {
        let max = self.counts.values().copied().max().unwrap_or(0);
        let min = self.counts.values().copied().min().unwrap_or(0);
        max - min
    }

    /// Least-loaded evaluator other than `excluded`. Ties go to `preferred`
    /// when it is among them, otherwise to the earliest evaluator.
    fn pick(&self, excluded: Option<Uuid>, preferred: Option<Uuid>) -> Option<Uuid> {
        self.evaluators
            .iter()
            .enumerate()
            .filter(|(_, user)| Some(user.id) != excluded)
            .min_by_key(|(index, user)| {
                let load = self.counts.get(&user.id).copied().unwrap_or(0);
                (load, Some(user.id) != preferred, *index)
            })
            .map(|(_, user)| user.id)
    }

    fn loads(&self) -> Vec<EvaluatorLoad> {
        self.evaluators
            .iter()
            .map(|user| EvaluatorLoad {
                evaluator_id: user.id,
                full_name: user.full_name.clone(),
                current_load: self.counts.get(&user.id).copied().unwrap_or(0),
            })
            .collect()
    }
}

pub struct EvaluatorBalancer {
    store: Arc<dyn Store>,
    evaluations: Arc<EvaluationService>,
    config: EngineConfig,
}

impl EvaluatorBalancer {
    pub fn new(
        store: Arc<dyn Store>,
        evaluations: Arc<EvaluationService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            evaluations,
            config,
        }
    }

    /// Eligible evaluators with their load for `track`, or across all
    /// tracks when `track` is `None`.
    pub async fn list_assignable(&self, track: Option<Track>) -> Result<Vec<EvaluatorLoad>> {
        let evaluators = self.store.list_external_evaluators().await?;
        let units = self.units(track).await?;
        Ok(LoadBook::from_units(evaluators, &units).loads())
    }

    pub async fn assign(
        &self,
        group_id: Uuid,
        evaluator_id: Uuid,
        actor: Actor,
    ) -> Result<Assignment> {
        actor.require_elevated("manage evaluator assignments")?;
        let group = self
            .store
            .get_group(group_id)
            .await?
            .ok_or_else(|| EngineError::not_found("group", group_id))?;
        self.assign_unit(Unit::from_group(&group), evaluator_id).await
    }

    pub async fn assign_solo(
        &self,
        student_id: Uuid,
        evaluator_id: Uuid,
        actor: Actor,
    ) -> Result<Assignment> {
        actor.require_elevated("manage evaluator assignments")?;
        let solo = self
            .store
            .get_solo_student(student_id)
            .await?
            .ok_or_else(|| EngineError::not_found("solo student", student_id))?;
        self.assign_unit(Unit::from_solo(&solo), evaluator_id).await
    }

    /// Binds every unassigned unit of the track, one at a time, to the
    /// evaluator with the smallest overall load.
    pub async fn auto_assign(
        &self,
        track: Option<Track>,
        actor: Actor,
    ) -> Result<AutoAssignOutcome> {
        actor.require_elevated("manage evaluator assignments")?;
        let evaluators = self.store.list_external_evaluators().await?;
        let all_units = self.units(None).await?;
        let mut book = LoadBook::from_units(evaluators, &all_units);

        let track_units = match track {
            Some(_) => self.units(track).await?,
            None => all_units,
        };

        let mut assigned = Vec::new();
        let mut unassigned = Vec::new();
        for unit in track_units
            .into_iter()
            .filter(|unit| unit.approved && unit.current.is_none())
        {
            let reason = if !unit.bindable() {
                Some(UnassignedReason::MissingProjectOrFaculty)
            } else if self.is_pinned(&unit).await? {
                Some(UnassignedReason::AlreadyScored)
            } else {
                None
            };
            if let Some(reason) = reason {
                unassigned.push(Unassigned {
                    unit: unit.key,
                    reason,
                });
                continue;
            }

            let Some(evaluator_id) = book.pick(unit.internal_faculty_id, None) else {
                unassigned.push(Unassigned {
                    unit: unit.key,
                    reason: UnassignedReason::NoEligibleEvaluator,
                });
                continue;
            };
            let records_bound = self.bind(&unit, evaluator_id).await?;
            book.bump(evaluator_id);
            assigned.push(Assignment {
                unit: unit.key,
                evaluator_id,
                previous: None,
                records_bound,
            });
        }

        info!(
            track = track.map(|t| t.as_str()),
            assigned = assigned.len(),
            unassigned = unassigned.len(),
            "auto-assignment finished"
        );
        Ok(AutoAssignOutcome {
            assigned,
            unassigned,
            loads: book.loads(),
        })
    }

    /// Redistributes existing bindings across every track.
    ///
    /// Units with an externally scored member stay where they are. The plan
    /// is applied only if it does not widen the busiest-to-idlest gap.
    pub async fn rebalance(&self, actor: Actor) -> Result<RebalanceOutcome> {
        actor.require_elevated("manage evaluator assignments")?;
        let evaluators = self.store.list_external_evaluators().await?;
        let units = self.units(None).await?;
        let before = LoadBook::from_units(evaluators.clone(), &units);
        let gap_before = before.gap();

        let mut fixed = Vec::new();
        let mut movable = Vec::new();
        for unit in units.into_iter().filter(|unit| unit.current.is_some()) {
            if unit.approved && unit.bindable() && !self.is_pinned(&unit).await? {
                movable.push(unit);
            } else {
                fixed.push(unit);
            }
        }

        let mut plan = LoadBook::from_units(evaluators, &fixed);
        let mut planned = Vec::new();
        for unit in &movable {
            match plan.pick(unit.internal_faculty_id, unit.current) {
                Some(evaluator_id) => {
                    plan.bump(evaluator_id);
                    if unit.current != Some(evaluator_id) {
                        planned.push((unit, evaluator_id));
                    }
                }
                None => {
                    // Nobody else can take it; leave the binding alone.
                    if let Some(current) = unit.current {
                        plan.bump(current);
                    }
                }
            }
        }

        let plan_gap = plan.gap();
        if plan_gap > gap_before {
            warn!(gap_before, plan_gap, "rebalance plan would widen the load gap, skipped");
            return Ok(RebalanceOutcome {
                changes: Vec::new(),
                gap_before,
                gap_after: gap_before,
                applied: false,
            });
        }

        let mut changes = Vec::with_capacity(planned.len());
        for (unit, evaluator_id) in planned {
            self.bind(unit, evaluator_id).await?;
            changes.push(RebalanceChange {
                unit: unit.key,
                from: unit.current,
                to: evaluator_id,
            });
        }

        info!(
            changes = changes.len(),
            gap_before,
            gap_after = plan_gap,
            "rebalance applied"
        );
        Ok(RebalanceOutcome {
            changes,
            gap_before,
            gap_after: plan_gap,
            applied: true,
        })
    }

    pub async fn validate_constraints(&self, track: Option<Track>) -> Result<ConstraintReport> {
        let evaluators = self.store.list_external_evaluators().await?;
        let units = self.units(track).await?;
        let book = LoadBook::from_units(evaluators, &units);

        let mut violations = Vec::new();
        for unit in &units {
            let Some(evaluator_id) = unit.current else {
                continue;
            };
            if unit.internal_faculty_id == Some(evaluator_id) {
                violations.push(ConstraintViolation::EvaluatorIsInternalFaculty {
                    unit: unit.key,
                    evaluator_id,
                });
            }
            if !book.counts.contains_key(&evaluator_id) {
                violations.push(ConstraintViolation::IneligibleEvaluator {
                    unit: unit.key,
                    evaluator_id,
                });
            }
        }

        let gap = book.gap();
        if gap > self.config.max_load_gap {
            let max = book.counts.values().copied().max().unwrap_or(0);
            violations.push(ConstraintViolation::LoadImbalance {
                max,
                min: max - gap,
                threshold: self.config.max_load_gap,
            });
        }

        Ok(ConstraintReport {
            is_valid: violations.is_empty(),
            violations,
            loads: book.loads(),
        })
    }

    async fn assign_unit(&self, unit: Unit, evaluator_id: Uuid) -> Result<Assignment> {
        let evaluator = self
            .store
            .get_user(evaluator_id)
            .await?
            .ok_or_else(|| EngineError::not_found("user", evaluator_id))?;
        if !evaluator.external_eligible {
            return Err(EngineError::validation(format!(
                "{} is not eligible as an external evaluator",
                evaluator.full_name
            )));
        }
        if !unit.bindable() {
            return Err(EngineError::validation(format!(
                "{} has no project or internal faculty yet",
                unit.key
            )));
        }
        if unit.internal_faculty_id == Some(evaluator_id) {
            return Err(EngineError::validation(format!(
                "{} cannot be the external evaluator of {} they supervise",
                evaluator.full_name, unit.key
            )));
        }
        if unit.current == Some(evaluator_id) {
            return Err(EngineError::Conflict(format!(
                "{} is already assigned to {}",
                evaluator.full_name, unit.key
            )));
        }

        let records_bound = self.bind(&unit, evaluator_id).await?;
        info!(unit = %unit.key, evaluator = %evaluator_id, "external evaluator assigned");
        Ok(Assignment {
            unit: unit.key,
            evaluator_id,
            previous: unit.current,
            records_bound,
        })
    }

    /// Writes the binding on the unit and on every member's record,
    /// creating records that do not exist yet.
    async fn bind(&self, unit: &Unit, evaluator_id: Uuid) -> Result<usize> {
        let bound = match unit.key {
            AssignmentUnit::Group(id) => {
                self.store.set_group_evaluator(id, Some(evaluator_id)).await?
            }
            AssignmentUnit::Solo(id) => {
                self.store.set_solo_evaluator(id, Some(evaluator_id)).await?
            }
        };
        if !bound {
            return Err(match unit.key {
                AssignmentUnit::Group(id) => EngineError::not_found("group", id),
                AssignmentUnit::Solo(id) => EngineError::not_found("solo student", id),
            });
        }

        let (Some(project_id), Some(internal_id)) = (unit.project_id, unit.internal_faculty_id)
        else {
            return Ok(0);
        };
        let mut records_bound = 0;
        for &student_id in &unit.students {
            let record = self
                .evaluations
                .get_or_create(
                    student_id,
                    unit.group_id,
                    project_id,
                    internal_id,
                    Some(evaluator_id),
                )
                .await?;
            if record.external_evaluator_id != Some(evaluator_id) {
                self.store
                    .set_external_evaluator(record.id, Some(evaluator_id))
                    .await?;
            }
            records_bound += 1;
        }
        debug!(unit = %unit.key, records_bound, "evaluator binding propagated");
        Ok(records_bound)
    }

    async fn units(&self, track: Option<Track>) -> Result<Vec<Unit>> {
        let mut units: Vec<Unit> = self
            .store
            .list_groups(track)
            .await?
            .iter()
            .map(Unit::from_group)
            .collect();
        units.extend(
            self.store
                .list_solo_students(track)
                .await?
                .iter()
                .map(Unit::from_solo),
        );
        Ok(units)
    }

    /// A unit is pinned once any member has an external score.
    async fn is_pinned(&self, unit: &Unit) -> Result<bool> {
        let filter = match unit.key {
            AssignmentUnit::Group(id) => EvaluationFilter::for_groups(vec![id]),
            AssignmentUnit::Solo(id) => EvaluationFilter {
                student_id: Some(id),
                solo: Some(true),
                ..EvaluationFilter::default()
            },
        };
        let records = self.store.list_evaluations(&filter).await?;
        Ok(records.iter().any(|record| record.external.is_some()))
    }
}
