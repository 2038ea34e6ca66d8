use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

macro_rules! text_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value.trim()))
                    .ok_or_else(|| {
                        EngineError::validation(format!("unknown {}: {value:?}", $label))
                    })
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Track {
    #[serde(rename = "IDP")]
    Idp,
    #[serde(rename = "UROP")]
    Urop,
    #[serde(rename = "CAPSTONE")]
    Capstone,
}

text_enum!(Track, "track", {
    Idp => "IDP",
    Urop => "UROP",
    Capstone => "CAPSTONE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Proposal,
    Application,
    Submission,
    Assessment,
    GradeRelease,
}

text_enum!(PhaseKind, "phase kind", {
    Proposal => "proposal",
    Application => "application",
    Submission => "submission",
    Assessment => "assessment",
    GradeRelease => "grade_release",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubAssessment {
    #[serde(rename = "CLA-1")]
    Cla1,
    #[serde(rename = "CLA-2")]
    Cla2,
    #[serde(rename = "CLA-3")]
    Cla3,
    External,
}

text_enum!(SubAssessment, "sub-assessment", {
    Cla1 => "CLA-1",
    Cla2 => "CLA-2",
    Cla3 => "CLA-3",
    External => "External",
});

/// The three internal marking components an internal faculty enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalComponent {
    Cla1,
    Cla2,
    Cla3,
}

text_enum!(InternalComponent, "component", {
    Cla1 => "cla1",
    Cla2 => "cla2",
    Cla3 => "cla3",
});

impl InternalComponent {
    pub fn sub_assessment(self) -> SubAssessment {
        match self {
            Self::Cla1 => SubAssessment::Cla1,
            Self::Cla2 => SubAssessment::Cla2,
            Self::Cla3 => SubAssessment::Cla3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Faculty,
    Coordinator,
    Admin,
}

text_enum!(Role, "role", {
    Student => "student",
    Faculty => "faculty",
    Coordinator => "coordinator",
    Admin => "admin",
});

impl Role {
    pub fn is_elevated(self) -> bool {
        matches!(self, Self::Coordinator | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum!(GroupStatus, "group status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// Identity of whoever is calling into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, role: Role) -> Self {
        Self { id, role }
    }

    /// Fails with an authorization error unless the actor is a coordinator
    /// or admin.
    pub fn require_elevated(&self, action: &str) -> Result<(), EngineError> {
        if self.role.is_elevated() {
            Ok(())
        } else {
            Err(EngineError::Authorization(format!(
                "{} may not {action}",
                self.role
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub phase_kind: PhaseKind,
    pub track: Track,
    pub sub_assessment: Option<SubAssessment>,
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.track, self.phase_kind)?;
        if let Some(sub) = self.sub_assessment {
            write!(f, " ({sub})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub id: Uuid,
    pub phase_kind: PhaseKind,
    pub track: Track,
    pub sub_assessment: Option<SubAssessment>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Cached "now is inside the interval", refreshed by reconciliation.
    pub is_active: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Window {
    pub fn key(&self) -> WindowKey {
        WindowKey {
            phase_kind: self.phase_kind,
            track: self.track,
            sub_assessment: self.sub_assessment,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.starts_at <= instant && instant <= self.ends_at
    }

    /// Touching boundaries count as overlapping.
    pub fn overlaps(&self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> bool {
        self.starts_at <= ends_at && starts_at <= self.ends_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScore {
    pub raw_score: f64,
    pub converted_score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStage {
    Unscored,
    PartiallyScored,
    FullyScored,
    Published,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    /// Absent for solo students.
    pub group_id: Option<Uuid>,
    pub project_id: Uuid,
    pub internal_evaluator_id: Uuid,
    pub external_evaluator_id: Option<Uuid>,
    pub cla1: Option<ComponentScore>,
    pub cla2: Option<ComponentScore>,
    pub cla3: Option<ComponentScore>,
    pub external: Option<ComponentScore>,
    pub total_internal: u32,
    pub total_external: u32,
    pub total: u32,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub published_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn internal(&self, component: InternalComponent) -> Option<&ComponentScore> {
        match component {
            InternalComponent::Cla1 => self.cla1.as_ref(),
            InternalComponent::Cla2 => self.cla2.as_ref(),
            InternalComponent::Cla3 => self.cla3.as_ref(),
        }
    }

    pub fn component(&self, sub: SubAssessment) -> Option<&ComponentScore> {
        match sub {
            SubAssessment::Cla1 => self.cla1.as_ref(),
            SubAssessment::Cla2 => self.cla2.as_ref(),
            SubAssessment::Cla3 => self.cla3.as_ref(),
            SubAssessment::External => self.external.as_ref(),
        }
    }

    pub fn component_mut(&mut self, sub: SubAssessment) -> &mut Option<ComponentScore> {
        match sub {
            SubAssessment::Cla1 => &mut self.cla1,
            SubAssessment::Cla2 => &mut self.cla2,
            SubAssessment::Cla3 => &mut self.cla3,
            SubAssessment::External => &mut self.external,
        }
    }

    /// Re-derives the three totals from the converted component scores.
    pub fn recompute_totals(&mut self) {
        let converted = |score: &Option<ComponentScore>| score.map_or(0, |s| s.converted_score);
        self.total_internal = converted(&self.cla1) + converted(&self.cla2) + converted(&self.cla3);
        self.total_external = converted(&self.external);
        self.total = self.total_internal + self.total_external;
    }

    pub fn stage(&self) -> EvaluationStage {
        if self.is_published {
            return EvaluationStage::Published;
        }
        let scored = [&self.cla1, &self.cla2, &self.cla3, &self.external]
            .iter()
            .filter(|component| component.is_some())
            .count();
        match scored {
            0 => EvaluationStage::Unscored,
            4 => EvaluationStage::FullyScored,
            _ => EvaluationStage::PartiallyScored,
        }
    }
}

/// The publication triple, always written as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub published_by: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub external_eligible: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Uuid,
    pub code: String,
    pub track: Track,
    pub status: GroupStatus,
    pub project_id: Option<Uuid>,
    pub internal_faculty_id: Option<Uuid>,
    pub member_ids: Vec<Uuid>,
    pub external_evaluator_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoloStudent {
    pub student_id: Uuid,
    pub track: Track,
    pub project_id: Option<Uuid>,
    pub internal_faculty_id: Option<Uuid>,
    pub external_evaluator_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorLoad {
    pub evaluator_id: Uuid,
    pub full_name: String,
    pub current_load: usize,
}
