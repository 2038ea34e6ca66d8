//! Roster loading: CSV import and a small seed dataset.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{Group, GroupStatus, PhaseKind, Role, SoloStudent, SubAssessment, Track, User};
use crate::store::{Store, WindowFilter};
use crate::window::NewWindow;
use crate::Engine;

/// One roster line. Students carry their placement; staff rows leave the
/// placement columns empty.
#[derive(Debug, Deserialize)]
struct RosterRow {
    full_name: String,
    email: String,
    role: String,
    #[serde(default)]
    external_eligible: bool,
    track: Option<String>,
    group_code: Option<String>,
    group_status: Option<String>,
    project_id: Option<Uuid>,
    faculty_email: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub users: usize,
    pub groups: usize,
    pub solo_students: usize,
}

struct GroupDraft {
    track: Track,
    status: GroupStatus,
    project_id: Option<Uuid>,
    faculty_email: Option<String>,
    members: Vec<Uuid>,
}

pub async fn import_csv(
    store: &dyn Store,
    csv_path: &Path,
    now: DateTime<Utc>,
) -> anyhow::Result<ImportSummary> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    import_roster(store, file, now).await
}

/// Upserts users by email first, then groups by code and solo students,
/// so placements can reference any user in the file.
pub async fn import_roster<R: Read>(
    store: &dyn Store,
    input: R,
    now: DateTime<Utc>,
) -> anyhow::Result<ImportSummary> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);
    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<RosterRow>().enumerate() {
        rows.push(result.with_context(|| format!("invalid roster row {}", line + 1))?);
    }

    let mut summary = ImportSummary::default();
    let mut ids: HashMap<String, Uuid> = HashMap::new();
    for row in &rows {
        let role: Role = row.role.parse()?;
        let user = User {
            id: Uuid::new_v4(),
            full_name: row.full_name.clone(),
            email: row.email.to_lowercase(),
            role,
            external_eligible: row.external_eligible,
            created_at: now,
        };
        let id = store.upsert_user(&user).await?;
        ids.insert(user.email, id);
        summary.users += 1;
    }

    let lookup = |email: &Option<String>| -> anyhow::Result<Option<Uuid>> {
        match email.as_deref().filter(|e| !e.is_empty()) {
            None => Ok(None),
            Some(email) => match ids.get(&email.to_lowercase()) {
                Some(id) => Ok(Some(*id)),
                None => bail!("{email} is not in the roster"),
            },
        }
    };

    let mut drafts: Vec<(String, GroupDraft)> = Vec::new();
    for row in rows.iter().filter(|row| row.role.eq_ignore_ascii_case("student")) {
        let Some(track) = row.track.as_deref().filter(|t| !t.is_empty()) else {
            continue;
        };
        let track: Track = track.parse()?;
        let student_id = lookup(&Some(row.email.clone()))?
            .with_context(|| format!("student {} has no email", row.full_name))?;

        match row.group_code.as_deref().filter(|code| !code.is_empty()) {
            Some(code) => {
                let status = match row.group_status.as_deref().filter(|s| !s.is_empty()) {
                    Some(status) => status.parse()?,
                    None => GroupStatus::Pending,
                };
                match drafts.iter_mut().find(|(existing, _)| existing == code) {
                    Some((_, draft)) => draft.members.push(student_id),
                    None => drafts.push((
                        code.to_string(),
                        GroupDraft {
                            track,
                            status,
                            project_id: row.project_id,
                            faculty_email: row.faculty_email.clone(),
                            members: vec![student_id],
                        },
                    )),
                }
            }
            None => {
                let solo = SoloStudent {
                    student_id,
                    track,
                    project_id: row.project_id,
                    internal_faculty_id: lookup(&row.faculty_email)?,
                    external_evaluator_id: None,
                    created_at: now,
                };
                store.upsert_solo_student(&solo).await?;
                summary.solo_students += 1;
            }
        }
    }

    for (code, draft) in drafts {
        let group = Group {
            id: Uuid::new_v4(),
            code,
            track: draft.track,
            status: draft.status,
            project_id: draft.project_id,
            internal_faculty_id: lookup(&draft.faculty_email)?,
            member_ids: draft.members,
            external_evaluator_id: None,
            created_at: now,
        };
        store.upsert_group(&group).await?;
        summary.groups += 1;
    }

    Ok(summary)
}

const SEED_ROSTER: &str = "\
full_name,email,role,external_eligible,track,group_code,group_status,project_id,faculty_email
Anita Rao,anita.rao@univ.edu,faculty,true,,,,,
Vikram Iyer,vikram.iyer@univ.edu,faculty,true,,,,,
Leena George,leena.george@univ.edu,faculty,true,,,,,
Sanjay Menon,sanjay.menon@univ.edu,coordinator,false,,,,,
Priya Das,priya.das@univ.edu,student,false,IDP,IDP-01,approved,5b0a7f64-3f0e-4c55-9d7e-0f2d1c6a9e11,anita.rao@univ.edu
Rahul Shah,rahul.shah@univ.edu,student,false,IDP,IDP-01,approved,5b0a7f64-3f0e-4c55-9d7e-0f2d1c6a9e11,anita.rao@univ.edu
Kavya Pillai,kavya.pillai@univ.edu,student,false,IDP,IDP-02,approved,9c4e2b13-6d1a-4f2e-8a57-3b9f0d7c5a22,vikram.iyer@univ.edu
Arjun Nair,arjun.nair@univ.edu,student,false,UROP,UROP-01,approved,1f8d3c2a-7b6e-4d9f-a0c1-5e2b8f4d6a33,leena.george@univ.edu
Divya Kumar,divya.kumar@univ.edu,student,false,CAPSTONE,,,7e6a5d4c-3b2a-4918-8f7e-6d5c4b3a2f44,vikram.iyer@univ.edu
";

/// Loads the seed roster and, when no windows exist yet, opens a two-week
/// IDP CLA-1 assessment window.
pub async fn seed(engine: &Engine, actor_id: Uuid) -> anyhow::Result<ImportSummary> {
    let now = engine.clock.now();
    let summary = import_roster(engine.store.as_ref(), SEED_ROSTER.as_bytes(), now).await?;

    let existing = engine.store.list_windows(&WindowFilter::default()).await?;
    if existing.is_empty() {
        let request = NewWindow {
            phase_kind: PhaseKind::Assessment,
            track: Track::Idp,
            sub_assessment: Some(SubAssessment::Cla1),
            starts_at: now,
            ends_at: now + Duration::days(14),
        };
        engine.gate.create(request, actor_id).await?;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn seed_roster_builds_groups_and_solos() {
        let store = MemoryStore::new();
        let summary = import_roster(&store, SEED_ROSTER.as_bytes(), now()).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                users: 9,
                groups: 3,
                solo_students: 1
            }
        );

        let groups = store.list_groups(Some(Track::Idp)).await.unwrap();
        assert_eq!(groups.len(), 2);
        let first = groups.iter().find(|g| g.code == "IDP-01").unwrap();
        assert_eq!(first.member_ids.len(), 2);
        assert_eq!(first.status, GroupStatus::Approved);
        assert!(first.internal_faculty_id.is_some());

        let evaluators = store.list_external_evaluators().await.unwrap();
        assert_eq!(evaluators.len(), 3);
        assert_eq!(store.list_solo_students(Some(Track::Capstone)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reimport_keeps_ids_stable() {
        let store = MemoryStore::new();
        import_roster(&store, SEED_ROSTER.as_bytes(), now()).await.unwrap();
        let before = store.list_groups(None).await.unwrap();
        import_roster(&store, SEED_ROSTER.as_bytes(), now()).await.unwrap();
        let after = store.list_groups(None).await.unwrap();

        let ids = |groups: &[Group]| groups.iter().map(|g| g.id).collect::<Vec<_>>();
        assert_eq!(ids(&before), ids(&after));
        assert_eq!(after[0].member_ids, before[0].member_ids);
    }

    #[tokio::test]
    async fn unknown_faculty_is_rejected() {
        let store = MemoryStore::new();
        let csv = "\
full_name,email,role,external_eligible,track,group_code,group_status,project_id,faculty_email
Solo Student,solo@univ.edu,student,false,UROP,,,,ghost@univ.edu
";
        let err = import_roster(&store, csv.as_bytes(), now()).await.unwrap_err();
        assert!(err.to_string().contains("ghost@univ.edu"));
    }

    #[tokio::test]
    async fn seed_opens_one_window_once() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(now()));
        let engine = Engine::new(store, clock, EngineConfig::default());
        let admin = Uuid::new_v4();

        seed(&engine, admin).await.unwrap();
        seed(&engine, admin).await.unwrap();

        let windows = engine.store.list_windows(&WindowFilter::default()).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert!(engine
            .gate
            .is_open(PhaseKind::Assessment, Track::Idp, Some(SubAssessment::Cla1))
            .await
            .unwrap());
    }
}
