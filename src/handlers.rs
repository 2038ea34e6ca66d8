//! Endpoint semantics for the evaluation engine.
//!
//! Each method corresponds to one REST route, takes the decoded JSON body,
//! and returns an [`ApiResponse`]. Transports own the HTTP framing.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::{resolve_aliases, ApiResponse};
use crate::error::{EngineError, Result};
use crate::models::{Actor, InternalComponent, PhaseKind, SubAssessment, Track};
use crate::store::WindowFilter;
use crate::window::{NewWindow, WindowPatch};
use crate::Engine;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuery {
    pub track: Option<Track>,
    pub phase_kind: Option<PhaseKind>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowKeyQuery {
    pub phase_kind: PhaseKind,
    pub track: Track,
    pub sub_assessment: Option<SubAssessment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InternalScoreBody {
    student_id: Uuid,
    /// Absent for solo students.
    group_id: Option<Uuid>,
    component: InternalComponent,
    raw_score: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalScoreBody {
    student_id: Uuid,
    group_id: Option<Uuid>,
    raw_score: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishBody {
    record_ids: Vec<Uuid>,
    is_published: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseBody {
    track: Track,
    sub_assessment: Option<SubAssessment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignBody {
    group_id: Uuid,
    external_evaluator_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignSoloBody {
    student_id: Uuid,
    external_evaluator_id: Uuid,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackBody {
    track: Option<Track>,
}

pub struct RequestHandler<'a> {
    engine: &'a Engine,
}

impl<'a> RequestHandler<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// `GET /windows`
    pub async fn list_windows(&self, query: WindowQuery) -> ApiResponse {
        let filter = WindowFilter {
            track: query.track,
            phase_kind: query.phase_kind,
            is_active: query.is_active,
        };
        ApiResponse::from_result(self.engine.gate.list(&filter).await)
    }

    /// `POST /windows`
    pub async fn create_window(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            actor.require_elevated("create windows")?;
            let request: NewWindow = parse(body)?;
            self.engine.gate.create(request, actor.id).await
        }
        .await;
        match result {
            Ok(window) => ApiResponse::created(&window),
            Err(err) => ApiResponse::error(&err),
        }
    }

    /// `PUT /windows/:id`
    pub async fn update_window(&self, actor: Actor, window_id: Uuid, body: Value) -> ApiResponse {
        let result = async {
            actor.require_elevated("edit windows")?;
            let patch: WindowPatch = parse(body)?;
            self.engine.gate.update(window_id, patch).await
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `DELETE /windows/:id`
    pub async fn delete_window(&self, actor: Actor, window_id: Uuid) -> ApiResponse {
        let result = async {
            actor.require_elevated("delete windows")?;
            self.engine.gate.delete(window_id).await?;
            Ok::<_, EngineError>(json!({ "deleted": window_id }))
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `DELETE /windows?expired=true`
    pub async fn delete_expired_windows(&self, actor: Actor) -> ApiResponse {
        let result = async {
            actor.require_elevated("delete windows")?;
            let removed = self.engine.gate.bulk_delete_expired(None).await?;
            Ok::<_, EngineError>(json!({ "removed": removed }))
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `GET /windows/upcoming`
    pub async fn list_upcoming(&self, track: Option<Track>, limit: Option<usize>) -> ApiResponse {
        ApiResponse::from_result(self.engine.gate.list_upcoming(track, limit).await)
    }

    /// `GET /windows/status`
    pub async fn window_status(&self, query: WindowKeyQuery) -> ApiResponse {
        let result = self
            .engine
            .gate
            .is_open(query.phase_kind, query.track, query.sub_assessment)
            .await
            .map(|is_open| json!({ "isOpen": is_open }));
        ApiResponse::from_result(result)
    }

    /// `PUT /evaluations/internal-score`
    pub async fn internal_score(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            let body: InternalScoreBody = parse(body)?;
            let sub = body.component.sub_assessment();
            self.require_assessment_window(actor, body.student_id, body.group_id, sub)
                .await?;
            let evaluations = &self.engine.evaluations;
            match body.group_id {
                Some(group_id) => {
                    evaluations
                        .update_internal_component(
                            body.student_id,
                            group_id,
                            body.component,
                            body.raw_score,
                            actor,
                        )
                        .await
                }
                None => {
                    evaluations
                        .update_solo_internal_component(
                            body.student_id,
                            body.component,
                            body.raw_score,
                            actor,
                        )
                        .await
                }
            }
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `PUT /evaluations/external-score`
    pub async fn external_score(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            let body: ExternalScoreBody = parse(body)?;
            let sub = SubAssessment::External;
            self.require_assessment_window(actor, body.student_id, body.group_id, sub)
                .await?;
            let evaluations = &self.engine.evaluations;
            match body.group_id {
                Some(group_id) => {
                    evaluations
                        .update_external_component(body.student_id, group_id, body.raw_score, actor)
                        .await
                }
                None => {
                    evaluations
                        .update_solo_external_component(body.student_id, body.raw_score, actor)
                        .await
                }
            }
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `PUT /evaluations/publish`
    pub async fn publish(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            let body: PublishBody = parse(body)?;
            self.engine
                .evaluations
                .set_published(&body.record_ids, body.is_published, actor)
                .await
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `POST /evaluations/release`
    pub async fn release(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            let body: ReleaseBody = parse(body)?;
            self.engine
                .evaluations
                .bulk_release_for_track(body.track, body.sub_assessment, actor)
                .await
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `GET /evaluations/:id`
    pub async fn get_evaluation(&self, record_id: Uuid) -> ApiResponse {
        ApiResponse::from_result(self.engine.evaluations.get(record_id).await)
    }

    /// `GET /groups/:id/evaluations`
    pub async fn group_evaluations(&self, group_id: Uuid) -> ApiResponse {
        ApiResponse::from_result(self.engine.evaluations.list_for_group(group_id).await)
    }

    /// `GET /evaluators`
    pub async fn list_evaluators(&self, track: Option<Track>) -> ApiResponse {
        ApiResponse::from_result(self.engine.balancer.list_assignable(track).await)
    }

    /// `POST /evaluators/assign`
    pub async fn assign(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            let body: AssignBody = parse(body)?;
            self.engine
                .balancer
                .assign(body.group_id, body.external_evaluator_id, actor)
                .await
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `POST /evaluators/assign-solo`
    pub async fn assign_solo(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            let body: AssignSoloBody = parse(body)?;
            self.engine
                .balancer
                .assign_solo(body.student_id, body.external_evaluator_id, actor)
                .await
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `POST /evaluators/auto-assign`
    pub async fn auto_assign(&self, actor: Actor, body: Value) -> ApiResponse {
        let result = async {
            let body: TrackBody = if body.is_null() {
                TrackBody::default()
            } else {
                parse(body)?
            };
            self.engine.balancer.auto_assign(body.track, actor).await
        }
        .await;
        ApiResponse::from_result(result)
    }

    /// `POST /evaluators/rebalance`
    pub async fn rebalance(&self, actor: Actor) -> ApiResponse {
        ApiResponse::from_result(self.engine.balancer.rebalance(actor).await)
    }

    /// `GET /evaluators/validate`
    pub async fn validate(&self, track: Option<Track>) -> ApiResponse {
        ApiResponse::from_result(self.engine.balancer.validate_constraints(track).await)
    }

    /// Non-elevated scorers may only write while the matching assessment
    /// window of the student's track is open.
    async fn require_assessment_window(
        &self,
        actor: Actor,
        student_id: Uuid,
        group_id: Option<Uuid>,
        sub_assessment: SubAssessment,
    ) -> Result<()> {
        if actor.role.is_elevated() {
            return Ok(());
        }
        let track = self.engine.evaluations.track_of(student_id, group_id).await?;
        self.engine
            .gate
            .require_open(PhaseKind::Assessment, track, Some(sub_assessment))
            .await
    }
}

fn parse<T: DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(resolve_aliases(body))
        .map_err(|err| EngineError::validation(format!("invalid request body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::models::{Group, GroupStatus, Role, SoloStudent, User};
    use crate::store::{MemoryStore, Store};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;

    struct Fixture {
        engine: Engine,
        clock: Arc<FixedClock>,
        group: Group,
        faculty: Actor,
        examiner: Actor,
        admin: Actor,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 8, 0, 0).unwrap()
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(start()));
        let engine = Engine::new(store.clone(), clock.clone(), EngineConfig::default());

        let faculty = Actor::new(Uuid::new_v4(), Role::Faculty);
        let examiner = Actor::new(Uuid::new_v4(), Role::Faculty);
        store
            .upsert_user(&User {
                id: examiner.id,
                full_name: "Meera Nair".into(),
                email: "meera.nair@univ.edu".into(),
                role: Role::Faculty,
                external_eligible: true,
                created_at: start(),
            })
            .await
            .unwrap();
        let group = Group {
            id: Uuid::new_v4(),
            code: "CAP-03".into(),
            track: Track::Capstone,
            status: GroupStatus::Approved,
            project_id: Some(Uuid::new_v4()),
            internal_faculty_id: Some(faculty.id),
            member_ids: vec![Uuid::new_v4()],
            external_evaluator_id: None,
            created_at: start(),
        };
        store.upsert_group(&group).await.unwrap();

        Fixture {
            engine,
            clock,
            group,
            faculty,
            examiner,
            admin: Actor::new(Uuid::new_v4(), Role::Admin),
        }
    }

    fn window_body(sub: &str, from_days: i64, to_days: i64) -> Value {
        json!({
            "phaseKind": "assessment",
            "track": "CAPSTONE",
            "subAssessment": sub,
            "startsAt": start() + Duration::days(from_days),
            "endsAt": start() + Duration::days(to_days),
        })
    }

    #[tokio::test]
    async fn window_crud_maps_to_statuses() {
        let f = fixture().await;
        let handler = RequestHandler::new(&f.engine);

        let created = handler.create_window(f.admin, window_body("CLA-1", 1, 5)).await;
        assert_eq!(created.status, 201);
        let overlapping = handler.create_window(f.admin, window_body("CLA-1", 5, 9)).await;
        assert_eq!(overlapping.status, 409);
        let backwards = handler.create_window(f.admin, window_body("CLA-2", 5, 1)).await;
        assert_eq!(backwards.status, 400);
        let forbidden = handler.create_window(f.faculty, window_body("CLA-3", 1, 2)).await;
        assert_eq!(forbidden.status, 403);

        let listed = handler.list_windows(WindowQuery::default()).await;
        assert_eq!(listed.body.data.unwrap().as_array().unwrap().len(), 1);

        let missing = handler.delete_window(f.admin, Uuid::new_v4()).await;
        assert_eq!(missing.status, 404);
        assert_eq!(missing.body.error.unwrap().code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn scoring_requires_an_open_assessment_window() {
        let f = fixture().await;
        let handler = RequestHandler::new(&f.engine);
        let body = json!({
            "studentId": f.group.member_ids[0],
            "groupId": f.group.id,
            "component": "cla2",
            "conductScore": 24,
        });

        let closed = handler.internal_score(f.faculty, body.clone()).await;
        assert_eq!(closed.status, 403);
        assert_eq!(closed.body.error.unwrap().code, "WINDOW_CLOSED");

        handler.create_window(f.admin, window_body("CLA-2", 0, 3)).await;
        let open = handler.internal_score(f.faculty, body.clone()).await;
        assert_eq!(open.status, 200);
        assert_eq!(open.body.data.unwrap()["totalInternal"], 12);

        f.clock.advance(Duration::days(4));
        let late = handler.internal_score(f.faculty, body.clone()).await;
        assert_eq!(late.status, 403);

        let admin = handler.internal_score(f.admin, body).await;
        assert_eq!(admin.status, 200);
    }

    #[tokio::test]
    async fn external_flow_through_aliases_and_publication() {
        let f = fixture().await;
        let handler = RequestHandler::new(&f.engine);
        handler.create_window(f.admin, window_body("External", 0, 3)).await;

        let assigned = handler
            .assign(
                f.admin,
                json!({ "groupId": f.group.id, "externalFacultyId": f.examiner.id }),
            )
            .await;
        assert_eq!(assigned.status, 200);

        let scored = handler
            .external_score(
                f.examiner,
                json!({
                    "studentId": f.group.member_ids[0],
                    "groupId": f.group.id,
                    "rawScore": 100,
                }),
            )
            .await;
        assert_eq!(scored.status, 200);
        let record = scored.body.data.unwrap();
        assert_eq!(record["totalExternal"], 50);
        assert_eq!(record["total"], 50);

        let published = handler
            .publish(f.admin, json!({ "recordIds": [record["id"]], "isPublished": true }))
            .await;
        assert_eq!(published.status, 200);

        let frozen = handler
            .external_score(
                f.examiner,
                json!({
                    "studentId": f.group.member_ids[0],
                    "groupId": f.group.id,
                    "rawScore": 10,
                }),
            )
            .await;
        assert_eq!(frozen.status, 409);
        assert_eq!(frozen.body.error.unwrap().code, "RECORD_FROZEN");
    }

    #[tokio::test]
    async fn solo_scores_omit_the_group_id() {
        let f = fixture().await;
        let handler = RequestHandler::new(&f.engine);
        let student = Uuid::new_v4();
        f.engine
            .store
            .upsert_solo_student(&SoloStudent {
                student_id: student,
                track: Track::Capstone,
                project_id: Some(Uuid::new_v4()),
                internal_faculty_id: Some(f.faculty.id),
                external_evaluator_id: None,
                created_at: start(),
            })
            .await
            .unwrap();

        let assigned = handler
            .assign_solo(f.admin, json!({ "studentId": student, "evaluatorId": f.examiner.id }))
            .await;
        assert_eq!(assigned.status, 200);

        let body = json!({ "studentId": student, "rawScore": 80 });
        let closed = handler.external_score(f.examiner, body.clone()).await;
        assert_eq!(closed.body.error.unwrap().code, "WINDOW_CLOSED");

        handler.create_window(f.admin, window_body("External", 0, 3)).await;
        let scored = handler.external_score(f.examiner, body).await;
        assert_eq!(scored.status, 200);
        let record = scored.body.data.unwrap();
        assert_eq!(record["groupId"], Value::Null);
        assert_eq!(record["totalExternal"], 40);
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let f = fixture().await;
        let handler = RequestHandler::new(&f.engine);

        let response = handler
            .internal_score(f.admin, json!({ "studentId": "nope" }))
            .await;
        assert_eq!(response.status, 400);

        let response = handler
            .internal_score(
                f.admin,
                json!({
                    "studentId": f.group.member_ids[0],
                    "groupId": f.group.id,
                    "component": "cla1",
                    "rawScore": 25,
                }),
            )
            .await;
        assert_eq!(response.status, 400);
        assert_eq!(response.body.error.unwrap().code, "RANGE_ERROR");
    }

    #[tokio::test]
    async fn evaluator_endpoints_report_loads() {
        let f = fixture().await;
        let handler = RequestHandler::new(&f.engine);

        let outcome = handler.auto_assign(f.admin, Value::Null).await;
        assert_eq!(outcome.status, 200);
        let data = outcome.body.data.unwrap();
        assert_eq!(data["assigned"].as_array().unwrap().len(), 1);
        assert_eq!(data["loads"][0]["currentLoad"], 1);

        let report = handler.validate(Some(Track::Capstone)).await;
        assert_eq!(report.body.data.unwrap()["isValid"], true);

        let denied = handler.rebalance(f.faculty).await;
        assert_eq!(denied.status, 403);
    }
}
