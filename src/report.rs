use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{EvaluationRecord, EvaluationStage, EvaluatorLoad, Track, Window};
use crate::store::WindowFilter;
use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackProgress {
    pub track: Track,
    pub unscored: usize,
    pub partially_scored: usize,
    pub fully_scored: usize,
    pub published: usize,
}

impl TrackProgress {
    pub fn total(&self) -> usize {
        self.unscored + self.partially_scored + self.fully_scored + self.published
    }
}

#[derive(Debug, Clone)]
pub struct ReportData {
    pub generated_at: DateTime<Utc>,
    pub open_windows: Vec<Window>,
    pub upcoming_windows: Vec<Window>,
    pub loads: Vec<EvaluatorLoad>,
    pub progress: Vec<TrackProgress>,
}

pub fn summarize_stages(track: Track, records: &[EvaluationRecord]) -> TrackProgress {
    let mut progress = TrackProgress {
        track,
        unscored: 0,
        partially_scored: 0,
        fully_scored: 0,
        published: 0,
    };
    for record in records {
        match record.stage() {
            EvaluationStage::Unscored => progress.unscored += 1,
            EvaluationStage::PartiallyScored => progress.partially_scored += 1,
            EvaluationStage::FullyScored => progress.fully_scored += 1,
            EvaluationStage::Published => progress.published += 1,
        }
    }
    progress
}

pub async fn collect(engine: &Engine, upcoming_limit: usize) -> Result<ReportData> {
    let open_windows = engine
        .gate
        .list(&WindowFilter {
            is_active: Some(true),
            ..WindowFilter::default()
        })
        .await?;
    let upcoming_windows = engine.gate.list_upcoming(None, Some(upcoming_limit)).await?;
    let loads = engine.balancer.list_assignable(None).await?;

    let mut progress = Vec::with_capacity(Track::ALL.len());
    for &track in Track::ALL {
        let records = engine.evaluations.list_for_track(track).await?;
        progress.push(summarize_stages(track, &records));
    }

    Ok(ReportData {
        generated_at: engine.gate.now(),
        open_windows,
        upcoming_windows,
        loads,
        progress,
    })
}

fn window_line(output: &mut String, window: &Window) {
    let _ = writeln!(
        output,
        "- {}: {} to {}",
        window.key(),
        window.starts_at.format("%Y-%m-%d %H:%M"),
        window.ends_at.format("%Y-%m-%d %H:%M")
    );
}

pub fn build_report(data: &ReportData) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Evaluation Engine Report");
    let _ = writeln!(
        output,
        "Generated {}",
        data.generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Open Windows");

    if data.open_windows.is_empty() {
        let _ = writeln!(output, "No windows are open right now.");
    } else {
        for window in &data.open_windows {
            window_line(&mut output, window);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Upcoming Windows");

    if data.upcoming_windows.is_empty() {
        let _ = writeln!(output, "Nothing scheduled.");
    } else {
        for window in &data.upcoming_windows {
            window_line(&mut output, window);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## External Evaluator Load");

    if data.loads.is_empty() {
        let _ = writeln!(output, "No eligible external evaluators.");
    } else {
        let _ = writeln!(output, "| Evaluator | Assigned |");
        let _ = writeln!(output, "|---|---|");
        for load in &data.loads {
            let _ = writeln!(output, "| {} | {} |", load.full_name, load.current_load);
        }
        let max = data.loads.iter().map(|l| l.current_load).max().unwrap_or(0);
        let min = data.loads.iter().map(|l| l.current_load).min().unwrap_or(0);
        let _ = writeln!(output);
        let _ = writeln!(output, "Load gap: {}", max - min);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Publication Progress");
    let _ = writeln!(
        output,
        "| Track | Records | Unscored | Partial | Fully scored | Published |"
    );
    let _ = writeln!(output, "|---|---|---|---|---|---|");
    for progress in &data.progress {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} |",
            progress.track,
            progress.total(),
            progress.unscored,
            progress.partially_scored,
            progress.fully_scored,
            progress.published
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentScore, PhaseKind, SubAssessment};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).unwrap()
    }

    fn record(scored: usize, published: bool) -> EvaluationRecord {
        let score = Some(ComponentScore {
            raw_score: 10.0,
            converted_score: 5,
        });
        let mut slots = [None; 4];
        for slot in slots.iter_mut().take(scored) {
            *slot = score;
        }
        let [cla1, cla2, cla3, external] = slots;
        EvaluationRecord {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            group_id: None,
            project_id: Uuid::new_v4(),
            internal_evaluator_id: Uuid::new_v4(),
            external_evaluator_id: None,
            cla1,
            cla2,
            cla3,
            external,
            total_internal: 0,
            total_external: 0,
            total: 0,
            is_published: published,
            published_at: None,
            published_by: None,
            created_at: at(1),
            updated_at: at(1),
        }
    }

    #[test]
    fn stages_are_counted_per_record() {
        let records = vec![
            record(0, false),
            record(2, false),
            record(4, false),
            record(4, true),
            record(1, false),
        ];
        let progress = summarize_stages(Track::Urop, &records);
        assert_eq!(progress.unscored, 1);
        assert_eq!(progress.partially_scored, 2);
        assert_eq!(progress.fully_scored, 1);
        assert_eq!(progress.published, 1);
        assert_eq!(progress.total(), 5);
    }

    #[test]
    fn report_lists_every_section() {
        let window = Window {
            id: Uuid::new_v4(),
            phase_kind: PhaseKind::Assessment,
            track: Track::Idp,
            sub_assessment: Some(SubAssessment::Cla2),
            starts_at: at(2),
            ends_at: at(9),
            is_active: true,
            created_by: Uuid::new_v4(),
            created_at: at(1),
            updated_at: at(1),
        };
        let data = ReportData {
            generated_at: at(3),
            open_windows: vec![window],
            upcoming_windows: Vec::new(),
            loads: vec![
                EvaluatorLoad {
                    evaluator_id: Uuid::new_v4(),
                    full_name: "Anita Rao".into(),
                    current_load: 3,
                },
                EvaluatorLoad {
                    evaluator_id: Uuid::new_v4(),
                    full_name: "Vikram Iyer".into(),
                    current_load: 2,
                },
            ],
            progress: vec![summarize_stages(Track::Idp, &[record(4, true)])],
        };

        let report = build_report(&data);
        assert!(report.contains("- IDP assessment (CLA-2): 2026-03-02 09:00 to 2026-03-09 09:00"));
        assert!(report.contains("Nothing scheduled."));
        assert!(report.contains("| Anita Rao | 3 |"));
        assert!(report.contains("Load gap: 1"));
        assert!(report.contains("| IDP | 1 | 0 | 0 | 0 | 1 |"));
    }
}
