use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

use evaluation_engine::api::ApiResponse;
use evaluation_engine::clock::SystemClock;
use evaluation_engine::config::EngineConfig;
use evaluation_engine::handlers::{RequestHandler, WindowKeyQuery, WindowQuery};
use evaluation_engine::models::{Actor, InternalComponent, PhaseKind, Role, SubAssessment, Track};
use evaluation_engine::store::PgStore;
use evaluation_engine::{report, roster, Engine};

#[derive(Parser)]
#[command(name = "evaluation-engine")]
#[command(about = "Phase windows, evaluation records and evaluator balancing", long_about = None)]
struct Cli {
    #[command(flatten)]
    actor: ActorArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ActorArgs {
    /// Identity the command acts as; required by every command that writes
    #[arg(long, global = true)]
    actor: Option<Uuid>,
    #[arg(long, global = true, default_value_t = Role::Student)]
    role: Role,
}

impl ActorArgs {
    fn resolve(&self) -> anyhow::Result<Actor> {
        let id = self
            .actor
            .context("--actor is required for commands that change state")?;
        Ok(Actor::new(id, self.role))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small roster and an opening assessment window
    Seed,
    /// Import users, groups and solo students from a roster CSV
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Manage phase windows
    #[command(subcommand)]
    Window(WindowCommand),
    /// Enter component scores
    #[command(subcommand)]
    Score(ScoreCommand),
    /// Publish or unpublish evaluation records
    #[command(group(
        ArgGroup::new("scope")
            .args(["records", "group"])
            .required(true)
            .multiple(false)
    ))]
    Publish {
        #[arg(long = "record")]
        records: Vec<Uuid>,
        /// Every record of this group
        #[arg(long)]
        group: Option<Uuid>,
        #[arg(long)]
        unpublish: bool,
    },
    /// Release a track's grades, optionally for one sub-assessment
    Release {
        #[arg(long)]
        track: Track,
        #[arg(long)]
        sub: Option<SubAssessment>,
    },
    /// Manage external evaluator assignments
    #[command(subcommand)]
    Evaluators(EvaluatorCommand),
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        upcoming: usize,
    },
    /// Run window reconciliation until interrupted
    Reconcile,
}

#[derive(Subcommand)]
enum WindowCommand {
    Create {
        #[arg(long)]
        phase: PhaseKind,
        #[arg(long)]
        track: Track,
        #[arg(long)]
        sub: Option<SubAssessment>,
        #[arg(long)]
        starts: DateTime<Utc>,
        #[arg(long)]
        ends: DateTime<Utc>,
    },
    List {
        #[arg(long)]
        track: Option<Track>,
        #[arg(long)]
        phase: Option<PhaseKind>,
        #[arg(long)]
        active: Option<bool>,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        starts: Option<DateTime<Utc>>,
        #[arg(long)]
        ends: Option<DateTime<Utc>>,
    },
    Delete {
        id: Uuid,
    },
    /// Delete every window that has already ended
    Cleanup,
    Upcoming {
        #[arg(long)]
        track: Option<Track>,
        #[arg(long)]
        limit: Option<usize>,
    },
    IsOpen {
        #[arg(long)]
        phase: PhaseKind,
        #[arg(long)]
        track: Track,
        #[arg(long)]
        sub: Option<SubAssessment>,
    },
}

#[derive(Subcommand)]
enum ScoreCommand {
    Internal {
        #[arg(long)]
        student: Uuid,
        /// Omit for a solo student
        #[arg(long)]
        group: Option<Uuid>,
        #[arg(long)]
        component: InternalComponent,
        #[arg(long)]
        raw: f64,
    },
    External {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        group: Option<Uuid>,
        #[arg(long)]
        raw: f64,
    },
}

#[derive(Subcommand)]
enum EvaluatorCommand {
    /// Eligible evaluators and their current load
    List {
        #[arg(long)]
        track: Option<Track>,
    },
    Assign {
        #[arg(long)]
        group: Uuid,
        #[arg(long)]
        evaluator: Uuid,
    },
    AssignSolo {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        evaluator: Uuid,
    },
    AutoAssign {
        #[arg(long)]
        track: Option<Track>,
    },
    Rebalance,
    Validate {
        #[arg(long)]
        track: Option<Track>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn print_response(response: &ApiResponse) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(response.body.success)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = EngineConfig::from_env()?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let store = PgStore::connect(&database_url, config.db_max_connections).await?;

    if let Commands::InitDb = cli.command {
        store.init_db().await?;
        println!("Schema ready.");
        return Ok(());
    }

    let engine = Engine::new(Arc::new(store), Arc::new(SystemClock), config);
    let acting = &cli.actor;
    let handler = RequestHandler::new(&engine);

    let response = match cli.command {
        Commands::InitDb => return Ok(()),
        Commands::Seed => {
            let summary = roster::seed(&engine, acting.resolve()?.id).await?;
            println!(
                "Seeded {} users, {} groups, {} solo students.",
                summary.users, summary.groups, summary.solo_students
            );
            return Ok(());
        }
        Commands::Import { csv } => {
            let summary =
                roster::import_csv(engine.store.as_ref(), &csv, engine.gate.now()).await?;
            println!(
                "Imported {} users, {} groups, {} solo students from {}.",
                summary.users,
                summary.groups,
                summary.solo_students,
                csv.display()
            );
            return Ok(());
        }
        Commands::Report { out, upcoming } => {
            let data = report::collect(&engine, upcoming).await?;
            std::fs::write(&out, report::build_report(&data))?;
            println!("Report written to {}.", out.display());
            return Ok(());
        }
        Commands::Reconcile => {
            let scheduler = engine.scheduler();
            scheduler.start();
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            scheduler.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&scheduler.status())?);
            return Ok(());
        }
        Commands::Window(command) => run_window(&handler, acting, command).await?,
        Commands::Score(command) => match command {
            ScoreCommand::Internal {
                student,
                group,
                component,
                raw,
            } => {
                let body = json!({
                    "studentId": student,
                    "groupId": group,
                    "component": component,
                    "rawScore": raw,
                });
                handler.internal_score(acting.resolve()?, body).await
            }
            ScoreCommand::External {
                student,
                group,
                raw,
            } => {
                let body = json!({ "studentId": student, "groupId": group, "rawScore": raw });
                handler.external_score(acting.resolve()?, body).await
            }
        },
        Commands::Publish {
            records,
            group,
            unpublish,
        } => {
            let actor = acting.resolve()?;
            let record_ids = match group {
                Some(group_id) => match engine.evaluations.list_for_group(group_id).await {
                    Ok(found) => found.into_iter().map(|record| record.id).collect(),
                    Err(err) => {
                        print_response(&ApiResponse::error(&err))?;
                        std::process::exit(1);
                    }
                },
                None => records,
            };
            let body = json!({ "recordIds": record_ids, "isPublished": !unpublish });
            handler.publish(actor, body).await
        }
        Commands::Release { track, sub } => {
            let body = json!({ "track": track, "subAssessment": sub });
            handler.release(acting.resolve()?, body).await
        }
        Commands::Evaluators(command) => match command {
            EvaluatorCommand::List { track } => handler.list_evaluators(track).await,
            EvaluatorCommand::Assign { group, evaluator } => {
                let body = json!({ "groupId": group, "externalEvaluatorId": evaluator });
                handler.assign(acting.resolve()?, body).await
            }
            EvaluatorCommand::AssignSolo { student, evaluator } => {
                let body = json!({ "studentId": student, "externalEvaluatorId": evaluator });
                handler.assign_solo(acting.resolve()?, body).await
            }
            EvaluatorCommand::AutoAssign { track } => {
                let body = json!({ "track": track });
                handler.auto_assign(acting.resolve()?, body).await
            }
            EvaluatorCommand::Rebalance => handler.rebalance(acting.resolve()?).await,
            EvaluatorCommand::Validate { track } => handler.validate(track).await,
        },
    };

    if !print_response(&response)? {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_window(
    handler: &RequestHandler<'_>,
    acting: &ActorArgs,
    command: WindowCommand,
) -> anyhow::Result<ApiResponse> {
    let response = match command {
        WindowCommand::Create {
            phase,
            track,
            sub,
            starts,
            ends,
        } => {
            let body = json!({
                "phaseKind": phase,
                "track": track,
                "subAssessment": sub,
                "startsAt": starts,
                "endsAt": ends,
            });
            handler.create_window(acting.resolve()?, body).await
        }
        WindowCommand::List {
            track,
            phase,
            active,
        } => {
            let query = WindowQuery {
                track,
                phase_kind: phase,
                is_active: active,
            };
            handler.list_windows(query).await
        }
        WindowCommand::Update { id, starts, ends } => {
            let body: Value = json!({ "startsAt": starts, "endsAt": ends });
            handler.update_window(acting.resolve()?, id, body).await
        }
        WindowCommand::Delete { id } => handler.delete_window(acting.resolve()?, id).await,
        WindowCommand::Cleanup => handler.delete_expired_windows(acting.resolve()?).await,
        WindowCommand::Upcoming { track, limit } => handler.list_upcoming(track, limit).await,
        WindowCommand::IsOpen { phase, track, sub } => {
            let query = WindowKeyQuery {
                phase_kind: phase,
                track,
                sub_assessment: sub,
            };
            handler.window_status(query).await
        }
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_defaults_to_least_privilege() {
        let cli = Cli::try_parse_from(["evaluation-engine", "evaluators", "list"]).unwrap();
        assert_eq!(cli.actor.role, Role::Student);
        assert!(cli.actor.actor.is_none());
        assert!(cli.actor.resolve().is_err());
    }

    #[test]
    fn actor_and_role_resolve_after_the_subcommand() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "evaluation-engine",
            "release",
            "--track",
            "IDP",
            "--actor",
            &id.to_string(),
            "--role",
            "coordinator",
        ])
        .unwrap();
        let actor = cli.actor.resolve().unwrap();
        assert_eq!(actor, Actor::new(id, Role::Coordinator));
    }

    #[test]
    fn solo_scores_take_no_group() {
        let cli = Cli::try_parse_from([
            "evaluation-engine",
            "score",
            "external",
            "--student",
            &Uuid::new_v4().to_string(),
            "--raw",
            "72",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Score(ScoreCommand::External { group: None, .. })
        ));
    }
}
