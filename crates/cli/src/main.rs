//! Foreman CLI
//!
//! Operator front-end over `foreman_core`: inspect and reset the mode
//! registry, check ownership for a section plan, run the validation gate,
//! request audited bypasses, and review crystallization candidates.
//!
//! Command output is JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use foreman_core::config::ForemanConfig;
use foreman_core::ownership::{build_ownership_map_with, EnforcementContext};
use foreman_core::patterns::{CandidateStatus, NewObservation, Outcome, PatternCrystallizer};
use foreman_core::state::{EnterContext, ForemanDb, Mode, ModeRegistry, RuntimePaths};
use foreman_core::swarm::{Section, SectionPlan};
use foreman_core::validation::{
    BypassRequest, CheckKind, CommandCheckRunner, ValidationGate, ValidationSession,
};

#[derive(Parser)]
#[command(author, version, about = "Foreman - coordination for parallel coding agents")]
struct Args {
    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Create the runtime directory with a default config
    Init,
    /// Inspect or change the session mode
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },
    /// Ownership map for a section plan
    Ownership {
        #[command(subcommand)]
        action: OwnershipAction,
    },
    /// Run the validation gate
    Validate {
        #[arg(long)]
        session: String,
        #[arg(long)]
        section: Option<String>,
    },
    /// Complete without passing validation; written to the audit log
    Bypass {
        #[arg(long)]
        session: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        acknowledge_risk: bool,
        /// Checks being bypassed (defaults to every required check)
        #[arg(long = "check")]
        checks: Vec<String>,
        #[arg(long)]
        section: Option<String>,
    },
    /// Observations, candidates, and skills
    Patterns {
        #[command(subcommand)]
        action: PatternAction,
    },
    /// Print the validation audit log
    Audit,
}

#[derive(Subcommand)]
enum ModeAction {
    Status,
    Enter {
        mode: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    Exit,
    /// Return to idle unconditionally
    Reset,
}

#[derive(Subcommand)]
enum OwnershipAction {
    /// Build and print the map
    Map {
        /// JSON file holding an array of sections
        #[arg(long)]
        plan: PathBuf,
    },
    /// Check one path against a section's boundary
    Check {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        section: String,
        path: String,
        /// Check an import instead of a write
        #[arg(long)]
        import: bool,
    },
}

#[derive(Subcommand)]
enum PatternAction {
    /// Record a completed tool sequence
    Record {
        #[arg(long)]
        session: String,
        /// Comma-separated tool names, in order
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
        #[arg(long, default_value = "")]
        goal: String,
        #[arg(long, default_value = "success")]
        outcome: String,
    },
    Candidates {
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    Approve {
        id: String,
    },
    Reject {
        id: String,
    },
    Skills {
        /// Only skills due for re-review
        #[arg(long)]
        expired: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Candidate,
    Approved,
    Rejected,
}

impl From<StatusFilter> for CandidateStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Candidate => CandidateStatus::Candidate,
            StatusFilter::Approved => CandidateStatus::Approved,
            StatusFilter::Rejected => CandidateStatus::Rejected,
        }
    }
}

/// Filter from `FOREMAN_LOG`, then `RUST_LOG`, else `info`; stderr only
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("FOREMAN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_plan(path: &Path) -> Result<SectionPlan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read section plan: {:?}", path))?;
    let sections: Vec<Section> =
        serde_json::from_str(&content).context("Section plan must be a JSON array of sections")?;
    Ok(SectionPlan::new(sections)?)
}

fn open_crystallizer(paths: &RuntimePaths, config: &ForemanConfig) -> Result<PatternCrystallizer> {
    let db = ForemanDb::open(paths)?;
    Ok(PatternCrystallizer::open(&db, config.patterns.clone())?)
}

fn open_gate(paths: &RuntimePaths, config: &ForemanConfig) -> Result<ValidationGate> {
    let runner = Arc::new(CommandCheckRunner::from_config(&config.checks));
    Ok(ValidationGate::from_config(paths, config, runner)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = RuntimePaths::from_env(&args.workspace);
    let _ = dotenvy::from_path(paths.runtime_dir().join(".env"));
    let paths = RuntimePaths::from_env(&args.workspace);

    init_tracing();
    let config = ForemanConfig::load(&paths);

    match args.command {
        CliCommand::Init => {
            let dir = paths.ensure_runtime_dir()?;
            let gitignore = dir.join(".gitignore");
            if !gitignore.exists() {
                std::fs::write(&gitignore, "# Never commit secrets\n.env\n*.env\n*.db\n")
                    .context("Failed to write .gitignore")?;
            }
            config.save(&paths)?;
            tracing::info!(path = %dir.display(), "Runtime directory initialized");
            print_json(&config)?;
        }

        CliCommand::Mode { action } => {
            let registry = ModeRegistry::open(&paths);
            let state = match action {
                ModeAction::Status => registry.get_state().await,
                ModeAction::Enter {
                    mode,
                    project,
                    session,
                } => {
                    let mode: Mode = mode.parse().map_err(anyhow::Error::msg)?;
                    let mut ctx = EnterContext::new();
                    if let Some(project) = &project {
                        ctx = ctx.project(project);
                    }
                    if let Some(session) = &session {
                        ctx = ctx.session(session);
                    }
                    registry.enter(mode, &ctx).await?
                }
                ModeAction::Exit => registry.exit().await?,
                ModeAction::Reset => registry.force_reset().await?,
            };
            print_json(&state)?;
        }

        CliCommand::Ownership { action } => match action {
            OwnershipAction::Map { plan } => {
                let plan = load_plan(&plan)?;
                let map = build_ownership_map_with(&plan.claims(), &config.ownership.shared_patterns);
                print_json(&map)?;
                map.validate()?;
            }
            OwnershipAction::Check {
                plan,
                section,
                path,
                import,
            } => {
                let plan = load_plan(&plan)?;
                let map = build_ownership_map_with(&plan.claims(), &config.ownership.shared_patterns);
                let ctx = EnforcementContext::new(section, Arc::new(map));
                let result = if import {
                    ctx.check_import_permission(&path)
                } else {
                    ctx.check_write_permission(&path)
                };
                print_json(&result)?;
            }
        },

        CliCommand::Validate { session, section } => {
            let gate = open_gate(&paths, &config)?;
            let mut request = ValidationSession::new(session, paths.workspace());
            if let Some(section) = section {
                request = request.for_section(section);
            }
            let outcome = gate.validate_completion(&request).await?;
            print_json(&outcome)?;
        }

        CliCommand::Bypass {
            session,
            user,
            reason,
            acknowledge_risk,
            checks,
            section,
        } => {
            let checks = checks
                .iter()
                .map(|c| c.parse::<CheckKind>().map_err(anyhow::Error::msg))
                .collect::<Result<Vec<_>>>()?;
            let gate = open_gate(&paths, &config)?;
            let outcome = gate
                .request_validation_bypass(
                    &session,
                    BypassRequest {
                        user,
                        reason,
                        acknowledge_risk,
                        checks,
                        section_id: section,
                    },
                )
                .await?;
            print_json(&outcome)?;
        }

        CliCommand::Patterns { action } => {
            let crystallizer = open_crystallizer(&paths, &config)?;
            match action {
                PatternAction::Record {
                    session,
                    tools,
                    goal,
                    outcome,
                } => {
                    let outcome: Outcome = outcome.parse().map_err(anyhow::Error::msg)?;
                    let recorded = crystallizer
                        .record_observation(NewObservation {
                            session_id: session,
                            tool_sequence: tools,
                            goal_summary: goal,
                            outcome,
                            timestamp: Utc::now(),
                        })
                        .await?;
                    // Released on a later run once the quarantine delay has passed.
                    recorded.release.abort();
                    print_json(&serde_json::json!({
                        "id": recorded.id,
                        "signature": recorded.signature,
                        "quarantineSecs": config.patterns.quarantine_secs,
                    }))?;
                }
                PatternAction::Candidates { status } => {
                    print_json(&crystallizer.candidates(status.map(Into::into))?)?;
                }
                PatternAction::Approve { id } => {
                    print_json(&crystallizer.approve_candidate(&id)?)?;
                }
                PatternAction::Reject { id } => {
                    print_json(&crystallizer.reject_candidate(&id)?)?;
                }
                PatternAction::Skills { expired } => {
                    let skills = if expired {
                        crystallizer.expired_skills(Utc::now())?
                    } else {
                        crystallizer.skills().list()?
                    };
                    print_json(&skills)?;
                }
            }
        }

        CliCommand::Audit => {
            let gate = open_gate(&paths, &config)?;
            print_json(&gate.audit().read_all().await?)?;
        }
    }

    Ok(())
}
