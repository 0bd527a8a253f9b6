use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use contact_tracer::{
    api,
    config::Settings,
    db,
    models::{normalize_email, Role},
    shutdown_signal,
    state::State,
    tasks::{Sender, Task, TaskEnvelope},
    traversal::{calculate_interaction_risks, TierPlan},
    worker::{run_group, Worker},
};

#[derive(Parser)]
#[command(name = "cohort-contact-tracer")]
#[command(about = "Contact tracing and risk notification for school cohorts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Serve the HTTP API
    Serve,
    /// Run task workers until interrupted
    Worker,
    /// Print the risk tiers around a member without sending mail
    Traverse {
        #[arg(long)]
        school: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        lookback_days: Option<u32>,
    },
    /// Print today's entry decision for a member
    Classify {
        #[arg(long)]
        school: String,
        #[arg(long)]
        email: String,
    },
    /// Queue the daily digest for a school
    EnqueueDigest {
        #[arg(long)]
        school: String,
    },
    /// Run a JSON array of admin tasks as one group, without the queue
    Bulk {
        #[arg(long)]
        school: String,
        #[arg(long)]
        admin_email: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Revoke a queued task that has not started
    Revoke {
        #[arg(long)]
        task_id: Uuid,
    },
}

fn system_sender(school: &str, email: &str) -> Sender {
    Sender {
        email: normalize_email(email),
        school: school.to_string(),
        first_name: String::new(),
        last_name: String::new(),
        role: Role::Admin,
        impersonator: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let state = State::new(settings).await?;
    let ctx = state.tasks.clone();

    match cli.command {
        Commands::InitDb => {
            db::init_db(&state.pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&state.pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Serve => {
            api::serve(ctx, state.settings.port, shutdown_signal()).await?;
        }
        Commands::Worker => {
            let token = CancellationToken::new();
            let trigger = token.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                trigger.cancel();
            });

            let worker = Arc::new(Worker::new(ctx, state.settings.worker_poll));
            worker
                .run(state.settings.worker_concurrency, token)
                .await;
        }
        Commands::Traverse {
            school,
            email,
            lookback_days,
        } => {
            let email = normalize_email(&email);
            let member = ctx
                .store
                .find_member(&school, &email)
                .await?
                .with_context(|| format!("{email} is not enrolled at {school}"))?;
            let settings = ctx.secrets.risk_notification(&school).await?;
            let plan = match settings.tiers {
                Some(tiers) => TierPlan::new(tiers)?,
                None => TierPlan::default(),
            };
            let lookback_days = lookback_days.unwrap_or(settings.lookback_days);

            let tiers = calculate_interaction_risks(
                ctx.store.as_ref(),
                &member,
                lookback_days,
                &plan,
                settings.cohort_policy,
                Utc::now(),
            )
            .await?;

            println!(
                "Contacts of {} over the last {} days:",
                member.display_name(),
                lookback_days
            );
            for tier in &tiers.tiers {
                println!(
                    "{} ({}): {} contacts",
                    tier.tier.label,
                    tier.tier.name,
                    tier.contacts.len()
                );
                for contact in &tier.contacts {
                    println!("- {} ({})", contact.name, contact.email);
                }
            }
        }
        Commands::Classify { school, email } => {
            let email = normalize_email(&email);
            let member = ctx
                .store
                .find_member(&school, &email)
                .await?
                .with_context(|| format!("{email} is not enrolled at {school}"))?;
            let decision = api::entry_decision(&ctx, &member).await?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::EnqueueDigest { school } => {
            let sender = system_sender(&school, &format!("scheduler@{school}"));
            let id = ctx
                .queue
                .enqueue(&TaskEnvelope::new(sender, Task::DailyDigest))
                .await?;
            println!("Queued daily digest for {school} as {id}.");
        }
        Commands::Bulk {
            school,
            admin_email,
            file,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let tasks: Vec<Task> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a list of tasks", file.display()))?;

            let sender = system_sender(&school, &admin_email);
            let report = run_group(&ctx, &sender, tasks).await;
            println!(
                "{} tasks completed, {} abandoned.",
                report.completed, report.abandoned
            );
        }
        Commands::Revoke { task_id } => {
            if ctx.queue.revoke(task_id).await? {
                println!("Revoked {task_id}.");
            } else {
                let current = ctx.queue.state(task_id).await?;
                println!(
                    "Nothing to revoke for {task_id} (state: {}).",
                    current.map(|s| s.as_str()).unwrap_or("unknown")
                );
            }
        }
    }

    Ok(())
}
