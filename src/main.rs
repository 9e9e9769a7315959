use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use apipatrol::config::AppConfig;
use apipatrol::model::{unix_time, Timer, TimerStatus};
use apipatrol::notify::LogNotifier;
use apipatrol::runner::RunOrchestrator;
use apipatrol::sandbox::Sandbox;
use apipatrol::storage::{Persistence, SqliteStore};
use apipatrol::transport::HttpTransport;

#[derive(Parser)]
#[command(
    name = "apipatrol",
    about = "Scheduled HTTP API test automation daemon",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + cron scheduler)
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Database path (overrides config)
        #[arg(long)]
        db: Option<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run one timer's collection immediately and print the report
    Run {
        /// Timer id
        #[arg(long)]
        timer: i64,

        /// Database path
        #[arg(long, default_value = "data/apipatrol.db")]
        db: String,
    },

    /// Manage timers
    Timer {
        #[command(subcommand)]
        action: TimerAction,
    },

    /// Inspect run reports
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },
}

#[derive(Subcommand)]
enum TimerAction {
    /// List a project's timers
    List {
        /// Project id
        #[arg(long)]
        project: i64,

        /// Database path
        #[arg(long, default_value = "data/apipatrol.db")]
        db: String,
    },

    /// Add a new timer
    Add {
        /// Timer name
        #[arg(long)]
        name: String,

        /// Project id
        #[arg(long)]
        project: i64,

        /// Collection id
        #[arg(long)]
        col: i64,

        /// Cron expression (5- or 6-field)
        #[arg(long)]
        cron: String,

        /// Environment name (defaults to the project's first environment)
        #[arg(long, default_value = "")]
        env: String,

        /// Notify on failure
        #[arg(long)]
        notice: bool,

        /// Database path
        #[arg(long, default_value = "data/apipatrol.db")]
        db: String,
    },

    /// Remove a timer
    Remove {
        /// Timer id
        #[arg(long)]
        id: i64,

        /// Database path
        #[arg(long, default_value = "data/apipatrol.db")]
        db: String,
    },
}

#[derive(Subcommand)]
enum ReportAction {
    /// List a project's reports, newest first
    List {
        /// Project id
        #[arg(long)]
        project: i64,

        /// Page size
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Page number
        #[arg(long, default_value = "1")]
        page: u32,

        /// Database path
        #[arg(long, default_value = "data/apipatrol.db")]
        db: String,
    },
}

fn open_store(db: &str) -> Result<SqliteStore> {
    let pool = apipatrol::storage::open_pool(db)?;
    Ok(SqliteStore::new(pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, db, config } => {
            let mut config = AppConfig::load_or_default(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            tracing::info!(bind = %config.bind, "Starting apipatrol daemon");
            apipatrol::serve(config).await?;
        }
        Commands::Run { timer, db } => {
            let store = Arc::new(open_store(&db)?);
            let Some(timer) = store.load_timer(timer).await? else {
                anyhow::bail!("timer {} not found", timer);
            };

            let sandbox = Sandbox::default();
            let orchestrator = RunOrchestrator::new(
                store,
                Arc::new(HttpTransport::new(sandbox.clone())),
                Arc::new(LogNotifier),
                sandbox,
            );

            match orchestrator.run_task(&timer).await? {
                Some(report) => {
                    println!("\nRun report for timer '{}'", timer.name);
                    println!("{:<25} | {:<6} | {:<8} | Messages", "Case", "Code", "Time(ms)");
                    println!("{:-<25}-|-{:-<6}-|-{:-<8}-|-{:-<40}", "", "", "", "");
                    for record in &report.test_list {
                        let messages: Vec<&str> = record
                            .valid_res
                            .iter()
                            .map(|m| m.message.as_str())
                            .collect();
                        println!(
                            "{:<25} | {:<6} | {:<8} | {}",
                            record.name,
                            record.code,
                            record.run_time,
                            messages.join("; ")
                        );
                    }
                    println!("\nStatus: {}\n", report.status);
                }
                None => {
                    println!("Run aborted: collection, project, or environments missing.");
                }
            }
        }
        Commands::Timer { action } => match action {
            TimerAction::List { project, db } => {
                let store = open_store(&db)?;
                let timers = store.list_timers(project).await?;
                if timers.is_empty() {
                    println!("No timers found.");
                } else {
                    println!(
                        "{:<6} | {:<20} | {:<15} | {:<8} | Env",
                        "Id", "Name", "Cron", "Status"
                    );
                    println!("{:-<6}-|-{:-<20}-|-{:-<15}-|-{:-<8}-|-{:-<10}", "", "", "", "", "");
                    for t in timers {
                        println!(
                            "{:<6} | {:<20} | {:<15} | {:<8} | {}",
                            t.id, t.name, t.cron_expression, t.status, t.env
                        );
                    }
                }
            }
            TimerAction::Add {
                name,
                project,
                col,
                cron,
                env,
                notice,
                db,
            } => {
                apipatrol::scheduler::parse_cron(&cron)?;
                let store = open_store(&db)?;
                let now = unix_time();
                let timer = Timer {
                    id: 0,
                    name: name.clone(),
                    project_id: project,
                    col_id: col,
                    env,
                    cron_expression: cron,
                    status: TimerStatus::Open,
                    notice,
                    uid: 0,
                    add_time: now,
                    up_time: now,
                };
                let id = store.save_timer(&timer).await?;
                println!(
                    "Timer '{}' added (id {}). A running daemon registers it at next start; \
                     use the API to activate it immediately.",
                    name, id
                );
            }
            TimerAction::Remove { id, db } => {
                let store = open_store(&db)?;
                store.delete_timer(id).await?;
                println!("Timer {} removed.", id);
            }
        },
        Commands::Report { action } => match action {
            ReportAction::List {
                project,
                limit,
                page,
                db,
            } => {
                let store = open_store(&db)?;
                let reports = store.list_reports(project, limit, page).await?;
                if reports.is_empty() {
                    println!("No reports found.");
                } else {
                    println!(
                        "{:<6} | {:<8} | {:<12} | {:<6} | Time",
                        "Id", "Status", "Env", "Cases"
                    );
                    println!("{:-<6}-|-{:-<8}-|-{:-<12}-|-{:-<6}-|-{:-<25}", "", "", "", "", "");
                    for r in reports {
                        let time = chrono::DateTime::from_timestamp(r.report.add_time, 0)
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default();
                        println!(
                            "{:<6} | {:<8} | {:<12} | {:<6} | {}",
                            r.id,
                            r.report.status,
                            r.report.env,
                            r.report.test_list.len(),
                            time
                        );
                    }
                }
            }
        },
    }

    Ok(())
}
