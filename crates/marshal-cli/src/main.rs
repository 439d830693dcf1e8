use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use marshal_core::config::PipelineConfig;
use marshal_core::flow::{FlowName, FlowSet};
use marshal_core::project::{NewProject, ProjectId};
use marshal_core::result::WorkerResult;
use marshal_core::role::RoleName;
use marshal_core::store::{NewTask, TaskFilter, TaskStore};
use marshal_core::task::{Queue, Task, TaskId};
use marshal_core::telemetry::{TelemetryConfig, init_telemetry};
use marshal_runner::engine::{EngineLimits, FlowEngine};
use marshal_runner::event_bus::{EventBus, spawn_jsonl_log};
use marshal_runner::housekeeping::{Reconciler, Sweeper};
use marshal_runner::http_store::HttpTaskStore;
use marshal_runner::review::GhReviewProvider;
use marshal_runner::scheduler::Scheduler;
use marshal_runner::steps::StepRegistry;
use marshal_runner::worktree::{Workspace, WorkspaceOwner, WorktreeManager};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "marshal", about = "Control plane for LLM coding workers")]
struct Cli {
    /// Path to the local task database.
    #[arg(long, default_value = "marshal.redb")]
    db: PathBuf,

    /// Path to pipeline.toml (scheduler, workspace, roles, checks, flows).
    #[arg(long, default_value = "configs/pipeline.toml")]
    config: PathBuf,

    /// Use a remote task store served by `marshal serve` instead of --db.
    #[arg(long)]
    store_url: Option<String>,

    /// Directory for span trace files.
    #[arg(long, default_value = "traces")]
    trace_dir: PathBuf,

    /// OTLP endpoint for OpenTelemetry export (e.g., "http://localhost:4317").
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Output JSON-structured logs to console.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl+C.
    Run {
        /// Also serve the task store API on this address.
        #[arg(long)]
        serve: Option<String>,
    },
    /// Serve the local task store over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7420")]
        bind: String,
    },
    /// Manage tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Inspect flows.
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Archive, remove and discard what finished tasks left behind, once.
    Sweep,
    /// Requeue expired and orphaned claims, once. Only safe while no
    /// scheduler is running against the same store.
    Reconcile,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Add a task to its flow's initial queue.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "implementer")]
        role: RoleName,
        #[arg(long, default_value = "")]
        desc: String,
        #[arg(long)]
        flow: Option<String>,
        #[arg(long)]
        project: Option<ProjectId>,
        /// Working branch; defaults to the project's or a private one.
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        base: Option<String>,
        #[arg(long, default_value = "0")]
        priority: i32,
        #[arg(long)]
        blocked_by: Option<TaskId>,
    },
    List {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        role: Option<RoleName>,
        #[arg(long)]
        project: Option<ProjectId>,
    },
    Show { id: TaskId },
    /// Move a task back to its flow's initial queue, dropping any claim.
    Reset {
        id: TaskId,
        #[arg(long, default_value = "manual reset")]
        reason: String,
    },
    /// Record an approving decision on a gated task.
    Approve {
        id: TaskId,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Record a rejecting decision; the feedback reaches the next claimant.
    Reject {
        id: TaskId,
        #[arg(long)]
        feedback: String,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    Add {
        #[arg(long)]
        name: String,
        /// Branch shared by all of the project's tasks, which then run in order.
        #[arg(long)]
        shared_branch: Option<String>,
        #[arg(long, default_value = "main")]
        base: String,
    },
    List,
}

#[derive(Subcommand)]
enum FlowAction {
    /// Validate the config and print every flow.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry_config = TelemetryConfig {
        service_name: "marshal".into(),
        otlp_endpoint: cli.otlp_endpoint.clone(),
        json_logs: cli.json_logs,
        log_filter: "marshal=info".into(),
        trace_dir: Some(cli.trace_dir.clone()),
    };
    let _telemetry_guard = init_telemetry(&telemetry_config)?;

    let mut config = PipelineConfig::load(&cli.config)?;
    let cwd = std::env::current_dir()?;
    config.workspace = config.workspace.clone().resolve_against(&cwd);
    let flows = Arc::new(config.flow_set()?);

    match cli.command {
        Commands::Flow {
            action: FlowAction::Check,
        } => {
            print_flows(&flows);
            Ok(())
        }
        Commands::Serve { bind } => {
            let state = Arc::new(marshal_api::ApiState::open(&cli.db)?);
            marshal_api::serve(state, &bind, shutdown_on_ctrl_c()).await
        }
        command => {
            let store = open_store(cli.store_url.as_deref(), &cli.db)?;
            match command {
                Commands::Run { serve } => cmd_run(&config, flows, store, serve).await,
                Commands::Task { action } => cmd_task(&config, flows, store, action).await,
                Commands::Project { action } => cmd_project(store.as_ref(), action).await,
                Commands::Sweep => cmd_sweep(&config, store).await,
                Commands::Reconcile => cmd_reconcile(&config, flows, store).await,
                Commands::Flow { .. } | Commands::Serve { .. } => Ok(()),
            }
        }
    }
}

fn open_store(store_url: Option<&str>, db: &Path) -> Result<Arc<dyn TaskStore>> {
    match store_url {
        Some(url) => {
            tracing::info!(url = %url, "using remote task store");
            Ok(Arc::new(HttpTaskStore::new(url)?))
        }
        None => Ok(Arc::new(marshal_db::RedbStore::open(db).context(format!(
            "failed to open task database {}",
            db.display()
        ))?)),
    }
}

/// The workspace a task's worker used, if it still has one.
async fn workspace_of(
    store: &dyn TaskStore,
    worktrees: &WorktreeManager,
    task: &Task,
) -> Option<Workspace> {
    let project = match task.project {
        Some(id) => store.get_project(id).await.ok(),
        None => None,
    };
    let owner = WorkspaceOwner::for_task(task, project.as_ref());
    worktrees.binding(owner).ok().flatten()
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
            token.cancel();
        }
    });
    shutdown
}

fn build_engine(
    config: &PipelineConfig,
    flows: Arc<FlowSet>,
    store: Arc<dyn TaskStore>,
    events: EventBus,
) -> (Arc<FlowEngine>, WorktreeManager) {
    let worktrees = WorktreeManager::from_config(&config.workspace);
    let steps = StepRegistry::builtin(
        worktrees.clone(),
        Arc::new(GhReviewProvider::new(&config.workspace.repo)),
        &config.checks,
        &config.review,
    );
    let engine = FlowEngine::new(
        store,
        flows,
        Arc::new(steps),
        events,
        EngineLimits::from(&config.scheduler),
    );
    (Arc::new(engine), worktrees)
}

// ─── Run ─────────────────────────────────────────────────────────────────

async fn cmd_run(
    config: &PipelineConfig,
    flows: Arc<FlowSet>,
    store: Arc<dyn TaskStore>,
    serve: Option<String>,
) -> Result<()> {
    let shutdown = shutdown_on_ctrl_c();
    let events = EventBus::new();
    let event_log = config.workspace.runtime_dir.join("events.jsonl");
    let logger = spawn_jsonl_log(&events, &event_log, shutdown.clone()).await?;
    tracing::info!(path = %event_log.display(), "writing pipeline events");

    let server = serve.map(|bind| {
        let state = Arc::new(marshal_api::ApiState::new(Arc::clone(&store)));
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = marshal_api::serve(state, &bind, token).await {
                tracing::error!(error = ?e, "API server failed");
            }
        })
    });

    let (engine, worktrees) = build_engine(config, flows, store, events);
    let scheduler = Scheduler::new(engine, worktrees, config);
    let result = scheduler.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(server) = server {
        join_background(server, "API server").await;
    }
    join_background(logger, "event logger").await;
    result
}

/// Wait for a background task, logging a panic or cancellation. Returns
/// whether it ended cleanly.
async fn join_background(handle: JoinHandle<()>, name: &str) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(task = name, error = ?e, "background task failed");
            false
        }
    }
}

// ─── Tasks ───────────────────────────────────────────────────────────────

async fn cmd_task(
    config: &PipelineConfig,
    flows: Arc<FlowSet>,
    store: Arc<dyn TaskStore>,
    action: TaskAction,
) -> Result<()> {
    match action {
        TaskAction::Add {
            title,
            role,
            desc,
            flow,
            project,
            branch,
            base,
            priority,
            blocked_by,
        } => {
            if !config.roles.contains(&role) {
                anyhow::bail!("unknown role '{role}'");
            }
            let flow = flow.map(FlowName::new);
            let initial = flows.resolve(flow.as_ref())?.initial.clone();
            let mut new = NewTask::new(title, role);
            new.description = desc;
            new.flow = flow;
            new.project = project;
            new.branch = branch;
            new.base_branch = base;
            new.priority = priority;
            new.blocked_by = blocked_by;
            new.queue = Some(initial);
            let task = store.create(new).await?;
            println!("Created {}: {} [{}]", task.id, task.title, task.branch_name());
        }
        TaskAction::List {
            queue,
            role,
            project,
        } => {
            let filter = TaskFilter {
                queues: queue.map(Queue::new).into_iter().collect(),
                role,
                project,
                ..TaskFilter::default()
            };
            let tasks = store.list(&filter).await?;
            if tasks.is_empty() {
                println!("No tasks found.");
            } else {
                println!(
                    "{:<10} {:<20} {:<14} {:<16} {:<4} TITLE",
                    "ID", "QUEUE", "ROLE", "HOLDER", "REJ"
                );
                println!("{}", "-".repeat(84));
                for t in tasks {
                    println!(
                        "{:<10} {:<20} {:<14} {:<16} {:<4} {}",
                        t.id,
                        t.queue,
                        t.role,
                        t.lease_holder().map(|w| w.to_string()).unwrap_or_default(),
                        t.rejection_count,
                        t.title
                    );
                }
            }
        }
        TaskAction::Show { id } => print_task(&store.get(id).await?),
        TaskAction::Reset { id, reason } => {
            let (engine, _) = build_engine(config, flows, Arc::clone(&store), EventBus::new());
            let task = engine.reset(&store.get(id).await?, &reason).await?;
            println!("Reset {} to {}", task.id, task.queue);
        }
        TaskAction::Approve { id, comment } => {
            let result = match comment {
                Some(c) => WorkerResult::approve().with_comment(c),
                None => WorkerResult::approve(),
            };
            let (engine, worktrees) =
                build_engine(config, flows, Arc::clone(&store), EventBus::new());
            let task = store.get(id).await?;
            let ws = workspace_of(store.as_ref(), &worktrees, &task).await;
            let resolution = engine.resolve_and_advance(&task, &result, ws.as_ref()).await?;
            println!("Approved {}: {:?}", task.id, resolution.outcome);
        }
        TaskAction::Reject { id, feedback } => {
            let (engine, worktrees) =
                build_engine(config, flows, Arc::clone(&store), EventBus::new());
            let task = store.get(id).await?;
            let ws = workspace_of(store.as_ref(), &worktrees, &task).await;
            let resolution = engine
                .resolve_and_advance(&task, &WorkerResult::reject(feedback), ws.as_ref())
                .await?;
            println!("Rejected {}: {:?}", task.id, resolution.outcome);
        }
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("{}: {}", task.id, task.title);
    println!("  queue:      {}", task.queue);
    println!("  role:       {}", task.role);
    println!("  flow:       {}", task.flow_name());
    println!("  branch:     {} (base {})", task.branch_name(), task.base_branch);
    println!("  version:    {}", task.version);
    if let Some(project) = task.project {
        println!("  project:    {project}");
    }
    if let Some(lease) = &task.lease {
        let state = if lease.is_expired(Utc::now()) {
            "expired"
        } else {
            "live"
        };
        println!(
            "  lease:      {} until {} ({state})",
            lease.holder,
            lease.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(blocker) = task.blocked_by {
        println!("  blocked by: {blocker}");
    }
    if let Some(review) = &task.review_request {
        println!("  review:     #{} {}", review.number, review.url);
    }
    if let Some(failure) = &task.step_failure {
        println!(
            "  step fail:  {} x{}: {}",
            failure.step, failure.attempts, failure.reason
        );
    }
    println!("  rejections: {}", task.rejection_count);
    if let Some(feedback) = &task.last_feedback {
        println!("  feedback:\n    {}", feedback.replace('\n', "\n    "));
    }
    if !task.description.is_empty() {
        println!("\n{}", task.description);
    }
    println!("\nAudit:");
    for entry in &task.audit {
        println!(
            "  {} {:<16} {}",
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            serde_json::to_value(entry.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            entry.message
        );
    }
}

// ─── Projects ────────────────────────────────────────────────────────────

async fn cmd_project(store: &dyn TaskStore, action: ProjectAction) -> Result<()> {
    match action {
        ProjectAction::Add {
            name,
            shared_branch,
            base,
        } => {
            let project = store
                .create_project(NewProject {
                    name,
                    shared_branch,
                    base_branch: base,
                })
                .await?;
            println!("Created {}: {}", project.id, project.name);
        }
        ProjectAction::List => {
            let projects = store.list_projects().await?;
            if projects.is_empty() {
                println!("No projects found.");
            }
            for p in projects {
                println!(
                    "{:<10} {:<24} {}",
                    p.id,
                    p.name,
                    p.shared_branch.as_deref().unwrap_or("(private branches)")
                );
            }
        }
    }
    Ok(())
}

// ─── Flows ───────────────────────────────────────────────────────────────

fn print_flows(flows: &FlowSet) {
    for flow in flows.iter() {
        println!("flow {} (initial: {})", flow.name, flow.initial);
        for t in &flow.transitions {
            let mut line = format!("  {} -> {}", t.from, t.to);
            if let Some(role) = &t.claim {
                line.push_str(&format!("  claim={role}"));
            }
            for c in &t.conditions {
                line.push_str(&format!("  [{}", c.name));
                if let Some(role) = &c.role {
                    line.push_str(&format!(" by {role}"));
                }
                if let Some(target) = &c.on_fail {
                    line.push_str(&format!(" else {target}"));
                }
                line.push(']');
            }
            if !t.steps.is_empty() {
                let steps: Vec<&str> = t.steps.iter().map(|s| s.as_str()).collect();
                line.push_str(&format!("  steps={}", steps.join(",")));
            }
            println!("{line}");
        }
    }
    println!("config OK");
}

// ─── Housekeeping ────────────────────────────────────────────────────────

async fn cmd_sweep(config: &PipelineConfig, store: Arc<dyn TaskStore>) -> Result<()> {
    let worktrees = WorktreeManager::from_config(&config.workspace);
    let sweeper = Sweeper::new(store, worktrees, &config.workspace, EventBus::new());
    let report = sweeper.run(Utc::now()).await?;
    println!(
        "archived {} log dir(s), removed {} workspace(s), deleted {} branch(es)",
        report.archived, report.removed, report.branches_deleted
    );
    Ok(())
}

async fn cmd_reconcile(
    config: &PipelineConfig,
    flows: Arc<FlowSet>,
    store: Arc<dyn TaskStore>,
) -> Result<()> {
    let (engine, _) = build_engine(config, flows, store, EventBus::new());
    let reconciler = Reconciler::new(
        engine,
        chrono::Duration::seconds(config.scheduler.orphan_secs),
    );
    let report = reconciler.run(&HashSet::new(), Utc::now()).await?;
    println!(
        "requeued {} expired and {} orphaned claim(s)",
        report.expired.len(),
        report.orphaned.len()
    );
    Ok(())
}
