mod commands;
mod config;
mod setup;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use setup::create_store;
use telemetry::{init_telemetry, log_config_validation, log_startup_info};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "flowspec")]
#[command(about = "FlowSpec workflow engine CLI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Company (tenant) id for this invocation
    #[arg(long, env = "FLOWSPEC_COMPANY_ID", global = true)]
    company: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE", global = true)]
    config: Option<String>,

    /// Database URL override
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new Draft workflow
    CreateWorkflow { name: String },
    /// Replace a workflow's editable Draft graph with the given JSON file
    PutDraft { workflow_id: i64, draft_json_path: String },
    /// Draft -> Validated
    Validate { workflow_id: i64 },
    /// Validated -> Draft
    Edit { workflow_id: i64 },
    /// Draft|Validated -> Published, writing a new WorkflowVersion
    Publish {
        workflow_id: i64,
        #[arg(long)]
        actor: String,
    },
    /// Published -> new Draft, cloning the chosen version's structure
    Branch {
        workflow_id: i64,
        version: i32,
        name: String,
    },
    /// Remove a never-published workflow
    DeleteWorkflow { workflow_id: i64 },
    /// Diff the current Draft against the Published snapshot
    Impact { workflow_id: i64 },

    /// Create (or return the existing) Flow for a scope
    CreateFlow {
        workflow_id: i64,
        scope_type: String,
        scope_id: String,
        #[arg(long)]
        actor: String,
    },
    /// Open a TaskExecution for the flow's current iteration
    StartTask {
        flow_id: i64,
        task_id: i64,
        #[arg(long)]
        actor: String,
    },
    /// Record a task outcome, routing gates and advancing the flow
    RecordOutcome {
        flow_id: i64,
        task_id: i64,
        outcome: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        detour_id: Option<i64>,
        #[arg(long)]
        metadata_json: Option<String>,
    },
    /// Diagnose why an ACTIVE flow is stalled
    Diagnose { flow_id: i64 },

    /// Create a PENDING ScheduleChangeRequest
    CreateChangeRequest {
        #[arg(long)]
        flow_id: Option<i64>,
        #[arg(long)]
        task_id: Option<i64>,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        requested_by: String,
        #[arg(long, default_value = "{}")]
        metadata_json: String,
    },
    /// Move a change request into IN_REVIEW
    StartReview {
        request_id: i64,
        #[arg(long)]
        actor: String,
    },
    /// Accept a change request, opening a blocking DetourRecord
    AcceptChangeRequest {
        request_id: i64,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        flow_id: i64,
        #[arg(long)]
        checkpoint_node_id: i64,
        #[arg(long)]
        resume_target_node_id: i64,
        #[arg(long)]
        checkpoint_task_execution_id: i64,
    },
    /// Reject a change request
    RejectChangeRequest {
        request_id: i64,
        #[arg(long)]
        actor: String,
    },
    /// Cancel a change request
    CancelChangeRequest {
        request_id: i64,
        #[arg(long)]
        actor: String,
    },

    /// Aggregate counts for the tenant
    Stats,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => {
            info!("Loading configuration from file: {}", config_file);
            Config::from_file(config_file)?
        }
        None => {
            info!("Loading configuration from environment");
            Config::from_env()?
        }
    };

    if let Some(ref database_url) = cli.database_url {
        info!("Overriding database URL from CLI");
        config.database.url = Some(database_url.clone());
    }

    if let Some(ref log_level) = cli.log_level {
        info!("Overriding log level from CLI");
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;
    log_config_validation(&config);
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }
    log_startup_info(&config);

    let store = create_store(&config)
        .await
        .context("Failed to initialize database store")?;

    let company = cli.company.clone();
    let require_company = || company.clone().context(
        "--company (or FLOWSPEC_COMPANY_ID) is required for this command",
    );

    let result = match cli.command {
        Command::CreateWorkflow { name } => {
            commands::workflow_create(&store, &require_company()?, &name).await
        }
        Command::PutDraft { workflow_id, draft_json_path } => {
            let draft_json = std::fs::read_to_string(&draft_json_path)
                .with_context(|| format!("failed to read {draft_json_path}"))?;
            commands::workflow_put_draft(&store, workflow_id, &draft_json).await
        }
        Command::Validate { workflow_id } => {
            commands::workflow_validate(&store, &require_company()?, workflow_id).await
        }
        Command::Edit { workflow_id } => {
            commands::workflow_edit(&store, &require_company()?, workflow_id).await
        }
        Command::Publish { workflow_id, actor } => {
            commands::workflow_publish(&store, &require_company()?, workflow_id, &actor).await
        }
        Command::Branch { workflow_id, version, name } => {
            commands::workflow_branch(&store, &require_company()?, workflow_id, version, &name).await
        }
        Command::DeleteWorkflow { workflow_id } => {
            commands::workflow_delete(&store, &require_company()?, workflow_id).await
        }
        Command::Impact { workflow_id } => {
            commands::workflow_impact(&store, &require_company()?, workflow_id).await
        }
        Command::CreateFlow { workflow_id, scope_type, scope_id, actor } => {
            commands::flow_create(
                &store,
                &require_company()?,
                workflow_id,
                &scope_type,
                &scope_id,
                &actor,
            )
            .await
        }
        Command::StartTask { flow_id, task_id, actor } => {
            commands::flow_start_task(&store, flow_id, task_id, &actor).await
        }
        Command::RecordOutcome { flow_id, task_id, outcome, actor, detour_id, metadata_json } => {
            let metadata = metadata_json
                .map(|m| serde_json::from_str(&m))
                .transpose()
                .context("malformed --metadata-json")?;
            commands::flow_record_outcome(
                &store,
                &require_company()?,
                flow_id,
                task_id,
                &outcome,
                &actor,
                detour_id,
                metadata,
            )
            .await
        }
        Command::Diagnose { flow_id } => commands::flow_diagnose(&store, flow_id).await,
        Command::CreateChangeRequest { flow_id, task_id, reason, requested_by, metadata_json } => {
            let metadata = serde_json::from_str(&metadata_json).context("malformed --metadata-json")?;
            commands::detour_create_change_request(
                &store,
                &require_company()?,
                flow_id,
                task_id,
                &reason,
                &requested_by,
                metadata,
            )
            .await
        }
        Command::StartReview { request_id, actor } => {
            commands::detour_start_review(&store, request_id, &actor).await
        }
        Command::AcceptChangeRequest {
            request_id,
            actor,
            flow_id,
            checkpoint_node_id,
            resume_target_node_id,
            checkpoint_task_execution_id,
        } => {
            commands::detour_accept(
                &store,
                request_id,
                &actor,
                flow_id,
                checkpoint_node_id,
                resume_target_node_id,
                checkpoint_task_execution_id,
            )
            .await
        }
        Command::RejectChangeRequest { request_id, actor } => {
            commands::detour_reject(&store, request_id, &actor).await
        }
        Command::CancelChangeRequest { request_id, actor } => {
            commands::detour_cancel(&store, request_id, &actor).await
        }
        Command::Stats => commands::stats(&store, &require_company()?).await,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
