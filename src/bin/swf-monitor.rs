//! swf-monitor CLI: run the monitor or inspect what it has recorded.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use swf_monitor::broadcast::{Broadcaster, InternalPublisher, spawn_bridge};
use swf_monitor::broker::BrokerConnection;
use swf_monitor::config::Config;
use swf_monitor::db::Db;
use swf_monitor::model::{WorkflowId, WorkflowStatus};
use swf_monitor::router::MessageRouter;
use swf_monitor::store::{AgentStore, Store, WorkflowFilter, WorkflowStore};
use swf_monitor::telemetry::{TelemetryConfig, init_telemetry};
use swf_monitor::web::{self, AppState};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "swf-monitor", about = "Streaming workflow testbed monitor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker listener and the HTTP server
    Serve,
    /// Workflow operations
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Agent operations
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List workflows, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by run id
        #[arg(long)]
        run_id: Option<String>,
        /// Maximum workflows to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a workflow and its stages
    Show {
        /// Workflow ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List known agents
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Workflow { action } => {
            let db = open_db().await?;
            match action {
                WorkflowAction::List {
                    status,
                    run_id,
                    limit,
                } => cmd_workflow_list(&db, status, run_id, limit).await,
                WorkflowAction::Show { id } => cmd_workflow_show(&db, id).await,
            }
        }
        Command::Agent {
            action: AgentAction::List,
        } => cmd_agent_list(&open_db().await?).await,
    }
}

async fn open_db() -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(db.clone());

    let broadcaster = Broadcaster::new(config.stream.queue_capacity);
    let (publisher, rx) = InternalPublisher::channel();
    let bridge = spawn_bridge(broadcaster.clone(), rx);

    let router = Arc::new(MessageRouter::new(store.clone(), broadcaster.clone()));
    let broker = BrokerConnection::new(config.broker.clone(), router);
    if !broker.connect().await {
        warn!("broker unavailable at startup, serving without live ingest");
    }

    let state = AppState {
        store,
        broadcaster,
        publisher,
        broker: Arc::new(broker.clone()),
        stream: config.stream.clone(),
        db: Some(db),
    };

    web::serve(config.http_bind, state, async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
    })
    .await?;

    broker.disconnect().await;
    bridge.abort();
    Ok(())
}

async fn cmd_workflow_list(
    db: &Db,
    status: Option<String>,
    run_id: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status: Option<WorkflowStatus> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let workflows = db
        .list_workflows(&WorkflowFilter {
            status,
            run_id,
            limit,
        })
        .await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<36}  {:<8}  {:<24}  {:<12}  CREATED",
        "ID", "FILENAME", "RUN", "STATUS", "AGENT"
    );
    println!("{}", "-".repeat(110));

    for w in &workflows {
        let short_id = &w.id.to_string()[..8];
        let filename = w.filename.get(..36).unwrap_or(&w.filename);
        println!(
            "{:<8}  {:<36}  {:<8}  {:<24}  {:<12}  {}",
            short_id,
            filename,
            w.run_id.as_deref().unwrap_or("-"),
            w.status,
            w.current_agent,
            w.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} workflow(s)", workflows.len());
    Ok(())
}

async fn cmd_workflow_show(db: &Db, id_str: String) -> anyhow::Result<()> {
    let id = if id_str.len() < 36 {
        let workflows = db
            .list_workflows(&WorkflowFilter {
                limit: 1000,
                ..WorkflowFilter::default()
            })
            .await?;
        let matches: Vec<_> = workflows
            .iter()
            .filter(|w| w.id.to_string().starts_with(&id_str))
            .collect();
        match matches.as_slice() {
            [] => anyhow::bail!("no workflow matching prefix '{id_str}'"),
            [only] => only.id,
            many => anyhow::bail!(
                "{} workflows match prefix '{id_str}', be more specific",
                many.len()
            ),
        }
    } else {
        id_str.parse::<WorkflowId>()?
    };

    let w = db.get_workflow(id).await?;
    let stages = db.list_stages(id).await?;

    println!("ID:          {}", w.id);
    println!("Filename:    {}", w.filename);
    println!("Run:         {}", w.run_id.as_deref().unwrap_or("-"));
    println!("Status:      {}", w.status);
    println!("Agent:       {}", w.current_agent);
    println!(
        "DAQ State:   {} / {}",
        w.daq_state.as_deref().unwrap_or("-"),
        w.daq_substate.as_deref().unwrap_or("-")
    );
    if let (Some(start), Some(end)) = (w.stf_start, w.stf_end) {
        println!("STF Window:  {start} .. {end}");
    }
    println!("Created:     {}", w.created_at);
    println!("Updated:     {}", w.updated_at);
    if let Some(done) = w.completed_at {
        println!("Completed:   {done}");
    }

    if !stages.is_empty() {
        println!("---");
        for s in &stages {
            let elapsed = s
                .elapsed()
                .map(|d| format!("{:.3}s", d.num_milliseconds() as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<12}  {:<12}  {:<20}  {}",
                s.agent_category,
                s.status,
                s.agent_name.as_deref().unwrap_or("-"),
                elapsed
            );
        }
    }

    Ok(())
}

async fn cmd_agent_list(db: &Db) -> anyhow::Result<()> {
    let agents = db.list_agents().await?;

    if agents.is_empty() {
        println!("No agents found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<12}  {:<8}  {:>8}  {:>10}  LAST HEARTBEAT",
        "NAME", "CATEGORY", "STATUS", "IN FLIGHT", "PROCESSED"
    );
    println!("{}", "-".repeat(100));

    for a in &agents {
        println!(
            "{:<24}  {:<12}  {:<8}  {:>8}  {:>10}  {}",
            a.name,
            a.category,
            a.status,
            a.in_flight,
            a.processed_total,
            a.last_heartbeat
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    println!("\n{} agent(s)", agents.len());
    Ok(())
}
