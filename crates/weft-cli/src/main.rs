//! weft - demo driver for weft-core
//!
//! 設定ファイル（任意）から Core を組み立て、擬似エージェントを登録してタスクを流し、
//! 最後に全体のステータスを表示します。
//!
//! ```text
//! weft-cli run --agents 3 --tasks 20 --fail-every 4
//! weft-cli --config weft.toml show-config
//! RUST_LOG=weft_core=debug weft-cli run
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::{
    AgentDescriptor, AgentId, Core, CoreBuilder, CoreConfig, DomainEvent, NewTask, Priority,
    TaskId,
};

#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "In-process task orchestration demo")]
struct Cli {
    /// TOML configuration file; defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register simulated agents, submit tasks and report the outcome
    Run {
        /// Number of simulated agents
        #[arg(long, default_value = "3")]
        agents: usize,

        /// Number of tasks to submit
        #[arg(long, default_value = "12")]
        tasks: usize,

        /// Every N-th attempt fails (0 disables failures)
        #[arg(long, default_value = "5")]
        fail_every: u64,

        /// Simulated processing time per task, in milliseconds
        #[arg(long, default_value = "50")]
        work_ms: u64,

        /// Give up waiting for completion after this many seconds
        #[arg(long, default_value = "30")]
        deadline_secs: u64,
    },

    /// Print the effective configuration as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CoreConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoreConfig::default(),
    };

    match cli.command.unwrap_or(Commands::Run {
        agents: 3,
        tasks: 12,
        fail_every: 5,
        work_ms: 50,
        deadline_secs: 30,
    }) {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run {
            agents,
            tasks,
            fail_every,
            work_ms,
            deadline_secs,
        } => {
            let sim = Simulation {
                agents,
                tasks,
                fail_every,
                work: Duration::from_millis(work_ms),
                deadline: Duration::from_secs(deadline_secs),
            };
            run(config, sim).await
        }
    }
}

struct Simulation {
    agents: usize,
    tasks: usize,
    fail_every: u64,
    work: Duration,
    deadline: Duration,
}

async fn run(config: CoreConfig, sim: Simulation) -> anyhow::Result<()> {
    let core = Arc::new(CoreBuilder::new(config).build()?);

    // task:assigned を受けて擬似エージェントに仕事を渡す
    let (tx, rx) = mpsc::unbounded_channel::<(TaskId, AgentId)>();
    core.bus().subscribe("task:assigned", move |message| {
        match serde_json::from_value::<DomainEvent>(message.clone()) {
            Ok(DomainEvent::TaskAssigned { task_id, agent_id }) => {
                let _ = tx.send((task_id, agent_id));
            }
            Ok(other) => warn!(topic = other.topic(), "unexpected event on task:assigned"),
            Err(err) => warn!(error = %err, "undecodable assignment event"),
        }
    })?;

    let mut agent_ids = Vec::with_capacity(sim.agents);
    for i in 0..sim.agents {
        let descriptor = AgentDescriptor::named(format!("sim-{i}")).capability("demo");
        agent_ids.push(core.registry().register(descriptor).await.id);
    }
    let heartbeats = tokio::spawn(heartbeat_loop(Arc::clone(&core), agent_ids));
    let workers = tokio::spawn(work_loop(Arc::clone(&core), rx, sim.work, sim.fail_every));

    core.start();

    let priorities = Priority::DESCENDING;
    for i in 0..sim.tasks {
        let priority = priorities[i % priorities.len()];
        let spec = NewTask::new("demo", serde_json::json!({ "n": i }))
            .priority(priority)
            .require("demo");
        core.store().submit(spec).await;
    }
    info!(tasks = sim.tasks, agents = sim.agents, "workload submitted");

    let finished = tokio::select! {
        done = wait_until_settled(&core, sim.tasks) => done,
        _ = tokio::time::sleep(sim.deadline) => false,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            false
        }
    };
    if !finished {
        warn!("stopping before every task settled");
    }

    let status = core.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    let dead = core.store().list_dead_letters().await;
    if !dead.is_empty() {
        println!("{}", serde_json::to_string_pretty(&dead)?);
    }

    heartbeats.abort();
    workers.abort();
    core.shutdown().await;
    Ok(())
}

async fn heartbeat_loop(core: Arc<Core>, agents: Vec<AgentId>) {
    let mut ticker = tokio::time::interval(core.registry().heartbeat_interval());
    loop {
        ticker.tick().await;
        for agent_id in &agents {
            if let Err(err) = core.registry().heartbeat(*agent_id).await {
                warn!(%agent_id, error = %err, "heartbeat rejected");
            }
        }
    }
}

async fn work_loop(
    core: Arc<Core>,
    mut assignments: mpsc::UnboundedReceiver<(TaskId, AgentId)>,
    work: Duration,
    fail_every: u64,
) {
    let attempts = Arc::new(AtomicU64::new(0));
    while let Some((task_id, agent_id)) = assignments.recv().await {
        let core = Arc::clone(&core);
        let attempts = Arc::clone(&attempts);
        tokio::spawn(async move {
            tokio::time::sleep(work).await;
            let n = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let outcome = if fail_every > 0 && n % fail_every == 0 {
                core.store()
                    .fail(task_id, format!("simulated failure on attempt {n}"))
                    .await
            } else {
                core.store()
                    .complete(task_id, serde_json::json!({ "agent": agent_id }))
                    .await
            };
            if let Err(err) = outcome {
                warn!(%task_id, error = %err, "result not accepted");
            }
        });
    }
}

/// Resolves true once every submitted task reached a terminal state.
async fn wait_until_settled(core: &Core, expected: usize) -> bool {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let stats = core.store().stats().await;
        let settled = stats.completed + stats.failed + stats.cancelled;
        if settled >= expected {
            return true;
        }
        if stats.total == 0 {
            return false;
        }
    }
}
