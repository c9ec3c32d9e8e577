//! Operator CLI: node registration, agent management over SSH, task
//! submission and targeted kills. Works directly against the master's
//! store and SSH launcher.

use clap::{Parser, Subcommand};
use std::sync::Arc;

use gputasker_master::config::MasterConfig;
use gputasker_master::remote::{self, SshTarget};
use gputasker_master::store::{NewTask, Store};
use gputasker_master::supervisor;

#[derive(Parser)]
#[command(name = "nodectl")]
#[command(about = "Manage GPUTasker nodes, agents and tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register or inspect GPU nodes
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Start/stop/restart node agents via SSH
    Agent {
        /// start, stop or restart
        action: AgentAction,

        /// Only operate on these node addresses (repeatable)
        #[arg(long = "ip")]
        ips: Vec<String>,

        /// File with one address per line; # comments allowed
        #[arg(long)]
        ip_file: Option<String>,
    },

    /// Submit and inspect tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Kill a running or lost run-log
    Kill {
        /// Run-log id to terminate
        log_id: i64,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum AgentAction {
    Start,
    Stop,
    Restart,
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Register a node; resolves its hostname over SSH
    Add {
        /// Node address (IP or DNS name)
        address: String,

        /// SSH port
        #[arg(short, long, default_value = "22")]
        port: u16,
    },

    /// List registered nodes with liveness
    List,

    /// Allow placements on a node
    Enable {
        /// Node address
        address: String,
    },

    /// Drain a node: keep reports, stop placements
    Disable {
        /// Node address
        address: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Submit a new task
    Submit {
        /// Task name
        #[arg(short, long)]
        name: String,

        /// Command to run (passed to bash on the node)
        #[arg(short, long)]
        cmd: String,

        /// Remote working directory
        #[arg(short, long, default_value = "~")]
        workspace: String,

        /// Owner username recorded on the task
        #[arg(short, long, default_value = "")]
        owner: String,

        /// Number of GPUs required (0-8)
        #[arg(short, long, default_value = "1")]
        gpus: u32,

        /// Require completely free GPUs
        #[arg(short, long)]
        exclusive: bool,

        /// Minimum free GPU memory in MiB
        #[arg(long, default_value = "0")]
        min_memory: u64,

        /// Minimum idle utilization percent
        #[arg(long, default_value = "0")]
        min_idle_util: u32,

        /// Pin to a node address
        #[arg(long)]
        node: Option<String>,

        /// Scheduling priority (higher dispatches first)
        #[arg(long, default_value = "0")]
        priority: i64,

        /// Create in UNREADY state instead of READY
        #[arg(long)]
        hold: bool,
    },

    /// List tasks with status
    List,

    /// Reset a task to READY without touching prior run-logs
    Restart {
        /// Task id
        id: i64,
    },

    /// Delete a task, its run-logs and their log files
    Delete {
        /// Task id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = MasterConfig::from_env();
    let store = Arc::new(Store::open(&config.db_path)?);

    match cli.command {
        Commands::Node { command } => match command {
            NodeCommands::Add { address, port } => {
                let node = store.create_node(&address, port)?;
                let target = SshTarget::for_node(&config, &node);
                match remote::get_hostname(&target).await {
                    Ok(hostname) if !hostname.is_empty() => {
                        store.set_node_hostname(node.id, &hostname)?;
                        println!("✅ registered {} ({})", node.display(), hostname);
                    }
                    Ok(_) => println!("✅ registered {} (hostname unresolved)", node.display()),
                    Err(err) => {
                        println!("✅ registered {} (hostname lookup failed: {})", node.display(), err)
                    }
                }
                println!("   report token: {}", node.report_token);
            }
            NodeCommands::Enable { address } => {
                let node = store
                    .node_by_address(&address)?
                    .ok_or_else(|| anyhow::anyhow!("unknown node {}", address))?;
                store.set_node_can_schedule(node.id, true)?;
                println!("✅ {} is schedulable", node.display());
            }
            NodeCommands::Disable { address } => {
                let node = store
                    .node_by_address(&address)?
                    .ok_or_else(|| anyhow::anyhow!("unknown node {}", address))?;
                store.set_node_can_schedule(node.id, false)?;
                println!("🚧 {} drained", node.display());
            }
            NodeCommands::List => {
                let nodes = store.list_nodes()?;
                println!("📋 Nodes ({}):", nodes.len());
                for node in nodes {
                    let live = node.is_reporting_alive(chrono::Utc::now(), config.node_stale_seconds);
                    println!(
                        "  {} host={} schedulable={} live={} last_report={}",
                        node.display(),
                        node.hostname.as_deref().unwrap_or("-"),
                        node.can_schedule,
                        live,
                        node.last_report_at
                            .map_or("-".into(), |t| t.to_rfc3339()),
                    );
                }
            }
        },

        Commands::Agent { action, ips, ip_file } => {
            let mut filters = ips;
            if let Some(path) = ip_file {
                let content = std::fs::read_to_string(&path)?;
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    filters.push(line.to_string());
                }
            }
            filters.dedup();

            let agent_source = if config.push_agent {
                Some(std::fs::read(&config.agent_source_path).map_err(|err| {
                    anyhow::anyhow!(
                        "cannot read agent source {}: {}",
                        config.agent_source_path.display(),
                        err
                    )
                })?)
            } else {
                None
            };

            let nodes = store
                .list_nodes()?
                .into_iter()
                .filter(|n| filters.is_empty() || filters.contains(&n.address))
                .collect::<Vec<_>>();

            let mut ok = 0;
            let mut failed = 0;
            for node in nodes {
                let target = SshTarget::for_node(&config, &node);
                let result = match action {
                    AgentAction::Start => {
                        remote::start_agent(
                            &target,
                            &config.server_url,
                            &node.report_token,
                            agent_source.as_deref(),
                            config.push_agent_mode,
                        )
                        .await
                    }
                    AgentAction::Stop => remote::stop_agent(&target).await,
                    AgentAction::Restart => {
                        remote::restart_agent(
                            &target,
                            &config.server_url,
                            &node.report_token,
                            agent_source.as_deref(),
                            config.push_agent_mode,
                        )
                        .await
                    }
                };
                match result {
                    Ok(out) => {
                        println!("[{}] {}", node.display(), out);
                        ok += 1;
                    }
                    Err(err) => {
                        eprintln!("[{}] FAILED: {:#}", node.display(), err);
                        failed += 1;
                    }
                }
            }
            println!("agents: {} ok, {} failed", ok, failed);
            if failed > 0 {
                std::process::exit(1);
            }
        }

        Commands::Task { command } => match command {
            TaskCommands::Submit {
                name,
                cmd,
                workspace,
                owner,
                gpus,
                exclusive,
                min_memory,
                min_idle_util,
                node,
                priority,
                hold,
            } => {
                let assign_node_id = match node {
                    Some(address) => Some(
                        store
                            .node_by_address(&address)?
                            .ok_or_else(|| anyhow::anyhow!("unknown node {}", address))?
                            .id,
                    ),
                    None => None,
                };
                let task = store.create_task(&NewTask {
                    name,
                    owner,
                    workspace,
                    cmd,
                    gpu_count: gpus.min(8),
                    exclusive,
                    min_memory_mib: min_memory,
                    max_used_utilization: min_idle_util,
                    assign_node_id,
                    priority,
                    ready: !hold,
                })?;
                println!("✅ submitted task {} ({})", task.id, task.name);
            }
            TaskCommands::List => {
                let tasks = store.list_tasks()?;
                println!("📋 Tasks ({}):", tasks.len());
                for task in tasks {
                    println!(
                        "  #{} {} status={} gpus={} priority={} owner={}",
                        task.id,
                        task.name,
                        task.status_enum().map_or("?", |s| s.as_str()),
                        task.gpu_count,
                        task.priority,
                        if task.owner.is_empty() { "-" } else { &task.owner },
                    );
                }
            }
            TaskCommands::Restart { id } => {
                if store.restart_task(id)? {
                    println!("✅ task {} reset to ready", id);
                } else {
                    anyhow::bail!("task {} not found", id);
                }
            }
            TaskCommands::Delete { id } => {
                let paths = store.delete_task(id)?;
                for path in &paths {
                    if let Err(err) = std::fs::remove_file(path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            eprintln!("could not remove {}: {}", path, err);
                        }
                    }
                }
                println!("🗑️  deleted task {} ({} log file(s))", id, paths.len());
            }
        },

        Commands::Kill { log_id } => {
            let Some(run_log) = store.run_log_by_id(log_id)? else {
                anyhow::bail!("run log {} not found", log_id);
            };
            println!(
                "🛑 killing run log {} (status={})",
                log_id,
                run_log.status_enum().map_or("?", |s| s.as_str())
            );
            supervisor::kill_run_log(&store, &config, log_id).await?;
            println!("done");
        }
    }

    Ok(())
}
