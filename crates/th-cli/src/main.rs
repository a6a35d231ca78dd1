mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use th_core::board::BoardFilter;
use th_core::types::{EventType, NewTask, Priority};

use commands::Workspace;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// taskhive CLI -- inspect and feed the shared task board.
#[derive(Parser)]
#[command(name = "th", version, about)]
struct Cli {
    /// Config file (defaults to ~/.taskhive/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Manage task groups.
    #[command(subcommand)]
    Group(GroupCommand),

    /// Create or settle tasks by hand.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Show tasks grouped by status.
    Board {
        /// Only tasks in this group.
        #[arg(short, long)]
        group: Option<String>,
        /// Only tasks assigned to this role.
        #[arg(short, long)]
        role: Option<String>,
    },

    /// Show task counts, groups and live instances (default).
    Status,

    /// Show the most recent events.
    Events {
        /// Only events of this type (e.g. task.completed).
        #[arg(short = 't', long = "type")]
        event_type: Option<EventType>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        /// One JSON object per line.
        #[arg(long)]
        json: bool,
    },

    /// List registered worker instances.
    Instances,
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Open a new group.
    Create {
        title: String,
        /// Role whose group prefix names the group.
        #[arg(short, long)]
        role: String,
        #[arg(long, default_value = "cli")]
        created_by: String,
    },
    /// List every group.
    List,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add a task to a group.
    Create {
        /// Group id.
        group: String,
        title: String,
        /// Role the task is for.
        #[arg(short, long)]
        assign: String,
        #[arg(short = 'k', long = "type", default_value = "implementation")]
        task_type: String,
        #[arg(short, long, default_value = "medium")]
        priority: Priority,
        #[arg(short, long)]
        description: Option<String>,
        /// Parent task id.
        #[arg(long)]
        parent: Option<String>,
        /// Task ids this one waits for (repeatable).
        #[arg(short, long = "blocked-by")]
        blocked_by: Vec<String>,
        #[arg(long, default_value = "cli")]
        created_by: String,
    },
    /// Reject a task with a reason.
    Reject { task_id: String, reason: String },
    /// Fail a task; dependents fail with it.
    Fail {
        task_id: String,
        #[arg(short, long)]
        error: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    th_telemetry::logging::init_logging("th", "warn");

    let config_path = cli.config;
    let open = || Workspace::open(config_path.as_deref());

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Init { force } => {
            let path = config_path
                .clone()
                .unwrap_or_else(th_core::config::Config::default_path);
            commands::init::run(&path, force)?;
        }
        Commands::Status => commands::status::run(&open().await?).await?,
        Commands::Group(GroupCommand::Create {
            title,
            role,
            created_by,
        }) => commands::group::create(&open().await?, &title, &role, &created_by).await?,
        Commands::Group(GroupCommand::List) => commands::group::list(&open().await?).await?,
        Commands::Task(TaskCommand::Create {
            group,
            title,
            assign,
            task_type,
            priority,
            description,
            parent,
            blocked_by,
            created_by,
        }) => {
            let mut new = NewTask::new(group, title, task_type, assign, created_by)
                .priority(priority)
                .blocked_by(blocked_by);
            if let Some(description) = description {
                new = new.description(description);
            }
            if let Some(parent) = parent {
                new = new.parent(parent);
            }
            commands::task::create(&open().await?, new).await?;
        }
        Commands::Task(TaskCommand::Reject { task_id, reason }) => {
            commands::task::reject(&open().await?, &task_id, &reason).await?
        }
        Commands::Task(TaskCommand::Fail { task_id, error }) => {
            commands::task::fail(&open().await?, &task_id, error).await?
        }
        Commands::Board { group, role } => {
            let mut filter = BoardFilter::default();
            if let Some(group) = group {
                filter = filter.group(group);
            }
            if let Some(role) = role {
                filter = filter.assigned_to(role);
            }
            commands::board::run(&open().await?, filter).await?;
        }
        Commands::Events {
            event_type,
            limit,
            json,
        } => commands::events::run(&open().await?, event_type, limit, json).await?,
        Commands::Instances => commands::instances::run(&open().await?).await?,
    }

    Ok(())
}
