use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use convoy::config::Config;
use convoy::log::LogMode;
use convoy::core::{Task, TaskId, TaskStatus};
use convoy::orchestration::{Inbox, InboxRequest, Supervisor};
use convoy::{clog, clog_error, Error, Result, TaskLedger};

/// convoy - run coding agents in parallel against one repository
#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONVOY_DEBUG=1         Enable debug logging (alternative to --debug)\n    CONVOY_LOG=<level>     error, warn, info, debug or trace")]
pub struct Cli {
    /// Configuration file (default: ~/.convoy/convoy.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Log file (default: ~/.convoy/convoy.log)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the supervisor in the foreground until interrupted
    Run,

    /// Queue tasks from a TOML ([[tasks]]) or JSON file
    Add {
        /// Task file
        file: PathBuf,
    },

    /// Retry a failed task
    Retry {
        /// Task ID
        task: String,
    },

    /// Stop a task's worker and discard its work
    Cancel {
        /// Task ID
        task: String,

        /// Put the task back in the queue instead of failing it
        #[arg(long)]
        requeue: bool,
    },

    /// Show the task ledger
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Deserialize)]
struct TaskFile {
    tasks: Vec<Task>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_path = cli.log_file.clone().or_else(convoy::log::default_path);
    if let Some(path) = &log_path {
        let mode = match cli.command {
            Command::Run => LogMode::Rotate,
            _ => LogMode::Append,
        };
        convoy::log::init(path, convoy::log::requested_level(cli.debug), mode);
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    let result = match cli.command {
        Command::Init { force } => run_init(&config_path, force),
        command => {
            let config = Config::load_from(&config_path)?;
            match command {
                Command::Run => run_supervisor(config),
                Command::Add { file } => run_add(&config, &file),
                Command::Retry { task } => submit(&config, InboxRequest::Retry {
                    task: TaskId::parse(&task)?,
                }),
                Command::Cancel { task, requeue } => submit(&config, InboxRequest::Cancel {
                    task: TaskId::parse(&task)?,
                    requeue,
                }),
                Command::Status { json } => run_status(&config, json),
                Command::Init { .. } => Ok(()),
            }
        }
    };
    if let Err(e) = &result {
        clog_error!("{}", e);
    }
    result
}

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Validation(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let mut config = Config::default();
    config
        .roles
        .insert(convoy::core::DEFAULT_ROLE.to_string(), Default::default());
    config.save_to(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Run the supervisor until Ctrl-C or SIGTERM.
fn run_supervisor(config: Config) -> Result<()> {
    clog!("Run command");
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let supervisor = Supervisor::new(config)?;
        let handle = supervisor.handle();

        tokio::spawn(async move {
            wait_for_signal().await;
            clog!("Shutdown requested");
            handle.shutdown();
        });

        println!("convoy supervisor running (Ctrl-C to stop)");
        supervisor.run().await
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn run_add(config: &Config, file: &Path) -> Result<()> {
    let tasks = read_tasks(file)?;
    for task in &tasks {
        task.id.validate()?;
    }
    let count = tasks.len();
    submit(config, InboxRequest::AddTasks { tasks })?;
    println!("Queued {} task(s)", count);
    Ok(())
}

/// Tasks from `[[tasks]]` TOML, a JSON `{"tasks": [...]}` object or a bare
/// JSON array.
fn read_tasks(file: &Path) -> Result<Vec<Task>> {
    let text = std::fs::read_to_string(file)?;
    let is_toml = file
        .extension()
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        let parsed: TaskFile = toml::from_str(&text)?;
        return Ok(parsed.tasks);
    }
    match serde_json::from_str::<TaskFile>(&text) {
        Ok(parsed) => Ok(parsed.tasks),
        Err(_) => Ok(serde_json::from_str::<Vec<Task>>(&text)?),
    }
}

fn submit(config: &Config, request: InboxRequest) -> Result<()> {
    let state_dir = config.state_dir()?;
    let path = Inbox::submit(&state_dir, &request)?;
    clog!("Submitted {}", path.display());
    println!("Request submitted to {}", state_dir.display());
    Ok(())
}

fn run_status(config: &Config, json: bool) -> Result<()> {
    let snapshot = TaskLedger::inspect(&config.state_dir()?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot.tasks())?);
        return Ok(());
    }
    if snapshot.is_empty() {
        println!("No tasks");
        return Ok(());
    }

    println!("{:<16} {:<15} {:>4} {:>4}  {}", "TASK", "STATUS", "PRI", "FAIL", "TITLE");
    for task in snapshot.in_dependency_order() {
        println!(
            "{:<16} {:<15} {:>4} {:>4}  {}",
            task.id,
            task.status.to_string(),
            task.priority,
            task.failures,
            task.title
        );
        if let Some(reason) = &task.status_reason {
            if matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
                println!("{:<16} {}", "", reason);
            }
        }
    }

    let counts: Vec<String> = snapshot
        .status_counts()
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    println!();
    println!("{}", counts.join(", "));
    Ok(())
}
