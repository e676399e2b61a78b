use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::unbounded_channel;
use tracing_subscriber::EnvFilter;

use cliptransfer::core::config::Settings;
use cliptransfer::core::events::{EventSink, ReceiverEvent, SenderEvent};
use cliptransfer::core::receiver::Receiver;
use cliptransfer::core::sender::Sender;
use cliptransfer::core::store::TaskStore;
use cliptransfer::utils::clipboard::SystemClipboard;
use cliptransfer::utils::data_dir::AppDirs;
use cliptransfer::utils::fsutil::format_file_size;

/// ClipTransfer - move files through a one-way clipboard channel.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Directory for persistent state (config, task journal, logs).
    /// Defaults to ~/.cliptransfer/
    #[clap(long)]
    conf: Option<PathBuf>,

    /// Verbosity (-v, -vv); overrides the configured log level.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a file or folder through the clipboard.
    Send { path: PathBuf },
    /// Listen for incoming transfers until interrupted.
    Listen,
    /// Inspect the task journal.
    Tasks {
        #[command(subcommand)]
        action: Option<TasksCommand>,
    },
}

#[derive(Subcommand)]
enum TasksCommand {
    /// List every known task.
    List,
    /// Print aggregate statistics.
    Stats,
    /// Drop completed tasks older than the retention window.
    Clean {
        /// Retention in days; 0 removes all completed tasks.
        #[clap(long, default_value_t = 7)]
        keep_days: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::resolve(cli.conf.as_deref());
    let settings = Settings::load(&dirs.config_file());

    let filter = match cli.verbose {
        0 => settings.log_level.to_lowercase(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let store = Arc::new(TaskStore::open(dirs.tasks_file())?);

    match cli.command {
        Command::Send { path } => run_send(settings, store, &path).await,
        Command::Listen => run_listen(settings, store).await,
        Command::Tasks { action } => run_tasks(&store, action.unwrap_or(TasksCommand::List)),
    }
}

async fn run_send(settings: Settings, store: Arc<TaskStore>, path: &Path) -> Result<()> {
    let (tx, mut events) = unbounded_channel();
    let sink: Arc<dyn EventSink<SenderEvent>> = Arc::new(move |event: SenderEvent| {
        let _ = tx.send(event);
    });

    let sender = Sender::new(settings, store, Arc::new(SystemClipboard), sink);
    sender.send(path)?;

    // Ctrl-C cancels the active transfer instead of killing the process.
    let stopper = sender.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.stop();
    });

    while let Some(event) = events.recv().await {
        match event {
            SenderEvent::TaskStarted(task) => println!(
                "Sending {} ({}, {} chunks)",
                task.file_name,
                format_file_size(task.total_size),
                task.chunk_total
            ),
            SenderEvent::Progress {
                completed, total, ..
            } => {
                print!("\r{completed}/{total} chunks");
                let _ = std::io::stdout().flush();
            }
            SenderEvent::TaskCompleted(task) => {
                println!("\nDone: {}", task.file_name);
                break;
            }
            SenderEvent::TaskCancelled(task) => {
                println!("\nCancelled: {}", task.file_name);
                break;
            }
            SenderEvent::TaskFailed { error, .. } => {
                println!();
                bail!("transfer failed: {error}");
            }
            SenderEvent::TaskPaused(_) | SenderEvent::TaskResumed(_) => {}
            SenderEvent::Error(msg) => eprintln!("error: {msg}"),
        }
    }
    Ok(())
}

async fn run_listen(settings: Settings, store: Arc<TaskStore>) -> Result<()> {
    let (tx, mut events) = unbounded_channel();
    let sink: Arc<dyn EventSink<ReceiverEvent>> = Arc::new(move |event: ReceiverEvent| {
        let _ = tx.send(event);
    });

    let receiver = Receiver::new(settings, store, Arc::new(SystemClipboard), sink);
    receiver.start_listening();
    println!("Listening for transfers (ctrl-c to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                receiver.stop_listening();
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ReceiverEvent::TaskStarted(task) => println!(
                        "Receiving {} ({}, {} chunks)",
                        task.file_name,
                        format_file_size(task.total_size),
                        task.chunk_total
                    ),
                    ReceiverEvent::Progress { completed, total, .. } => {
                        print!("\r{completed}/{total} chunks");
                        let _ = std::io::stdout().flush();
                    }
                    ReceiverEvent::TaskCompleted { task, output } => println!(
                        "\nReceived {} -> {}",
                        task.file_name,
                        output.display()
                    ),
                    ReceiverEvent::TaskFailed { task, error } => {
                        println!("\nFailed {}: {error}", task.file_name)
                    }
                    ReceiverEvent::TaskIncomplete { task, missing } => println!(
                        "\nIncomplete {}: {} chunk(s) missing {:?} - request a fresh send",
                        task.file_name,
                        missing.len(),
                        missing
                    ),
                    ReceiverEvent::Error(msg) => eprintln!("error: {msg}"),
                    ReceiverEvent::ListeningStarted | ReceiverEvent::ListeningStopped => {}
                }
            }
        }
    }
    Ok(())
}

fn run_tasks(store: &TaskStore, action: TasksCommand) -> Result<()> {
    match action {
        TasksCommand::List => {
            let tasks = store.list();
            if tasks.is_empty() {
                println!("No tasks recorded");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{:<36}  {:<9}  {:>10}  {}",
                    task.task_id,
                    task.status,
                    format_file_size(task.total_size),
                    task.file_name
                );
            }
        }
        TasksCommand::Stats => {
            let stats = store.statistics();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        TasksCommand::Clean { keep_days } => {
            let removed = store.cleanup_completed(keep_days);
            println!("Removed {removed} completed task(s)");
        }
    }
    Ok(())
}
