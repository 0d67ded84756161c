mod backends;
mod backoff;
mod command_channel;
mod config;
mod conflict_resolver;
mod connection_monitor;
mod error;
mod handlers;
mod heartbeat;
mod log_throttle;
mod model;
mod node;
mod offline_buffer;
mod playback;
mod protocol;
mod state_sync;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use backends::memory::MemoryBackend;
use backends::sqlite::SqliteBackend;
use backends::SyncBackend;
use clap::{Parser, Subcommand};
use command_channel::CommandIssuer;
use config::{BackendKind, Config};
use log::{info, warn};
use model::CommandType;
use node::SyncNode;
use playback::InMemoryCatalog;
use protocol::{CommandMessage, Message, QueueMessage, SyncMessage};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Parser, Debug)]
#[command(name = "playnode")]
#[command(about = "Shared playback state and remote command node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run the node until stopped
    Run,
    /// Issue a command into the shared command log
    Send {
        #[arg(value_parser = parse_command_type)]
        command_type: CommandType,
        /// JSON payload
        #[arg(value_parser = parse_payload)]
        payload: Option<serde_json::Value>,
        /// Node to address; defaults to this node's id
        #[arg(long)]
        target: Option<String>,
    },
    /// Print a command's status and result
    Status { command_id: String },
}

fn parse_command_type(value: &str) -> Result<CommandType, String> {
    CommandType::parse(value).ok_or_else(|| format!("unknown command type '{value}'"))
}

fn parse_payload(value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|err| format!("payload is not valid JSON: {err}"))
}

fn database_path(config: &Config) -> PathBuf {
    if !config.node.database_path.is_empty() {
        return PathBuf::from(&config.node.database_path);
    }
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("playnode")
        .join("shared_state.db")
}

fn open_backend(config: &Config) -> Result<Arc<dyn SyncBackend>, Box<dyn std::error::Error>> {
    match config.node.backend {
        BackendKind::Sqlite => {
            let path = database_path(config);
            info!("Using shared database at {}", path.display());
            Ok(Arc::new(SqliteBackend::open(&path)?))
        }
        BackendKind::Memory => {
            info!("Using in-memory backend; state is not shared");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

fn log_bus_message(message: &Message) {
    match message {
        Message::Connection(change) => info!("Node: {:?}", change),
        Message::Sync(SyncMessage::Degraded { reason }) => {
            warn!("Node: running degraded: {}", reason)
        }
        Message::Sync(SyncMessage::BufferedUpdateDropped { retry_count }) => {
            warn!(
                "Node: gave up on a buffered queue update after {} attempts",
                retry_count
            )
        }
        Message::Queue(QueueMessage::RemoteQueueApplied { active_queue, .. }) => {
            info!("Node: remote queue applied ({} items)", active_queue.len())
        }
        Message::Command(CommandMessage::Executed {
            id,
            command_type,
            success,
        }) => info!("Node: command {} ({}) success={}", id, command_type, success),
        _ => {}
    }
}

fn run_node(config: &Config, backend: Arc<dyn SyncBackend>) {
    let node = SyncNode::new(config, backend, Arc::new(InMemoryCatalog::new()));
    let mut bus = node.subscribe();
    node.start();

    let running = Arc::new(AtomicBool::new(true));
    // On a terminal, Ctrl-D stops the node; otherwise it runs until killed.
    if std::io::stdin().is_terminal() {
        let stdin_running = Arc::clone(&running);
        thread::spawn(move || {
            let mut sink = String::new();
            while std::io::stdin()
                .read_line(&mut sink)
                .map(|read| read > 0)
                .unwrap_or(false)
            {
                sink.clear();
            }
            stdin_running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        loop {
            match bus.try_recv() {
                Ok(message) => log_bus_message(&message),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Node: bus lagged by {} messages", skipped);
                }
                Err(_) => break,
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
    node.shutdown();
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("playnode.toml")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = config::load_or_create(&config_path());

    let mut clog = colog::default_builder();
    clog.filter(None, config.logging.level_filter());
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let backend = open_backend(&config)?;
    match cli.command.unwrap_or(CliCommand::Run) {
        CliCommand::Run => run_node(&config, backend),
        CliCommand::Send {
            command_type,
            payload,
            target,
        } => {
            let target = target.unwrap_or_else(|| config.node.node_id.clone());
            let issuer = CommandIssuer::new(backend, "cli");
            let payload = payload.unwrap_or(serde_json::Value::Null);
            let command = issuer.send(&target, command_type, payload)?;
            println!("{}", command.id);
        }
        CliCommand::Status { command_id } => {
            let issuer = CommandIssuer::new(backend, "cli");
            match issuer.status(&command_id)? {
                Some(command) => println!("{}", serde_json::to_string_pretty(&command)?),
                None => {
                    eprintln!("command {command_id} not found");
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{lock_or_recover, Cli, CliCommand};
    use crate::model::CommandType;
    use clap::Parser;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_send_with_payload_and_target() {
        let cli = Cli::try_parse_from([
            "playnode",
            "send",
            "setVolume",
            "{\"volume\": 0.3}",
            "--target",
            "lobby",
        ])
        .expect("valid send");
        let Some(CliCommand::Send {
            command_type,
            payload,
            target,
        }) = cli.command
        else {
            panic!("expected send");
        };
        assert_eq!(command_type, CommandType::SetVolume);
        assert_eq!(payload.expect("payload")["volume"], 0.3);
        assert_eq!(target.as_deref(), Some("lobby"));
    }

    #[test]
    fn test_parse_rejects_unknown_type_and_defaults_to_run() {
        let bare = Cli::try_parse_from(["playnode"]).expect("no subcommand");
        assert!(bare.command.is_none());
        assert!(matches!(
            Cli::try_parse_from(["playnode", "run"]).map(|cli| cli.command),
            Ok(Some(CliCommand::Run))
        ));
        assert!(Cli::try_parse_from(["playnode", "send", "explode"]).is_err());
        assert!(Cli::try_parse_from(["playnode", "send", "skip", "{not json"]).is_err());
        assert!(Cli::try_parse_from(["playnode", "status"]).is_err());
    }

    #[test]
    fn test_send_without_payload_leaves_it_empty() {
        let cli = Cli::try_parse_from(["playnode", "send", "skip"]).expect("valid send");
        assert!(matches!(
            cli.command,
            Some(CliCommand::Send {
                command_type: CommandType::Skip,
                payload: None,
                target: None,
            })
        ));
    }

    #[test]
    fn test_lock_or_recover_survives_poisoning() {
        let shared = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(shared.is_poisoned());
        *lock_or_recover(&shared) += 1;
        assert_eq!(*lock_or_recover(&shared), 2);
    }
}
