use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;

use repodrop_core::channel::unix::UnixConnector;
use repodrop_core::config::{self, MAX_ARCHIVE_BYTES, validate_settings};
use repodrop_core::{
    APP_NAME, ArchiveReady, ChannelEvent, ChannelOptions, ConnectionChannel, Message,
    UploadProgress, run_log,
};

#[derive(Parser)]
#[command(name = "repodrop")]
#[command(about = "Push project archives to GitHub through the repodrop daemon", long_about = None)]
struct Cli {
    /// Print machine-readable NDJSON instead of text.
    #[arg(long)]
    json: bool,

    /// Mirror client logs to stderr (filter via REPODROP_LOG).
    #[arg(long, short)]
    verbose: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a ZIP archive to the daemon and follow the sync to the end.
    Push {
        archive: PathBuf,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Print every progress update the daemon broadcasts.
    Watch,
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Validate config.toml without contacting the daemon.
    Check,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<repodrop_core::Error> for CliError {
    fn from(e: repodrop_core::Error) -> Self {
        let retryable = matches!(
            e,
            repodrop_core::Error::Busy
                | repodrop_core::Error::StaleConfig { .. }
                | repodrop_core::Error::TransportDead
        );
        Self {
            code: e.code(),
            message: e.user_message(),
            retryable,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    if cli.verbose {
        run_log::init_logging(true);
    }
    let config_dir = cli.config_dir.unwrap_or_else(config::default_config_dir);
    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    let socket_path = data_dir.join("ipc").join("channel.sock");

    match cli.cmd {
        Command::Push {
            archive,
            message,
            project,
        } => push(&socket_path, &archive, message, project, cli.json).await,
        Command::Watch => watch(&socket_path, cli.json).await,
        Command::Config {
            cmd: ConfigCmd::Check,
        } => config_check(&config_dir, cli.json),
    }
}

/// Connects as a UI context. The subscription lives as long as the receiver
/// is needed, so it is returned alongside it.
async fn open_channel(
    socket_path: &Path,
) -> Result<
    (
        ConnectionChannel,
        repodrop_core::channel::Subscription,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ),
    CliError,
> {
    let channel = ConnectionChannel::new(
        Arc::new(UnixConnector::new(socket_path)),
        ChannelOptions {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            ..ChannelOptions::default()
        },
    );
    let (sub, events) = channel.events();
    channel.connect().await.map_err(|_| {
        CliError::retryable(
            "daemon.unavailable",
            format!("{APP_NAME} daemon is not reachable at {}", socket_path.display()),
        )
    })?;
    Ok((channel, sub, events))
}

async fn push(
    socket_path: &Path,
    archive: &Path,
    message: Option<String>,
    project: Option<String>,
    json: bool,
) -> Result<(), CliError> {
    let bytes = std::fs::read(archive).map_err(|e| {
        CliError::new("archive.read_failed", format!("{}: {e}", archive.display()))
    })?;
    check_archive_size(bytes.len())?;

    let (channel, _sub, mut events) = open_channel(socket_path).await?;
    channel.send(Message::ContentScriptReady)?;

    let version = loop {
        match next_event(&mut events).await? {
            Message::SettingsChanged { version, ready } => {
                if !ready {
                    return Err(CliError::new(
                        "sync.not_ready",
                        "daemon is not configured; run `repodrop config check`",
                    ));
                }
                break version;
            }
            _ => continue,
        }
    };

    let mut request = ArchiveReady::from_bytes(&bytes);
    request.commit_message = message;
    request.project_id = project;
    request.config_version = Some(version);
    channel.send(Message::ArchiveReady(request))?;

    loop {
        match next_event(&mut events).await? {
            Message::UploadStatus(p) => {
                print_progress(&p, json);
                if p.phase.is_terminal() {
                    return match p.phase {
                        repodrop_core::SyncPhase::Success => Ok(()),
                        _ => Err(CliError::new("sync.failed", p.message)),
                    };
                }
            }
            Message::Rejected { code, message } => {
                let retryable = code == "sync.busy" || code == "config.stale";
                return Err(CliError {
                    code: "sync.rejected",
                    message: format!("{message} ({code})"),
                    retryable,
                });
            }
            _ => {}
        }
    }
}

/// Oversized archives would exceed the socket frame limit, so they are
/// refused before connecting.
fn check_archive_size(len: usize) -> Result<(), CliError> {
    if len as u64 > MAX_ARCHIVE_BYTES {
        return Err(repodrop_core::Error::ArchiveTooLarge {
            size: len,
            limit: MAX_ARCHIVE_BYTES as usize,
        }
        .into());
    }
    Ok(())
}

async fn watch(socket_path: &Path, json: bool) -> Result<(), CliError> {
    let (channel, _sub, mut events) = open_channel(socket_path).await?;
    channel.send(Message::ContentScriptReady)?;

    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            m = next_event(&mut events) => m?,
        };
        match message {
            Message::UploadStatus(p) => print_progress(&p, json),
            Message::SettingsChanged { version, ready } => {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "type": "settings.changed", "version": version, "ready": ready })
                    );
                } else {
                    println!("settings version={version} ready={ready}");
                }
            }
            _ => {}
        }
    }
}

/// Next inbound message; terminal channel events become errors.
async fn next_event(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Result<Message, CliError> {
    loop {
        match events.recv().await {
            Some(ChannelEvent::Message(m)) => return Ok(m),
            Some(ChannelEvent::HostGone) => {
                return Err(CliError::retryable("daemon.stopped", "daemon shut down"));
            }
            Some(ChannelEvent::RetriesExhausted { attempts }) => {
                return Err(CliError::retryable(
                    "daemon.unavailable",
                    format!("lost the daemon after {attempts} reconnect attempts"),
                ));
            }
            Some(ChannelEvent::TransientDrop) => {
                tracing::debug!(event = "cli.channel_dropped", "cli.channel_dropped");
            }
            Some(ChannelEvent::StateChanged(_)) => {}
            None => return Err(CliError::new("channel.closed", "event stream closed")),
        }
    }
}

fn print_progress(p: &UploadProgress, json: bool) {
    if json {
        let line = serde_json::json!({ "type": "upload.status", "progress": p });
        println!("{line}");
        return;
    }
    match (p.files_done, p.files_total) {
        (Some(done), Some(total)) => println!(
            "[{:>3}%] {:<12} {} ({done}/{total})",
            p.percent,
            p.phase.as_str(),
            p.message
        ),
        _ => println!("[{:>3}%] {:<12} {}", p.percent, p.phase.as_str(), p.message),
    }
}

fn config_check(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = config::load_settings(config_dir)?;
    validate_settings(&settings)?;
    settings.check_ready()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "owner": settings.github.owner,
                "repo": settings.github.repo,
                "branch": settings.github.branch,
                "projects": settings.projects.len(),
            })
        );
    } else {
        println!("ok");
        println!("target={}/{}@{}", settings.github.owner, settings.github.repo, settings.github.branch);
        println!("projects={}", settings.projects.len());
    }
    Ok(())
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
