use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use handoff_core::bootstrap::Role;
use handoff_core::config::{IceConfig, TransferConfig};
use handoff_core::handshake::SdpKind;
use handoff_core::optical::{self, LineDecoder, ScannedCode};
use handoff_core::progress::ProgressTracker;
use handoff_core::session::{SessionController, TransferSession};
use handoff_core::snapshot::{DirectorySink, Snapshot};
use handoff_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use handoff_core::transport::webrtc::WebRtcConnector;
use handoff_core::{HandoffError, Result as HandoffResult};
use tokio::sync::watch;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = TransferConfig::from_env();
    if let Some(millis) = cli.gather_timeout_ms {
        config = config.with_gather_timeout(Duration::from_millis(millis));
    }
    let ice = if cli.ice_servers.is_empty() {
        IceConfig::from_env()
    } else {
        IceConfig {
            servers: cli.ice_servers.clone(),
        }
    };
    let controller = SessionController::new(Arc::new(WebRtcConnector::new(ice)), config.clone());

    match cli.command {
        Command::Receive(args) => handle_receive(&controller, &config, args).await,
        Command::Send(args) => handle_send(&controller, &config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "handoff",
    about = "Move a database backup between two devices with no network server in between",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[arg(
        long = "gather-timeout-ms",
        global = true,
        value_name = "MILLIS",
        help = "Give up if candidate gathering takes longer than this"
    )]
    gather_timeout_ms: Option<u64>,

    #[arg(
        long = "ice-server",
        global = true,
        value_name = "URL",
        help = "STUN/TURN server to use (repeatable; none keeps the exchange offline)"
    )]
    ice_servers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "HANDOFF_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "HANDOFF_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a connection code and wait for a backup
    Receive(ReceiveArgs),
    /// Scan a receiver's code and send it a backup file
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    #[arg(
        long = "out-dir",
        value_name = "DIR",
        default_value = ".",
        help = "Directory the received backup is saved into"
    )]
    out_dir: PathBuf,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long, value_name = "PATH", help = "Exported backup (JSON) to send")]
    file: PathBuf,
}

async fn handle_receive(
    controller: &SessionController,
    config: &TransferConfig,
    args: ReceiveArgs,
) -> anyhow::Result<()> {
    let session = controller.begin(Role::Receiver).await;
    info!(session_id = %session.id(), "receive session started");

    eprintln!("Preparing connection code…");
    let offer = until_interrupted(&session, session.start_offer()).await?;
    show_code("Scan this code on the sending device:", &offer)?;

    let answer = read_code(
        "Paste the sending device's answer code:",
        SdpKind::Answer,
        config,
    )
    .await?;
    until_interrupted(&session, session.accept_answer(&answer.text)).await?;

    eprintln!("Waiting for the backup…");
    let sink = DirectorySink::new(&args.out_dir);
    let progress = spawn_progress(session.progress(), "Receiving");
    let report = until_interrupted(&session, session.receive(&sink)).await;
    progress.finish().await;
    let report = report?;

    let saved = report
        .saved_to
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| report.file_name.clone());
    println!("✅ Received {} ({} bytes) → {saved}", report.file_name, report.bytes);
    if let Some(summary) = &report.summary {
        println!(
            "   {} students, {} attendance records{}",
            summary.students,
            summary.attendance,
            summary
                .export_date
                .as_deref()
                .map(|date| format!(", exported {date}"))
                .unwrap_or_default()
        );
    }
    if report.dropped_frames > 0 {
        eprintln!("⚠️  {} damaged messages were skipped", report.dropped_frames);
    }
    Ok(())
}

async fn handle_send(
    controller: &SessionController,
    config: &TransferConfig,
    args: SendArgs,
) -> anyhow::Result<()> {
    let snapshot = Snapshot::from_file(&args.file)
        .await
        .with_context(|| format!("cannot send {}", args.file.display()))?;
    let session = controller.begin(Role::Sender).await;
    info!(session_id = %session.id(), file_name = %snapshot.file_name, "send session started");

    let offer = read_code(
        "Paste the receiving device's connection code:",
        SdpKind::Offer,
        config,
    )
    .await?;
    eprintln!("Preparing answer code…");
    let answer = until_interrupted(&session, session.accept_offer(&offer.text)).await?;
    show_code("Scan this answer code on the receiving device:", &answer)?;

    let progress = spawn_progress(session.progress(), "Sending");
    let report = until_interrupted(&session, session.send(&snapshot)).await;
    progress.finish().await;
    let report = report?;
    println!(
        "✅ Sent {} ({} bytes in {} chunks, {:.1}s)",
        report.file_name,
        report.bytes,
        report.chunks,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Runs one session step, cancelling the session on Ctrl-C.
async fn until_interrupted<T>(
    session: &TransferSession,
    step: impl std::future::Future<Output = HandoffResult<T>>,
) -> anyhow::Result<T> {
    let result = tokio::select! {
        result = step => result,
        _ = tokio::signal::ctrl_c() => {
            session.cancel().await;
            Err(HandoffError::UserCancelled)
        }
    };
    result.map_err(|err| {
        let message = err.user_message();
        anyhow::Error::new(err).context(message)
    })
}

fn show_code(heading: &str, text: &str) -> anyhow::Result<()> {
    let rendered = optical::render(text).map_err(|err| anyhow!(err.user_message()))?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "\n{heading}\n")?;
    writeln!(stdout, "{rendered}")?;
    writeln!(stdout, "Or copy the code as text:\n\n{text}\n")?;
    stdout.flush()?;
    Ok(())
}

/// Reads stdin lines until one holds a handshake of the expected kind.
async fn read_code(
    prompt: &str,
    kind: SdpKind,
    config: &TransferConfig,
) -> anyhow::Result<ScannedCode> {
    eprintln!("{prompt}");
    let max_age = config.payload_max_age;
    let scanned = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let lines = stdin.lock().lines().map_while(|line| line.ok()).inspect(|line| {
            if !line.trim().is_empty() {
                debug!(len = line.trim().len(), "code line read");
            }
        });
        optical::scan_handshake(&mut LineDecoder, lines, kind, max_age)
    })
    .await
    .context("stdin reader stopped")?;
    match scanned {
        Some(scanned) => Ok(scanned),
        None => bail!("input ended before a valid {kind} code was entered"),
    }
}

struct ProgressPrinter {
    done: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ProgressPrinter {
    async fn finish(self) {
        let _ = self.done.send(true);
        let _ = self.task.await;
        eprintln!();
    }
}

fn spawn_progress(progress: &ProgressTracker, label: &'static str) -> ProgressPrinter {
    let mut updates = progress.subscribe();
    let (done, mut done_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            let percent = *updates.borrow_and_update();
            eprint!("\r{label}… {percent:>3}%");
            let _ = io::stderr().flush();
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = done_rx.changed() => break,
            }
        }
        let percent = *updates.borrow();
        eprint!("\r{label}… {percent:>3}%");
    });
    ProgressPrinter { done, task }
}
