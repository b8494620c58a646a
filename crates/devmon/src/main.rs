mod render;

use anyhow::{Context, Result};
use clap::Parser;
use devmon_capture::{spawn_capture, CaptureConfig, CaptureSink};
use devmon_core::{now_ms, resolve_workspace, Depth, NotificationBus, SessionContext};
use devmon_mind::provider::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use devmon_mind::{
    spawn_analysis_loop, AnalysisConfig, AnalysisEngine, AnalysisProvider, AnthropicProvider,
    FallbackChain, PatternConfig, PatternEngine, ProviderConfig,
};
use devmon_storage::MonitorStore;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DB_FILE: &str = "devmon.db";
const LOG_FILE: &str = "devmon.log";
const INBOX_FILE: &str = "signals.jsonl";
const RETENTION_SWEEP: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "devmon", about = "Watches a development session and comments on it")]
struct Args {
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "DEVMON_MODEL", default_value = DEFAULT_MODEL)]
    model: String,
    /// Second model tried when the primary one fails.
    #[arg(long, env = "DEVMON_FALLBACK_MODEL")]
    fallback_model: Option<String>,
    #[arg(long, env = "DEVMON_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,
    #[arg(long, env = "DEVMON_INTERVAL_SECS", default_value_t = 120)]
    interval_secs: u64,
    #[arg(long, env = "DEVMON_WARMUP_SECS", default_value_t = 15)]
    warmup_secs: u64,
    #[arg(long, env = "DEVMON_DEPTH", default_value = "standard")]
    depth: Depth,
    #[arg(long, env = "DEVMON_SNAPSHOT_WINDOW_SECS", default_value_t = 300)]
    snapshot_window_secs: u64,
    #[arg(long, env = "DEVMON_RETENTION_DAYS", default_value_t = 30)]
    retention_days: i64,
    #[arg(long, env = "DEVMON_CONVERSATION_ROOT")]
    conversation_root: Option<PathBuf>,
    #[arg(long, env = "DEVMON_INBOX")]
    inbox: Option<PathBuf>,
    #[arg(long, env = "DEVMON_DATA_DIR")]
    data_dir: Option<PathBuf>,
    #[arg(long, env = "DEVMON_WORKSPACE")]
    workspace: Option<PathBuf>,
    #[arg(long, env = "DEVMON_VCS_POLL_SECS", default_value_t = 10)]
    vcs_poll_secs: u64,
    #[arg(long, env = "DEVMON_NO_VCS", default_value_t = false)]
    no_vcs: bool,
    #[arg(long, env = "DEVMON_SHOW_CAPTURES", default_value_t = false)]
    show_captures: bool,
    #[arg(long, env = "DEVMON_LOG_LEVEL")]
    log_level: Option<String>,
    /// Mirror log lines to stderr as well as the log file.
    #[arg(long, env = "DEVMON_LOG_STDERR", default_value_t = false)]
    log_stderr: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    data_dir: PathBuf,
    workspace: String,
    provider: ProviderConfig,
    fallback_model: Option<String>,
    analysis: AnalysisConfig,
    capture: CaptureConfig,
    retention_days: i64,
    show_captures: bool,
    log_level: String,
    log_stderr: bool,
}

fn load_config(args: Args) -> RuntimeConfig {
    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    let cwd = match args.workspace {
        Some(path) => path,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let workspace = resolve_workspace(&cwd);

    let log_level = if args.debug {
        "debug".to_string()
    } else {
        args.log_level
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| "info".to_string())
    };

    let capture = CaptureConfig {
        conversation_root: args.conversation_root.or_else(default_conversation_root),
        inbox_path: Some(args.inbox.unwrap_or_else(|| data_dir.join(INBOX_FILE))),
        workspace_root: (!args.no_vcs).then(|| PathBuf::from(&workspace)),
        snapshot_window: Duration::from_secs(args.snapshot_window_secs),
        vcs_poll_interval: Duration::from_secs(args.vcs_poll_secs.max(1)),
        ..CaptureConfig::default()
    };

    RuntimeConfig {
        data_dir,
        workspace,
        provider: ProviderConfig {
            api_key: args.api_key,
            model: args.model,
            base_url: args.base_url,
            ..ProviderConfig::default()
        },
        fallback_model: args.fallback_model.filter(|model| !model.trim().is_empty()),
        analysis: AnalysisConfig {
            warmup: Duration::from_secs(args.warmup_secs),
            interval: Duration::from_secs(args.interval_secs.max(1)),
            default_depth: args.depth,
            ..AnalysisConfig::default()
        },
        capture,
        retention_days: args.retention_days.max(1),
        show_captures: args.show_captures,
        log_level,
        log_stderr: args.log_stderr,
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("devmon"))
        .unwrap_or_else(|| PathBuf::from(".devmon"))
}

fn default_conversation_root() -> Option<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("opencode").join("storage"))
        .filter(|dir| dir.is_dir())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(Args::parse());
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let _log_guard = init_logging(&config);

    let provider = build_provider(&config)?;
    let context = SessionContext::for_workspace(config.workspace.clone());
    let db_path = config.data_dir.join(DB_FILE);
    let store = Arc::new(
        MonitorStore::open(&db_path, context.clone())
            .with_context(|| format!("opening store {}", db_path.display()))?,
    );
    info!(
        workspace = %context.workspace_id,
        session = %context.session_id,
        db = %db_path.display(),
        provider = provider.name(),
        "devmon started"
    );

    let bus = NotificationBus::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = vec![render::spawn_renderer(
        bus.subscribe(),
        config.show_captures,
        shutdown_rx.clone(),
    )];

    handles.extend(spawn_capture(
        &config.capture,
        CaptureSink::new(Arc::clone(&store), bus.clone()),
        shutdown_rx.clone(),
    ));

    let patterns = Arc::new(PatternEngine::new(
        Arc::clone(&provider),
        Arc::clone(&store),
        PatternConfig::default(),
    ));
    let engine = Arc::new(AnalysisEngine::new(
        Arc::clone(&store),
        provider,
        patterns,
        bus.clone(),
        config.analysis.clone(),
    ));
    handles.push(spawn_analysis_loop(Arc::clone(&engine), shutdown_rx.clone()));
    handles.push(spawn_retention_loop(
        Arc::clone(&store),
        config.retention_days,
        bus.clone(),
        shutdown_rx.clone(),
    ));
    handles.push(spawn_command_loop(
        Arc::clone(&engine),
        bus.clone(),
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));

    bus.status(format!(
        "watching {} (type 'a' + Enter to analyze now, 'q' to quit)",
        context.workspace_id
    ));

    let mut stop = shutdown_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = stop.wait_for(|stopped| *stopped) => {}
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    store.close().context("closing store")?;
    Ok(())
}

fn build_provider(config: &RuntimeConfig) -> Result<Arc<dyn AnalysisProvider>> {
    let primary = AnthropicProvider::new(config.provider.clone())
        .context("analysis provider is not configured")?;
    let Some(model) = &config.fallback_model else {
        return Ok(Arc::new(primary));
    };

    let fallback = AnthropicProvider::new(ProviderConfig {
        model: model.clone(),
        ..config.provider.clone()
    })
    .context("fallback provider is not configured")?;
    Ok(Arc::new(FallbackChain::new(vec![
        Arc::new(primary) as Arc<dyn AnalysisProvider>,
        Arc::new(fallback),
    ])))
}

fn spawn_retention_loop(
    store: Arc<MonitorStore>,
    retention_days: i64,
    bus: NotificationBus,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match store.purge_older_than(retention_days, now_ms()) {
                    Ok(report) if report.total() > 0 => info!(
                        events = report.events,
                        observations = report.observations,
                        pattern_occurrences = report.pattern_occurrences,
                        "retention purge"
                    ),
                    Ok(_) => {}
                    Err(err) => {
                        warn!("retention_purge_failed: {err}");
                        bus.error(format!("retention purge failed: {err}"));
                    }
                },
            }
        }
    })
}

/// Reads line commands from stdin on a plain thread so a pending read never
/// holds up runtime shutdown.
fn spawn_command_loop(
    engine: Arc<AnalysisEngine>,
    bus: NotificationBus,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    match line.trim() {
                        "a" | "analyze" => {
                            let engine = Arc::clone(&engine);
                            let bus = bus.clone();
                            tokio::spawn(async move {
                                if let Ok(report) = engine.analyze_now().await {
                                    if report.events == 0 {
                                        bus.status("no new activity since the last cycle");
                                    } else if report.observation.is_none() {
                                        bus.status(format!(
                                            "{} events analyzed, nothing to report",
                                            report.events
                                        ));
                                    }
                                }
                            });
                        }
                        "q" | "quit" => {
                            let _ = shutdown_tx.send(true);
                        }
                        "" => {}
                        other => bus.status(format!("unknown command: {other}")),
                    }
                }
            }
        }
    })
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let guard = match open_log_file(&config.data_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stderr_enabled = config.log_stderr;
    let make_writer = BoxMakeWriter::new(move || LogWriter::new(file.clone(), stderr_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// File sink with an optional stderr mirror; stdout stays reserved for the
/// rendered notification stream.
struct LogWriter {
    stderr: Option<io::Stderr>,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl LogWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>, stderr_enabled: bool) -> Self {
        Self {
            stderr: stderr_enabled.then(io::stderr),
            file,
        }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(data_dir: &Path) -> io::Result<LogGuard> {
    std::fs::create_dir_all(data_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join(LOG_FILE))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> RuntimeConfig {
        let mut argv = vec!["devmon", "--data-dir", "/tmp/devmon-test", "--workspace", "/"];
        argv.extend_from_slice(extra);
        load_config(Args::try_parse_from(argv).expect("args"))
    }

    #[test]
    fn flags_flow_into_component_configs() {
        let config = parse(&[
            "--interval-secs",
            "60",
            "--warmup-secs",
            "5",
            "--depth",
            "deep",
            "--snapshot-window-secs",
            "120",
            "--retention-days",
            "7",
            "--inbox",
            "/tmp/inbox.jsonl",
            "--no-vcs",
        ]);

        assert_eq!(config.analysis.interval, Duration::from_secs(60));
        assert_eq!(config.analysis.warmup, Duration::from_secs(5));
        assert_eq!(config.analysis.default_depth, Depth::Deep);
        assert_eq!(config.capture.snapshot_window, Duration::from_secs(120));
        assert_eq!(
            config.capture.inbox_path,
            Some(PathBuf::from("/tmp/inbox.jsonl"))
        );
        assert!(config.capture.workspace_root.is_none());
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn inbox_defaults_into_data_dir() {
        let config = parse(&[]);
        assert_eq!(
            config.capture.inbox_path,
            Some(PathBuf::from("/tmp/devmon-test").join(INBOX_FILE))
        );
        assert_eq!(config.capture.workspace_root, Some(PathBuf::from(&config.workspace)));
    }

    #[test]
    fn debug_flag_overrides_log_level() {
        let config = parse(&["--log-level", "warn", "--debug"]);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn missing_credential_is_fatal() {
        let mut config = parse(&[]);
        config.provider.api_key = None;
        let err = build_provider(&config).err().expect("missing key rejected");
        assert!(format!("{err:#}").contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn fallback_model_builds_chain() {
        let mut config = parse(&["--fallback-model", "claude-3-5-sonnet-latest"]);
        config.provider.api_key = Some("test-key".to_string());
        assert_eq!(build_provider(&config).expect("chain").name(), "fallback-chain");

        config.fallback_model = None;
        assert_eq!(build_provider(&config).expect("single").name(), "anthropic");
    }
}
