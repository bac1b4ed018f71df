use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{
    comms::CommsAdapter, files::FilesAdapter, screen::ScreenAdapter, terminal::TerminalAdapter,
    voice::VoiceAdapter, Adapter, CaptureManager,
};
use crate::config::{self, AgentManifest, PerceptionConfig};
use crate::distill;
use crate::llm::LlmClient;
use crate::logger;
use crate::models;
use crate::scheduler::RefinerScheduler;
use crate::server::{self, AppState};
use crate::store::MemoryStore;

const DISTILL_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Run the daemon until SIGTERM/SIGINT. Subsystems start leaves-first and
/// tear down in reverse order. Returns Err only for unrecoverable init
/// failures (state root, migrations, port bind).
pub async fn run() -> Result<()> {
    let state_root = models::signet_dir();
    std::fs::create_dir_all(&state_root)
        .with_context(|| format!("creating state root {}", state_root.display()))?;
    logger::init(models::logs_dir());

    let manifest = AgentManifest::load()?;
    let _pid_lock = acquire_pid_lock().context("acquiring pid lock")?;

    let store = Arc::new(
        MemoryStore::open(
            &manifest.database_path(),
            &manifest.embedding,
            manifest.search,
            &manifest.perception.ollama_url,
        )
        .context("opening memory store")?,
    );

    let llm = Arc::new(LlmClient::new(
        &manifest.perception.ollama_url,
        &manifest.perception.refiner_model,
    ));

    let manager = Arc::new(CaptureManager::new(build_adapters(&manifest.perception)));
    manager.start();

    let scheduler = Arc::new(RefinerScheduler::new(
        Arc::clone(&manager),
        Arc::clone(&store),
        Arc::clone(&llm),
        manifest.perception.refiner_interval_minutes,
    ));
    scheduler.start();

    let distill_task = spawn_distillation_loop(
        Arc::clone(&store),
        Arc::clone(&manager),
        Arc::clone(&llm),
    );

    let app_state = AppState {
        store: Arc::clone(&store),
        manager: Arc::clone(&manager),
        scheduler: Arc::clone(&scheduler),
        llm: Arc::clone(&llm),
        started_at: Instant::now(),
        agent_name: if manifest.agent.name.is_empty() {
            "signet".to_string()
        } else {
            manifest.agent.name.clone()
        },
    };

    logger::info(
        "daemon",
        &format!(
            "signet {} starting, state root {}",
            env!("CARGO_PKG_VERSION"),
            models::shorten_home(&state_root.to_string_lossy())
        ),
    );

    let result = server::run(app_state, config::port(), shutdown_signal()).await;

    // reverse dependency order
    distill_task.abort();
    scheduler.stop();
    manager.stop();
    release_pid_file();
    logger::info("daemon", "shutdown complete");

    result
}

fn build_adapters(perception: &PerceptionConfig) -> Vec<Arc<dyn Adapter>> {
    vec![
        Arc::new(ScreenAdapter::new(perception.screen.clone())),
        Arc::new(FilesAdapter::new(perception.files.clone())),
        Arc::new(TerminalAdapter::new(perception.terminal.clone())),
        Arc::new(CommsAdapter::new(perception.comms.clone())),
        Arc::new(VoiceAdapter::new(perception.voice.clone())),
    ]
}

fn spawn_distillation_loop(
    store: Arc<MemoryStore>,
    manager: Arc<CaptureManager>,
    llm: Arc<LlmClient>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(DISTILL_CHECK_INTERVAL);
        timer.tick().await;
        loop {
            timer.tick().await;
            if !distill::should_run_distillation(&store) {
                continue;
            }
            if let Err(e) = distill::run_distillation(&store, &manager, &llm).await {
                logger::warn("distill", &format!("distillation run failed: {e}"));
            }
        }
    })
}

/// Exclusive pid file: a second daemon against the same state root refuses
/// to start.
fn acquire_pid_lock() -> Result<File> {
    let path = models::pid_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another signet daemon holds {}", path.display()))?;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(file)
}

fn release_pid_file() {
    let _ = std::fs::remove_file(models::pid_path());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    logger::info("daemon", "shutdown signal received");
}

/// Liveness probe for `signet status`: read the pid file and signal 0 it.
pub fn running_pid() -> Option<u32> {
    let content = std::fs::read_to_string(models::pid_path()).ok()?;
    let pid: libc::pid_t = content.trim().parse().ok()?;
    if unsafe { libc::kill(pid, 0) } == 0 {
        Some(pid as u32)
    } else {
        None
    }
}
