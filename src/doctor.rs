use crate::capture::find_tool;
use crate::config::{AgentManifest, EmbeddingProvider};
use crate::models;
use crate::store::{migrations, open_connection};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

pub async fn run() {
    println!();
    println!("{DIM}── signet doctor ───────────────────────────────{RESET}");
    println!();

    let mut pass = 0u32;
    let mut fail = 0u32;

    check_state_root(&mut pass, &mut fail);
    check_manifest(&mut pass, &mut fail);
    check_database(&mut pass, &mut fail);
    check_inference(&mut pass, &mut fail).await;
    check_tools();
    check_daemon();

    println!();
    println!(
        "  {BOLD}{pass}{RESET} passed  {}{fail}{} failed",
        if fail > 0 { RED } else { DIM },
        RESET
    );
    println!();
}

fn ok(msg: &str, pass: &mut u32) {
    println!("  {GREEN}✓{RESET}  {msg}");
    *pass += 1;
}

fn err(msg: &str, fail: &mut u32) {
    println!("  {RED}✗{RESET}  {msg}");
    *fail += 1;
}

fn info(msg: &str) {
    println!("  {CYAN}i{RESET}  {msg}");
}

fn check_state_root(pass: &mut u32, fail: &mut u32) {
    let root = models::signet_dir();
    let display = models::shorten_home(&root.to_string_lossy());
    if root.is_dir() {
        ok(&format!("state root exists ({display})"), pass);
    } else if std::fs::create_dir_all(&root).is_ok() {
        ok(&format!("state root created ({display})"), pass);
    } else {
        err(&format!("state root not writable ({display})"), fail);
    }
}

fn check_manifest(pass: &mut u32, fail: &mut u32) {
    let path = AgentManifest::manifest_path();
    if !path.exists() {
        info("agent.yaml missing — running with defaults");
        return;
    }
    match AgentManifest::load() {
        Ok(manifest) => {
            ok(&format!("agent.yaml valid (schema {})", manifest.schema), pass);
            if manifest.embedding.provider == EmbeddingProvider::None {
                info("no embedding provider configured — recall is keyword-only");
            }
        }
        Err(e) => err(&format!("agent.yaml malformed: {e}"), fail),
    }
}

fn check_database(pass: &mut u32, fail: &mut u32) {
    let path = models::db_path();
    if !path.exists() {
        info("no database yet — created on first daemon start");
        return;
    }
    match open_connection(&path) {
        Ok(conn) => {
            let version = migrations::current_version(&conn);
            let latest = migrations::latest_version();
            if version == latest {
                ok(&format!("database at schema version {version}"), pass);
            } else {
                info(&format!(
                    "database at schema version {version} of {latest} — daemon start migrates"
                ));
            }
            match conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0)) {
                Ok(v) => ok(&format!("sqlite-vec loaded ({v})"), pass),
                Err(_) => err("sqlite-vec extension failed to load", fail),
            }
        }
        Err(e) => err(&format!("database unreadable: {e}"), fail),
    }
}

async fn check_inference(pass: &mut u32, fail: &mut u32) {
    let manifest = AgentManifest::load().unwrap_or_default();
    let llm = crate::llm::LlmClient::new(
        &manifest.perception.ollama_url,
        &manifest.perception.refiner_model,
    );
    if llm.check_health().await {
        ok(
            &format!(
                "inference endpoint reachable ({}, model {})",
                llm.base_url(),
                llm.model()
            ),
            pass,
        );
    } else {
        err(
            &format!(
                "inference endpoint unreachable ({}) — refiners will idle",
                llm.base_url()
            ),
            fail,
        );
    }
}

fn check_tools() {
    for (tool, used_by) in [
        ("git", "comms adapter"),
        ("tesseract", "screen OCR"),
        ("ffmpeg", "voice capture"),
        ("whisper", "voice transcription"),
    ] {
        match find_tool(tool) {
            Some(path) => info(&format!("{tool} found at {}", path.display())),
            None => info(&format!("{tool} not found — {used_by} degrades")),
        }
    }
}

fn check_daemon() {
    match crate::daemon::running_pid() {
        Some(pid) => info(&format!("daemon running (pid {pid})")),
        None => info("daemon not running"),
    }
}
