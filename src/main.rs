mod capture;
mod cli;
mod config;
mod daemon;
mod distill;
mod doctor;
mod git;
mod llm;
mod logger;
mod models;
mod refiners;
mod scheduler;
mod server;
mod store;

use anyhow::Result;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h")
        || args.first().map(|s| s.as_str()) == Some("help")
    {
        cli::print_help();
        return;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("signet {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match args.first().map(|s| s.as_str()) {
        None | Some("daemon") => daemon::run().await,
        Some("status") => status(&args[1..]).await,
        Some("export") => export_cmd(&args[1..]),
        Some("import") => import_cmd(&args[1..]),
        Some("doctor") => {
            doctor::run().await;
            Ok(())
        }
        Some(other) => {
            eprintln!("signet: unknown command '{other}'\n");
            eprintln!("Run 'signet help' for usage.");
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("[signet] fatal: {e:#}");
        std::process::exit(1);
    }
}

fn open_store(manifest: &config::AgentManifest) -> Result<store::MemoryStore> {
    store::MemoryStore::open(
        &manifest.database_path(),
        &manifest.embedding,
        manifest.search,
        &manifest.perception.ollama_url,
    )
}

fn export_cmd(args: &[String]) -> Result<()> {
    let manifest_path = config::AgentManifest::manifest_path();
    if !manifest_path.exists() {
        config::AgentManifest::default().save_to(&manifest_path)?;
    }
    let manifest = config::AgentManifest::load()?;
    let target = cli::get_flag(args, "--output")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| models::signet_path("export"));
    let inline = cli::has_flag(args, "--embeddings");

    let memory_store = open_store(&manifest)?;
    let map = store::export::export(&memory_store, &models::signet_dir(), inline)?;
    store::export::write_to_dir(&map, &target)?;
    println!(
        "exported {} files to {}",
        map.len(),
        models::shorten_home(&target.to_string_lossy())
    );
    Ok(())
}

fn import_cmd(args: &[String]) -> Result<()> {
    let Some(source) = args.first().filter(|a| !a.starts_with("--")) else {
        eprintln!("signet: import requires a source directory");
        std::process::exit(1);
    };
    let strategy = cli::get_flag(args, "--strategy")
        .as_deref()
        .map(|s| {
            store::export::ConflictStrategy::parse(s).unwrap_or_else(|| {
                eprintln!("signet: unknown strategy '{s}' (skip | overwrite | merge)");
                std::process::exit(1);
            })
        })
        .unwrap_or_default();

    let manifest = config::AgentManifest::load()?;
    let memory_store = open_store(&manifest)?;
    let map = store::export::read_from_dir(std::path::Path::new(source))?;
    let summary = store::export::import(&memory_store, &map, strategy)?;
    println!(
        "imported {} memories ({} skipped), {} graph nodes, {} edges",
        summary.memories, summary.skipped, summary.nodes, summary.edges
    );
    Ok(())
}

async fn status(args: &[String]) -> Result<()> {
    let port: u16 = cli::get_flag(args, "--port")
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(config::port);

    let url = format!("http://127.0.0.1:{port}/api/status");
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Ok(resp) => {
            eprintln!("signet: daemon answered {} on port {port}", resp.status());
            std::process::exit(1);
        }
        Err(_) => {
            match daemon::running_pid() {
                Some(pid) => eprintln!(
                    "signet: pid file says {pid} is alive but port {port} is not answering"
                ),
                None => eprintln!("signet: daemon not running"),
            }
            std::process::exit(1);
        }
    }
}
