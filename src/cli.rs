pub fn print_help() {
    println!("signet {}", env!("CARGO_PKG_VERSION"));
    println!("Local-first personal-agent daemon — ambient capture, durable memory, hybrid recall.\n");
    println!("USAGE:");
    println!("  signet daemon               Run the daemon (capture, refiners, HTTP API)");
    println!("  signet status               Query the running daemon");
    println!("  signet export  [OPTIONS]    Write the agent's state as a portable file map");
    println!("  signet import <dir> [OPTIONS]  Load a file map into the memory store");
    println!("  signet doctor               Check configuration and dependencies");
    println!("  signet help | --help | -h   Show this message");
    println!("  signet --version | -V       Show version\n");
    println!("EXPORT OPTIONS:");
    println!("  --output <dir>    Target directory (default: ~/.agents/export)");
    println!("  --embeddings      Inline vectors as base64 in memories.jsonl\n");
    println!("IMPORT OPTIONS:");
    println!("  --strategy <s>    Conflict strategy: skip (default) | overwrite | merge\n");
    println!("ENVIRONMENT:");
    println!("  SIGNET_PATH       State root (default: ~/.agents)");
    println!("  SIGNET_PORT       HTTP port (default: 3850)");
    println!("  SIGNET_NO_HOOKS   Set to 1 to suppress hook execution in spawned agents");
}

pub fn get_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn get_flag_reads_following_value() {
        let a = args(&["status", "--port", "4000"]);
        assert_eq!(get_flag(&a, "--port").as_deref(), Some("4000"));
        assert_eq!(get_flag(&a, "--missing"), None);
    }

    #[test]
    fn get_flag_without_value_is_none() {
        let a = args(&["status", "--port"]);
        assert_eq!(get_flag(&a, "--port"), None);
    }

    #[test]
    fn has_flag_is_exact_match() {
        let a = args(&["daemon", "--foreground"]);
        assert!(has_flag(&a, "--foreground"));
        assert!(!has_flag(&a, "--fore"));
    }
}
