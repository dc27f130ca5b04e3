use crate::config::Config;
use crate::embeddings::EmbeddingGateway;
use crate::scrub::{Allowlist, Scrubber};
use anyhow::Result;
use std::path::Path;

/// Installation health report: config, home directory, secret rules,
/// vector store and embedding provider reachability.
pub async fn run(config: &Config, config_path: Option<&Path>) -> Result<()> {
    println!("contextd doctor");
    println!("===============");

    match config_path {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: (defaults; no contextd.toml found)"),
    }

    let home = crate::paths::contextd_home();
    match std::fs::create_dir_all(home) {
        Ok(()) => println!("home:   {} (writable)", home.display()),
        Err(e) => println!("home:   {} NOT writable: {e}", home.display()),
    }

    match Scrubber::new(Allowlist::empty()) {
        Ok(_) => println!("scrub:  built-in rule set compiles"),
        Err(e) => println!("scrub:  FAILED to compile rules: {e}"),
    }
    let user_allowlist = crate::paths::user_allowlist_file();
    if user_allowlist.exists() {
        match Allowlist::load_merged(None, Some(&user_allowlist)) {
            Ok(_) => println!("scrub:  user allowlist ok ({})", user_allowlist.display()),
            Err(e) => println!("scrub:  user allowlist INVALID: {e}"),
        }
    }

    match config.vectorstore.provider.as_str() {
        "memory" => println!("store:  in-memory (no infrastructure needed)"),
        "qdrant" => {
            let url = format!(
                "{}/collections",
                config.vectorstore.url.trim_end_matches('/')
            );
            match reqwest::get(&url).await {
                Ok(resp) if resp.status().is_success() => {
                    println!("store:  qdrant reachable at {}", config.vectorstore.url)
                }
                Ok(resp) => println!(
                    "store:  qdrant at {} answered {}",
                    config.vectorstore.url,
                    resp.status()
                ),
                Err(e) => println!("store:  qdrant UNREACHABLE at {}: {e}", config.vectorstore.url),
            }
        }
        other => println!("store:  unknown provider {other:?}"),
    }

    match EmbeddingGateway::from_config(&config.embeddings) {
        Ok(gateway) => match gateway.embed("contextd healthcheck").await {
            Ok(vec) => println!(
                "embed:  {} ok (dim {})",
                config.embeddings.provider,
                vec.len()
            ),
            Err(e) => println!("embed:  {} FAILED: {e}", config.embeddings.provider),
        },
        Err(e) => println!("embed:  misconfigured: {e}"),
    }

    Ok(())
}
