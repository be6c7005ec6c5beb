//! Port Authority
//!
//! Command-line host for the request guard. Initializes the global
//! allocator, sets up logging, and runs one of:
//!
//! - `classify`: local/public verdict for URLs (no I/O)
//! - `decide`: one full decision against the configured store
//! - `serve`: JSON-lines loop on stdin/stdout for a browser-side shim

mod serve;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pa_guard::{Guard, GuardConfig};
use pa_network::{ClassificationVerdict, RequestContext, classify_str};
use pa_tabs::TabId;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Blocks port scans and tracker CNAMEs for the browser
#[derive(Parser, Debug)]
#[command(name = "port-authority", version, about)]
struct Args {
    /// Config file (.toml or .json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage file, overrides the config
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Classify URLs as local or public
    Classify {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Decide a single request
    Decide {
        /// Request target
        #[arg(long)]
        url: String,
        /// Page making the request
        #[arg(long)]
        origin: String,
        /// Tab the request belongs to
        #[arg(long, default_value_t = 0)]
        tab: i64,
    },
    /// Read JSON-lines messages from stdin, answer on stdout
    Serve,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "port_authority={level},pa_guard={level},pa_network={level},pa_tabs={level},pa_storage={level},warn"
        ))
    });

    // stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<GuardConfig> {
    let mut config = match &args.config {
        Some(path) => GuardConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => GuardConfig::default(),
    };
    if let Some(store) = &args.store {
        config.store_path = Some(store.clone());
    }
    Ok(config)
}

fn classify_urls(urls: &[String]) -> Result<()> {
    let mut failures = 0;
    for url in urls {
        match classify_str(url) {
            Ok(ClassificationVerdict::Local(reason)) => println!("{}\tlocal\t{}", url, reason),
            Ok(ClassificationVerdict::Public) => println!("{}\tpublic\t-", url),
            Err(e) => {
                warn!("{}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} URLs could not be parsed", failures, urls.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match &args.command {
        Mode::Classify { urls } => classify_urls(urls),
        Mode::Decide { url, origin, tab } => {
            let guard = Guard::open(load_config(&args)?).await?;
            let ctx = RequestContext::new(url.as_str(), origin.as_str(), TabId(*tab));

            let verdict = guard.on_before_request(&ctx).await;
            println!("{}", serde_json::to_string(&verdict)?);

            guard.shutdown().await;
            Ok(())
        }
        Mode::Serve => {
            info!("Port Authority starting...");
            let guard = Guard::open(load_config(&args)?).await?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            serve::serve(guard, stdin, tokio::io::stdout()).await?;
            info!("Port Authority shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_store_overrides_config() {
        let args = Args::parse_from(["port-authority", "--store", "/tmp/pa.json", "serve"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/pa.json")));
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(classify_urls(&["http://127.0.0.1/".to_string()]).is_ok());
        assert!(classify_urls(&["::not a url::".to_string()]).is_err());
    }
}
