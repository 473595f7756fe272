//! Cultivation-world text adventure.
//!
//! Reads player actions from stdin and streams the narration to stdout:
//!
//! ```bash
//! cargo run -p xiuxian -- --name "Lin Feng" --path "Sword Dao" --region "Misty Peak"
//! ```
//!
//! The host is configured with `XIUXIAN_HOST_URL` (and optionally
//! `XIUXIAN_API_KEY`). Without it the game still starts, but only save
//! management works.

mod headless;

use host::{Backend, FileStore, HostConfig, HttpHost};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Logs go to stderr so they never mix with the narration.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,xiuxian=info,xiuxian_core=info,host=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let options = headless::parse_options_from_args(&args);
    let backend = connect(&options.data_dir)?;

    headless::run_headless(backend, options)
        .await
        .map_err(|e| e.into())
}

/// Build the backend: the HTTP host if one is configured, with saves falling
/// back to files under `data_dir` until it reports ready.
fn connect(data_dir: &Path) -> Result<Arc<Backend>, host::Error> {
    let store = Arc::new(FileStore::new(data_dir));

    let config = match HostConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "No host configured, running offline");
            return Ok(Arc::new(Backend::local_only(store)));
        }
    };

    tracing::info!(url = %config.base_url, "Connecting to host");
    let http = Arc::new(HttpHost::new(config)?);
    let backend = Backend::new(http.clone(), store);

    let notifier = backend.notifier();
    tokio::spawn(async move {
        if http.probe().await {
            notifier.notify_ready();
        }
    });

    Ok(Arc::new(backend))
}

fn print_help() {
    println!("xiuxian - a cultivation-world text adventure");
    println!();
    println!("USAGE:");
    println!("    xiuxian [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --name <NAME>         Character name");
    println!("    --gender <GENDER>     male, female or formless");
    println!("    --race <RACE>         Character race (default: Human)");
    println!("    --path <PATH>         The Dao the character walks");
    println!("    --region <REGION>     Starting region");
    println!("    --age <YEARS>         Starting age (default: 16)");
    println!("    --model <MODEL>       Model id or name (default: XL)");
    println!("    --max-tokens <N>      Token budget per response");
    println!("    --data-dir <DIR>      Where local saves are kept (default: ./data)");
    println!("    --continue            Resume from the autosave");
    println!("    -h, --help            Show this help");
    println!();
    println!("ENVIRONMENT:");
    println!("    XIUXIAN_HOST_URL      Base URL of the completion host");
    println!("    XIUXIAN_API_KEY       Bearer token for the host");
    println!("    XIUXIAN_DATA_DIR      Default for --data-dir");
    println!("    RUST_LOG              Log filter, e.g. xiuxian_core=debug");
}
