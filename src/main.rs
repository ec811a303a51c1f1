//! Command-line entry point: `import` walks directories of generated PNGs
//! into hydrus, `retag` reparses files already there.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};

use hydrus_import::error::AppError;
use hydrus_import::hydrus::{self, HydrusClient};
use hydrus_import::import::{CACHE_FILE, ImportRun, ProcessedCache};
use hydrus_import::metadata::WebuiEvaluator;
use hydrus_import::retag;

#[derive(Parser)]
#[command(
    name = "hydrus-import",
    about = "Import AI-generated images into hydrus with tags rebuilt from their metadata",
    version
)]
struct Cli {
    /// Tag service that receives the generated tags
    #[arg(short, long, global = true, default_value = "stable-diffusion-webui")]
    service: String,

    /// Hydrus client API endpoint
    #[arg(short = 'a', long, global = true, default_value = hydrus::DEFAULT_API_URL)]
    api_url: String,

    /// Access key; falls back to the HYDRUS_ACCESS_KEY environment variable
    #[arg(short = 'k', long, global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import new files
    Import {
        /// Directories to scan for PNG files
        #[arg(required = true)]
        paths: Vec<String>,

        /// Extra tag applied to every imported file; repeatable
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,

        /// Do not descend into subdirectories
        #[arg(short = 'n', long)]
        no_recursive: bool,
    },
    /// Reparse and retag files already in the store
    Retag {
        /// Search query, one tag per argument
        #[arg(required = true)]
        query: Vec<String>,
    },
}

fn run(cli: Cli) -> Result<(), AppError> {
    let api_key = cli
        .api_key
        .or_else(|| std::env::var("HYDRUS_ACCESS_KEY").ok())
        .ok_or_else(|| {
            AppError::Config(
                "no access key: pass --api-key or set HYDRUS_ACCESS_KEY".to_string(),
            )
        })?;

    let client = HydrusClient::new(&cli.api_url, &api_key)?;
    client.verify_permissions(&[
        hydrus::PERMISSION_IMPORT_FILES,
        hydrus::PERMISSION_ADD_TAGS,
        hydrus::PERMISSION_SEARCH_FILES,
    ])?;

    match cli.command {
        Command::Import {
            paths,
            tags,
            no_recursive,
        } => {
            let service_key = client.service_key(&cli.service)?;

            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            ctrlc::set_handler(move || {
                log::warn!("interrupt received, finishing current batch");
                flag.store(true, Ordering::SeqCst);
            })
            .map_err(|err| AppError::Config(format!("cannot install interrupt handler: {err}")))?;

            let cache = ProcessedCache::load(Path::new(CACHE_FILE));
            let mut import_run =
                ImportRun::new(&client, &WebuiEvaluator, service_key, cache, shutdown);
            import_run.import_paths(&paths, &tags, !no_recursive)?;
        }
        Command::Retag { query } => {
            retag::retag(&client, &cli.service, &query, &WebuiEvaluator)?;
        }
    }
    Ok(())
}

fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("{err}");
        std::process::exit(1);
    }
}
