//! Linkharvest command-line entrypoint
//!
//! One invocation is one crawl run over every configured site. Exit codes:
//! 0 on success (including a run ended by a stop threshold), 2 on
//! configuration errors, 3 on unrecoverable runtime errors.

use clap::Parser;
use linkharvest::config::{
    default_sites_dir, image_dir, load_global_config, load_site_configs, validate_global,
};
use linkharvest::crawler::Runner;
use linkharvest::runtime::RunContext;
use linkharvest::sheets::{RestSheetsApi, SheetsWriter};
use linkharvest::state::StateStore;
use linkharvest::{HarvestError, SiteConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Resumable multi-site product-link crawler
#[derive(Parser, Debug)]
#[command(name = "linkharvest")]
#[command(about = "Crawls configured sites and appends product rows to a spreadsheet")]
struct Cli {
    /// Run identifier; a UUID v4 is generated when omitted
    #[arg(long)]
    run_id: Option<String>,

    /// Continue from persisted per-category progress (the default)
    #[arg(long, overrides_with = "no_resume")]
    resume: bool,

    /// Ignore persisted progress and start every category from page 1
    #[arg(long = "no-resume", overrides_with = "resume")]
    no_resume: bool,

    /// Purge the local progress store before running
    #[arg(long)]
    reset_state: bool,

    /// Crawl without writing anything to the spreadsheet
    #[arg(long)]
    dry_run: bool,

    /// Directory with per-site YAML/JSON configs
    #[arg(long, env = "SITE_CONFIG_DIR")]
    sites_dir: Option<PathBuf>,
}

fn setup_logging() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(format!("linkharvest={},warn", level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("linkharvest=info,warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // An explicit LOG_FILE_PATH redirects output to a file; default stays
    // on stdout so container logs keep working unconfigured.
    if let Ok(path) = std::env::var("LOG_FILE_PATH") {
        if !path.trim().is_empty() {
            if let Some(parent) = std::path::Path::new(path.trim()).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path.trim())
            {
                Ok(file) => {
                    builder
                        .with_ansi(false)
                        .with_writer(move || -> Box<dyn std::io::Write + Send> {
                            match file.try_clone() {
                                Ok(clone) => Box::new(clone),
                                Err(_) => Box::new(std::io::stdout()),
                            }
                        })
                        .init();
                    return;
                }
                Err(err) => {
                    eprintln!("cannot open log file {}: {}, using stdout", path, err);
                }
            }
        }
    }
    builder.init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(HarvestError::Config(err)) => {
            tracing::error!(error = %err, "Configuration error");
            eprintln!("configuration error: {}", err);
            2
        }
        Err(err) => {
            tracing::error!(error = %err, "Run failed");
            eprintln!("run failed: {}", err);
            3
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> linkharvest::Result<()> {
    let config = Arc::new(load_global_config()?);
    validate_global(&config)?;

    let sites_dir = cli.sites_dir.unwrap_or_else(default_sites_dir);
    let sites: Vec<Arc<SiteConfig>> = load_site_configs(&sites_dir)?
        .into_iter()
        .map(Arc::new)
        .collect();

    let run_id = cli
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    // Resume is the default; --no-resume switches it off, --resume wins if
    // both are given later on the command line.
    let resume = !cli.no_resume || cli.resume;
    tracing::info!(
        run_id = %run_id,
        sites = sites.len(),
        resume,
        dry_run = cli.dry_run,
        sites_dir = %sites_dir.display(),
        "Starting run"
    );

    let state = Arc::new(StateStore::open(&config.state.database)?);
    if cli.reset_state {
        tracing::warn!("Purging local progress store before the run");
        state.reset_all()?;
    }

    let writer = if cli.dry_run {
        None
    } else {
        let api = RestSheetsApi::from_env(config.sheet.spreadsheet_id.clone())?;
        Some(Arc::new(SheetsWriter::new(
            Arc::new(api),
            config.sheet.state_tab.clone(),
            config.sheet.runs_tab.clone(),
            config.sheet.flush_product_interval,
        )))
    };

    let context = RunContext::new(run_id, resume, cli.dry_run, config.runtime.global_stop);

    // Ctrl-C stops scheduling new work; in-flight product commits finish
    // and buffered rows flush before the runner returns.
    let cancel = context.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });

    let runner = Runner::new(context, config, sites, state, writer, image_dir());
    let results = runner.run().await?;

    let total_new: u64 = results.iter().map(|r| r.products_new()).sum();
    tracing::info!(
        sites = results.len(),
        products_new = total_new,
        "Run complete"
    );
    Ok(())
}
