use anyhow::{Context, Result};
use clap::Parser;
use escrow_desk::{
    SessionRouter,
    cli::Args,
    config::Settings,
    console::{self, ConsoleGateway},
    dispatcher::Dispatcher,
    memory_store::MemoryStore,
    store::{DealStore, PreferenceStore, SledStore},
    telemetry,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "Fatal error");
            eprintln!("Fatal error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("load configuration")?;
    let _log_guard = telemetry::init(
        &settings.log_level,
        settings.logs_dir.as_deref().map(Path::new),
    );

    let (deals, preferences) = open_stores(&args, &settings)?;

    let gateway = Arc::new(ConsoleGateway::new(tokio::io::stdout()));
    let dispatcher = Dispatcher::new(
        gateway,
        Arc::clone(&preferences),
        settings.arbiter().id,
        settings.dispatch_policy(),
    );
    let router = Arc::new(SessionRouter::new(
        deals,
        preferences,
        dispatcher,
        settings.router_settings(),
    ));

    info!(admin = settings.admin.id, "Escrow desk ready, reading events from stdin");

    let handled = console::serve(router, BufReader::new(tokio::io::stdin())).await?;

    info!(events = handled, "Input closed, shutting down");
    Ok(())
}

fn open_stores(
    args: &Args,
    settings: &Settings,
) -> Result<(Arc<dyn DealStore>, Arc<dyn PreferenceStore>)> {
    if args.ephemeral {
        let store = Arc::new(MemoryStore::new());
        let deals: Arc<dyn DealStore> = store.clone();
        let preferences: Arc<dyn PreferenceStore> = store;
        return Ok((deals, preferences));
    }

    let path = args
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.db_path));
    let db = sled::open(&path).with_context(|| format!("open database at {}", path.display()))?;
    let store = Arc::new(SledStore::new(Arc::new(db))?);

    let deals: Arc<dyn DealStore> = store.clone();
    let preferences: Arc<dyn PreferenceStore> = store;
    Ok((deals, preferences))
}
