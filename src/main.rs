mod app;
mod broadcast;
mod common;
mod config;
mod connection;
mod engine;
mod oracle;
mod protocol;
mod registry;
mod store;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use app::{App, ServerState};
use broadcast::Broadcaster;
use engine::Engine;
use oracle::MineOracle;
use registry::SessionRegistry;
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = config::Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    let store = Store::open(&args.store)
        .await
        .with_context(|| format!("could not open the store at {}", args.store.display()))?;
    let registry = Arc::new(SessionRegistry::new());
    let state = Arc::new(ServerState {
        engine: Engine::new(store.clone(), MineOracle::new(args.seed.clone())),
        broadcaster: Broadcaster::new(registry.clone()),
        registry,
        store,
    });

    let app = App::bind(args.listen, state)
        .await
        .with_context(|| format!("could not bind {}", args.listen))?;
    log::info!("listening on {}", app.local_addr()?);
    app.run().await;
    Ok(())
}
