use axum::serve;
use modelgraph_db::config::AppConfig;
use modelgraph_db::{build_app, build_engine, FileStore};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("tower_http", LevelFilter::Warn)
        .filter_module("hyper", LevelFilter::Warn)
        .parse_default_env()
        .init();

    println!("modelgraph-db: schema-driven model server");

    let config = AppConfig::load()?;
    println!(
        "Configuration loaded: server={}:{}, uploads={}, identity={:?}",
        config.server.host,
        config.server.port,
        config.storage.uploads_dir.display(),
        config.engine.identity_strategy
    );

    let store = Arc::new(FileStore::new(&config.storage.uploads_dir).await?);
    let engine = build_engine(store, config.engine.identity_strategy);

    run_server(build_app(engine, config.server.max_body_bytes), &config).await?;

    Ok(())
}

async fn run_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    println!("modelgraph-db server running on http://{}", bind_address);
    println!(
        "Upload a schema with POST http://{}/sessions to get started",
        bind_address
    );

    serve(listener, app).await?;

    Ok(())
}
