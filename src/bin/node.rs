use std::sync::Arc;
use anyhow::Result;
use gumdrop::Options;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use contrace::config::{self, NodeArgs};
use contrace::hooks::HookManager;
use contrace::node::{self, Tracer};
use contrace::pods::ContainerRegistry;
use contrace::session::{self, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = NodeArgs::parse_args_default_or_exit();
    let cfg  = args.resolve()?;

    config::logger(cfg.verbose);

    let pods  = Arc::new(ContainerRegistry::new(&cfg.pods).await?);
    let hooks = Arc::new(HookManager::load(cfg.hooks).await?);
    let sink  = Arc::new(cfg.sink);
    let seed  = session::seed(&cfg.node);

    let sessions = Arc::new(SessionRegistry::new(&cfg.node, seed, pods.clone(), hooks.clone(), sink));

    let tracer = Arc::new(Tracer {
        node:     cfg.node.clone(),
        pods:     pods,
        hooks:    hooks,
        sessions: sessions.clone(),
    });

    let listener = TcpListener::bind(cfg.address).await?;
    info!("node tracer {} listening on {}", cfg.node, cfg.address);

    axum::serve(listener, node::router(tracer)).with_graceful_shutdown(async {
        if let Err(e) = signal::ctrl_c().await {
            error!("signal handler failed: {:?}", e);
        }
    }).await?;

    info!("shutting down, destroying all trace sessions");
    sessions.destroy_all().await;

    Ok(())
}
