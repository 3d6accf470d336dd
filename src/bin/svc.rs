use std::sync::Arc;
use anyhow::Result;
use gumdrop::Options;
use kube::Client;
use log::info;
use tokio::net::TcpListener;
use contrace::config::{self, SvcArgs};
use contrace::fleet::{self, FleetProxy, KubeDirectory};
use contrace::task::spawn;

#[tokio::main]
async fn main() -> Result<()> {
    let args = SvcArgs::parse_args_default_or_exit();
    let cfg  = args.resolve()?;

    config::logger(cfg.verbose);

    let client    = Client::try_default().await?;
    let directory = Box::new(KubeDirectory::new(client));
    let proxy     = Arc::new(FleetProxy::new(cfg.fleet, directory));

    proxy.discover().await?;
    spawn(proxy.clone().watch());

    let listener = TcpListener::bind(cfg.address).await?;
    info!("fleet proxy listening on {}", cfg.address);

    axum::serve(listener, fleet::api::router(proxy)).await?;

    Ok(())
}
