use std::future::Future;
use anyhow::Result;
use log::{debug, error};
use tokio::task::JoinHandle;

pub fn spawn<F: Future<Output = Result<()>> + Send + 'static>(task: F) -> JoinHandle<()> {
    tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!("task finished"),
            Err(e) => error!("task failed: {:?}", e),
        }
    })
}
