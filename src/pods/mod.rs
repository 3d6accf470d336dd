use std::path::{Path, PathBuf};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use glob::Pattern;
use libc::pid_t;
use log::{debug, warn};
use parking_lot::RwLock;
use procfs::process::Process;
use tokio::task;
use crate::data::{Container, PodMap};

pub mod cri;
pub mod ns;
pub mod proc;

pub use cri::{CriConfig, CriDiscovery};
pub use proc::ProcDiscovery;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    Cri,
    Proc,
}

#[async_trait]
pub trait Discover: Send + Sync {
    async fn scan(&self) -> Result<PodMap>;

    fn strategy(&self) -> Strategy;
}

#[derive(Clone, Debug)]
pub struct PodConfig {
    pub cri:        CriConfig,
    pub force_proc: bool,
    pub procfs:     PathBuf,
}

pub struct ContainerRegistry {
    discover: Box<dyn Discover>,
    procfs:   PathBuf,
    pods:     RwLock<PodMap>,
}

impl ContainerRegistry {
    pub async fn new(cfg: &PodConfig) -> Result<Self> {
        let discover = discover(cfg).await?;
        let registry = Self::with_discover(discover, &cfg.procfs);

        if let Err(e) = registry.scan().await {
            warn!("initial pods scan failed: {:?}", e);
        }

        Ok(registry)
    }

    pub fn with_discover(discover: Box<dyn Discover>, procfs: &Path) -> Self {
        Self {
            discover: discover,
            procfs:   procfs.to_owned(),
            pods:     RwLock::new(PodMap::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.discover.strategy()
    }

    pub async fn scan(&self) -> Result<()> {
        let mut pods = self.discover.scan().await?;

        if self.strategy() == Strategy::Proc {
            let procfs = self.procfs.clone();
            pods = task::spawn_blocking(move || {
                scan_parents(&procfs, &mut pods);
                pods
            }).await?;
        }

        *self.pods.write() = pods;

        Ok(())
    }

    pub fn pods(&self) -> PodMap {
        self.pods.read().clone()
    }

    pub fn containers(&self, pod: &str, container: &str) -> Vec<Container> {
        select(&self.pods.read(), pod, container)
    }
}

async fn discover(cfg: &PodConfig) -> Result<Box<dyn Discover>> {
    if !cfg.force_proc {
        match CriDiscovery::connect(&cfg.cri).await {
            Ok(cri) => return Ok(Box::new(cri)),
            Err(e)  => warn!("CRI discovery unavailable: {}", e),
        }
    }

    match ProcDiscovery::new(&cfg.procfs) {
        Ok(proc) => Ok(Box::new(proc)),
        Err(e)   => Err(anyhow!("no pods discovery available: {}", e)),
    }
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

pub fn matches(pattern: &str, name: &str) -> bool {
    if !has_wildcard(pattern) {
        return pattern == name;
    }

    match Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(name),
        Err(e)      => {
            debug!("invalid pattern {:?}: {}", pattern, e);
            false
        }
    }
}

pub fn select(pods: &PodMap, pod: &str, container: &str) -> Vec<Container> {
    let mut found = pods.iter().filter(|(name, _)| matches(pod, name)).flat_map(|(_, p)| {
        p.containers.iter().filter(|(name, _)| matches(container, name))
    }).map(|(_, c)| c.clone()).collect::<Vec<_>>();

    found.sort_by(|a, b| (&a.pod, &a.id).cmp(&(&b.pod, &b.id)));

    found
}

fn scan_parents(procfs: &Path, pods: &mut PodMap) {
    for container in pods.values_mut().flat_map(|p| p.containers.values_mut()) {
        for pid in container.tasks.clone() {
            let ppid = match parent(procfs, pid) {
                Ok(ppid) => ppid,
                Err(e)   => {
                    debug!("no parent of {}: {}", pid, e);
                    continue;
                }
            };

            let known = container.tasks.contains(&ppid) || container.parent.contains(&ppid);
            if ppid != 0 && !known {
                container.parent.push(ppid);
            }
        }
    }
}

fn parent(procfs: &Path, pid: pid_t) -> Result<pid_t> {
    let process = Process::new_with_root(procfs.join(pid.to_string()))?;
    Ok(process.stat()?.ppid)
}
