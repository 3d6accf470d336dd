use std::path::Path;
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use libc::pid_t;
use log::{debug, info};
use procfs::process::Process;
use tokio::task;
use crate::data::{self, PodMap};
use super::ns::{JoinUts, Kind, NamespaceWalker, UtsResolver};
use super::{Discover, Strategy};

/// The procfs walk cannot see CRI container boundaries, every task of a pod
/// lands in this one container.
pub const DEFAULT_CONTAINER: &str = "unknown";

pub struct ProcDiscovery {
    walker: Arc<Walker>,
}

struct Walker {
    ns:   NamespaceWalker,
    uts:  Box<dyn UtsResolver>,
    host: u64,
}

impl ProcDiscovery {
    pub fn new(root: &Path) -> Result<Self> {
        let uts = JoinUts::new(root)?;
        Self::with_resolver(root, Box::new(uts))
    }

    pub fn with_resolver(root: &Path, uts: Box<dyn UtsResolver>) -> Result<Self> {
        let ns   = NamespaceWalker::new(root);
        let host = ns.inode(1, Kind::Uts)?;

        info!("using procfs for pods discovery at {}", root.display());

        let walker = Arc::new(Walker { ns, uts, host });
        Ok(Self { walker })
    }

    pub fn walk(&self) -> Result<PodMap> {
        self.walker.walk()
    }
}

#[async_trait]
impl Discover for ProcDiscovery {
    async fn scan(&self) -> Result<PodMap> {
        let walker = self.walker.clone();
        task::spawn_blocking(move || walker.walk()).await?
    }

    fn strategy(&self) -> Strategy {
        Strategy::Proc
    }
}

impl Walker {
    fn walk(&self) -> Result<PodMap> {
        let mut pods = PodMap::new();
        for pid in children(self.ns.root(), 1)? {
            self.visit(&mut pods, 1, pid);
        }
        Ok(pods)
    }

    fn visit(&self, pods: &mut PodMap, ppid: pid_t, pid: pid_t) {
        match self.boundary(ppid, pid) {
            Ok(Some(pod)) => {
                let container = data::container(pods, &pod, DEFAULT_CONTAINER);
                for task in self.subtree(pid) {
                    container.add_task(task);
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                debug!("skipping {} under {}: {}", pid, ppid, e);
                return;
            }
        }

        match children(self.ns.root(), pid) {
            Ok(children) => {
                for child in children {
                    self.visit(pods, pid, child);
                }
            }
            Err(e) => debug!("no children of {}: {}", pid, e),
        }
    }

    // Pod name when `pid` starts a new PID namespace outside the host UTS
    // namespace.
    fn boundary(&self, ppid: pid_t, pid: pid_t) -> Result<Option<String>> {
        if self.ns.same(ppid, pid, Kind::Pid)? {
            return Ok(None);
        }

        if self.ns.inode(pid, Kind::Uts)? == self.host {
            return Ok(None);
        }

        self.uts.nodename(pid).map(Some)
    }

    fn subtree(&self, pid: pid_t) -> Vec<pid_t> {
        let mut tasks = vec![pid];
        let mut next  = 0;

        while let Some(&pid) = tasks.get(next) {
            next += 1;
            match children(self.ns.root(), pid) {
                Ok(children) => {
                    for child in children {
                        if !tasks.contains(&child) {
                            tasks.push(child);
                        }
                    }
                }
                Err(e) => debug!("no children of {}: {}", pid, e),
            }
        }

        tasks
    }
}

/// Children forked by any thread of `pid`.
pub fn children(root: &Path, pid: pid_t) -> Result<Vec<pid_t>> {
    let process = Process::new_with_root(root.join(pid.to_string()))?;
    let mut children = Vec::new();

    for task in process.tasks()? {
        let list = match task.and_then(|task| task.children()) {
            Ok(list) => list,
            Err(e)   => {
                debug!("skipping a thread of {}: {}", pid, e);
                continue;
            }
        };

        for child in list {
            if let Ok(child) = pid_t::try_from(child) {
                if !children.contains(&child) {
                    children.push(child);
                }
            }
        }
    }

    Ok(children)
}
