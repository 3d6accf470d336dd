use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::{Api, Client};
use kube::api::ListParams;
use log::{debug, info, warn};
use reqwest::{Client as HttpClient, Url};
use tokio::sync::RwLock;
use tokio::time::sleep;

pub mod api;
pub mod proxy;

pub use proxy::{Aggregate, Forward, Reply};

pub const DEFAULT_POLL:         Duration = Duration::from_secs(10);
pub const DEFAULT_POD_SELECTOR: &str     = "app=container-tracer-backend";
pub const DEFAULT_SVC_SELECTOR: &str     = "metadata.name=container-tracer-node";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Unknown,
    Running,
    Other(String),
}

#[derive(Clone, Debug)]
pub struct NodeTracer {
    pub phase:  Phase,
    pub ip:     String,
    pub target: Option<Url>,
    pub client: Option<HttpClient>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TracerPod {
    pub name:  String,
    pub phase: Phase,
    pub ip:    String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TracerEndpoint {
    pub ip:   String,
    pub port: i32,
}

#[derive(Debug, Default)]
pub struct Tracers {
    nodes: BTreeMap<String, NodeTracer>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn pods(&self, selector: &str) -> Result<Vec<TracerPod>>;

    async fn endpoints(&self, selector: &str) -> Result<Vec<TracerEndpoint>>;
}

pub struct KubeDirectory {
    client: Client,
}

#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub poll:         Duration,
    pub pod_selector: String,
    pub svc_selector: String,
}

pub struct FleetProxy {
    cfg:       FleetConfig,
    directory: Box<dyn Directory>,
    tracers:   RwLock<Tracers>,
}

impl Phase {
    pub fn from_status(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Self::Running,
            Some("Unknown") => Self::Unknown,
            other           => Self::Other(other.unwrap_or_default().to_owned()),
        }
    }
}

impl Tracers {
    pub fn invalidate(&mut self) {
        for node in self.nodes.values_mut() {
            node.phase = Phase::Unknown;
        }
    }

    pub fn upsert(&mut self, pod: TracerPod) {
        let node = self.nodes.entry(pod.name).or_insert_with(|| NodeTracer {
            phase:  Phase::Unknown,
            ip:     pod.ip.clone(),
            target: None,
            client: None,
        });

        if node.ip != pod.ip {
            node.client = None;
            node.target = None;
        }

        node.phase = pod.phase;
        node.ip    = pod.ip;
    }

    pub fn unattached(&self) -> bool {
        self.nodes.values().any(|node| {
            node.phase != Phase::Unknown && node.client.is_none()
        })
    }

    pub fn attach(&mut self, ip: &str, port: i32) {
        for (name, node) in &mut self.nodes {
            if node.phase == Phase::Unknown || node.client.is_some() || node.ip != ip {
                continue;
            }

            match connect(ip, port) {
                Ok((target, client)) => {
                    info!("add node {} @ {}", name, target);
                    node.target = Some(target);
                    node.client = Some(client);
                }
                Err(e) => warn!("invalid target for node {}: {}", name, e),
            }
        }
    }

    pub fn evict(&mut self) {
        self.nodes.retain(|name, node| {
            let keep = node.phase != Phase::Unknown;
            if !keep {
                info!("remove node {}", name);
            }
            keep
        });
    }

    pub fn runnable(&self) -> Vec<(String, Url, HttpClient)> {
        self.nodes.iter().filter(|(_, node)| node.phase == Phase::Running).filter_map(|(name, node)| {
            let target = node.target.clone()?;
            let client = node.client.clone()?;
            Some((name.clone(), target, client))
        }).collect()
    }

    pub fn get(&self, name: &str) -> Option<&NodeTracer> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn connect(ip: &str, port: i32) -> Result<(Url, HttpClient)> {
    let host = match ip.contains(':') {
        true  => format!("[{}]", ip),
        false => ip.to_owned(),
    };
    let target = Url::parse(&format!("http://{}:{}", host, port))?;
    let client = HttpClient::builder().no_proxy().build()?;
    Ok((target, client))
}

impl KubeDirectory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Directory for KubeDirectory {
    async fn pods(&self, selector: &str) -> Result<Vec<TracerPod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().labels(selector)).await?;

        Ok(list.into_iter().filter_map(|pod| {
            let name   = pod.metadata.name?;
            let status = pod.status.unwrap_or_default();
            Some(TracerPod {
                name:  name,
                phase: Phase::from_status(status.phase.as_deref()),
                ip:    status.pod_ip.unwrap_or_default(),
            })
        }).collect())
    }

    async fn endpoints(&self, selector: &str) -> Result<Vec<TracerEndpoint>> {
        let api: Api<Endpoints> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().fields(selector)).await?;

        let mut found = Vec::new();
        for subset in list.into_iter().flat_map(|e| e.subsets.unwrap_or_default()) {
            let addresses = subset.addresses.unwrap_or_default();
            for port in subset.ports.unwrap_or_default() {
                for address in &addresses {
                    found.push(TracerEndpoint {
                        ip:   address.ip.clone(),
                        port: port.port,
                    });
                }
            }
        }

        Ok(found)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            poll:         DEFAULT_POLL,
            pod_selector: DEFAULT_POD_SELECTOR.to_owned(),
            svc_selector: DEFAULT_SVC_SELECTOR.to_owned(),
        }
    }
}

impl FleetProxy {
    pub fn new(cfg: FleetConfig, directory: Box<dyn Directory>) -> Self {
        Self {
            cfg:       cfg,
            directory: directory,
            tracers:   RwLock::new(Tracers::default()),
        }
    }

    pub async fn discover(&self) -> Result<()> {
        let mut tracers = self.tracers.write().await;

        tracers.invalidate();

        for pod in self.directory.pods(&self.cfg.pod_selector).await? {
            tracers.upsert(pod);
        }

        if tracers.unattached() {
            for ep in self.directory.endpoints(&self.cfg.svc_selector).await? {
                tracers.attach(&ep.ip, ep.port);
            }
        }

        tracers.evict();

        debug!("{} node tracers after discovery", tracers.len());

        Ok(())
    }

    pub async fn watch(self: Arc<Self>) -> Result<()> {
        loop {
            sleep(self.cfg.poll).await;
            if let Err(e) = self.discover().await {
                warn!("tracers discovery failed: {:?}", e);
            }
        }
    }

    pub async fn runnable(&self) -> Vec<(String, Url, HttpClient)> {
        self.tracers.read().await.runnable()
    }

    pub async fn nodes(&self) -> usize {
        self.tracers.read().await.len()
    }
}
