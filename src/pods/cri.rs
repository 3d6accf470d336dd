use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use k8s_cri::v1::runtime_service_client::RuntimeServiceClient;
use k8s_cri::v1::{Container as CriContainer, ContainerFilter, ContainerState, ContainerStateValue};
use k8s_cri::v1::{ContainerStatusRequest, ListContainersRequest};
use libc::pid_t;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use crate::data::{self, PodMap};
use super::{Discover, Strategy};

pub const KNOWN_ENDPOINTS: &[&str] = &[
    "containerd/containerd.sock",
    "cri-dockerd.sock",
    "dockershim.sock",
    "crio/crio.sock",
    "k3s/containerd/containerd.sock",
];

pub const DEFAULT_RUN_PATHS: &[&str] = &["/run", "/var/run"];

pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";

const SOCKET_PREFIX:   &str     = "unix://";
const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default)]
pub struct CriConfig {
    pub endpoint:  Option<String>,
    pub run_paths: Vec<PathBuf>,
    pub pod_name:  Option<String>,
}

pub struct CriDiscovery {
    client: RuntimeServiceClient<Channel>,
}

#[derive(Debug, Deserialize)]
struct Info {
    #[serde(alias = "Pid")]
    pid: pid_t,
}

impl CriDiscovery {
    pub async fn connect(cfg: &CriConfig) -> Result<Self> {
        if let Some(endpoint) = cfg.endpoint.as_deref().filter(|e| !e.is_empty()) {
            let client = connect(socket_path(endpoint)).await?;
            info!("using CRI for pods discovery at {}", endpoint);
            return Ok(Self { client });
        }

        for path in candidates(&cfg.run_paths) {
            let client = match connect(path.clone()).await {
                Ok(client) => client,
                Err(e)     => {
                    debug!("no CRI at {}: {}", path.display(), e);
                    continue;
                }
            };

            let mut cri = Self { client };
            if cri.verify(cfg.pod_name.as_deref()).await {
                info!("using CRI for pods discovery at {}{}", SOCKET_PREFIX, path.display());
                return Ok(cri);
            }

            debug!("CRI at {} does not run this pod", path.display());
        }

        Err(anyhow!("cannot connect to CRI endpoint"))
    }

    async fn verify(&mut self, pod: Option<&str>) -> bool {
        let pod = match pod.filter(|pod| !pod.is_empty()) {
            Some(pod) => pod,
            None      => return true,
        };

        match self.running().await {
            Ok(containers) => containers.iter().any(|c| pod_name(c) == Some(pod)),
            Err(_)         => false,
        }
    }

    async fn running(&mut self) -> Result<Vec<CriContainer>> {
        let filter = ContainerFilter {
            state: Some(ContainerStateValue {
                state: ContainerState::ContainerRunning as i32,
            }),
            ..Default::default()
        };

        let request = ListContainersRequest { filter: Some(filter) };
        let reply   = self.client.list_containers(request).await?;

        Ok(reply.into_inner().containers)
    }

    async fn init_pid(&mut self, id: &str) -> Result<Option<pid_t>> {
        let request = ContainerStatusRequest {
            container_id: id.to_owned(),
            verbose:      true,
        };

        let reply = self.client.container_status(request).await?.into_inner();

        Ok(reply.info.get("info").and_then(|info| parse_info(info)))
    }
}

#[async_trait]
impl Discover for CriDiscovery {
    async fn scan(&self) -> Result<PodMap> {
        let mut cri  = Self { client: self.client.clone() };
        let mut pods = PodMap::new();

        for c in cri.running().await? {
            let pod = match pod_name(&c) {
                Some(pod) => pod.to_owned(),
                None      => continue,
            };

            let name = match &c.metadata {
                Some(metadata) => metadata.name.clone(),
                None           => continue,
            };

            let pid = cri.init_pid(&c.id).await;
            let container = data::container(&mut pods, &pod, &name);

            match pid {
                Ok(Some(pid)) => container.add_task(pid),
                Ok(None)      => debug!("no init task reported for {}/{}", pod, name),
                Err(e)        => warn!("status of container {} failed: {}", c.id, e),
            }
        }

        Ok(pods)
    }

    fn strategy(&self) -> Strategy {
        Strategy::Cri
    }
}

async fn connect(path: PathBuf) -> Result<RuntimeServiceClient<Channel>> {
    let endpoint = Endpoint::from_static("http://[::]:50051");
    let connect  = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        UnixStream::connect(path.clone())
    }));

    let channel = timeout(CONNECT_TIMEOUT, connect).await??;

    Ok(RuntimeServiceClient::new(channel))
}

fn socket_path(endpoint: &str) -> PathBuf {
    let path = endpoint.strip_prefix(SOCKET_PREFIX).unwrap_or(endpoint);
    Path::new(path).to_owned()
}

fn candidates(run_paths: &[PathBuf]) -> Vec<PathBuf> {
    let defaults = DEFAULT_RUN_PATHS.iter().map(PathBuf::from).collect::<Vec<_>>();
    let paths    = match run_paths.is_empty() {
        true  => &defaults,
        false => run_paths,
    };

    paths.iter().flat_map(|path| {
        KNOWN_ENDPOINTS.iter().map(move |socket| path.join(socket))
    }).collect()
}

fn pod_name(c: &CriContainer) -> Option<&str> {
    c.labels.get(POD_NAME_LABEL).map(String::as_str)
}

fn parse_info(info: &str) -> Option<pid_t> {
    serde_json::from_str::<Info>(info).ok().map(|info| info.pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_unix_scheme() {
        assert_eq!(socket_path("unix:///run/crio/crio.sock"), Path::new("/run/crio/crio.sock"));
        assert_eq!(socket_path("/run/cri.sock"), Path::new("/run/cri.sock"));
    }

    #[test]
    fn probes_known_sockets_in_order() {
        let paths = candidates(&[]);
        assert_eq!(paths.len(), DEFAULT_RUN_PATHS.len() * KNOWN_ENDPOINTS.len());
        assert_eq!(paths[0], Path::new("/run/containerd/containerd.sock"));
        assert_eq!(paths[5], Path::new("/var/run/containerd/containerd.sock"));

        let paths = candidates(&[PathBuf::from("/host/run")]);
        assert_eq!(paths.len(), KNOWN_ENDPOINTS.len());
        assert_eq!(paths[3], Path::new("/host/run/crio/crio.sock"));
    }

    #[test]
    fn reads_init_pid_from_verbose_info() {
        assert_eq!(parse_info(r#"{"pid": 4242, "sandboxID": "abc"}"#), Some(4242));
        assert_eq!(parse_info(r#"{"Pid": 17}"#), Some(17));
        assert_eq!(parse_info(r#"{"runtimeSpec": {}}"#), None);
        assert_eq!(parse_info("not json"), None);
    }

    #[test]
    fn groups_by_pod_label() {
        let mut c = CriContainer::default();
        assert_eq!(pod_name(&c), None);
        c.labels.insert(POD_NAME_LABEL.to_owned(), "web-0".to_owned());
        assert_eq!(pod_name(&c), Some("web-0"));
    }

    #[test]
    fn speaks_runtime_v1() {
        let name = std::any::type_name::<ListContainersRequest>();
        assert_eq!(name, "k8s_cri::v1::ListContainersRequest");
        let name = std::any::type_name::<RuntimeServiceClient<Channel>>();
        assert!(name.starts_with("k8s_cri::v1::runtime_service_client::"));
    }

    #[tokio::test]
    async fn missing_socket_fails_fast() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = CriConfig {
            run_paths: vec![dir.path().to_owned()],
            ..Default::default()
        };
        assert!(CriDiscovery::connect(&cfg).await.is_err());
    }
}
