use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use libc::pid_t;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use crate::data::Container;
use crate::error::{Error, Result};
use crate::hooks::{HookManager, HookSession, Output, TraceHook};
use crate::pods::ContainerRegistry;
use crate::sink::{Sink, Span};

pub const ID_RETRIES: usize = 100;
pub const ALL: &str = "all";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub pod:       String,
    #[serde(default)]
    pub container: String,
    #[serde(rename = "trace-hook", default)]
    pub hook:      String,
    #[serde(rename = "trace-arguments", default)]
    pub arguments: String,
    #[serde(rename = "trace-user-context", default)]
    pub context:   String,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct SessionChange {
    pub run: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    pub id:           u64,
    pub node:         String,
    pub context:      String,
    pub containers:   BTreeMap<String, Vec<String>>,
    pub trace_hook:   String,
    pub trace_params: Vec<String>,
    pub running:      bool,
    pub output:       Option<Vec<String>>,
    pub error:        Option<Vec<String>>,
}

struct TraceSession {
    containers: Vec<Container>,
    hook:       TraceHook,
    params:     Vec<String>,
    context:    String,
    running:    Option<HookSession>,
    output:     Option<Arc<Output>>,
    started:    SystemTime,
    stopping:   bool,
    destroyed:  bool,
}

pub struct SessionRegistry {
    node:     String,
    pods:     Arc<ContainerRegistry>,
    hooks:    Arc<HookManager>,
    sink:     Arc<Sink>,
    rng:      Mutex<StdRng>,
    sessions: RwLock<HashMap<u64, Arc<AsyncMutex<TraceSession>>>>,
}

impl SessionRegistry {
    pub fn new(
        node:  &str,
        seed:  u64,
        pods:  Arc<ContainerRegistry>,
        hooks: Arc<HookManager>,
        sink:  Arc<Sink>,
    ) -> Self {
        Self {
            node:     node.to_owned(),
            pods:     pods,
            hooks:    hooks,
            sink:     sink,
            rng:      Mutex::new(StdRng::seed_from_u64(seed)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn new_session(&self, req: &SessionRequest) -> Result<u64> {
        let containers = self.pods.containers(&req.pod, &req.container);
        if containers.is_empty() {
            return Err(Error::NoContainers {
                pod:       req.pod.clone(),
                container: req.container.clone(),
            });
        }

        let hook = self.hooks.hook(&req.hook)?;

        let session = TraceSession {
            containers: containers,
            hook:       hook,
            params:     req.arguments.split_whitespace().map(String::from).collect(),
            context:    req.context.clone(),
            running:    None,
            output:     None,
            started:    SystemTime::now(),
            stopping:   false,
            destroyed:  false,
        };

        let mut sessions = self.sessions.write();
        let id = generate_id(&mut *self.rng.lock(), |id| sessions.contains_key(&id), ID_RETRIES)?;
        sessions.insert(id, Arc::new(AsyncMutex::new(session)));

        info!("created trace session {} with hook {}", id, req.hook);

        Ok(id)
    }

    pub async fn start(&self, id: u64) -> Result<()> {
        let session = self.get(id)?;
        let mut session = session.lock().await;

        if session.destroyed {
            return Err(Error::NoSession(id));
        }

        if session.running.is_some() || session.stopping {
            return Err(Error::AlreadyRunning(id));
        }

        let (pids, parents) = session.tasks();
        let run = self.hooks.run(
            &session.hook,
            &pids,
            &parents,
            &session.params,
            &session.context,
        ).await?;

        debug!("trace session {} started", id);

        session.output  = Some(run.output());
        session.started = SystemTime::now();
        session.running = Some(run);

        Ok(())
    }

    pub async fn stop(&self, id: u64) -> Result<()> {
        let session = self.get(id)?;
        let run = {
            let mut session = session.lock().await;
            let run = session.running.take().ok_or(Error::NotRunning(id))?;
            session.stopping = true;
            run
        };
        self.halt(id, &session, run).await
    }

    pub async fn change(&self, id: u64, change: SessionChange) -> Result<()> {
        match change.run {
            true  => self.start(id).await,
            false => self.stop(id).await,
        }
    }

    pub async fn destroy(&self, id: u64) -> Result<()> {
        let session = self.sessions.write().remove(&id).ok_or(Error::NoSession(id))?;
        let run = {
            let mut session = session.lock().await;
            session.destroyed = true;
            session.running.take()
        };

        if let Some(run) = run {
            if let Err(e) = self.halt(id, &session, run).await {
                warn!("trace session {} stopped with error: {}", id, e);
            }
        }

        info!("destroyed trace session {}", id);

        Ok(())
    }

    pub async fn destroy_all(&self) {
        let ids = self.sessions.read().keys().copied().collect::<Vec<_>>();
        for id in ids {
            if let Err(e) = self.destroy(id).await {
                debug!("destroy of trace session {} failed: {}", id, e);
            }
        }
    }

    pub async fn describe(&self, id: u64) -> Result<SessionInfo> {
        let session = self.get(id)?;
        let session = session.lock().await;
        Ok(session.info(id, &self.node))
    }

    pub async fn list(&self, id: &str, only_running: bool) -> Result<BTreeMap<String, SessionInfo>> {
        let all = id == ALL;
        let ids = match all {
            true  => self.sessions.read().keys().copied().collect(),
            false => vec![parse_id(id)?],
        };

        let mut infos = BTreeMap::new();
        for id in ids {
            let info = match self.describe(id).await {
                Ok(info)                        => info,
                Err(Error::NoSession(_)) if all => continue,
                Err(e)                          => return Err(e),
            };

            if !only_running || info.running {
                infos.insert(id.to_string(), info);
            }
        }

        Ok(infos)
    }

    async fn halt(&self, id: u64, session: &AsyncMutex<TraceSession>, mut run: HookSession) -> Result<()> {
        let result = self.hooks.stop(&mut run, true).await;

        debug!("trace session {} stopped", id);

        let span = {
            let mut session = session.lock().await;
            session.stopping = false;
            session.span(id, &self.node)
        };

        if let Err(e) = self.sink.export(span).await {
            warn!("export of trace session {} failed: {}", id, e);
        }

        Ok(result?)
    }

    fn get(&self, id: u64) -> Result<Arc<AsyncMutex<TraceSession>>> {
        match self.sessions.read().get(&id) {
            Some(session) => Ok(session.clone()),
            None          => Err(Error::NoSession(id)),
        }
    }
}

impl TraceSession {
    fn tasks(&self) -> (Vec<pid_t>, Vec<pid_t>) {
        let mut pids    = Vec::new();
        let mut parents = Vec::new();
        for c in &self.containers {
            pids.extend_from_slice(&c.tasks);
            parents.extend_from_slice(&c.parent);
        }
        (pids, parents)
    }

    fn pods(&self) -> BTreeMap<String, Vec<String>> {
        let mut pods = BTreeMap::<String, Vec<String>>::new();
        for c in &self.containers {
            pods.entry(c.pod.clone()).or_default().push(c.id.clone());
        }
        pods
    }

    fn info(&self, id: u64, node: &str) -> SessionInfo {
        SessionInfo {
            id:           id,
            node:         node.to_owned(),
            context:      self.context.clone(),
            containers:   self.pods(),
            trace_hook:   self.hook.name.clone(),
            trace_params: self.params.clone(),
            running:      self.running.is_some() || self.stopping,
            output:       self.output.as_ref().map(|o| o.stdout()),
            error:        self.output.as_ref().map(|o| o.stderr()),
        }
    }

    fn span(&self, id: u64, node: &str) -> Span {
        let pods = self.pods().into_keys().collect::<Vec<_>>().join(",");
        let span = Span::new(&self.hook.name, self.started)
            .attr("node", node)
            .attr("pod", pods)
            .attr("traceHook", self.hook.name.as_str())
            .attr("traceSession", id.to_string())
            .attr("context", self.context.as_str());

        match &self.output {
            Some(output) => span.events("stdout", output.stdout()).events("stderr", output.stderr()),
            None         => span,
        }
    }
}

pub fn parse_id(id: &str) -> Result<u64> {
    id.parse().map_err(|_| Error::InvalidId(id.to_owned()))
}

pub fn generate_id<R: Rng, F: Fn(u64) -> bool>(rng: &mut R, live: F, retries: usize) -> Result<u64> {
    for _ in 0..retries {
        let id = rng.random::<u64>();
        if !live(id) {
            return Ok(id);
        }
    }
    Err(Error::IdExhausted(retries))
}

/// RNG seed derived from the node name and the current time.
pub fn seed(node: &str) -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let mut bytes = node.as_bytes().to_vec();
    bytes.extend_from_slice(&now.to_le_bytes());
    fnv1a(&bytes)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME:  u64 = 0x100000001b3;

    bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
