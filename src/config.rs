use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};
use env_logger::Builder;
use gumdrop::Options;
use log::LevelFilter;
use crate::fleet::{self, FleetConfig};
use crate::hooks::{self, HookConfig};
use crate::pods::{CriConfig, PodConfig};
use crate::sink::Sink;

#[derive(Debug, Default, Options)]
pub struct NodeArgs {
    #[options(help = "print help message")]
    pub help:         bool,
    #[options(no_short, help = "REST API listen address")]
    pub address:      Option<String>,
    #[options(no_short, help = "node name reported in sessions")]
    pub node_name:    Option<String>,
    #[options(no_short, help = "CRI socket to use")]
    pub cri_endpoint: Option<String>,
    #[options(no_short, help = "run directory searched for CRI sockets")]
    pub run_path:     Vec<String>,
    #[options(no_short, help = "name of this pod, checked against CRI")]
    pub pod_name:     Option<String>,
    #[options(no_short, help = "skip CRI and walk procfs")]
    pub use_procfs:   bool,
    #[options(no_short, help = "procfs mount point")]
    pub procfs_path:  Option<String>,
    #[options(no_short, help = "sysfs mount point")]
    pub sysfs_path:   Option<String>,
    #[options(no_short, help = "trace hooks directory")]
    pub trace_hooks:  Option<String>,
    #[options(no_short, help = "telemetry sink: log | http,endpoint=URL")]
    pub telemetry:    Option<String>,
    #[options(count, help = "increase log verbosity")]
    pub verbose:      u32,
}

#[derive(Debug, Default, Options)]
pub struct SvcArgs {
    #[options(help = "print help message")]
    pub help:          bool,
    #[options(no_short, help = "REST API listen address")]
    pub address:       Option<String>,
    #[options(no_short, help = "tracers discovery interval in seconds")]
    pub poll:          Option<u64>,
    #[options(no_short, help = "label selector of node tracer pods")]
    pub pods_selector: Option<String>,
    #[options(no_short, help = "field selector of node tracer endpoints")]
    pub svc_selector:  Option<String>,
    #[options(count, help = "increase log verbosity")]
    pub verbose:       u32,
}

pub struct NodeConfig {
    pub address: SocketAddr,
    pub node:    String,
    pub pods:    PodConfig,
    pub hooks:   HookConfig,
    pub sink:    Sink,
    pub verbose: u32,
}

#[derive(Debug)]
pub struct SvcConfig {
    pub address: SocketAddr,
    pub fleet:   FleetConfig,
    pub verbose: u32,
}

impl NodeArgs {
    pub fn resolve(self) -> Result<NodeConfig> {
        self.resolve_with(|name| env::var(name).ok())
    }

    pub fn resolve_with<F: Fn(&str) -> Option<String>>(self, env: F) -> Result<NodeConfig> {
        let address = self.address.or_else(|| env("TRACER_API_ADDRESS"));
        let address = address.as_deref().unwrap_or("0.0.0.0:8080");
        let address = address.parse().with_context(|| format!("invalid address {}", address))?;

        let node = match self.node_name.or_else(|| env("TRACER_NODE_NAME")) {
            Some(node) => node,
            None       => hostname::get()?.to_string_lossy().into_owned(),
        };

        let mut run_paths = self.run_path;
        if run_paths.is_empty() {
            run_paths = env("TRACER_RUN_PATHS").into_iter().collect();
        }

        let cri = CriConfig {
            endpoint:  self.cri_endpoint.or_else(|| env("TRACER_CRI_ENDPOINT")),
            run_paths: run_paths.iter().flat_map(|p| split(p)).map(PathBuf::from).collect(),
            pod_name:  self.pod_name.or_else(|| env("TRACER_POD_NAME")),
        };

        let procfs = self.procfs_path.or_else(|| env("TRACER_PROCFS_PATH"));
        let procfs = PathBuf::from(procfs.as_deref().unwrap_or("/proc"));
        let sysfs  = self.sysfs_path.or_else(|| env("TRACER_SYSFS_PATH"));
        let sysfs  = PathBuf::from(sysfs.as_deref().unwrap_or("/sys"));
        let path   = self.trace_hooks.or_else(|| env("TRACER_HOOKS"));
        let path   = PathBuf::from(path.as_deref().unwrap_or(hooks::DEFAULT_PATH));

        let sink = self.telemetry.or_else(|| env("TRACER_TELEMETRY"));
        let sink = match sink {
            Some(sink) => sink.parse()?,
            None       => Sink::default(),
        };

        let force_proc = self.use_procfs || env("TRACER_FORCE_PROCFS").is_some();
        let verbose    = verbosity(self.verbose, env("TRACER_VERBOSE"));

        Ok(NodeConfig {
            address: address,
            node:    node,
            pods:    PodConfig { cri, force_proc, procfs: procfs.clone() },
            hooks:   HookConfig { path, procfs, sysfs },
            sink:    sink,
            verbose: verbose,
        })
    }
}

impl SvcArgs {
    pub fn resolve(self) -> Result<SvcConfig> {
        self.resolve_with(|name| env::var(name).ok())
    }

    pub fn resolve_with<F: Fn(&str) -> Option<String>>(self, env: F) -> Result<SvcConfig> {
        let address = self.address.or_else(|| env("TRACE_KUBE_API_ADDRESS"));
        let address = address.as_deref().unwrap_or("0.0.0.0:80");
        let address = address.parse().with_context(|| format!("invalid address {}", address))?;

        let poll = match self.poll {
            Some(poll) => Duration::from_secs(poll),
            None       => match env("TRACE_KUBE_DISCOVERY_POLL") {
                Some(poll) => Duration::from_secs(poll.parse().context("invalid poll interval")?),
                None       => fleet::DEFAULT_POLL,
            },
        };

        let pods = self.pods_selector.or_else(|| env("TRACE_KUBE_SELECTOR_PODS"));
        let svcs = self.svc_selector.or_else(|| env("TRACE_KUBE_SELECTOR_SVCS"));

        Ok(SvcConfig {
            address: address,
            fleet:   FleetConfig {
                poll:         poll,
                pod_selector: pods.unwrap_or_else(|| fleet::DEFAULT_POD_SELECTOR.to_owned()),
                svc_selector: svcs.unwrap_or_else(|| fleet::DEFAULT_SVC_SELECTOR.to_owned()),
            },
            verbose: verbosity(self.verbose, env("TRACE_KUBE_VERBOSE")),
        })
    }
}

pub fn logger(verbose: u32) {
    let mut builder = Builder::from_default_env();
    builder.filter(None, match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    builder.init();
}

fn verbosity(count: u32, env: Option<String>) -> u32 {
    match env {
        Some(_) => count.max(1),
        None    => count,
    }
}

fn split(paths: &str) -> impl Iterator<Item = &str> {
    paths.split(|c: char| c == ',' || c == ';' || c.is_whitespace()).filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn node_defaults() {
        let cfg = NodeArgs::default().resolve_with(env(&[("TRACER_NODE_NAME", "n1")])).unwrap();
        assert_eq!(cfg.address, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.node, "n1");
        assert!(!cfg.pods.force_proc);
        assert!(cfg.pods.cri.run_paths.is_empty());
        assert_eq!(cfg.pods.procfs, PathBuf::from("/proc"));
        assert_eq!(cfg.hooks.sysfs, PathBuf::from("/sys"));
        assert_eq!(cfg.hooks.path, PathBuf::from("trace-hooks"));
        assert!(matches!(cfg.sink, Sink::Log));
        assert_eq!(cfg.verbose, 0);
    }

    #[test]
    fn flags_override_environment() {
        let args = NodeArgs::parse_args_default(&[
            "--address", "127.0.0.1:9000",
            "--run-path", "/host/run",
            "--use-procfs",
            "-vv",
        ]).unwrap();

        let cfg = args.resolve_with(env(&[
            ("TRACER_API_ADDRESS", "0.0.0.0:1"),
            ("TRACER_RUN_PATHS",   "/a,/b"),
            ("TRACER_NODE_NAME",   "n1"),
            ("TRACER_PROCFS_PATH", "/host/proc"),
        ])).unwrap();

        assert_eq!(cfg.address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.pods.cri.run_paths, vec![PathBuf::from("/host/run")]);
        assert!(cfg.pods.force_proc);
        assert_eq!(cfg.hooks.procfs, PathBuf::from("/host/proc"));
        assert_eq!(cfg.verbose, 2);
    }

    #[test]
    fn splits_run_paths() {
        let cfg = NodeArgs::default().resolve_with(env(&[
            ("TRACER_NODE_NAME", "n1"),
            ("TRACER_RUN_PATHS", "/run; /var/run,/host/run\t/x"),
            ("TRACER_FORCE_PROCFS", ""),
            ("TRACER_VERBOSE", "yes"),
        ])).unwrap();

        let paths = cfg.pods.cri.run_paths.iter().map(|p| p.to_str().unwrap()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["/run", "/var/run", "/host/run", "/x"]);
        assert!(cfg.pods.force_proc);
        assert_eq!(cfg.verbose, 1);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = env(&[("TRACER_NODE_NAME", "n1"), ("TRACER_TELEMETRY", "jaeger")]);
        assert!(NodeArgs::default().resolve_with(bad).is_err());

        let bad = env(&[("TRACE_KUBE_API_ADDRESS", "nowhere")]);
        assert!(SvcArgs::default().resolve_with(bad).is_err());
    }

    #[test]
    fn svc_defaults_and_env() {
        let cfg = SvcArgs::default().resolve_with(env(&[])).unwrap();
        assert_eq!(cfg.address, "0.0.0.0:80".parse().unwrap());
        assert_eq!(cfg.fleet.poll, Duration::from_secs(10));
        assert_eq!(cfg.fleet.pod_selector, "app=container-tracer-backend");
        assert_eq!(cfg.fleet.svc_selector, "metadata.name=container-tracer-node");

        let cfg = SvcArgs::default().resolve_with(env(&[
            ("TRACE_KUBE_DISCOVERY_POLL", "3"),
            ("TRACE_KUBE_SELECTOR_PODS",  "app=x"),
        ])).unwrap();
        assert_eq!(cfg.fleet.poll, Duration::from_secs(3));
        assert_eq!(cfg.fleet.pod_selector, "app=x");
    }
}
