#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use anyhow::Result;
use async_trait::async_trait;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use contrace::data::{self, PodMap};
use contrace::hooks::{HookConfig, HookManager};
use contrace::node::Tracer;
use contrace::pods::{ContainerRegistry, Discover, Strategy};
use contrace::session::SessionRegistry;
use contrace::sink::Sink;

pub const DRIVER: &str = r#"#!/bin/sh
case "$1" in
    --get-all)
        echo "echo"
        ;;
    --describe)
        echo "Echo the arguments"
        ;;
    --run)
        trap 'echo "done $TRACER_USER_CONTEXT"; exit 0' INT
        echo "args $4"
        while true; do sleep 0.05; done
        ;;
esac
"#;

pub struct Fixed {
    pub pods:  PodMap,
    pub scans: Arc<AtomicUsize>,
}

#[async_trait]
impl Discover for Fixed {
    async fn scan(&self) -> Result<PodMap> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self.pods.clone())
    }

    fn strategy(&self) -> Strategy {
        Strategy::Cri
    }
}

pub fn pods() -> PodMap {
    let mut pods = PodMap::new();
    data::container(&mut pods, "web-0", "nginx").add_task(100);
    data::container(&mut pods, "web-1", "nginx").add_task(200);
    pods
}

pub fn install(root: &Path, dir: &str, name: &str, script: &str) -> PathBuf {
    let dir  = root.join(dir);
    let file = dir.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(&file, script).unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

pub async fn tracer(root: &TempDir, scans: Arc<AtomicUsize>) -> Arc<Tracer> {
    install(root.path(), "echo", "manager.sh", DRIVER);

    let discover = Fixed { pods: pods(), scans };
    let pods     = Arc::new(ContainerRegistry::with_discover(Box::new(discover), Path::new("/proc")));
    let hooks    = Arc::new(HookManager::load(HookConfig {
        path:   root.path().to_owned(),
        procfs: PathBuf::from("/proc"),
        sysfs:  PathBuf::from("/sys"),
    }).await.unwrap());

    pods.scan().await.unwrap();

    let sink     = Arc::new(Sink::Log);
    let sessions = Arc::new(SessionRegistry::new("node-a", 1, pods.clone(), hooks.clone(), sink));

    Arc::new(Tracer {
        node:     "node-a".to_owned(),
        pods:     pods,
        hooks:    hooks,
        sessions: sessions,
    })
}

pub async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let req = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => req.header("content-type", "application/json").body(Body::from(body.to_string())),
        None       => req.body(Body::empty()),
    }.unwrap();

    let res    = router.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes  = body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value  = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    (status, value)
}
