use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use anyhow::{anyhow, Result};
use libc::pid_t;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use walkdir::{DirEntry, WalkDir};
use crate::error::Error;
use crate::task::spawn;

pub const DRIVER_PREFIX: &str = "manager.";
pub const DEFAULT_PATH:  &str = "trace-hooks";

pub const ENV_PROCFS:  &str = "TRACER_PROCFS_PATH";
pub const ENV_SYSFS:   &str = "TRACER_SYSFS_PATH";
pub const ENV_CONTEXT: &str = "TRACER_USER_CONTEXT";

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TraceHook {
    pub name:        String,
    #[serde(skip)]
    pub group:       PathBuf,
    pub description: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HookGroup {
    #[serde(skip)]
    pub dir:    PathBuf,
    #[serde(skip)]
    pub driver: PathBuf,
    #[serde(rename = "Tracers")]
    pub hooks:  BTreeMap<String, TraceHook>,
}

#[derive(Clone, Debug)]
pub struct HookConfig {
    pub path:   PathBuf,
    pub procfs: PathBuf,
    pub sysfs:  PathBuf,
}

pub struct HookManager {
    cfg:    HookConfig,
    groups: RwLock<BTreeMap<PathBuf, HookGroup>>,
}

#[derive(Debug, Default)]
pub struct Output {
    stdout: RwLock<Vec<String>>,
    stderr: RwLock<Vec<String>>,
}

pub struct HookSession {
    child:   Child,
    output:  Arc<Output>,
    readers: Vec<JoinHandle<()>>,
}

impl HookManager {
    pub async fn load(cfg: HookConfig) -> Result<Self> {
        let manager = Self {
            cfg:    cfg,
            groups: RwLock::new(BTreeMap::new()),
        };

        manager.discover().await?;
        manager.reset_all().await;

        Ok(manager)
    }

    pub async fn discover(&self) -> Result<()> {
        let root    = fs::canonicalize(&self.cfg.path)?;
        let mut all = BTreeMap::new();

        for (dir, driver) in drivers(&root)? {
            match self.probe(&dir, &driver).await {
                Ok(hooks) => {
                    info!("found {} trace hooks in {}", hooks.len(), dir.display());
                    all.insert(dir.clone(), HookGroup { dir, driver, hooks });
                }
                Err(e) => warn!("skipping hook driver {}: {}", driver.display(), e),
            }
        }

        *self.groups.write() = all;

        Ok(())
    }

    pub fn groups(&self) -> BTreeMap<PathBuf, HookGroup> {
        self.groups.read().clone()
    }

    pub fn hook(&self, name: &str) -> Result<TraceHook, Error> {
        let groups = self.groups.read();
        groups.values().find_map(|group| {
            group.hooks.get(name).cloned()
        }).ok_or_else(|| Error::UnknownHook(name.to_owned()))
    }

    pub async fn run(
        &self,
        hook:    &TraceHook,
        pids:    &[pid_t],
        parents: &[pid_t],
        params:  &[String],
        context: &str,
    ) -> Result<HookSession> {
        if pids.is_empty() {
            return Err(anyhow!("no tasks are provided"));
        }

        let driver = self.driver(&hook.group)?;

        let mut cmd = self.command(&hook.group, &driver);
        cmd.args(run_args(&hook.name, pids, parents, params));
        cmd.env(ENV_CONTEXT, context);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let output    = Arc::new(Output::default());

        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("no stderr"))?;

        debug!("started hook {} as {:?}", hook.name, child.id());

        let readers = vec![
            spawn(capture(stdout, output.clone(), Stream::Stdout)),
            spawn(capture(stderr, output.clone(), Stream::Stderr)),
        ];

        Ok(HookSession { child, output, readers })
    }

    pub async fn stop(&self, session: &mut HookSession, wait: bool) -> Result<()> {
        if let Some(pid) = session.child.id() {
            interrupt(pid)?;
        }

        if !wait {
            return Ok(());
        }

        for reader in session.readers.drain(..) {
            reader.await?;
        }

        let status = session.child.wait().await?;

        match status.code() {
            Some(0) | None => Ok(()),
            Some(code)     => Err(anyhow!("trace hook exited with {}", code)),
        }
    }

    pub async fn reset_all(&self) {
        let groups = self.groups();
        for group in groups.values() {
            let mut cmd = self.command(&group.dir, &group.driver);
            cmd.arg("--clear");
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());

            match cmd.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => debug!("clear of {} returned {}", group.dir.display(), status),
                Err(e)     => debug!("clear of {} failed: {}", group.dir.display(), e),
            }
        }
    }

    async fn probe(&self, dir: &Path, driver: &Path) -> Result<BTreeMap<String, TraceHook>> {
        let names = self.call(dir, driver, &["--get-all"]).await?;
        let mut hooks = BTreeMap::new();

        for name in names.split_whitespace() {
            let description = match self.call(dir, driver, &["--describe", name]).await {
                Ok(text) => describe(&text),
                Err(e)   => {
                    debug!("cannot describe hook {}: {}", name, e);
                    continue;
                }
            };

            hooks.insert(name.to_owned(), TraceHook {
                name:        name.to_owned(),
                group:       dir.to_owned(),
                description: description,
            });
        }

        Ok(hooks)
    }

    async fn call(&self, dir: &Path, driver: &Path, args: &[&str]) -> Result<String> {
        let output = self.command(dir, driver).args(args).output().await?;

        if !output.status.success() {
            return Err(anyhow!("{:?} returned {}", args, output.status));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn driver(&self, group: &Path) -> Result<PathBuf> {
        match self.groups.read().get(group) {
            Some(group) => Ok(group.driver.clone()),
            None        => Err(anyhow!("no hook driver in {}", group.display())),
        }
    }

    fn command(&self, dir: &Path, driver: &Path) -> Command {
        let mut cmd = Command::new(driver);
        cmd.current_dir(dir);
        cmd.env(ENV_PROCFS, &self.cfg.procfs);
        cmd.env(ENV_SYSFS, &self.cfg.sysfs);
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl Output {
    pub fn stdout(&self) -> Vec<String> {
        self.stdout.read().clone()
    }

    pub fn stderr(&self) -> Vec<String> {
        self.stderr.read().clone()
    }

    fn buffer(&self, stream: Stream) -> &RwLock<Vec<String>> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }
}

impl HookSession {
    pub fn output(&self) -> Arc<Output> {
        self.output.clone()
    }
}

#[derive(Clone, Copy, Debug)]
enum Stream {
    Stdout,
    Stderr,
}

async fn capture<R: AsyncRead + Unpin>(pipe: R, output: Arc<Output>, stream: Stream) -> Result<()> {
    let mut lines = BufReader::new(pipe).lines();
    while let Some(line) = lines.next_line().await? {
        output.buffer(stream).write().push(line);
    }
    Ok(())
}

fn interrupt(pid: u32) -> Result<()> {
    let pid = pid_t::try_from(pid)?;
    // SAFETY: kill(2) has no memory safety requirements.
    match unsafe { libc::kill(pid, libc::SIGINT) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error().into()),
    }
}

fn drivers(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut found = BTreeMap::new();

    let walk = WalkDir::new(root).sort_by_file_name().into_iter();
    for entry in walk.filter_entry(|e| e.depth() == 0 || !hidden(e)) {
        let entry = entry?;
        let name  = entry.file_name().to_string_lossy();

        if !entry.file_type().is_file() || !name.starts_with(DRIVER_PREFIX) {
            continue;
        }

        if let Some(dir) = entry.path().parent() {
            found.insert(dir.to_owned(), entry.path().to_owned());
        }
    }

    Ok(found.into_iter().collect())
}

fn hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn describe(text: &str) -> Vec<String> {
    text.lines().map(str::trim).filter(|line| !line.is_empty()).map(String::from).collect()
}

pub fn run_args(hook: &str, pids: &[pid_t], parents: &[pid_t], params: &[String]) -> Vec<String> {
    let mut packed = vec!["--pid".to_owned()];
    packed.extend(pids.iter().map(pid_t::to_string));

    if !parents.is_empty() {
        packed.push("--parent".to_owned());
        packed.extend(parents.iter().map(pid_t::to_string));
    }

    packed.extend(params.iter().cloned());

    vec![
        "--run".to_owned(),
        hook.to_owned(),
        "--args".to_owned(),
        packed.join(" "),
    ]
}
