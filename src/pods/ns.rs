use std::ffi::CStr;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Result};
use libc::pid_t;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Pid,
    Uts,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Uts => "uts",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
pub struct NamespaceWalker {
    root: PathBuf,
}

impl NamespaceWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, pid: pid_t, kind: Kind) -> PathBuf {
        self.root.join(pid.to_string()).join("ns").join(kind.name())
    }

    /// Namespace identifier of `pid`, read from the `ns/<kind>` link target
    /// (`uts:[4026531838]`).
    pub fn inode(&self, pid: pid_t, kind: Kind) -> Result<u64> {
        let link = fs::read_link(self.path(pid, kind))?;
        let link = link.to_string_lossy();
        parse(kind, &link).ok_or_else(|| {
            anyhow!("broken {} namespace id {:?} for {}", kind, link, pid)
        })
    }

    pub fn same(&self, a: pid_t, b: pid_t, kind: Kind) -> Result<bool> {
        Ok(self.inode(a, kind)? == self.inode(b, kind)?)
    }
}

fn parse(kind: Kind, link: &str) -> Option<u64> {
    let id = link.strip_prefix(kind.name())?.strip_prefix(":[")?;
    id.strip_suffix(']')?.parse().ok()
}

pub trait UtsResolver: Send + Sync {
    fn nodename(&self, pid: pid_t) -> Result<String>;
}

/// Reads a task's hostname by joining its UTS namespace for the duration of
/// a single `uname(2)` call.
pub struct JoinUts {
    root: PathBuf,
    home: File,
}

impl JoinUts {
    pub fn new(root: &Path) -> Result<Self> {
        let home = File::open("/proc/self/ns/uts")?;
        Ok(Self { root: root.to_owned(), home })
    }
}

impl UtsResolver for JoinUts {
    fn nodename(&self, pid: pid_t) -> Result<String> {
        let ns = File::open(self.root.join(pid.to_string()).join("ns/uts"))?;

        setns(&ns)?;
        let name = uname();
        setns(&self.home)?;

        name
    }
}

fn setns(ns: &File) -> Result<()> {
    // SAFETY: the descriptor belongs to an open namespace file and the call
    // only switches the UTS namespace of the calling thread.
    match unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWUTS) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error().into()),
    }
}

fn uname() -> Result<String> {
    // SAFETY: utsname is plain old data and uname(2) fills every field with
    // NUL terminated strings.
    unsafe {
        let mut uts: libc::utsname = mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let name = CStr::from_ptr(uts.nodename.as_ptr());
        Ok(name.to_string_lossy().into_owned())
    }
}
