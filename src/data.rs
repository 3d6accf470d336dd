use std::collections::HashMap;
use libc::pid_t;
use serde::Serialize;

pub type PodMap = HashMap<String, Pod>;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    pub id:     String,
    pub pod:    String,
    pub parent: Vec<pid_t>,
    pub tasks:  Vec<pid_t>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Pod {
    pub containers: HashMap<String, Container>,
}

impl Container {
    pub fn new(pod: &str, id: &str) -> Self {
        Self {
            id:     id.to_owned(),
            pod:    pod.to_owned(),
            parent: Vec::new(),
            tasks:  Vec::new(),
        }
    }

    pub fn add_task(&mut self, pid: pid_t) {
        if !self.tasks.contains(&pid) {
            self.tasks.push(pid);
        }
    }
}

impl Pod {
    pub fn container(&mut self, pod: &str, name: &str) -> &mut Container {
        self.containers.entry(name.to_owned()).or_insert_with(|| {
            Container::new(pod, name)
        })
    }
}

pub fn container<'a>(pods: &'a mut PodMap, pod: &str, name: &str) -> &'a mut Container {
    pods.entry(pod.to_owned()).or_default().container(pod, name)
}
