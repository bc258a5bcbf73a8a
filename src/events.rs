//! Kubernetes Event recording is an external collaborator per the scope of
//! this system — only the interface is specified here. [`TracingEventRecorder`]
//! is the stand-in used until a real deployment swaps in
//! `kube::runtime::events::Recorder`.

use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRef<'a> {
    pub kind: &'a str,
    pub namespace: Option<&'a str>,
    pub name: &'a str,
}

impl std::fmt::Display for ObjectRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

pub trait EventRecorder: Send + Sync {
    fn warn(&self, obj: &ObjectRef<'_>, reason: &str, message: &str);
    fn normal(&self, obj: &ObjectRef<'_>, reason: &str, message: &str);
}

#[derive(Default)]
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn warn(&self, obj: &ObjectRef<'_>, reason: &str, message: &str) {
        warn!(object = %obj, reason, message, "event");
    }

    fn normal(&self, obj: &ObjectRef<'_>, reason: &str, message: &str) {
        info!(object = %obj, reason, message, "event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_displays_namespaced_form() {
        let obj = ObjectRef {
            kind: "Subnet",
            namespace: None,
            name: "s1",
        };
        assert_eq!(obj.to_string(), "Subnet/s1");

        let pod = ObjectRef {
            kind: "Pod",
            namespace: Some("default"),
            name: "nginx",
        };
        assert_eq!(pod.to_string(), "Pod/default/nginx");
    }

    #[test]
    fn recorder_does_not_panic() {
        let recorder = TracingEventRecorder;
        let obj = ObjectRef {
            kind: "Subnet",
            namespace: None,
            name: "s1",
        };
        recorder.warn(&obj, "ValidationFailed", "cidr is not parseable");
        recorder.normal(&obj, "Active", "subnet is ready");
    }
}
