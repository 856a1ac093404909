// Quorum policy for a batch of reimaged hosts

use std::collections::BTreeSet;

/// Tracks which hosts reimaged successfully and whether that is enough
pub trait HostGroup {
    fn mark_host_success(&mut self, hostname: &str);
    fn enough_hosts_succeeded(&self) -> bool;
}

/// Every named host must succeed
#[derive(Debug, Clone, Default)]
pub struct ExplicitHostGroup {
    hosts: BTreeSet<String>,
    succeeded: BTreeSet<String>,
}

impl ExplicitHostGroup {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            succeeded: BTreeSet::new(),
        }
    }
}

impl HostGroup for ExplicitHostGroup {
    fn mark_host_success(&mut self, hostname: &str) {
        if self.hosts.contains(hostname) {
            self.succeeded.insert(hostname.to_string());
        }
    }

    fn enough_hosts_succeeded(&self) -> bool {
        self.succeeded == self.hosts
    }
}

/// Any `num_required` hosts matching a label
#[derive(Debug, Clone)]
pub struct MetaHostGroup {
    label: String,
    num_required: usize,
    succeeded: BTreeSet<String>,
}

impl MetaHostGroup {
    pub fn new(label: impl Into<String>, num_required: usize) -> Self {
        Self {
            label: label.into(),
            num_required,
            succeeded: BTreeSet::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl HostGroup for MetaHostGroup {
    fn mark_host_success(&mut self, hostname: &str) {
        self.succeeded.insert(hostname.to_string());
    }

    fn enough_hosts_succeeded(&self) -> bool {
        self.succeeded.len() >= self.num_required
    }
}
