//! Host inventory and role selection

use execgraph::Host;
use std::collections::BTreeSet;

/// The fleet described by the cluster file.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: Vec<Host>,
}

impl Inventory {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Hosts playing any of `roles`, each once, ordered by name.
    ///
    /// A host selected through several roles is still one target.
    pub fn hosts_for_roles(&self, roles: &[String]) -> Vec<Host> {
        let selected: BTreeSet<&Host> = self
            .hosts
            .iter()
            .filter(|host| roles.iter().any(|role| host.has_role(role)))
            .collect();
        selected.into_iter().cloned().collect()
    }

    /// Every role any host plays.
    pub fn roles(&self) -> BTreeSet<&str> {
        self.hosts
            .iter()
            .flat_map(|h| h.roles.iter().map(String::as_str))
            .collect()
    }
}
