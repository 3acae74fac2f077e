// Inventory module for host management

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::parser::ast::Value;

/// A single host in the inventory
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub facts: HashMap<String, Value>,
    pub groups: Vec<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Host {
            name: name.into(),
            facts: HashMap::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn get_fact(&self, key: &str) -> Option<&Value> {
        self.facts.get(key)
    }

    pub fn in_group(&self, group: &str) -> bool {
        group == "all" || self.groups.iter().any(|g| g == group)
    }
}

/// Reachability state of a host during a play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    #[default]
    Active,
    Unreachable,
    /// Removed from the rest of the play after a failure
    Excluded,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostState::Active => "active",
            HostState::Unreachable => "unreachable",
            HostState::Excluded => "excluded",
        };
        write!(f, "{}", s)
    }
}

/// Supplies the finalized host set for a play.
///
/// How the hosts were assembled (files, scripts, cloud APIs) is the
/// provider's concern; the executor only consumes the result.
pub trait InventoryProvider: Send + Sync {
    /// All hosts, in inventory order
    fn hosts(&self) -> Vec<Host>;

    fn host(&self, name: &str) -> Option<Host> {
        self.hosts().into_iter().find(|h| h.name == name)
    }

    /// Hosts matching a pattern: `all`, a group, a host name, or a
    /// `:`-separated union of those. Order follows the inventory.
    fn select(&self, pattern: &str) -> Vec<Host> {
        let parts: Vec<&str> = pattern
            .split(':')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        self.hosts()
            .into_iter()
            .filter(|h| parts.iter().any(|p| *p == h.name || h.in_group(p)))
            .collect()
    }
}

/// In-memory inventory built up front
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    hosts: Vec<Host>,
}

impl StaticInventory {
    pub fn new() -> Self {
        StaticInventory::default()
    }

    /// Add a host; a host with the same name is replaced in place
    pub fn add_host(&mut self, host: Host) {
        if let Some(existing) = self.hosts.iter_mut().find(|h| h.name == host.name) {
            *existing = host;
        } else {
            self.hosts.push(host);
        }
    }

    pub fn with_host(mut self, host: Host) -> Self {
        self.add_host(host);
        self
    }

    /// Group names in first-seen order
    pub fn groups(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.hosts
            .iter()
            .flat_map(|h| h.groups.iter())
            .filter(|g| seen.insert(g.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl FromIterator<Host> for StaticInventory {
    fn from_iter<I: IntoIterator<Item = Host>>(iter: I) -> Self {
        let mut inv = StaticInventory::new();
        for host in iter {
            inv.add_host(host);
        }
        inv
    }
}

impl InventoryProvider for StaticInventory {
    fn hosts(&self) -> Vec<Host> {
        self.hosts.clone()
    }

    fn host(&self, name: &str) -> Option<Host> {
        self.hosts.iter().find(|h| h.name == name).cloned()
    }
}
