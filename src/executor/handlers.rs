// Handler queue: per-host pending notifications, deduplicated per flush window

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::parser::ast::Handler;

/// Handlers pending for one host at the moment of a flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushBatch {
    /// 1-based flush window counter for the host
    pub window: u32,
    /// Handler indices in declaration order
    pub handlers: Vec<usize>,
}

#[derive(Debug, Default)]
struct HostQueue {
    pending: BTreeSet<usize>,
    flushes: u32,
}

/// Pending handler notifications for every host of a play.
///
/// Notifying the same handler twice before a flush is a no-op; a flush
/// returns the pending handlers in the order they were declared in the
/// play, not the order they were notified.
#[derive(Debug)]
pub struct HandlerQueue {
    /// Handler name -> declaration index
    index: HashMap<String, usize>,
    hosts: RwLock<HashMap<String, HostQueue>>,
}

impl HandlerQueue {
    pub fn from_handlers(handlers: &[Handler]) -> Self {
        HandlerQueue {
            index: handlers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.name().to_string(), i))
                .collect(),
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Mark a handler pending for a host. Returns true if it was not
    /// already pending in the current window.
    pub fn notify(&self, host: &str, handler_name: &str) -> bool {
        let Some(&idx) = self.index.get(handler_name) else {
            warn!(host, handler = handler_name, "notify for unknown handler ignored");
            return false;
        };

        let added = self
            .hosts
            .write()
            .entry(host.to_string())
            .or_default()
            .pending
            .insert(idx);
        if added {
            debug!(host, handler = handler_name, "handler notified");
        }
        added
    }

    /// Take the host's pending handlers and open a new flush window
    pub fn flush(&self, host: &str) -> FlushBatch {
        let mut hosts = self.hosts.write();
        let queue = hosts.entry(host.to_string()).or_default();
        queue.flushes += 1;
        FlushBatch {
            window: queue.flushes,
            handlers: std::mem::take(&mut queue.pending).into_iter().collect(),
        }
    }

    /// Continue window numbering after windows an earlier run already
    /// used, so new flushes never reuse a recorded handler step
    pub fn continue_windows(&self, windows: &HashMap<String, u32>) {
        let mut hosts = self.hosts.write();
        for (host, window) in windows {
            let queue = hosts.entry(host.clone()).or_default();
            queue.flushes = queue.flushes.max(*window);
        }
    }

    /// Drop the host's pending handlers without running them
    pub fn discard(&self, host: &str) -> Vec<usize> {
        self.hosts
            .write()
            .get_mut(host)
            .map(|q| std::mem::take(&mut q.pending).into_iter().collect())
            .unwrap_or_default()
    }

    /// Pending handler names for a host, in declaration order
    pub fn pending(&self, host: &str) -> Vec<String> {
        let hosts = self.hosts.read();
        let Some(queue) = hosts.get(host) else {
            return Vec::new();
        };
        let mut names: Vec<(&usize, &String)> = self
            .index
            .iter()
            .filter(|(_, idx)| queue.pending.contains(idx))
            .map(|(name, idx)| (idx, name))
            .collect();
        names.sort();
        names.into_iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn has_pending(&self, host: &str) -> bool {
        self.hosts
            .read()
            .get(host)
            .is_some_and(|q| !q.pending.is_empty())
    }
}
