//! Resource-granular reader/writer locks and the waits-for graph used to
//! detect deadlocks before a transaction is allowed to block.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::{Error, Result};

/// Whether a resource is held for reading or writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A lockable database resource: one entry, identified across tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub table: String,
    pub key: i64,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

/// Maps every resource to a reader/writer lock, lazily created on first
/// use. Acquisition is not guard-based: a transaction locks here and
/// releases much later (at commit) through [`ResourceLockManager::unlock`],
/// possibly from a different call stack.
#[derive(Default)]
pub struct ResourceLockManager {
    locks: Mutex<HashMap<Resource, LockState>>,
    released: Condvar,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the resource can be granted in the requested mode.
    pub fn lock(&self, resource: &Resource, mode: LockMode) {
        let mut locks = self.locks.lock();
        locks.entry(resource.clone()).or_default();
        loop {
            let state = locks.get_mut(resource).expect("state inserted above");
            let compatible = match mode {
                LockMode::Shared => !state.writer,
                LockMode::Exclusive => !state.writer && state.readers == 0,
            };
            if compatible {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                return;
            }
            self.released.wait(&mut locks);
        }
    }

    /// Releases a previously granted lock. Unlocking a resource that is not
    /// held in the given mode is an error.
    pub fn unlock(&self, resource: &Resource, mode: LockMode) -> Result<()> {
        let mut locks = self.locks.lock();
        let Some(state) = locks.get_mut(resource) else {
            return Err(Error::InvalidUnlock);
        };
        match mode {
            LockMode::Shared => {
                if state.readers == 0 {
                    return Err(Error::InvalidUnlock);
                }
                state.readers -= 1;
            }
            LockMode::Exclusive => {
                if !state.writer {
                    return Err(Error::InvalidUnlock);
                }
                state.writer = false;
            }
        }
        self.released.notify_all();
        Ok(())
    }
}

/// Directed multigraph over transactions. An edge `a -> b` means `a` is
/// waiting on a resource `b` currently holds; a cycle means deadlock.
#[derive(Default)]
pub struct WaitsForGraph {
    edges: Mutex<Vec<(Uuid, Uuid)>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `from` waits for `to`. Parallel edges accumulate.
    pub fn add_edge(&self, from: Uuid, to: Uuid) {
        self.edges.lock().push((from, to));
    }

    /// Removes one copy of the edge, reporting whether one existed.
    pub fn remove_edge(&self, from: Uuid, to: Uuid) -> bool {
        let mut edges = self.edges.lock();
        match edges.iter().position(|&edge| edge == (from, to)) {
            Some(pos) => {
                edges.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether the graph currently contains a cycle. Every vertex is used
    /// as a DFS start, so cycles unreachable from any particular vertex are
    /// still found; only confirmed cycles are reported.
    pub fn has_cycle(&self) -> bool {
        let edges = self.edges.lock();
        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for &(from, to) in edges.iter() {
            adjacency.entry(from).or_default().push(to);
        }
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        adjacency.keys().any(|&start| {
            !visited.contains(&start) && Self::dfs(start, &adjacency, &mut visited, &mut on_path)
        })
    }

    fn dfs(
        node: Uuid,
        adjacency: &HashMap<Uuid, Vec<Uuid>>,
        visited: &mut HashSet<Uuid>,
        on_path: &mut HashSet<Uuid>,
    ) -> bool {
        visited.insert(node);
        on_path.insert(node);
        if let Some(successors) = adjacency.get(&node) {
            for &next in successors {
                if on_path.contains(&next) {
                    return true;
                }
                if !visited.contains(&next) && Self::dfs(next, adjacency, visited, on_path) {
                    return true;
                }
            }
        }
        on_path.remove(&node);
        false
    }
}
