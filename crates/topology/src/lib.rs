//! In-memory forest of known agents, rooted at the administrator.
//!
//! A single readers-writer lock guards both the node table and the
//! parent/child edges, mirroring how session state is guarded
//! elsewhere in comparable relay servers: short, non-blocking
//! critical sections, no I/O while held.

use std::time::{SystemTime, UNIX_EPOCH};

use ahash::{HashMap, HashMapExt};
use log::{debug, warn};
use parking_lot::RwLock;

#[derive(Debug)]
pub enum Error {
    UnknownNode(String),
    CycleRefused,
    CycleDetected,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNode(id) => write!(f, "unknown node: {id}"),
            Self::CycleRefused => write!(f, "edge would introduce a cycle or self-loop"),
            Self::CycleDetected => write!(f, "cycle detected while walking the topology"),
        }
    }
}

/// Everything known about one agent, direct or cascaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub local_ips: Vec<String>,
    pub os: String,
    pub arch: String,
    pub parent_id: Option<String>,
    pub last_seen: u64,
    pub active: bool,
}

impl Node {
    fn new(id: String, hostname: String, local_ips: Vec<String>, os: String, arch: String) -> Self {
        Self {
            id,
            hostname,
            local_ips,
            os,
            arch,
            parent_id: None,
            last_seen: now(),
            active: true,
        }
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    children: HashMap<String, Vec<String>>,
}

pub struct Topology(RwLock<Inner>);

impl Default for Topology {
    fn default() -> Self {
        Self(RwLock::new(Inner {
            nodes: HashMap::with_capacity(64),
            children: HashMap::with_capacity(64),
        }))
    }
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert: creates the node on first sight, otherwise
    /// just refreshes liveness.
    pub fn add_node(&self, id: &str, hostname: &str, local_ips: Vec<String>, os: &str, arch: &str) {
        let mut inner = self.0.write();
        match inner.nodes.get_mut(id) {
            Some(node) => {
                node.last_seen = now();
                node.active = true;
                debug!("topology: refreshed node {id}");
            }
            None => {
                inner
                    .nodes
                    .insert(id.to_string(), Node::new(id.to_string(), hostname.to_string(), local_ips, os.to_string(), arch.to_string()));
                inner.children.entry(id.to_string()).or_default();
                debug!("topology: added node {id} ({hostname}, {os}/{arch})");
            }
        }
    }

    /// Attaches `child` under `parent`. Rejects self-loops and any
    /// edge that would make `parent` a descendant of `child`.
    pub fn add_edge(&self, parent: &str, child: &str) -> Result<(), Error> {
        if parent == child {
            warn!("topology: refusing self-loop edge {parent} -> {child}");
            return Err(Error::CycleRefused);
        }

        let mut inner = self.0.write();
        if !inner.nodes.contains_key(parent) {
            warn!("topology: refusing edge {parent} -> {child}: unknown parent");
            return Err(Error::UnknownNode(parent.to_string()));
        }
        if !inner.nodes.contains_key(child) {
            warn!("topology: refusing edge {parent} -> {child}: unknown child");
            return Err(Error::UnknownNode(child.to_string()));
        }

        if inner.nodes.get(child).and_then(|n| n.parent_id.as_deref()) == Some(parent) {
            return Ok(());
        }

        if ancestor_chain_contains(&inner.nodes, parent, child) {
            warn!("topology: refusing edge {parent} -> {child}: would introduce a cycle");
            return Err(Error::CycleRefused);
        }

        if let Some(old_parent) = inner.nodes.get(child).and_then(|n| n.parent_id.clone()) {
            if let Some(siblings) = inner.children.get_mut(&old_parent) {
                siblings.retain(|id| id != child);
            }
        }

        inner.children.entry(parent.to_string()).or_default().push(child.to_string());
        if let Some(node) = inner.nodes.get_mut(child) {
            node.parent_id = Some(parent.to_string());
        }

        debug!("topology: added edge {parent} -> {child}");
        Ok(())
    }

    /// Marks `id` inactive and detaches it from its parent's child list.
    pub fn remove_node(&self, id: &str) {
        let mut inner = self.0.write();
        if let Some(node) = inner.nodes.get_mut(id) {
            node.active = false;
        }
        if let Some(parent) = inner.nodes.get(id).and_then(|n| n.parent_id.clone()) {
            if let Some(siblings) = inner.children.get_mut(&parent) {
                siblings.retain(|child| child != id);
            }
        }
    }

    pub fn update_heartbeat(&self, id: &str) {
        let mut inner = self.0.write();
        if let Some(node) = inner.nodes.get_mut(id) {
            node.last_seen = now();
            node.active = true;
        }
    }

    /// Returns the ids of every active node whose last heartbeat is
    /// older than `timeout_secs`, flipping each to inactive.
    pub fn check_dead(&self, timeout_secs: u64) -> Vec<String> {
        let deadline = now().saturating_sub(timeout_secs);
        let mut inner = self.0.write();
        let mut dead = Vec::new();
        for node in inner.nodes.values_mut() {
            if node.active && node.last_seen < deadline {
                node.active = false;
                dead.push(node.id.clone());
            }
        }
        if !dead.is_empty() {
            warn!("topology: swept {} dead node(s): {}", dead.len(), dead.join(", "));
        }
        dead
    }

    /// Path from the root down to `target`, inclusive. Empty if
    /// `target` is unknown.
    pub fn get_path(&self, target: &str) -> Result<Vec<String>, Error> {
        let inner = self.0.read();
        if !inner.nodes.contains_key(target) {
            return Ok(Vec::new());
        }

        let mut path = vec![target.to_string()];
        let mut visited: HashMap<String, ()> = HashMap::new();
        visited.insert(target.to_string(), ());

        let mut cursor = target.to_string();
        while let Some(parent) = inner.nodes.get(&cursor).and_then(|n| n.parent_id.clone()) {
            if visited.contains_key(&parent) {
                return Err(Error::CycleDetected);
            }
            visited.insert(parent.clone(), ());
            path.push(parent.clone());
            cursor = parent;
        }

        path.reverse();
        Ok(path)
    }

    pub fn get_all_nodes(&self) -> Vec<Node> {
        self.0.read().nodes.values().cloned().collect()
    }

    pub fn children_of(&self, id: &str) -> Vec<String> {
        self.0.read().children.get(id).cloned().unwrap_or_default()
    }
}

fn ancestor_chain_contains(nodes: &HashMap<String, Node>, start: &str, needle: &str) -> bool {
    let mut cursor = start.to_string();
    let mut guard = 0usize;
    while let Some(parent) = nodes.get(&cursor).and_then(|n| n.parent_id.clone()) {
        if parent == needle {
            return true;
        }
        cursor = parent;
        guard += 1;
        if guard > nodes.len() + 1 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(topo: &Topology, id: &str) {
        topo.add_node(id, "host", vec!["10.0.0.1".into()], "linux", "x86_64");
    }

    #[test]
    fn add_node_is_idempotent() {
        let topo = Topology::new();
        add(&topo, "a1");
        add(&topo, "a1");
        assert_eq!(topo.get_all_nodes().len(), 1);
    }

    #[test]
    fn add_edge_rejects_unknown_nodes() {
        let topo = Topology::new();
        add(&topo, "a1");
        assert!(matches!(topo.add_edge("a1", "ghost"), Err(Error::UnknownNode(_))));
    }

    #[test]
    fn add_edge_rejects_self_loop() {
        let topo = Topology::new();
        add(&topo, "a1");
        assert!(matches!(topo.add_edge("a1", "a1"), Err(Error::CycleRefused)));
    }

    #[test]
    fn add_edge_rejects_cycles() {
        let topo = Topology::new();
        add(&topo, "a1");
        add(&topo, "a2");
        add(&topo, "a3");
        topo.add_edge("a1", "a2").unwrap();
        topo.add_edge("a2", "a3").unwrap();
        assert!(matches!(topo.add_edge("a3", "a1"), Err(Error::CycleRefused)));
    }

    #[test]
    fn get_path_walks_root_to_target() {
        let topo = Topology::new();
        add(&topo, "admin");
        add(&topo, "a1");
        add(&topo, "a2");
        topo.add_edge("admin", "a1").unwrap();
        topo.add_edge("a1", "a2").unwrap();
        assert_eq!(topo.get_path("a2").unwrap(), vec!["admin", "a1", "a2"]);
    }

    #[test]
    fn get_path_is_empty_for_unknown_node() {
        let topo = Topology::new();
        assert!(topo.get_path("ghost").unwrap().is_empty());
    }

    #[test]
    fn remove_node_detaches_from_parent() {
        let topo = Topology::new();
        add(&topo, "admin");
        add(&topo, "a1");
        topo.add_edge("admin", "a1").unwrap();
        topo.remove_node("a1");
        assert!(topo.children_of("admin").is_empty());
    }

    #[test]
    fn check_dead_flips_stale_nodes_once() {
        let topo = Topology::new();
        add(&topo, "a1");
        {
            let mut inner = topo.0.write();
            inner.nodes.get_mut("a1").unwrap().last_seen = 0;
        }
        let dead = topo.check_dead(10);
        assert_eq!(dead, vec!["a1".to_string()]);
        assert!(topo.check_dead(10).is_empty());
    }
}
