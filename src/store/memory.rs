//! In-process coordination store
//!
//! Keeps the whole tree in a `BTreeMap` behind a mutex. Watches are one-shot
//! and are handed, in commit order, to a single dispatch task on the Tokio
//! runtime, so callbacks never run on the writer's thread.

use super::{CoordinationStore, CreateMode, EventType, Op, Stat, WatchedEvent, Watcher};
use crate::common::{utils, Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

struct Dispatch {
    watcher: Watcher,
    event: WatchedEvent,
}

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
    next_sequence: u64,
}

struct ArmedWatch {
    session: u64,
    watcher: Watcher,
}

enum Trigger {
    Data(String, EventType),
    Children(String, EventType),
}

#[derive(Default)]
struct Watches {
    data: HashMap<String, Vec<ArmedWatch>>,
    children: HashMap<String, Vec<ArmedWatch>>,
}

impl Watches {
    fn drop_session(&mut self, session: u64) {
        for map in [&mut self.data, &mut self.children] {
            map.retain(|_, armed| {
                armed.retain(|w| w.session != session);
                !armed.is_empty()
            });
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: Watches,
    live_sessions: HashSet<u64>,
    reachable: bool,
}

impl Tree {
    fn check_session(&self, session: u64) -> Result<()> {
        if !self.reachable {
            Err(Error::Communication("coordination store unreachable".into()))
        } else if self.live_sessions.contains(&session) {
            Ok(())
        } else {
            Err(Error::SessionEnded(session))
        }
    }

    fn arm_data(&mut self, path: &str, session: u64, watcher: Watcher) {
        self.watches
            .data
            .entry(path.to_string())
            .or_default()
            .push(ArmedWatch { session, watcher });
    }

    fn arm_children(&mut self, path: &str, session: u64, watcher: Watcher) {
        self.watches
            .children
            .entry(path.to_string())
            .or_default()
            .push(ArmedWatch { session, watcher });
    }

    /// Hand every watch matched by `triggers` to the dispatcher. Runs under
    /// the tree lock so events are queued in commit order.
    fn fire(&mut self, triggers: Vec<Trigger>, events: &mpsc::UnboundedSender<Dispatch>) {
        for trigger in triggers {
            let (armed, event) = match trigger {
                Trigger::Data(path, event_type) => (
                    self.watches.data.remove(&path),
                    WatchedEvent { event_type, path },
                ),
                Trigger::Children(path, event_type) => (
                    self.watches.children.remove(&path),
                    WatchedEvent { event_type, path },
                ),
            };
            for ArmedWatch { watcher, .. } in armed.into_iter().flatten() {
                if events
                    .send(Dispatch {
                        watcher,
                        event: event.clone(),
                    })
                    .is_err()
                {
                    tracing::debug!("Watch dispatcher gone, dropping event for {}", event.path);
                }
            }
        }
    }
}

fn parent_of(path: &str) -> Result<String> {
    utils::parent_path(path)
        .map(str::to_string)
        .ok_or_else(|| Error::Programming(format!("{} has no parent", path)))
}

fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    };
    nodes
        .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

fn apply_create(
    nodes: &mut BTreeMap<String, Node>,
    path: &str,
    data: Vec<u8>,
    mode: CreateMode,
    session: u64,
    triggers: &mut Vec<Trigger>,
) -> Result<String> {
    utils::validate_path(path)?;
    if path == "/" {
        return Err(Error::NodeExists(path.to_string()));
    }
    let parent = parent_of(path)?;
    let (sequence, parent_is_ephemeral) = match nodes.get(&parent) {
        Some(node) => (node.next_sequence, node.stat.ephemeral_owner.is_some()),
        None => return Err(Error::NoNode(parent)),
    };
    if parent_is_ephemeral {
        return Err(Error::NoChildrenForEphemerals(parent));
    }

    let actual = if mode.is_sequential() {
        format!("{}{:010}", path, sequence)
    } else {
        path.to_string()
    };
    if nodes.contains_key(&actual) {
        return Err(Error::NodeExists(actual));
    }

    if let Some(parent_node) = nodes.get_mut(&parent) {
        if mode.is_sequential() {
            parent_node.next_sequence += 1;
        }
        parent_node.stat.cversion += 1;
        parent_node.stat.num_children += 1;
    }

    let now = utils::timestamp_now_millis();
    nodes.insert(
        actual.clone(),
        Node {
            data,
            stat: Stat {
                ctime: now,
                mtime: now,
                ephemeral_owner: mode.is_ephemeral().then_some(session),
                ..Stat::default()
            },
            next_sequence: 0,
        },
    );

    triggers.push(Trigger::Data(actual.clone(), EventType::NodeCreated));
    triggers.push(Trigger::Children(parent, EventType::NodeChildrenChanged));
    Ok(actual)
}

fn check_version(path: &str, node: &Node, version: Option<u64>) -> Result<()> {
    match version {
        Some(expected) if expected != node.stat.version => Err(Error::BadVersion {
            path: path.to_string(),
            expected,
            actual: node.stat.version,
        }),
        _ => Ok(()),
    }
}

fn apply_set(
    nodes: &mut BTreeMap<String, Node>,
    path: &str,
    data: Vec<u8>,
    version: Option<u64>,
    triggers: &mut Vec<Trigger>,
) -> Result<Stat> {
    let node = nodes
        .get_mut(path)
        .ok_or_else(|| Error::NoNode(path.to_string()))?;
    check_version(path, node, version)?;

    node.data = data;
    node.stat.version += 1;
    node.stat.mtime = utils::timestamp_now_millis();

    triggers.push(Trigger::Data(path.to_string(), EventType::NodeDataChanged));
    Ok(node.stat)
}

fn apply_delete(
    nodes: &mut BTreeMap<String, Node>,
    path: &str,
    version: Option<u64>,
    triggers: &mut Vec<Trigger>,
) -> Result<()> {
    if path == "/" {
        return Err(Error::Programming("cannot delete the root node".into()));
    }
    let node = nodes
        .get(path)
        .ok_or_else(|| Error::NoNode(path.to_string()))?;
    check_version(path, node, version)?;
    if node.stat.num_children > 0 {
        return Err(Error::NotEmpty(path.to_string()));
    }

    nodes.remove(path);
    let parent = parent_of(path)?;
    if let Some(parent_node) = nodes.get_mut(&parent) {
        parent_node.stat.cversion += 1;
        parent_node.stat.num_children -= 1;
    }

    triggers.push(Trigger::Data(path.to_string(), EventType::NodeDeleted));
    triggers.push(Trigger::Children(path.to_string(), EventType::NodeDeleted));
    triggers.push(Trigger::Children(parent, EventType::NodeChildrenChanged));
    Ok(())
}

fn apply_check(nodes: &BTreeMap<String, Node>, path: &str, version: u64) -> Result<()> {
    let node = nodes
        .get(path)
        .ok_or_else(|| Error::NoNode(path.to_string()))?;
    check_version(path, node, Some(version))
}

struct Shared {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
    events: mpsc::UnboundedSender<Dispatch>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end_session(&self, session: u64, reason: &str) {
        let mut tree = self.lock();
        if !tree.live_sessions.remove(&session) {
            return;
        }
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut triggers = Vec::new();
        for path in &owned {
            if let Err(e) = apply_delete(&mut tree.nodes, path, None, &mut triggers) {
                tracing::warn!("Failed to drop ephemeral node {}: {}", path, e);
            }
        }
        // The session's own watches on its ephemerals fire too, then the rest go
        tree.fire(triggers, &self.events);
        tree.watches.drop_session(session);

        tracing::debug!(
            "Session {:#x} {}, removed {} ephemeral node(s)",
            session,
            reason,
            owned.len()
        );
    }
}

/// Shared in-process store. Clone freely; every clone sees the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store. Must be called from within a Tokio runtime,
    /// which hosts the watch dispatch task.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("MemoryStore needs a Tokio runtime: {}", e)))?;

        let (events, mut rx) = mpsc::unbounded_channel::<Dispatch>();
        runtime.spawn(async move {
            while let Some(Dispatch { watcher, event }) = rx.recv().await {
                let path = event.path.clone();
                if catch_unwind(AssertUnwindSafe(move || watcher(event))).is_err() {
                    tracing::error!("Watcher on {} panicked", path);
                }
            }
        });

        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                stat: Stat::default(),
                next_sequence: 0,
            },
        );

        Ok(Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree {
                    nodes,
                    watches: Watches::default(),
                    live_sessions: HashSet::new(),
                    reachable: true,
                }),
                next_session: AtomicU64::new(1),
                events,
            }),
        })
    }

    /// Open a new client session
    pub fn connect(&self) -> Arc<Session> {
        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        self.shared.lock().live_sessions.insert(id);
        tracing::debug!("Session {:#x} opened", id);
        Arc::new(Session {
            id,
            shared: self.shared.clone(),
        })
    }

    /// Drop a session as if its client had lost connectivity
    pub fn expire_session(&self, session: u64) {
        self.shared.end_session(session, "expired");
    }

    /// Cut every client off from the store, or restore access. Sessions and
    /// their ephemerals survive the outage.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
        tracing::info!(
            "Coordination store {}",
            if reachable { "reachable" } else { "unreachable" }
        );
    }

    /// Number of watches armed and not yet fired
    pub fn armed_watches(&self) -> usize {
        let tree = self.shared.lock();
        tree.watches.data.values().map(Vec::len).sum::<usize>()
            + tree.watches.children.values().map(Vec::len).sum::<usize>()
    }

    /// Human-readable listing of every node, for debugging
    pub fn dump(&self) -> String {
        let tree = self.shared.lock();
        let mut out = String::new();
        for (path, node) in &tree.nodes {
            let kind = match node.stat.ephemeral_owner {
                Some(owner) => format!("ephemeral({:#x})", owner),
                None => "persistent".to_string(),
            };
            out.push_str(&format!(
                "{} [{}, v{}, {} bytes]\n",
                path,
                kind,
                node.stat.version,
                node.data.len()
            ));
        }
        out
    }
}

/// One client session on a [`MemoryStore`]
pub struct Session {
    id: u64,
    shared: Arc<Shared>,
}

impl Session {
    /// Close gracefully; ephemeral nodes owned by this session are removed.
    pub fn close(&self) {
        self.shared.end_session(self.id, "closed");
    }

    pub fn is_live(&self) -> bool {
        self.shared.lock().live_sessions.contains(&self.id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl CoordinationStore for Session {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let mut tree = self.shared.lock();
        tree.check_session(self.id)?;
        let mut triggers = Vec::new();
        let actual = apply_create(&mut tree.nodes, path, data, mode, self.id, &mut triggers)?;
        tree.fire(triggers, &self.shared.events);
        tracing::debug!("create {} ({:?})", actual, mode);
        Ok(actual)
    }

    fn get_data(&self, path: &str, watcher: Option<Watcher>) -> Result<Option<(Vec<u8>, Stat)>> {
        let mut tree = self.shared.lock();
        tree.check_session(self.id)?;
        let found = tree
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat));
        if let Some(watcher) = watcher {
            tree.arm_data(path, self.id, watcher);
        }
        Ok(found)
    }

    fn exists(&self, path: &str, watcher: Option<Watcher>) -> Result<Option<Stat>> {
        let mut tree = self.shared.lock();
        tree.check_session(self.id)?;
        let found = tree.nodes.get(path).map(|node| node.stat);
        if let Some(watcher) = watcher {
            tree.arm_data(path, self.id, watcher);
        }
        Ok(found)
    }

    fn get_children(&self, path: &str, watcher: Option<Watcher>) -> Result<Option<Vec<String>>> {
        let mut tree = self.shared.lock();
        tree.check_session(self.id)?;
        let found = tree
            .nodes
            .contains_key(path)
            .then(|| children_of(&tree.nodes, path));
        if let Some(watcher) = watcher {
            tree.arm_children(path, self.id, watcher);
        }
        Ok(found)
    }

    fn set_data(&self, path: &str, data: Vec<u8>, version: Option<u64>) -> Result<Stat> {
        let mut tree = self.shared.lock();
        tree.check_session(self.id)?;
        let mut triggers = Vec::new();
        let stat = apply_set(&mut tree.nodes, path, data, version, &mut triggers)?;
        tree.fire(triggers, &self.shared.events);
        tracing::debug!("set {} (v{})", path, stat.version);
        Ok(stat)
    }

    fn delete(&self, path: &str, version: Option<u64>) -> Result<()> {
        let mut tree = self.shared.lock();
        tree.check_session(self.id)?;
        let mut triggers = Vec::new();
        apply_delete(&mut tree.nodes, path, version, &mut triggers)?;
        tree.fire(triggers, &self.shared.events);
        tracing::debug!("delete {}", path);
        Ok(())
    }

    fn multi(&self, ops: Vec<Op>) -> Result<()> {
        let mut tree = self.shared.lock();
        tree.check_session(self.id)?;

        // Work on a copy so a failing op leaves the tree untouched
        let mut nodes = tree.nodes.clone();
        let mut triggers = Vec::new();
        let count = ops.len();
        for op in ops {
            match op {
                Op::Create { path, data, mode } => {
                    apply_create(&mut nodes, &path, data, mode, self.id, &mut triggers)?;
                }
                Op::SetData {
                    path,
                    data,
                    version,
                } => {
                    apply_set(&mut nodes, &path, data, version, &mut triggers)?;
                }
                Op::Delete { path, version } => {
                    apply_delete(&mut nodes, &path, version, &mut triggers)?;
                }
                Op::Check { path, version } => apply_check(&nodes, &path, version)?,
            }
        }

        tree.nodes = nodes;
        tree.fire(triggers, &self.shared.events);
        tracing::debug!("multi committed {} op(s)", count);
        Ok(())
    }
}
