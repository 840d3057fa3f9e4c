//! Per-host command queue
//!
//! Commands are persistent sequential children of the queue node, so the
//! store's sequence counter gives a total FIFO order across producers. The
//! current command lives in its own node (empty body = none). Dequeue removes
//! the head and sets the current command in one atomic batch, conditioned on
//! the head's version; losing a race means re-reading and trying again.

use crate::common::utils::node_name;
use crate::common::{join_path, Error, Result};
use crate::coordinator::host::{CommandQueueListener, CurrentCommandListener, HostCommand};
use crate::coordinator::watched::{NodeValue, WatchSource, WatchedValue};
use crate::store::{decode, encode, CoordinationStore, CreateMode, Op, Watcher};
use std::sync::Arc;

const COMMAND_PREFIX: &str = "command_";

/// Queue contents, read from the child listing of the queue node
pub struct QueueSource {
    path: String,
}

impl QueueSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl WatchSource for QueueSource {
    type Value = Vec<HostCommand>;

    fn path(&self) -> &str {
        &self.path
    }

    fn load(
        &self,
        store: &dyn CoordinationStore,
        watcher: Option<Watcher>,
    ) -> Result<Option<Vec<HostCommand>>> {
        let Some(children) = store.get_children(&self.path, watcher)? else {
            return Ok(None);
        };
        let mut commands = Vec::with_capacity(children.len());
        for child in children {
            // Dequeued between the listing and this read
            if let Some((data, _)) = store.get_data(&join_path(&self.path, &child), None)? {
                commands.push(decode(&data)?);
            }
        }
        Ok(Some(commands))
    }
}

pub struct CommandQueue {
    store: Arc<dyn CoordinationStore>,
    queue_path: String,
    current_path: String,
    max_retries: usize,
    queue: WatchedValue<QueueSource>,
    current: WatchedValue<NodeValue<HostCommand>>,
}

impl CommandQueue {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue_path: String,
        current_path: String,
        max_retries: usize,
    ) -> Self {
        Self {
            queue: WatchedValue::new(store.clone(), QueueSource::new(queue_path.clone())),
            current: WatchedValue::new(store.clone(), NodeValue::new(current_path.clone())),
            store,
            queue_path,
            current_path,
            max_retries: max_retries.max(1),
        }
    }

    pub fn enqueue(&self, command: HostCommand) -> Result<()> {
        let path = self.store.create(
            &join_path(&self.queue_path, COMMAND_PREFIX),
            encode(&command)?,
            CreateMode::PersistentSequential,
        )?;
        tracing::debug!("Enqueued {} as {}", command, node_name(&path));
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Vec<HostCommand>> {
        Ok(self.queue.read()?.unwrap_or_default())
    }

    pub fn current(&self) -> Result<Option<HostCommand>> {
        self.current.read()
    }

    pub fn next(&self) -> Result<Option<HostCommand>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_next() {
                Ok(command) => return Ok(command),
                Err(e) if e.is_store_conflict() && attempt < self.max_retries => {
                    tracing::debug!(
                        "Dequeue attempt {} on {} lost a race: {}",
                        attempt,
                        self.queue_path,
                        e
                    );
                }
                Err(e) => {
                    if e.is_store_conflict() {
                        tracing::warn!(
                            "Giving up dequeue on {} after {} attempts",
                            self.queue_path,
                            attempt
                        );
                    }
                    return Err(e.into_conflict(&format!("dequeue from {}", self.queue_path)));
                }
            }
        }
    }

    fn try_next(&self) -> Result<Option<HostCommand>> {
        let children = self.children()?;
        let Some(head) = children.first() else {
            self.clear_current()?;
            return Ok(None);
        };

        let head_path = join_path(&self.queue_path, head);
        let Some((data, stat)) = self.store.get_data(&head_path, None)? else {
            return Err(Error::NoNode(head_path));
        };
        let command: HostCommand = decode(&data)?;

        self.store.multi(vec![
            Op::Delete {
                path: head_path,
                version: Some(stat.version),
            },
            Op::SetData {
                path: self.current_path.clone(),
                data: encode(&command)?,
                version: None,
            },
        ])?;
        tracing::debug!("Dequeued {} from {}", command, self.queue_path);
        Ok(Some(command))
    }

    /// Set the current command to none, writing only if it is not already.
    fn clear_current(&self) -> Result<()> {
        match self.store.get_data(&self.current_path, None)? {
            Some((data, stat)) if !data.is_empty() => {
                self.store
                    .set_data(&self.current_path, Vec::new(), Some(stat.version))?;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!(
                "current command node {}",
                self.current_path
            ))),
        }
    }

    /// Remove every queued command in one batch. Clearing an empty queue
    /// changes nothing and notifies no one.
    pub fn clear(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let children = self.children()?;
            if children.is_empty() {
                return Ok(());
            }
            let ops = children
                .iter()
                .map(|child| Op::Delete {
                    path: join_path(&self.queue_path, child),
                    version: None,
                })
                .collect();
            match self.store.multi(ops) {
                Ok(()) => {
                    tracing::debug!(
                        "Cleared {} command(s) from {}",
                        children.len(),
                        self.queue_path
                    );
                    return Ok(());
                }
                Err(e) if e.is_store_conflict() && attempt < self.max_retries => {
                    tracing::debug!(
                        "Clear attempt {} on {} lost a race: {}",
                        attempt,
                        self.queue_path,
                        e
                    );
                }
                Err(e) => return Err(e.into_conflict(&format!("clear {}", self.queue_path))),
            }
        }
    }

    fn children(&self) -> Result<Vec<String>> {
        self.store
            .get_children(&self.queue_path, None)?
            .ok_or_else(|| Error::NotFound(format!("command queue {}", self.queue_path)))
    }

    pub fn subscribe_queue(&self, listener: CommandQueueListener) -> Result<()> {
        self.queue.subscribe(listener)
    }

    pub fn unsubscribe_queue(&self) {
        self.queue.unsubscribe()
    }

    pub fn subscribe_current(&self, listener: CurrentCommandListener) -> Result<()> {
        self.current.subscribe(listener)
    }

    pub fn unsubscribe_current(&self) {
        self.current.unsubscribe()
    }
}
