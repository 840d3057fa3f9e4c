//! In-process host, for tests and simulations
//!
//! Same contract as the store-backed host, but listeners are called
//! synchronously, after the host's lock is released. With a single writer
//! every notification has been delivered by the time the write returns.

use crate::common::{timestamp_now_millis, Error, Result};
use crate::coordinator::domain::{Domain, HostDomain, PartitionProperties};
use crate::coordinator::host::{
    CommandQueueListener, CurrentCommandListener, Host, HostCommand, HostState,
    HostStateListener, PartitionServerAddress,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct MemoryHostDomain {
    domain: Domain,
    assigned: AtomicBool,
    partitions: Mutex<BTreeMap<u32, PartitionProperties>>,
}

impl MemoryHostDomain {
    fn new(domain: Domain) -> Self {
        Self {
            domain,
            assigned: AtomicBool::new(true),
            partitions: Mutex::new(BTreeMap::new()),
        }
    }

    fn partitions_lock(&self) -> MutexGuard<'_, BTreeMap<u32, PartitionProperties>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HostDomain for MemoryHostDomain {
    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn add_partition_properties(
        &self,
        partition: u32,
        num_bytes: u64,
        num_records: u64,
    ) -> Result<()> {
        if !self.assigned.load(Ordering::SeqCst) {
            return Err(Error::NotFound(format!(
                "domain {} is no longer assigned",
                self.domain
            )));
        }
        self.partitions_lock().insert(
            partition,
            PartitionProperties {
                num_bytes,
                num_records,
            },
        );
        Ok(())
    }

    fn partition_properties(&self, partition: u32) -> Result<Option<PartitionProperties>> {
        Ok(self.partitions_lock().get(&partition).copied())
    }

    fn partitions(&self) -> Result<BTreeMap<u32, PartitionProperties>> {
        Ok(self.partitions_lock().clone())
    }
}

#[derive(Default)]
struct Listeners {
    state: Option<HostStateListener>,
    queue: Option<CommandQueueListener>,
    current: Option<CurrentCommandListener>,
}

struct Inner {
    state: HostState,
    up_since: Option<u64>,
    flags: Vec<String>,
    queue: VecDeque<HostCommand>,
    current: Option<HostCommand>,
    domains: HashMap<u32, Arc<MemoryHostDomain>>,
    statistics: HashMap<String, String>,
    listeners: Listeners,
    /// Notifications in commit order, not yet delivered
    outbox: VecDeque<Pending>,
    /// Some caller is draining `outbox`
    delivering: bool,
}

/// Deferred listener calls, made once the lock is dropped
#[derive(Default)]
struct Pending {
    state: Option<(HostStateListener, Option<HostState>)>,
    queue: Option<(CommandQueueListener, Vec<HostCommand>)>,
    current: Option<(CurrentCommandListener, Option<HostCommand>)>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.state.is_none() && self.queue.is_none() && self.current.is_none()
    }

    fn deliver(self) {
        if let Some((listener, value)) = self.state {
            listener.on_watched_value_change(value);
        }
        if let Some((listener, value)) = self.current {
            listener.on_watched_value_change(value);
        }
        if let Some((listener, value)) = self.queue {
            listener.on_watched_value_change(Some(value));
        }
    }
}

impl Inner {
    fn state_changed(&self, pending: &mut Pending) {
        if let Some(listener) = &self.listeners.state {
            let value = self.state.is_online().then_some(self.state);
            pending.state = Some((listener.clone(), value));
        }
    }

    fn queue_changed(&self, pending: &mut Pending) {
        if let Some(listener) = &self.listeners.queue {
            pending.queue = Some((listener.clone(), self.queue.iter().copied().collect()));
        }
    }

    fn current_changed(&self, pending: &mut Pending) {
        if let Some(listener) = &self.listeners.current {
            pending.current = Some((listener.clone(), self.current));
        }
    }

    /// Drop the host's presence: OFFLINE, no statistics.
    fn go_offline(&mut self, pending: &mut Pending) {
        let was_online = self.state.is_online();
        self.state = HostState::Offline;
        self.up_since = None;
        self.statistics.clear();
        if was_online {
            self.state_changed(pending);
        }
    }
}

pub struct MemoryHost {
    address: PartitionServerAddress,
    inner: Mutex<Inner>,
}

impl MemoryHost {
    pub fn new(address: PartitionServerAddress) -> Self {
        Self {
            address,
            inner: Mutex::new(Inner {
                state: HostState::Offline,
                up_since: None,
                flags: Vec::new(),
                queue: VecDeque::new(),
                current: None,
                domains: HashMap::new(),
                statistics: HashMap::new(),
                listeners: Listeners::default(),
                outbox: VecDeque::new(),
                delivering: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate under the lock, then notify with the lock released.
    ///
    /// Notifications are queued under the lock and drained by one caller at a
    /// time, so listeners see changes in commit order even with concurrent
    /// writers. A listener writing to the host gets its own notification
    /// after it returns.
    fn update<R>(&self, f: impl FnOnce(&mut Inner, &mut Pending) -> R) -> R {
        let mut pending = Pending::default();
        let (result, drain) = {
            let mut inner = self.lock();
            let result = f(&mut inner, &mut pending);
            if !pending.is_empty() {
                inner.outbox.push_back(pending);
            }
            let drain = !inner.delivering && !inner.outbox.is_empty();
            if drain {
                inner.delivering = true;
            }
            (result, drain)
        };
        if drain {
            self.drain_outbox();
        }
        result
    }

    fn drain_outbox(&self) {
        loop {
            let next = {
                let mut inner = self.lock();
                match inner.outbox.pop_front() {
                    Some(pending) => pending,
                    None => {
                        inner.delivering = false;
                        return;
                    }
                }
            };
            if catch_unwind(AssertUnwindSafe(|| next.deliver())).is_err() {
                tracing::error!("Listener on host {} panicked", self.address);
            }
        }
    }

    /// Simulate the host losing its session.
    pub fn disconnect(&self) {
        tracing::info!("Host {} disconnected", self.address);
        self.update(|inner, pending| inner.go_offline(pending));
    }

    /// Every statistic currently reported by the host
    pub fn statistics(&self) -> BTreeMap<String, String> {
        self.lock()
            .statistics
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Host for MemoryHost {
    fn address(&self) -> &PartitionServerAddress {
        &self.address
    }

    fn state(&self) -> Result<HostState> {
        Ok(self.lock().state)
    }

    fn set_state(&self, state: HostState) -> Result<()> {
        self.update(|inner, pending| {
            if !state.is_online() {
                inner.go_offline(pending);
                return;
            }
            if !inner.state.is_online() {
                inner.up_since = Some(timestamp_now_millis());
            }
            inner.state = state;
            inner.state_changed(pending);
        });
        tracing::debug!("Host {} set to {}", self.address, state);
        Ok(())
    }

    fn up_since(&self) -> Result<Option<u64>> {
        Ok(self.lock().up_since)
    }

    fn set_state_change_listener(&self, listener: HostStateListener) -> Result<()> {
        self.lock().listeners.state = Some(listener);
        Ok(())
    }

    fn cancel_state_change_listener(&self) {
        self.lock().listeners.state = None;
    }

    fn flags(&self) -> Result<Vec<String>> {
        Ok(self.lock().flags.clone())
    }

    fn set_flags(&self, flags: &[String]) -> Result<()> {
        self.lock().flags = flags.to_vec();
        Ok(())
    }

    fn enqueue_command(&self, command: HostCommand) -> Result<()> {
        self.update(|inner, pending| {
            inner.queue.push_back(command);
            inner.queue_changed(pending);
        });
        Ok(())
    }

    fn command_queue(&self) -> Result<Vec<HostCommand>> {
        Ok(self.lock().queue.iter().copied().collect())
    }

    fn next_command(&self) -> Result<Option<HostCommand>> {
        Ok(self.update(|inner, pending| match inner.queue.pop_front() {
            Some(command) => {
                inner.current = Some(command);
                inner.current_changed(pending);
                inner.queue_changed(pending);
                Some(command)
            }
            None => {
                if inner.current.take().is_some() {
                    inner.current_changed(pending);
                }
                None
            }
        }))
    }

    fn current_command(&self) -> Result<Option<HostCommand>> {
        Ok(self.lock().current)
    }

    fn clear_command_queue(&self) -> Result<()> {
        self.update(|inner, pending| {
            if !inner.queue.is_empty() {
                inner.queue.clear();
                inner.queue_changed(pending);
            }
        });
        Ok(())
    }

    fn set_command_queue_change_listener(&self, listener: CommandQueueListener) -> Result<()> {
        self.lock().listeners.queue = Some(listener);
        Ok(())
    }

    fn cancel_command_queue_change_listener(&self) {
        self.lock().listeners.queue = None;
    }

    fn set_current_command_change_listener(
        &self,
        listener: CurrentCommandListener,
    ) -> Result<()> {
        self.lock().listeners.current = Some(listener);
        Ok(())
    }

    fn cancel_current_command_change_listener(&self) {
        self.lock().listeners.current = None;
    }

    fn assigned_domains(&self) -> Result<Vec<Arc<dyn HostDomain>>> {
        Ok(self
            .lock()
            .domains
            .values()
            .map(|hd| hd.clone() as Arc<dyn HostDomain>)
            .collect())
    }

    fn add_domain(&self, domain: &Domain) -> Result<Arc<dyn HostDomain>> {
        let mut inner = self.lock();
        if inner.domains.contains_key(&domain.id) {
            return Err(Error::Conflict(format!(
                "domain {} is already assigned to {}",
                domain, self.address
            )));
        }
        let host_domain = Arc::new(MemoryHostDomain::new(domain.clone()));
        inner.domains.insert(domain.id, host_domain.clone());
        Ok(host_domain as Arc<dyn HostDomain>)
    }

    fn remove_domain(&self, domain: &Domain) -> Result<bool> {
        match self.lock().domains.remove(&domain.id) {
            Some(host_domain) => {
                host_domain.assigned.store(false, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn host_domain(&self, domain: &Domain) -> Result<Option<Arc<dyn HostDomain>>> {
        Ok(self
            .lock()
            .domains
            .get(&domain.id)
            .map(|hd| hd.clone() as Arc<dyn HostDomain>))
    }

    fn set_ephemeral_statistic(&self, key: &str, value: &str) -> Result<()> {
        self.lock()
            .statistics
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn statistic(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().statistics.get(key).cloned())
    }

    fn delete_statistic(&self, key: &str) -> Result<()> {
        self.lock().statistics.remove(key);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.listeners = Listeners::default();
        let mut discarded = Pending::default();
        inner.go_offline(&mut discarded);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryHost [address={}]", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::watched::WatchedValueListener;

    fn host() -> MemoryHost {
        MemoryHost::new(PartitionServerAddress::new("localhost", 1))
    }

    type Seen<T> = Arc<Mutex<Vec<Option<T>>>>;

    fn recorder<T: Send + 'static>() -> (Seen<T>, Arc<dyn WatchedValueListener<T>>) {
        let seen: Seen<T> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (
            seen,
            Arc::new(move |v: Option<T>| sink.lock().unwrap().push(v)),
        )
    }

    #[test]
    fn test_state_and_up_since() {
        let host = host();
        let (seen, listener) = recorder::<HostState>();
        host.set_state_change_listener(listener).unwrap();

        assert_eq!(host.up_since().unwrap(), None);
        host.set_state(HostState::Idle).unwrap();
        let up = host.up_since().unwrap().unwrap();
        host.set_state(HostState::Serving).unwrap();
        assert_eq!(host.up_since().unwrap(), Some(up));

        host.set_state(HostState::Offline).unwrap();
        assert_eq!(host.up_since().unwrap(), None);
        // Already offline: nothing to report
        host.set_state(HostState::Offline).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(HostState::Idle), Some(HostState::Serving), None]
        );
    }

    #[test]
    fn test_queue_notifications() {
        let host = host();
        let (queues, queue_listener) = recorder::<Vec<HostCommand>>();
        let (currents, current_listener) = recorder::<HostCommand>();
        host.set_command_queue_change_listener(queue_listener)
            .unwrap();
        host.set_current_command_change_listener(current_listener)
            .unwrap();

        host.enqueue_command(HostCommand::ServeData).unwrap();
        host.enqueue_command(HostCommand::GoToIdle).unwrap();
        assert_eq!(host.next_command().unwrap(), Some(HostCommand::ServeData));
        host.clear_command_queue().unwrap();
        host.clear_command_queue().unwrap();
        assert_eq!(host.next_command().unwrap(), None);
        assert_eq!(host.next_command().unwrap(), None);

        assert_eq!(
            *queues.lock().unwrap(),
            vec![
                Some(vec![HostCommand::ServeData]),
                Some(vec![HostCommand::ServeData, HostCommand::GoToIdle]),
                Some(vec![HostCommand::GoToIdle]),
                Some(vec![]),
            ]
        );
        assert_eq!(
            *currents.lock().unwrap(),
            vec![Some(HostCommand::ServeData), None]
        );
    }

    #[test]
    fn test_disconnect() {
        let host = host();
        let (seen, listener) = recorder::<HostState>();
        host.set_state_change_listener(listener).unwrap();
        host.set_state(HostState::Serving).unwrap();
        host.set_ephemeral_statistic("qps", "10").unwrap();

        host.disconnect();
        assert_eq!(host.state().unwrap(), HostState::Offline);
        assert_eq!(host.statistic("qps").unwrap(), None);
        assert_eq!(seen.lock().unwrap().last(), Some(&None));
    }

    #[test]
    fn test_domains() {
        let host = host();
        let d = Domain::new(4, "d4");
        let hd = host.add_domain(&d).unwrap();
        assert!(matches!(host.add_domain(&d), Err(Error::Conflict(_))));
        hd.add_partition_properties(1, 10, 1).unwrap();
        assert_eq!(host.host_domain(&d).unwrap().unwrap().total_num_bytes().unwrap(), 10);

        assert!(host.remove_domain(&d).unwrap());
        assert!(!host.remove_domain(&d).unwrap());
        assert!(hd.add_partition_properties(2, 10, 1).is_err());
        assert!(host.assigned_domains().unwrap().is_empty());
    }

    #[test]
    fn test_close_silences_listeners() {
        let host = host();
        let (seen, listener) = recorder::<HostState>();
        host.set_state_change_listener(listener).unwrap();
        host.set_state(HostState::Idle).unwrap();
        host.close().unwrap();
        host.set_state(HostState::Serving).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some(HostState::Idle)]);
    }

    #[test]
    fn test_concurrent_writers_notify_in_commit_order() {
        let host = Arc::new(host());
        let (seen, listener) = recorder::<Vec<HostCommand>>();
        host.set_command_queue_change_listener(listener).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let host = host.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        host.enqueue_command(HostCommand::ServeData).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // Every enqueue grows the queue by one, so lengths arrive as 1, 2, 3...
        let lengths: Vec<usize> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.as_ref().map_or(0, Vec::len))
            .collect();
        assert_eq!(lengths, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn test_listener_may_write_to_host() {
        let host = Arc::new(host());
        let seen: Seen<HostCommand> = Arc::new(Mutex::new(Vec::new()));
        let (sink, target) = (seen.clone(), Arc::downgrade(&host));
        host.set_current_command_change_listener(Arc::new(move |v: Option<HostCommand>| {
            sink.lock().unwrap().push(v);
            // Move straight on to the next command
            if v.is_some() {
                if let Some(host) = target.upgrade() {
                    host.next_command().unwrap();
                }
            }
        }))
        .unwrap();

        host.enqueue_command(HostCommand::ExecuteUpdate).unwrap();
        host.enqueue_command(HostCommand::ServeData).unwrap();
        host.next_command().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Some(HostCommand::ExecuteUpdate),
                Some(HostCommand::ServeData),
                None
            ]
        );
        assert!(host.command_queue().unwrap().is_empty());
    }
}
