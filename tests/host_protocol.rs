//! Host protocol tests: both host implementations, plus the notification
//! behaviour of the store-backed one

use hostcoord::common::{timestamp_now_millis, CoordinationConfig};
use hostcoord::coordinator::{
    hosts, Domain, Host, HostCommand, HostContext, HostState, HostStatus, MemoryHost,
    PartitionServerAddress, StaticDomainResolver, StoreHost, WatchedValueListener,
};
use hostcoord::store::{CoordinationStore, MemoryStore, Session};
use hostcoord::Error;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn context(session: Arc<Session>) -> HostContext {
    HostContext::new(
        session,
        Arc::new(StaticDomainResolver::new(
            (0..4).map(|id| Domain::new(id, format!("domain-{}", id))),
        )),
        CoordinationConfig::default(),
    )
}

fn address() -> PartitionServerAddress {
    PartitionServerAddress::new("my.super.host", 32267)
}

fn listener<T: Send + 'static>(
    tx: mpsc::UnboundedSender<Option<T>>,
) -> Arc<dyn WatchedValueListener<T>> {
    Arc::new(move |value: Option<T>| {
        let _ = tx.send(value);
    })
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<Option<T>>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("channel closed")
}

async fn assert_quiet<T: Debug>(rx: &mut mpsc::UnboundedReceiver<Option<T>>) {
    // A cancelled listener closes the channel; only a delivered value counts
    let res = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(!matches!(res, Ok(Some(_))), "unexpected notification: {:?}", res);
}

// === Contract shared by both implementations ===

fn check_fifo(host: &dyn Host) {
    let commands = [
        HostCommand::ExecuteUpdate,
        HostCommand::GoToIdle,
        HostCommand::ServeData,
        HostCommand::ServeData,
        HostCommand::GoToIdle,
    ];
    for command in commands {
        host.enqueue_command(command).unwrap();
    }
    assert_eq!(host.command_queue().unwrap(), commands.to_vec());

    for command in commands {
        assert_eq!(host.next_command().unwrap(), Some(command));
        assert_eq!(host.current_command().unwrap(), Some(command));
    }
    assert!(host.command_queue().unwrap().is_empty());
    assert_eq!(host.next_command().unwrap(), None);
    assert_eq!(host.current_command().unwrap(), None);
}

fn check_clear(host: &dyn Host) {
    host.clear_command_queue().unwrap();
    assert!(host.command_queue().unwrap().is_empty());

    host.enqueue_command(HostCommand::ServeData).unwrap();
    host.enqueue_command(HostCommand::GoToIdle).unwrap();
    host.clear_command_queue().unwrap();
    assert!(host.command_queue().unwrap().is_empty());
    assert_eq!(host.next_command().unwrap(), None);
}

fn check_up_since(host: &dyn Host) {
    assert_eq!(host.up_since().unwrap(), None);

    let before = timestamp_now_millis();
    host.set_state(HostState::Serving).unwrap();
    let up = host.up_since().unwrap().expect("online host has up-since");
    assert!(up >= before);
    assert_eq!(host.state().unwrap(), HostState::Serving);

    host.set_state(HostState::Offline).unwrap();
    assert_eq!(host.up_since().unwrap(), None);
    assert_eq!(host.state().unwrap(), HostState::Offline);
}

fn check_domains(host: &dyn Host) {
    let d = Domain::new(2, "domain-2");
    assert!(host.host_domain(&d).unwrap().is_none());

    let added = host.add_domain(&d).unwrap();
    assert_eq!(added.domain(), &d);
    assert_eq!(host.host_domain(&d).unwrap().unwrap().domain(), &d);
    assert!(matches!(host.add_domain(&d), Err(Error::Conflict(_))));

    host.add_domain(&Domain::new(0, "domain-0")).unwrap();
    let ids: Vec<u32> = host
        .assigned_domains_sorted()
        .unwrap()
        .iter()
        .map(|hd| hd.domain().id)
        .collect();
    assert_eq!(ids, vec![0, 2]);

    assert!(host.remove_domain(&d).unwrap());
    assert!(host.host_domain(&d).unwrap().is_none());
    assert!(!host.remove_domain(&d).unwrap());
}

fn check_statistics_and_flags(host: &dyn Host) {
    host.set_ephemeral_statistic("disk/used", "42").unwrap();
    host.set_ephemeral_statistic("disk/used", "43").unwrap();
    assert_eq!(host.statistic("disk/used").unwrap(), Some("43".to_string()));
    host.delete_statistic("disk/used").unwrap();
    assert_eq!(host.statistic("disk/used").unwrap(), None);

    host.set_flags(&["ssd".to_string(), "rack-1".to_string()])
        .unwrap();
    host.set_flags(&["rack-2".to_string()]).unwrap();
    assert_eq!(host.flags().unwrap(), vec!["rack-2".to_string()]);
}

fn check_all(host: &dyn Host) {
    check_fifo(host);
    check_clear(host);
    check_up_since(host);
    check_domains(host);
    check_statistics_and_flags(host);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_host_contract() {
    let store = MemoryStore::new().unwrap();
    let host = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    check_all(&host);
}

#[test]
fn test_memory_host_contract() {
    check_all(&MemoryHost::new(address()));
}

// === Store-backed notifications ===

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_scenario_notifications() {
    let store = MemoryStore::new().unwrap();
    let host = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    let (tx, mut queue) = mpsc::unbounded_channel();
    host.set_command_queue_change_listener(listener(tx)).unwrap();

    host.enqueue_command(HostCommand::GoToIdle).unwrap();
    assert_eq!(recv(&mut queue).await, Some(vec![HostCommand::GoToIdle]));
    host.enqueue_command(HostCommand::ServeData).unwrap();
    assert_eq!(
        recv(&mut queue).await,
        Some(vec![HostCommand::GoToIdle, HostCommand::ServeData])
    );
    assert_eq!(
        host.command_queue().unwrap(),
        vec![HostCommand::GoToIdle, HostCommand::ServeData]
    );

    assert_eq!(host.next_command().unwrap(), Some(HostCommand::GoToIdle));
    assert_eq!(host.current_command().unwrap(), Some(HostCommand::GoToIdle));
    assert_eq!(host.command_queue().unwrap(), vec![HostCommand::ServeData]);
    assert_eq!(recv(&mut queue).await, Some(vec![HostCommand::ServeData]));

    assert_eq!(host.next_command().unwrap(), Some(HostCommand::ServeData));
    assert!(host.command_queue().unwrap().is_empty());
    assert_eq!(recv(&mut queue).await, Some(vec![]));

    // Queue already empty: no queue notification
    assert_eq!(host.next_command().unwrap(), None);
    assert_quiet(&mut queue).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_current_command_notifications() {
    let store = MemoryStore::new().unwrap();
    let host = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    let (tx, mut current) = mpsc::unbounded_channel();
    host.set_current_command_change_listener(listener(tx)).unwrap();

    host.enqueue_command(HostCommand::ExecuteUpdate).unwrap();
    host.next_command().unwrap();
    assert_eq!(recv(&mut current).await, Some(HostCommand::ExecuteUpdate));

    host.next_command().unwrap();
    assert_eq!(recv(&mut current).await, None);

    // Already none: nothing written, nothing delivered
    host.next_command().unwrap();
    assert_quiet(&mut current).await;

    host.cancel_current_command_change_listener();
    host.enqueue_command(HostCommand::ServeData).unwrap();
    host.next_command().unwrap();
    assert_quiet(&mut current).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clear_notifies_once() {
    let store = MemoryStore::new().unwrap();
    let host = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    for command in [
        HostCommand::ServeData,
        HostCommand::GoToIdle,
        HostCommand::ServeData,
    ] {
        host.enqueue_command(command).unwrap();
    }
    let (tx, mut queue) = mpsc::unbounded_channel();
    host.set_command_queue_change_listener(listener(tx)).unwrap();

    host.clear_command_queue().unwrap();
    assert_eq!(recv(&mut queue).await, Some(vec![]));
    assert_quiet(&mut queue).await;

    host.clear_command_queue().unwrap();
    assert_quiet(&mut queue).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_listeners_see_every_transition_in_order() {
    let store = MemoryStore::new().unwrap();
    let writer = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    let first = StoreHost::load(&context(store.connect()), address()).unwrap();
    let second = StoreHost::load(&context(store.connect()), address()).unwrap();

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    first.set_state_change_listener(listener(tx1)).unwrap();
    second.set_state_change_listener(listener(tx2)).unwrap();

    let transitions = [
        HostState::Idle,
        HostState::Updating,
        HostState::Idle,
        HostState::Serving,
        HostState::Offline,
        HostState::Idle,
    ];
    for state in transitions {
        writer.set_state(state).unwrap();
        let expected = state.is_online().then_some(state);
        assert_eq!(recv(&mut rx1).await, expected);
        assert_eq!(recv(&mut rx2).await, expected);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_is_seen_as_absent() {
    let store = MemoryStore::new().unwrap();
    let coordinator = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();

    let node_session = store.connect();
    let node = StoreHost::load(&context(node_session.clone()), address()).unwrap();
    node.set_state(HostState::Serving).unwrap();
    node.set_ephemeral_statistic("qps", "1200").unwrap();
    assert_eq!(hosts::status(&coordinator), HostStatus::Online(HostState::Serving));

    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_state_change_listener(listener(tx)).unwrap();
    let (own_tx, mut own_rx) = mpsc::unbounded_channel();
    node.set_state_change_listener(listener(own_tx)).unwrap();

    store.expire_session(node_session.session_id());
    assert_eq!(recv(&mut rx).await, None);
    assert_eq!(coordinator.state().unwrap(), HostState::Offline);
    assert_eq!(coordinator.up_since().unwrap(), None);
    assert_eq!(coordinator.statistic("qps").unwrap(), None);
    assert_eq!(hosts::status(&coordinator), HostStatus::Offline);

    // The node's own handle sees the same implicit OFFLINE
    assert_eq!(recv(&mut own_rx).await, None);
    assert_eq!(node.state().unwrap(), HostState::Offline);
    assert_eq!(node.up_since().unwrap(), None);
    assert_eq!(node.statistic("qps").unwrap(), None);
    assert_eq!(hosts::status(&node), HostStatus::Offline);
    node.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_store_is_not_offline() {
    let store = MemoryStore::new().unwrap();
    let node = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    node.set_state(HostState::Serving).unwrap();

    store.set_reachable(false);
    assert!(matches!(node.state(), Err(Error::Communication(_))));
    assert_eq!(hosts::status(&node), HostStatus::Unknown);

    store.set_reachable(true);
    assert_eq!(node.state().unwrap(), HostState::Serving);
}

#[test]
fn test_memory_host_disconnect_matches_session_loss() {
    let host = MemoryHost::new(address());
    let (tx, mut rx) = mpsc::unbounded_channel();
    host.set_state(HostState::Serving).unwrap();
    host.set_ephemeral_statistic("qps", "1200").unwrap();
    host.set_state_change_listener(listener(tx)).unwrap();

    host.disconnect();
    assert_eq!(rx.try_recv().unwrap(), None);
    assert_eq!(host.state().unwrap(), HostState::Offline);
    assert_eq!(host.up_since().unwrap(), None);
    assert_eq!(host.statistic("qps").unwrap(), None);
    assert_eq!(hosts::status(&host), HostStatus::Offline);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_coordinator_enqueues_node_dequeues() {
    let store = MemoryStore::new().unwrap();
    let coordinator = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    let node = StoreHost::load(&context(store.connect()), address()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    node.set_command_queue_change_listener(listener(tx)).unwrap();

    coordinator.enqueue_command(HostCommand::ServeData).unwrap();
    assert_eq!(recv(&mut rx).await, Some(vec![HostCommand::ServeData]));

    assert_eq!(node.next_command().unwrap(), Some(HostCommand::ServeData));
    assert_eq!(
        coordinator.current_command().unwrap(),
        Some(HostCommand::ServeData)
    );
    assert!(coordinator.command_queue().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_domains_visible_across_handles() {
    let store = MemoryStore::new().unwrap();
    let coordinator = StoreHost::create(&context(store.connect()), address(), &[]).unwrap();
    let node = StoreHost::load(&context(store.connect()), address()).unwrap();
    let d = Domain::new(1, "domain-1");

    coordinator.add_domain(&d).unwrap();
    let hd = node.host_domain(&d).unwrap().expect("assignment visible");
    hd.add_partition_properties(0, 100, 10).unwrap();
    hd.add_partition_properties(1, 50, 5).unwrap();

    let seen = coordinator.host_domain(&d).unwrap().unwrap();
    assert_eq!(seen.total_num_bytes().unwrap(), 150);
    assert_eq!(seen.total_num_records().unwrap(), 15);

    coordinator.remove_domain(&d).unwrap();
    assert!(node.host_domain(&d).unwrap().is_none());
    assert!(matches!(
        hd.add_partition_properties(2, 1, 1),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_hosts_order_by_address() {
    let mut hosts: Vec<Box<dyn Host>> = vec![
        Box::new(MemoryHost::new(PartitionServerAddress::new("b", 1))),
        Box::new(MemoryHost::new(PartitionServerAddress::new("a", 9))),
        Box::new(MemoryHost::new(PartitionServerAddress::new("a", 2))),
    ];
    hosts.sort();
    let order: Vec<String> = hosts.iter().map(|h| h.address().to_string()).collect();
    assert_eq!(order, vec!["a:2", "a:9", "b:1"]);

    let same: Box<dyn Host> = Box::new(MemoryHost::new(PartitionServerAddress::new("a", 2)));
    assert!(hosts[0] == same);
}
