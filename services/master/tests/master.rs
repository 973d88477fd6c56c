//! End-to-end master scenarios on wall-clock time.
//!
//! Frameworks go through real scheduler drivers. Slaves are either the
//! in-process `LocalSlave` or a scripted endpoint that only records what the
//! master asks of it.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use corral_id::{OfferId, SlaveId};
use corral_master::config::Config;
use corral_master::storage::MemoryStorage;
use corral_master::whitelist::run_whitelist_loop;
use corral_master::MasterState;
use corral_protocol::{ExecutorInfo, FrameworkInfo, StatusUpdate, TaskInfo, TaskState, TaskStatus};
use tokio::sync::watch;

fn executor(id: &str) -> ExecutorInfo {
    ExecutorInfo {
        executor_id: eid(id),
        command: "echo-executor".into(),
        resources: r("cpus:0.5;mem:128"),
    }
}

/// Nothing a slave holds is counted twice or lost.
async fn assert_conserved(cluster: &Cluster, state: &MasterState) {
    for slave in &state.slaves {
        let held = slave.used.checked_add(&slave.offered).unwrap();
        assert!(
            slave.total.contains(&held),
            "{} holds {held} of {}",
            slave.hostname,
            slave.total
        );
    }
    let snapshot = cluster.supervisor.allocator().unwrap().snapshot().await.unwrap();
    for (slave_id, ledger) in &snapshot.slaves {
        assert!(ledger.is_balanced(), "allocator ledger of {slave_id} unbalanced");
    }
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn test_registration_reports_leading_master() {
    let mut cluster = Cluster::start();
    let (_driver, mut events) = cluster.framework("web");

    let (framework_id, master) = expect_registered(&mut events).await;
    assert_eq!(&master, cluster.supervisor.info());

    let state = cluster
        .wait_state(|s| s.framework(framework_id).is_some())
        .await;
    assert!(state.leading);
    assert!(state.framework(framework_id).unwrap().active);
    assert_eq!(state.stats.frameworks_registered, 1);

    let store = cluster.supervisor.store().unwrap().clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.exists(framework_id).await.unwrap().then_some(()) }
    })
    .await;
}

#[tokio::test]
async fn test_new_slave_offered_in_full() {
    let mut cluster = Cluster::start();
    let (_driver, mut events) = cluster.framework("web");
    let (framework_id, _) = expect_registered(&mut events).await;

    cluster
        .supervisor
        .spawn_local_slave(slave_info("host1", "cpus:4;mem:1024"), Duration::from_millis(100));

    let offer = expect_offer(&mut events, "host1").await;
    assert_eq!(offer.framework_id, framework_id);
    assert_eq!(offer.resources, r("cpus:4;mem:1024"));

    let state = cluster.state().await;
    assert_eq!(state.offers.len(), 1);
    assert_conserved(&cluster, &state).await;
}

// =============================================================================
// Launch validation
// =============================================================================

#[tokio::test]
async fn test_launch_exceeding_offer_is_lost_and_reoffered() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("web");
    expect_registered(&mut events).await;
    let (_slave_id, _calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;

    let offer = expect_offer(&mut events, "host1").await;
    driver
        .launch_tasks(offer.id, vec![command_task(&offer, "big", "cpus:5;mem:512")])
        .unwrap();

    let status = expect_status(&mut events, &tid("big"), TaskState::Lost).await;
    assert!(status.message.unwrap().contains("more resources"));

    let again = expect_offer(&mut events, "host1").await;
    assert_ne!(again.id, offer.id);
    assert_eq!(again.resources, r("cpus:4;mem:1024"));

    let state = cluster.state().await;
    assert_eq!(state.stats.invalid_launches, 1);
    assert!(state.tasks.is_empty());
    assert_conserved(&cluster, &state).await;
}

#[tokio::test]
async fn test_launch_with_unknown_offer_is_lost() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("web");
    expect_registered(&mut events).await;
    let (slave_id, _calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;
    expect_offer(&mut events, "host1").await;

    let task = TaskInfo::command(tid("stray"), slave_id, r("cpus:1"), "true");
    driver.launch_tasks(OfferId::new(), vec![task]).unwrap();

    let status = expect_status(&mut events, &tid("stray"), TaskState::Lost).await;
    assert!(status.message.unwrap().contains("invalid offer"));
    // The outstanding offer is untouched.
    let state = cluster.state().await;
    assert_eq!(state.offers.len(), 1);
}

#[tokio::test]
async fn test_empty_launch_declines_offer() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("web");
    expect_registered(&mut events).await;
    let (_slave_id, _calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:2;mem:512")).await;

    let offer = expect_offer(&mut events, "host1").await;
    driver.launch_tasks(offer.id, Vec::new()).unwrap();

    let again = expect_offer(&mut events, "host1").await;
    assert_eq!(again.resources, offer.resources);
    let state = cluster.state().await;
    assert_eq!(state.stats.offers_declined, 1);
}

// =============================================================================
// Status updates and reclamation
// =============================================================================

#[tokio::test]
async fn test_duplicate_terminal_update_reclaims_once() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("batch");
    let (framework_id, _) = expect_registered(&mut events).await;
    let (slave_id, mut calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;

    let offer = expect_offer(&mut events, "host1").await;
    driver
        .launch_tasks(offer.id, vec![command_task(&offer, "t1", "cpus:1;mem:256")])
        .unwrap();
    expect_call(&mut calls, |c| match c {
        SlaveCall::RunTask(_, task) if task.task_id == tid("t1") => Some(()),
        _ => None,
    })
    .await;
    let state = cluster.wait_state(|s| s.tasks.len() == 1).await;
    assert_eq!(state.tasks[0].state, TaskState::Starting);

    let finished = || StatusUpdate::new(framework_id, TaskStatus::new(tid("t1"), TaskState::Finished));
    cluster.master.status_update(slave_id, finished()).unwrap();
    cluster.master.status_update(slave_id, finished()).unwrap();

    // Both copies reach the scheduler and both are acknowledged.
    expect_status(&mut events, &tid("t1"), TaskState::Finished).await;
    expect_status(&mut events, &tid("t1"), TaskState::Finished).await;
    for _ in 0..2 {
        expect_call(&mut calls, |c| match c {
            SlaveCall::Acknowledge(fw, task_id, _) if *fw == framework_id && *task_id == tid("t1") => {
                Some(())
            }
            _ => None,
        })
        .await;
    }

    let state = cluster.wait_state(|s| s.stats.status_updates == 2).await;
    assert_eq!(state.stats.reclamations, 1);
    assert_eq!(state.stats.tasks_finished, 1);
    assert!(state.tasks.is_empty());
    let slave = state.slave(slave_id).unwrap();
    assert!(slave.used.is_empty());
    assert_conserved(&cluster, &state).await;
}

#[tokio::test]
async fn test_running_then_stale_update_is_ignored() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("batch");
    let (framework_id, _) = expect_registered(&mut events).await;
    let (slave_id, _calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;

    let offer = expect_offer(&mut events, "host1").await;
    driver
        .launch_tasks(offer.id, vec![command_task(&offer, "t1", "cpus:1;mem:256")])
        .unwrap();
    cluster.wait_state(|s| s.tasks.len() == 1).await;

    let update = |state| StatusUpdate::new(framework_id, TaskStatus::new(tid("t1"), state));
    cluster.master.status_update(slave_id, update(TaskState::Running)).unwrap();
    cluster.master.status_update(slave_id, update(TaskState::Starting)).unwrap();

    let state = cluster.wait_state(|s| s.stats.status_updates == 2).await;
    assert_eq!(state.task(framework_id, &tid("t1")).unwrap().state, TaskState::Running);
}

// =============================================================================
// Allocation
// =============================================================================

#[tokio::test]
async fn test_lowest_dominant_share_gets_next_slave() {
    let mut cluster = Cluster::start();
    let (driver_a, mut a) = cluster.framework("a");
    let (a_id, _) = expect_registered(&mut a).await;
    let (_slave1, _calls1) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;

    let offer = expect_offer(&mut a, "host1").await;
    driver_a
        .launch_tasks(offer.id, vec![command_task(&offer, "all", "cpus:4;mem:1024")])
        .unwrap();
    cluster.wait_state(|s| s.tasks.len() == 1).await;

    let (_driver_b, mut b) = cluster.framework("b");
    let (b_id, _) = expect_registered(&mut b).await;
    let (_slave2, _calls2) =
        register_scripted(&cluster.master, slave_info("host2", "cpus:4;mem:1024")).await;

    let offer_b = expect_offer(&mut b, "host2").await;
    assert_eq!(offer_b.framework_id, b_id);
    assert_eq!(offer_b.resources, r("cpus:4;mem:1024"));

    let state = cluster.state().await;
    assert!(state.offers.iter().all(|o| o.framework_id != a_id));
    assert_conserved(&cluster, &state).await;
}

#[tokio::test]
async fn test_whitelist_file_changes_reach_allocator() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "# hosts\nhost1\n").unwrap();
    let initial = HashSet::from(["host1".to_string()]);

    let mut cluster = Cluster::with(
        test_config(),
        Arc::new(MemoryStorage::new()),
        Some(initial.clone()),
    );
    let (stop, stop_rx) = watch::channel(false);
    let refresher = tokio::spawn(run_whitelist_loop(
        file.path().to_path_buf(),
        Duration::from_millis(100),
        cluster.supervisor.allocator().unwrap().clone(),
        initial,
        stop_rx,
    ));

    let (_driver, mut events) = cluster.framework("web");
    expect_registered(&mut events).await;
    let (_slave1, _c1) = register_scripted(&cluster.master, slave_info("host1", "cpus:1")).await;
    let (_slave2, _c2) = register_scripted(&cluster.master, slave_info("host2", "cpus:1")).await;

    expect_offer(&mut events, "host1").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = cluster.state().await;
    assert!(state.offers.iter().all(|o| o.hostname != "host2"));

    std::fs::write(file.path(), "host1\nhost2\n").unwrap();
    let offer = expect_offer(&mut events, "host2").await;
    assert_eq!(offer.resources, r("cpus:1"));

    stop.send(true).unwrap();
    refresher.await.unwrap();
}

#[tokio::test]
async fn test_cleared_whitelist_admits_every_host() {
    let mut cluster = Cluster::with(
        test_config(),
        Arc::new(MemoryStorage::new()),
        Some(HashSet::new()),
    );
    let (_driver, mut events) = cluster.framework("web");
    expect_registered(&mut events).await;
    register_scripted(&cluster.master, slave_info("host1", "cpus:1")).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.state().await.offers.is_empty());

    cluster.supervisor.allocator().unwrap().update_whitelist(None);
    expect_offer(&mut events, "host1").await;
}

// =============================================================================
// Executors and kills
// =============================================================================

#[tokio::test]
async fn test_framework_message_round_trip_through_executor() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("echo");
    expect_registered(&mut events).await;
    cluster
        .supervisor
        .spawn_local_slave(slave_info("host1", "cpus:4;mem:1024"), Duration::from_millis(100));

    let offer = expect_offer(&mut events, "host1").await;
    let task = TaskInfo::with_executor(tid("t1"), offer.slave_id, r("cpus:1;mem:256"), executor("echo"));
    driver.launch_tasks(offer.id, vec![task]).unwrap();
    expect_status(&mut events, &tid("t1"), TaskState::Running).await;

    driver
        .send_framework_message(offer.slave_id, eid("echo"), Bytes::from_static(b"ping"))
        .unwrap();
    let (slave_id, executor_id, data) = expect_event(&mut events, |e| match e {
        Event::Message {
            slave_id,
            executor_id,
            data,
        } => Some((*slave_id, executor_id.clone(), data.clone())),
        _ => None,
    })
    .await;
    assert_eq!(slave_id, offer.slave_id);
    assert_eq!(executor_id, eid("echo"));
    assert_eq!(data, Bytes::from_static(b"ping"));

    let state = cluster.state().await;
    assert_eq!(state.stats.framework_messages, 2);
}

#[tokio::test]
async fn test_kill_reoffers_task_then_executor_resources() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("svc");
    let (framework_id, _) = expect_registered(&mut events).await;
    let slave = cluster
        .supervisor
        .spawn_local_slave(slave_info("host1", "cpus:4;mem:1024"), Duration::from_millis(100));

    let offer = expect_offer(&mut events, "host1").await;
    let slave_id = offer.slave_id;
    let task = TaskInfo::with_executor(tid("t1"), slave_id, r("cpus:1;mem:256"), executor("svc"));
    driver.launch_tasks(offer.id, vec![task]).unwrap();
    expect_status(&mut events, &tid("t1"), TaskState::Running).await;

    driver.kill_task(tid("t1")).unwrap();
    expect_status(&mut events, &tid("t1"), TaskState::Killed).await;

    // The executor keeps its share until it exits.
    let state = cluster
        .wait_state(|s| {
            s.slave(slave_id).is_some_and(|sl| {
                sl.used.quantity("cpus") == 0.5 && sl.offered.quantity("cpus") == 3.5
            })
        })
        .await;
    assert_eq!(state.slave(slave_id).unwrap().offered.quantity("mem"), 896.0);
    assert_conserved(&cluster, &state).await;

    slave.exit_executor(framework_id, eid("svc"), 0).unwrap();
    let state = cluster
        .wait_state(|s| {
            s.slave(slave_id)
                .is_some_and(|sl| sl.used.is_empty() && sl.offered == sl.total)
        })
        .await;
    assert_eq!(state.stats.tasks_killed, 1);
    assert_conserved(&cluster, &state).await;
}

#[tokio::test]
async fn test_executor_exit_loses_its_tasks() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("svc");
    let (framework_id, _) = expect_registered(&mut events).await;
    let slave = cluster
        .supervisor
        .spawn_local_slave(slave_info("host1", "cpus:4;mem:1024"), Duration::from_millis(100));

    let offer = expect_offer(&mut events, "host1").await;
    let task = TaskInfo::with_executor(tid("t1"), offer.slave_id, r("cpus:1;mem:256"), executor("svc"));
    driver.launch_tasks(offer.id, vec![task]).unwrap();
    expect_status(&mut events, &tid("t1"), TaskState::Running).await;

    slave.exit_executor(framework_id, eid("svc"), 137).unwrap();
    let status = expect_status(&mut events, &tid("t1"), TaskState::Lost).await;
    assert!(status.message.unwrap().contains("exited"));

    let state = cluster.wait_state(|s| s.tasks.is_empty()).await;
    assert_eq!(state.stats.tasks_lost, 1);
    assert_eq!(state.stats.reclamations, 1);
    assert!(slave.tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_unknown_task_reports_lost() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("svc");
    expect_registered(&mut events).await;

    driver.kill_task(tid("ghost")).unwrap();
    let status = expect_status(&mut events, &tid("ghost"), TaskState::Lost).await;
    assert!(status.message.unwrap().contains("unknown task"));
}

// =============================================================================
// Leadership
// =============================================================================

#[tokio::test]
async fn test_framework_follows_new_leader() {
    let mut cluster = Cluster::start();
    let (_driver, mut events) = cluster.framework("web");
    let (framework_id, first) = expect_registered(&mut events).await;

    let (mut standby, standby_master) = cluster.standby();
    standby.elect();

    let master = expect_event(&mut events, |e| match e {
        Event::Reregistered(master) => Some(master.clone()),
        _ => None,
    })
    .await;
    assert_eq!(&master, standby.info());
    assert_ne!(master, first);

    let state = wait_until(|| {
        let standby_master = standby_master.clone();
        async move {
            let state = standby_master.state().await.unwrap();
            state.framework(framework_id).is_some().then_some(state)
        }
    })
    .await;
    assert!(state.leading);
    assert!(!cluster.state().await.leading);

    standby.stop().await;
}

#[tokio::test]
async fn test_losing_leader_disconnects_then_reregisters() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("web");
    let (framework_id, _) = expect_registered(&mut events).await;

    cluster.detector.withdraw();
    expect_event(&mut events, |e| matches!(e, Event::Disconnected).then_some(())).await;

    // Launches while disconnected are lost locally.
    let task = TaskInfo::command(tid("t1"), SlaveId::new(), r("cpus:1"), "true");
    driver.launch_tasks(OfferId::new(), vec![task]).unwrap();
    let status = expect_status(&mut events, &tid("t1"), TaskState::Lost).await;
    assert!(status.slave_id.is_none());

    cluster.supervisor.elect();
    expect_event(&mut events, |e| matches!(e, Event::Reregistered(_)).then_some(())).await;
    let state = cluster.state().await;
    assert!(state.framework(framework_id).unwrap().active);
    assert_eq!(state.frameworks.len(), 1);
}

// =============================================================================
// Failover and unregistration
// =============================================================================

#[tokio::test]
async fn test_failover_within_timeout_keeps_framework_id() {
    let mut cluster = Cluster::start();
    let info = FrameworkInfo::new("svc", "ops").with_failover_timeout(Duration::from_secs(30));
    let (driver, mut events) = cluster.framework_with(info.clone(), None);
    let (framework_id, _) = expect_registered(&mut events).await;

    driver.stop(true).unwrap();
    tokio::time::timeout(WAIT, driver.stopped()).await.unwrap();
    cluster
        .wait_state(|s| s.framework(framework_id).is_some_and(|f| !f.active))
        .await;

    let (_failover, mut failover_events) = cluster.framework_with(info, Some(framework_id));
    let (id, _) = expect_registered(&mut failover_events).await;
    assert_eq!(id, framework_id);

    let state = cluster
        .wait_state(|s| s.framework(framework_id).is_some_and(|f| f.active))
        .await;
    assert_eq!(state.frameworks.len(), 1);

    let store = cluster.supervisor.store().unwrap();
    assert!(store.exists(framework_id).await.unwrap());
    assert_eq!(store.list().await.unwrap()[&framework_id].name, "svc");
}

#[tokio::test]
async fn test_takeover_while_connected_tells_old_scheduler() {
    let mut cluster = Cluster::start();
    let info = FrameworkInfo::new("svc", "ops").with_failover_timeout(Duration::from_secs(30));
    let (old, mut old_events) = cluster.framework_with(info.clone(), None);
    let (framework_id, _) = expect_registered(&mut old_events).await;

    let (_new, mut new_events) = cluster.framework_with(info, Some(framework_id));
    let (id, _) = expect_registered(&mut new_events).await;
    assert_eq!(id, framework_id);

    let message = expect_event(&mut old_events, |e| match e {
        Event::Error(message) => Some(message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(message, "Framework failed over");
    tokio::time::timeout(WAIT, old.stopped()).await.unwrap();

    // New slaves are offered to the scheduler that took over.
    let (_slave_id, _calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:2;mem:512")).await;
    let offer = expect_offer(&mut new_events, "host1").await;
    assert_eq!(offer.framework_id, framework_id);

    let state = cluster.state().await;
    assert_eq!(state.frameworks.len(), 1);
    assert!(state.framework(framework_id).is_some_and(|f| f.active));
}

#[tokio::test]
async fn test_failover_timeout_removes_framework_and_tasks() {
    let mut cluster = Cluster::start();
    let info = FrameworkInfo::new("svc", "ops").with_failover_timeout(Duration::from_millis(200));
    let (driver, mut events) = cluster.framework_with(info, None);
    let (framework_id, _) = expect_registered(&mut events).await;
    let (_slave_id, mut calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;

    let offer = expect_offer(&mut events, "host1").await;
    driver
        .launch_tasks(offer.id, vec![command_task(&offer, "t1", "cpus:1;mem:256")])
        .unwrap();
    cluster.wait_state(|s| s.tasks.len() == 1).await;

    driver.stop(true).unwrap();
    expect_call(&mut calls, |c| match c {
        SlaveCall::ShutdownFramework(id) if *id == framework_id => Some(()),
        _ => None,
    })
    .await;

    let state = cluster
        .wait_state(|s| s.framework(framework_id).is_none())
        .await;
    assert!(state.tasks.is_empty());
    assert!(state.offers.is_empty());
    assert!(!cluster.supervisor.store().unwrap().exists(framework_id).await.unwrap());
    assert_conserved(&cluster, &state).await;
}

#[tokio::test]
async fn test_failover_timeout_without_store_uses_local_timer() {
    let storage = Arc::new(FailingListStorage::default());
    let mut cluster = Cluster::with(test_config(), storage.clone(), None);
    let info = FrameworkInfo::new("svc", "ops").with_failover_timeout(Duration::from_millis(200));
    let (driver, mut events) = cluster.framework_with(info, None);
    let (framework_id, _) = expect_registered(&mut events).await;

    driver.stop(true).unwrap();
    cluster
        .wait_state(|s| s.framework(framework_id).is_none())
        .await;
    assert!(storage.list_calls() >= 1);
}

#[tokio::test]
async fn test_failed_delete_still_removes_framework_on_time() {
    let storage = Arc::new(NoDeleteStorage::default());
    let mut cluster = Cluster::with(test_config(), storage.clone(), None);
    let timeout = Duration::from_millis(1000);
    let info = FrameworkInfo::new("svc", "ops").with_failover_timeout(timeout);
    let (driver, mut events) = cluster.framework_with(info, None);
    let (framework_id, _) = expect_registered(&mut events).await;

    let started = std::time::Instant::now();
    driver.stop(true).unwrap();
    cluster
        .wait_state(|s| s.framework(framework_id).is_none())
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "removed early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "removed late after {elapsed:?}");
    assert!(storage.removes() >= 1);
}

#[tokio::test]
async fn test_unregister_kills_framework_everywhere() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("batch");
    let (framework_id, _) = expect_registered(&mut events).await;
    let (_slave_id, mut calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;

    let offer = expect_offer(&mut events, "host1").await;
    driver
        .launch_tasks(offer.id, vec![command_task(&offer, "t1", "cpus:2;mem:256")])
        .unwrap();
    cluster.wait_state(|s| s.tasks.len() == 1).await;

    driver.stop(false).unwrap();
    expect_call(&mut calls, |c| match c {
        SlaveCall::ShutdownFramework(id) if *id == framework_id => Some(()),
        _ => None,
    })
    .await;

    let state = cluster.wait_state(|s| s.frameworks.is_empty()).await;
    assert!(state.tasks.is_empty());
    let snapshot = cluster.supervisor.allocator().unwrap().snapshot().await.unwrap();
    assert!(snapshot
        .slaves
        .values()
        .all(|ledger| ledger.allocated.get(&framework_id).is_none()));
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn test_unanswered_offer_is_rescinded_and_reoffered() {
    let config = Config {
        offer_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    };
    let mut cluster = Cluster::with(config, Arc::new(MemoryStorage::new()), None);
    let (_driver, mut events) = cluster.framework("idle");
    expect_registered(&mut events).await;
    register_scripted(&cluster.master, slave_info("host1", "cpus:2;mem:512")).await;

    let offer = expect_offer(&mut events, "host1").await;
    let rescinded = expect_event(&mut events, |e| match e {
        Event::Rescinded(id) => Some(*id),
        _ => None,
    })
    .await;
    assert_eq!(rescinded, offer.id);

    let again = expect_offer(&mut events, "host1").await;
    assert_ne!(again.id, offer.id);
    assert!(cluster.state().await.stats.offers_timed_out >= 1);
}

#[tokio::test]
async fn test_silent_slave_removed_by_health_check() {
    let config = Config {
        slave_ping_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let mut cluster = Cluster::with(config, Arc::new(MemoryStorage::new()), None);
    let (_driver, mut events) = cluster.framework("web");
    expect_registered(&mut events).await;

    let (silent, mut calls) = register_scripted(&cluster.master, slave_info("quiet", "cpus:1")).await;
    let healthy = cluster
        .supervisor
        .spawn_local_slave(slave_info("busy", "cpus:1"), Duration::from_millis(50));

    let lost = expect_event(&mut events, |e| match e {
        Event::SlaveLost(id) => Some(*id),
        _ => None,
    })
    .await;
    assert_eq!(lost, silent);
    expect_call(&mut calls, |c| matches!(c, SlaveCall::Shutdown(_)).then_some(())).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let healthy_id = healthy.slave_id().await.unwrap().unwrap();
    let state = cluster.state().await;
    assert!(state.slave(silent).is_none());
    assert!(state.slave(healthy_id).is_some());
    assert_eq!(state.stats.slaves_lost, 1);
}

#[tokio::test]
async fn test_unregistered_slave_loses_tasks() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("batch");
    expect_registered(&mut events).await;
    let (slave_id, _calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;

    let offer = expect_offer(&mut events, "host1").await;
    driver
        .launch_tasks(offer.id, vec![command_task(&offer, "t1", "cpus:1;mem:256")])
        .unwrap();
    cluster.wait_state(|s| s.tasks.len() == 1).await;

    cluster.master.unregister_slave(slave_id).unwrap();
    let status = expect_status(&mut events, &tid("t1"), TaskState::Lost).await;
    assert!(status.message.unwrap().contains("host1"));
    expect_event(&mut events, |e| matches!(e, Event::SlaveLost(id) if *id == slave_id).then_some(())).await;

    let state = cluster.wait_state(|s| s.slaves.is_empty()).await;
    assert!(state.tasks.is_empty());
    assert!(state.offers.is_empty());
    assert_eq!(state.stats.tasks_lost, 1);
}

#[tokio::test]
async fn test_unreachable_slave_loses_launched_tasks() {
    let mut cluster = Cluster::start();
    let (driver, mut events) = cluster.framework("batch");
    expect_registered(&mut events).await;
    let (slave_id, calls) =
        register_scripted(&cluster.master, slave_info("host1", "cpus:4;mem:1024")).await;
    drop(calls);

    let offer = expect_offer(&mut events, "host1").await;
    driver
        .launch_tasks(offer.id, vec![command_task(&offer, "t1", "cpus:1;mem:256")])
        .unwrap();

    expect_status(&mut events, &tid("t1"), TaskState::Lost).await;
    let state = cluster.wait_state(|s| s.slave(slave_id).is_none()).await;
    assert!(state.tasks.is_empty());
    assert_eq!(state.stats.tasks_launched, 0);
}
