//! Master supervisor - root supervisor for one master and its actors.
//!
//! ## Supervision Tree
//!
//! ```text
//! MasterSupervisor
//! ├── MasterActor          (frameworks, slaves, tasks, offers)
//! ├── AllocatorActor       (DRF over roles and frameworks)
//! ├── FrameworksStore      (cached framework metadata)
//! ├── DriverActor(name)    (in-process schedulers)
//! └── LocalSlave(hostname) (in-process slaves)
//! ```
//!
//! The master and the allocator hold each other's handle, so the master's
//! mailbox is created before the allocator is spawned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use corral_id::{FrameworkId, MasterId};
use corral_protocol::{FrameworkInfo, MasterInfo, SlaveInfo};
use tokio::sync::watch;
use tracing::info;

use super::allocator::{AllocatorActor, AllocatorHandle};
use super::driver::{spawn_driver, Scheduler, SchedulerDriver};
use super::framework::{mailbox, Supervisor};
use super::frameworks::{FrameworksStore, FrameworksStoreHandle};
use super::local_slave::{spawn_local_slave, LocalSlaveHandle};
use super::master::{MasterActor, MasterConfig, MasterHandle, MasterMessage};
use crate::config::Config;
use crate::detector::{Leader, MasterDetector};
use crate::storage::FrameworksStorage;

/// Root supervisor for a master.
pub struct MasterSupervisor {
    config: Config,
    info: MasterInfo,
    detector: MasterDetector,
    supervisor: Supervisor,
    master: Option<MasterHandle>,
    allocator: Option<AllocatorHandle>,
    store: Option<FrameworksStoreHandle>,
}

impl MasterSupervisor {
    pub fn new(config: Config, detector: MasterDetector, shutdown: watch::Receiver<bool>) -> Self {
        let info = MasterInfo {
            id: MasterId::new(),
            host: config.host.clone(),
            port: config.port,
        };
        Self {
            config,
            info,
            detector,
            supervisor: Supervisor::new(shutdown),
            master: None,
            allocator: None,
            store: None,
        }
    }

    /// Start the master, the allocator and the frameworks store.
    pub fn start(
        &mut self,
        storage: Arc<dyn FrameworksStorage>,
        whitelist: Option<HashSet<String>>,
    ) -> MasterHandle {
        info!(master = %self.info, "Starting master supervisor");

        let (master_tx, master_rx) = mailbox::<MasterMessage>("master");

        let allocator = AllocatorHandle::new(self.supervisor.spawn(AllocatorActor::new(
            master_tx.clone(),
            self.config.allocation_interval,
            whitelist,
        )));
        let store = FrameworksStoreHandle::new(self.supervisor.spawn(FrameworksStore::new(storage)));

        let master_config = MasterConfig {
            offer_timeout: self.config.offer_timeout,
            slave_ping_timeout: self.config.slave_ping_timeout,
            health_check_interval: self.config.health_check_interval(),
        };
        let actor = MasterActor::new(
            self.info.clone(),
            master_config,
            self.detector.clone(),
            allocator.clone(),
            store.clone(),
        );
        let master = MasterHandle::new(self.supervisor.start(actor, master_tx, master_rx));

        self.master = Some(master.clone());
        self.allocator = Some(allocator);
        self.store = Some(store);

        info!(
            running = self.supervisor.running_count(),
            "Master actors started"
        );
        master
    }

    /// Make this master the leader. Does nothing before [`start`](Self::start).
    pub fn elect(&self) {
        if let Some(master) = &self.master {
            self.detector.appoint(Leader {
                info: self.info.clone(),
                master: master.clone(),
            });
        }
    }

    pub fn info(&self) -> &MasterInfo {
        &self.info
    }

    pub fn detector(&self) -> &MasterDetector {
        &self.detector
    }

    pub fn master(&self) -> Option<&MasterHandle> {
        self.master.as_ref()
    }

    pub fn allocator(&self) -> Option<&AllocatorHandle> {
        self.allocator.as_ref()
    }

    pub fn store(&self) -> Option<&FrameworksStoreHandle> {
        self.store.as_ref()
    }

    pub fn spawn_driver<S: Scheduler>(
        &mut self,
        scheduler: S,
        info: FrameworkInfo,
        framework_id: Option<FrameworkId>,
    ) -> SchedulerDriver {
        spawn_driver(
            &mut self.supervisor,
            scheduler,
            info,
            framework_id,
            self.detector.clone(),
        )
    }

    /// Start an in-process slave that heartbeats every `heartbeat`.
    pub fn spawn_local_slave(&mut self, info: SlaveInfo, heartbeat: Duration) -> LocalSlaveHandle {
        spawn_local_slave(&mut self.supervisor, info, self.detector.clone(), heartbeat)
    }

    /// Stop every actor this supervisor started.
    pub async fn stop(&mut self) {
        info!(master = %self.info, "Stopping master supervisor");
        self.supervisor.stop_all().await;
        self.master = None;
        self.allocator = None;
        self.store = None;
    }
}
