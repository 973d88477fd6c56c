//! Allocator actor - hierarchical DRF over roles and frameworks.
//!
//! The allocator is the only writer of the per-slave resource ledger. For
//! every slave it tracks the total, the free part, and what each framework
//! holds there (offered or in use). The master reports how offers resolve
//! (`ResourcesUnused`, `ResourcesRecovered`) and never touches the ledger.
//!
//! Allocation passes run on a fixed interval and right after any change that
//! can free or add resources. A pass walks slaves in registration order and
//! gives each whitelisted slave's whole free bundle to the active framework
//! that DRF puts first, updating shares before the next slave.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use corral_id::{FrameworkId, SlaveId};
use corral_protocol::{FrameworkInfo, ResourceRequest, SlaveInfo};
use corral_resources::Resources;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle};
use super::master::MasterMessage;
use crate::drf::DrfSorter;

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug)]
pub enum AllocatorMessage {
    AddFramework {
        framework_id: FrameworkId,
        info: FrameworkInfo,
    },
    /// Returns everything the framework still holds and forgets it.
    RemoveFramework { framework_id: FrameworkId },
    ActivateFramework { framework_id: FrameworkId },
    /// Inactive frameworks keep their allocation but receive no offers.
    DeactivateFramework { framework_id: FrameworkId },

    /// `used` is what frameworks already hold on a re-registering slave.
    AddSlave {
        slave_id: SlaveId,
        info: SlaveInfo,
        used: HashMap<FrameworkId, Resources>,
    },
    RemoveSlave { slave_id: SlaveId },

    /// `None` makes every slave eligible.
    UpdateWhitelist { hostnames: Option<HashSet<String>> },

    ResourcesRequested {
        framework_id: FrameworkId,
        requests: Vec<ResourceRequest>,
    },
    /// Offered resources the framework declined or did not use.
    ResourcesUnused {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    },
    /// Resources released by a finished task, an exited executor, or a
    /// rescinded or expired offer.
    ResourcesRecovered {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    },

    /// Periodic pass.
    Allocate,

    Snapshot {
        reply_to: oneshot::Sender<AllocatorSnapshot>,
    },
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorSnapshot {
    pub slaves: HashMap<SlaveId, SlaveLedger>,
    /// Active and inactive frameworks with their dominant share within the
    /// cluster, in DRF order.
    pub frameworks: Vec<(FrameworkId, f64)>,
    pub total: Resources,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlaveLedger {
    pub hostname: String,
    pub total: Resources,
    pub free: Resources,
    pub allocated: HashMap<FrameworkId, Resources>,
    pub whitelisted: bool,
}

impl SlaveLedger {
    /// `free + Σ allocated == total`.
    pub fn is_balanced(&self) -> bool {
        Resources::try_sum(self.allocated.values())
            .and_then(|held| held.checked_add(&self.free))
            .is_ok_and(|sum| sum == self.total)
    }
}

// =============================================================================
// Actor State
// =============================================================================

#[derive(Debug)]
struct SlaveEntry {
    info: SlaveInfo,
    free: Resources,
}

#[derive(Debug)]
struct FrameworkEntry {
    /// `None` until the framework registers; such entries only hold what a
    /// re-registering slave reported for it.
    role: Option<String>,
    active: bool,
    allocations: HashMap<SlaveId, Resources>,
}

pub struct AllocatorActor {
    master: ActorHandle<MasterMessage>,
    interval: Duration,
    slaves: HashMap<SlaveId, SlaveEntry>,
    slave_order: Vec<SlaveId>,
    frameworks: HashMap<FrameworkId, FrameworkEntry>,
    roles: DrfSorter<String>,
    role_sorters: HashMap<String, DrfSorter<FrameworkId>>,
    total: Resources,
    whitelist: Option<HashSet<String>>,
}

impl AllocatorActor {
    pub fn new(
        master: ActorHandle<MasterMessage>,
        interval: Duration,
        whitelist: Option<HashSet<String>>,
    ) -> Self {
        Self {
            master,
            interval,
            slaves: HashMap::new(),
            slave_order: Vec::new(),
            frameworks: HashMap::new(),
            roles: DrfSorter::new(),
            role_sorters: HashMap::new(),
            total: Resources::new(),
            whitelist,
        }
    }

    fn is_whitelisted(&self, hostname: &str) -> bool {
        self.whitelist
            .as_ref()
            .is_none_or(|hosts| hosts.contains(hostname))
    }

    // -------------------------------------------------------------------------
    // Ledger
    // -------------------------------------------------------------------------

    /// Move `resources` on `slave_id` from free to `framework_id`.
    fn allocate(&mut self, framework_id: FrameworkId, slave_id: SlaveId, resources: &Resources) {
        let (Some(framework), Some(slave)) = (
            self.frameworks.get_mut(&framework_id),
            self.slaves.get_mut(&slave_id),
        ) else {
            return;
        };

        if let Err(e) = slave.free.try_sub_assign(resources) {
            warn!(slave_id = %slave_id, error = %e, "Allocation exceeds free resources");
            return;
        }
        let held = framework.allocations.entry(slave_id).or_default();
        if let Err(e) = held.try_add_assign(resources) {
            warn!(framework_id = %framework_id, error = %e, "Allocation kind mismatch");
            let _ = slave.free.try_add_assign(resources);
            return;
        }

        if let Some(role) = framework.role.clone() {
            if let Some(sorter) = self.role_sorters.get_mut(&role) {
                let _ = sorter.allocated(&framework_id, resources);
            }
            let _ = self.roles.allocated(&role, resources);
        }
    }

    /// Move `resources` on `slave_id` from `framework_id` back to free.
    ///
    /// Unknown frameworks and slaves were already reclaimed by their removal.
    fn unallocate(&mut self, framework_id: FrameworkId, slave_id: SlaveId, resources: &Resources) {
        let (Some(framework), Some(slave)) = (
            self.frameworks.get_mut(&framework_id),
            self.slaves.get_mut(&slave_id),
        ) else {
            debug!(
                framework_id = %framework_id,
                slave_id = %slave_id,
                "Ignoring recovery for removed framework or slave"
            );
            return;
        };

        let Some(held) = framework.allocations.get_mut(&slave_id) else {
            warn!(framework_id = %framework_id, slave_id = %slave_id, "Recovery without allocation");
            return;
        };
        if let Err(e) = held.try_sub_assign(resources) {
            warn!(
                framework_id = %framework_id,
                slave_id = %slave_id,
                error = %e,
                "Recovered more than was allocated"
            );
            return;
        }
        if held.is_empty() {
            framework.allocations.remove(&slave_id);
        }
        if let Err(e) = slave.free.try_add_assign(resources) {
            warn!(slave_id = %slave_id, error = %e, "Failed to return resources to free pool");
        }

        match framework.role.clone() {
            Some(role) => {
                if let Some(sorter) = self.role_sorters.get_mut(&role) {
                    let _ = sorter.unallocated(&framework_id, resources);
                }
                let _ = self.roles.unallocated(&role, resources);
            }
            // Placeholder for a framework that never registered here.
            None if framework.allocations.is_empty() => {
                self.frameworks.remove(&framework_id);
                debug!(framework_id = %framework_id, "Dropped placeholder framework");
            }
            None => {}
        }
    }

    fn adjust_totals(&mut self, resources: &Resources, add: bool) {
        let apply = |sorter_total: Result<(), corral_resources::ResourceError>| {
            if let Err(e) = sorter_total {
                warn!(error = %e, "Cluster total out of sync");
            }
        };
        if add {
            apply(self.total.try_add_assign(resources));
            apply(self.roles.add_total(resources));
            for sorter in self.role_sorters.values_mut() {
                apply(sorter.add_total(resources));
            }
        } else {
            apply(self.total.try_sub_assign(resources));
            apply(self.roles.remove_total(resources));
            for sorter in self.role_sorters.values_mut() {
                apply(sorter.remove_total(resources));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Message Handlers
    // -------------------------------------------------------------------------

    fn add_framework(&mut self, framework_id: FrameworkId, info: FrameworkInfo) {
        let entry = self
            .frameworks
            .entry(framework_id)
            .or_insert_with(|| FrameworkEntry {
                role: None,
                active: false,
                allocations: HashMap::new(),
            });
        if entry.role.is_some() {
            debug!(framework_id = %framework_id, "Framework already known to allocator");
            return;
        }
        let role = info.role.clone();
        entry.role = Some(role.clone());
        entry.active = true;
        let held = Resources::try_sum(entry.allocations.values()).unwrap_or_default();

        self.roles.add(role.clone());
        let total = self.total.clone();
        let sorter = self.role_sorters.entry(role.clone()).or_insert_with(|| {
            let mut sorter = DrfSorter::new();
            let _ = sorter.add_total(&total);
            sorter
        });
        sorter.add(framework_id);
        let _ = sorter.allocated(&framework_id, &held);
        let _ = self.roles.allocated(&role, &held);

        info!(framework_id = %framework_id, role = %role, "Added framework to allocator");
    }

    fn remove_framework(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.frameworks.get(&framework_id) else {
            return;
        };
        let held: Vec<(SlaveId, Resources)> = framework
            .allocations
            .iter()
            .map(|(s, r)| (*s, r.clone()))
            .collect();
        for (slave_id, resources) in held {
            self.unallocate(framework_id, slave_id, &resources);
        }

        let Some(role) = self.frameworks.remove(&framework_id).and_then(|f| f.role) else {
            return;
        };
        if let Some(sorter) = self.role_sorters.get_mut(&role) {
            sorter.remove(&framework_id);
            if sorter.is_empty() {
                self.role_sorters.remove(&role);
                self.roles.remove(&role);
            }
        }
        info!(framework_id = %framework_id, "Removed framework from allocator");
    }

    fn set_active(&mut self, framework_id: FrameworkId, active: bool) {
        match self.frameworks.get_mut(&framework_id) {
            Some(framework) => {
                framework.active = active;
                debug!(framework_id = %framework_id, active, "Framework activation changed");
            }
            None => warn!(framework_id = %framework_id, "Activation change for unknown framework"),
        }
    }

    fn add_slave(
        &mut self,
        slave_id: SlaveId,
        info: SlaveInfo,
        used: HashMap<FrameworkId, Resources>,
    ) {
        if self.slaves.contains_key(&slave_id) {
            warn!(slave_id = %slave_id, "Slave already known to allocator");
            return;
        }
        let total = info.resources.clone();
        self.adjust_totals(&total, true);
        self.slave_order.push(slave_id);
        info!(
            slave_id = %slave_id,
            hostname = %info.hostname,
            resources = %total,
            "Added slave to allocator"
        );
        self.slaves.insert(
            slave_id,
            SlaveEntry {
                info,
                free: total,
            },
        );

        for (framework_id, resources) in used {
            self.frameworks
                .entry(framework_id)
                .or_insert_with(|| FrameworkEntry {
                    role: None,
                    active: false,
                    allocations: HashMap::new(),
                });
            self.allocate(framework_id, slave_id, &resources);
        }
    }

    fn remove_slave(&mut self, slave_id: SlaveId) {
        let holders: Vec<(FrameworkId, Resources)> = self
            .frameworks
            .iter()
            .filter_map(|(id, f)| f.allocations.get(&slave_id).map(|r| (*id, r.clone())))
            .collect();
        for (framework_id, resources) in holders {
            self.unallocate(framework_id, slave_id, &resources);
        }

        let Some(slave) = self.slaves.remove(&slave_id) else {
            return;
        };
        self.slave_order.retain(|id| *id != slave_id);
        self.adjust_totals(&slave.info.resources, false);
        info!(slave_id = %slave_id, hostname = %slave.info.hostname, "Removed slave from allocator");
    }

    /// First active framework in hierarchical DRF order.
    fn next_framework(&self) -> Option<FrameworkId> {
        self.roles.sort().into_iter().find_map(|role| {
            self.role_sorters.get(&role).and_then(|sorter| {
                sorter
                    .sort()
                    .into_iter()
                    .find(|id| self.frameworks.get(id).is_some_and(|f| f.active))
            })
        })
    }

    #[instrument(skip(self), fields(slaves = self.slaves.len(), frameworks = self.frameworks.len()))]
    fn allocate_pass(&mut self) {
        let mut offers: HashMap<FrameworkId, HashMap<SlaveId, Resources>> = HashMap::new();

        for slave_id in self.slave_order.clone() {
            let Some(slave) = self.slaves.get(&slave_id) else {
                continue;
            };
            if slave.free.is_empty() || !self.is_whitelisted(&slave.info.hostname) {
                continue;
            }
            let Some(framework_id) = self.next_framework() else {
                break;
            };

            let resources = slave.free.clone();
            self.allocate(framework_id, slave_id, &resources);
            offers
                .entry(framework_id)
                .or_default()
                .insert(slave_id, resources);
        }

        for (framework_id, offers) in offers {
            debug!(framework_id = %framework_id, slaves = offers.len(), "Offering resources");
            if self
                .master
                .send(MasterMessage::ResourcesOffered {
                    framework_id,
                    offers,
                })
                .is_err()
            {
                warn!("Master stopped; dropping offers");
            }
        }
    }

    fn snapshot(&self) -> AllocatorSnapshot {
        let slaves = self
            .slaves
            .iter()
            .map(|(slave_id, slave)| {
                let allocated = self
                    .frameworks
                    .iter()
                    .filter_map(|(id, f)| f.allocations.get(slave_id).map(|r| (*id, r.clone())))
                    .collect();
                (
                    *slave_id,
                    SlaveLedger {
                        hostname: slave.info.hostname.clone(),
                        total: slave.info.resources.clone(),
                        free: slave.free.clone(),
                        allocated,
                        whitelisted: self.is_whitelisted(&slave.info.hostname),
                    },
                )
            })
            .collect();

        let mut frameworks: Vec<(FrameworkId, f64)> = self
            .frameworks
            .iter()
            .map(|(id, f)| {
                let held = Resources::try_sum(f.allocations.values()).unwrap_or_default();
                (*id, crate::drf::dominant_share(&held, &self.total))
            })
            .collect();
        frameworks.sort_by(|a, b| a.1.total_cmp(&b.1));

        AllocatorSnapshot {
            slaves,
            frameworks,
            total: self.total.clone(),
        }
    }
}

#[async_trait]
impl Actor for AllocatorActor {
    type Message = AllocatorMessage;

    fn name(&self) -> &str {
        "allocator"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<AllocatorMessage>) -> Result<(), ActorError> {
        info!(interval_ms = self.interval.as_millis() as u64, "Allocator started");
        ctx.schedule(self.interval, AllocatorMessage::Allocate);
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: AllocatorMessage,
        ctx: &mut ActorContext<AllocatorMessage>,
    ) -> Result<bool, ActorError> {
        let reallocate = match msg {
            AllocatorMessage::AddFramework { framework_id, info } => {
                self.add_framework(framework_id, info);
                true
            }
            AllocatorMessage::RemoveFramework { framework_id } => {
                self.remove_framework(framework_id);
                true
            }
            AllocatorMessage::ActivateFramework { framework_id } => {
                self.set_active(framework_id, true);
                true
            }
            AllocatorMessage::DeactivateFramework { framework_id } => {
                self.set_active(framework_id, false);
                false
            }
            AllocatorMessage::AddSlave {
                slave_id,
                info,
                used,
            } => {
                self.add_slave(slave_id, info, used);
                true
            }
            AllocatorMessage::RemoveSlave { slave_id } => {
                self.remove_slave(slave_id);
                false
            }
            AllocatorMessage::UpdateWhitelist { hostnames } => {
                info!(
                    hosts = hostnames.as_ref().map(|h| h.len()),
                    "Updated slave whitelist"
                );
                self.whitelist = hostnames;
                true
            }
            AllocatorMessage::ResourcesRequested {
                framework_id,
                requests,
            } => {
                info!(
                    framework_id = %framework_id,
                    requests = requests.len(),
                    "Received resource request"
                );
                false
            }
            AllocatorMessage::ResourcesUnused {
                framework_id,
                slave_id,
                resources,
            }
            | AllocatorMessage::ResourcesRecovered {
                framework_id,
                slave_id,
                resources,
            } => {
                self.unallocate(framework_id, slave_id, &resources);
                true
            }
            AllocatorMessage::Allocate => {
                ctx.schedule(self.interval, AllocatorMessage::Allocate);
                true
            }
            AllocatorMessage::Snapshot { reply_to } => {
                let _ = reply_to.send(self.snapshot());
                false
            }
        };

        if reallocate {
            self.allocate_pass();
        }
        Ok(true)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed client for the allocator. Sends never wait.
#[derive(Debug, Clone)]
pub struct AllocatorHandle {
    handle: ActorHandle<AllocatorMessage>,
}

impl AllocatorHandle {
    pub fn new(handle: ActorHandle<AllocatorMessage>) -> Self {
        Self { handle }
    }

    fn send(&self, msg: AllocatorMessage) {
        if let Err(e) = self.handle.send(msg) {
            warn!(error = %e, "Allocator unavailable");
        }
    }

    pub fn add_framework(&self, framework_id: FrameworkId, info: FrameworkInfo) {
        self.send(AllocatorMessage::AddFramework { framework_id, info });
    }

    pub fn remove_framework(&self, framework_id: FrameworkId) {
        self.send(AllocatorMessage::RemoveFramework { framework_id });
    }

    pub fn activate_framework(&self, framework_id: FrameworkId) {
        self.send(AllocatorMessage::ActivateFramework { framework_id });
    }

    pub fn deactivate_framework(&self, framework_id: FrameworkId) {
        self.send(AllocatorMessage::DeactivateFramework { framework_id });
    }

    pub fn add_slave(
        &self,
        slave_id: SlaveId,
        info: SlaveInfo,
        used: HashMap<FrameworkId, Resources>,
    ) {
        self.send(AllocatorMessage::AddSlave {
            slave_id,
            info,
            used,
        });
    }

    pub fn remove_slave(&self, slave_id: SlaveId) {
        self.send(AllocatorMessage::RemoveSlave { slave_id });
    }

    pub fn update_whitelist(&self, hostnames: Option<HashSet<String>>) {
        self.send(AllocatorMessage::UpdateWhitelist { hostnames });
    }

    pub fn resources_requested(&self, framework_id: FrameworkId, requests: Vec<ResourceRequest>) {
        self.send(AllocatorMessage::ResourcesRequested {
            framework_id,
            requests,
        });
    }

    pub fn resources_unused(&self, framework_id: FrameworkId, slave_id: SlaveId, resources: Resources) {
        if resources.is_empty() {
            return;
        }
        self.send(AllocatorMessage::ResourcesUnused {
            framework_id,
            slave_id,
            resources,
        });
    }

    pub fn resources_recovered(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    ) {
        if resources.is_empty() {
            return;
        }
        self.send(AllocatorMessage::ResourcesRecovered {
            framework_id,
            slave_id,
            resources,
        });
    }

    pub fn allocate(&self) {
        self.send(AllocatorMessage::Allocate);
    }

    pub async fn snapshot(&self) -> Result<AllocatorSnapshot, ActorError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle
            .send(AllocatorMessage::Snapshot { reply_to })?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }
}

// =============================================================================
// Tests
// =============================================================================
