//! Corral master library.
//!
//! The master collects resource inventories from slaves, divides them among
//! frameworks with hierarchical Dominant Resource Fairness, hands out offers
//! and tracks tasks from launch to a terminal state, reclaiming their
//! resources exactly once.
//!
//! ## Architecture
//!
//! ```text
//! Slave ──register──▶ Master ──add_slave──▶ Allocator
//!                       ▲  ◀──ResourcesOffered──┘
//!                       │
//!          launch/decline│ offers, status updates
//!                       ▼
//!                  SchedulerDriver ──▶ Scheduler
//! ```
//!
//! ## Modules
//!
//! - `actors`: actor runtime plus the master, allocator, frameworks store,
//!   scheduler driver and local slave actors
//! - `drf`: dominant share computation and ordering
//! - `launch`: validation of launch requests against offers
//! - `state`: master bookkeeping and snapshots
//! - `storage`: durable framework metadata backends
//! - `detector`: leading master broadcast
//! - `endpoints`: traits the master uses to reach schedulers and slaves

pub mod actors;
pub mod clock;
pub mod config;
pub mod detector;
pub mod drf;
pub mod endpoints;
pub mod launch;
pub mod state;
pub mod storage;
pub mod whitelist;

pub use actors::{
    LocalSlaveHandle, MasterHandle, MasterSupervisor, Scheduler, SchedulerDriver,
};
pub use config::Config;
pub use detector::{Leader, MasterDetector};
pub use endpoints::{EndpointError, SchedulerEndpoint, SlaveEndpoint};
pub use state::MasterState;
