//! Actors of the master.
//!
//! Every component owns its state and talks to the others through unbounded
//! mailboxes. Timers are messages an actor schedules to itself.
//!
//! ## Actor Types
//!
//! - `MasterActor`: frameworks, slaves, tasks and outstanding offers
//! - `AllocatorActor`: DRF allocation and the per-slave resource ledger
//! - `FrameworksStore`: cached framework metadata with delayed removal
//! - `DriverActor`: framework side of the protocol, one per scheduler
//! - `LocalSlave`: in-process slave
//! - `MasterSupervisor`: starts and stops all of the above

mod allocator;
mod driver;
mod framework;
mod frameworks;
mod local_slave;
mod master;
mod supervisor;

pub use allocator::{
    AllocatorActor, AllocatorHandle, AllocatorMessage, AllocatorSnapshot, SlaveLedger,
};
pub use driver::{spawn_driver, DriverActor, DriverMessage, MasterEvent, Scheduler, SchedulerDriver};
pub use framework::{
    mailbox, Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, BackoffPolicy,
    Mailbox, Message, Supervisor, TimerHandle,
};
pub use frameworks::{FrameworksError, FrameworksMessage, FrameworksStore, FrameworksStoreHandle};
pub use local_slave::{
    spawn_local_slave, LocalSlave, LocalSlaveHandle, LocalSlaveMessage, SlaveCommand,
};
pub use master::{MasterActor, MasterConfig, MasterHandle, MasterMessage};
pub use supervisor::MasterSupervisor;
