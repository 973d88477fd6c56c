//! Core actor framework types and traits.
//!
//! Provides the building blocks every component of the master runs on:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages, including delayed (timer) messages
//! - `Supervisor` for spawning and stopping actors
//! - `BackoffPolicy` for retry delays
//!
//! Mailboxes are unbounded. The master, allocator and frameworks store send
//! to each other in both directions, and a bounded mailbox on either side of
//! such a cycle can deadlock when both are full.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock;

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<bool, ActorError>;

    /// Called once before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext<M: Message> {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,

    pub messages_processed: u64,

    /// Current actor state (for introspection).
    pub state: ActorState,

    myself: ActorHandle<M>,
}

impl<M: Message> ActorContext<M> {
    fn new(myself: ActorHandle<M>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id: myself.actor_id().to_string(),
            shutdown,
            messages_processed: 0,
            state: ActorState::Starting,
            myself,
        }
    }

    /// Handle to this actor's own mailbox.
    pub fn myself(&self) -> &ActorHandle<M> {
        &self.myself
    }

    /// Deliver `msg` to this actor after `delay`.
    pub fn schedule(&self, delay: Duration, msg: M) -> TimerHandle {
        self.myself.schedule(delay, msg)
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Error that leaves the actor running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Error that stops the actor.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor has stopped and its mailbox is closed.
    #[error("actor stopped")]
    ActorStopped,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::UnboundedSender<M>,
    actor_id: Arc<str>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: Arc::clone(&self.actor_id),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Enqueue a message. Never waits.
    pub fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).map_err(|_| ActorError::ActorStopped)
    }

    /// Enqueue `msg` once `delay` has elapsed on the clock.
    ///
    /// The deadline is fixed now, not when the timer task first runs.
    pub fn schedule(&self, delay: Duration, msg: M) -> TimerHandle {
        let deadline = clock::now() + delay;
        let handle = self.clone();
        let task = tokio::spawn(async move {
            clock::sleep_until(deadline).await;
            if handle.send(msg).is_err() {
                debug!(actor_id = %handle.actor_id, "Timer fired after actor stopped");
            }
        });
        TimerHandle { task }
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// True once the receiving actor is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes once the receiving actor is gone.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Receiving side of an actor mailbox.
///
/// Normally consumed by [`Supervisor::start`]; tests may read it directly to
/// observe what an actor sends.
pub struct Mailbox<M: Message> {
    rx: mpsc::UnboundedReceiver<M>,
}

impl<M: Message> Mailbox<M> {
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }
}

/// Create a mailbox and the handle that feeds it.
pub fn mailbox<M: Message>(name: &str) -> (ActorHandle<M>, Mailbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ActorHandle {
        tx,
        actor_id: format!("{}_{}", name, generate_actor_id()).into(),
    };
    (handle, Mailbox { rx })
}

/// A pending scheduled message.
///
/// Dropping the handle leaves the timer armed; use [`cancel`](Self::cancel)
/// to disarm it.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_pending(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Type-erased actor reference for supervision.
pub struct ActorRef {
    pub actor_id: String,
    pub actor_type: String,
    task_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number, never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let base = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        let jittered = base + rand_jitter(base * self.jitter);
        Duration::from_millis(jittered.clamp(0.0, self.max.as_millis() as f64) as u64)
    }
}

/// Cheap jitter source seeded from the wall clock.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let normalized = (random as f64 / u64::MAX as f64) * 2.0 - 1.0;
    normalized * range
}

// =============================================================================
// Supervisor
// =============================================================================

/// Spawns actors and stops them together.
pub struct Supervisor {
    children: HashMap<String, ActorRef>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a supervisor. Children stop when `shutdown` flips to true.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            children: HashMap::new(),
            shutdown,
        }
    }

    /// Start `actor` on a mailbox created earlier with [`mailbox`].
    ///
    /// Splitting creation from start lets two actors hold each other's handle.
    pub fn start<A: Actor>(
        &mut self,
        actor: A,
        handle: ActorHandle<A::Message>,
        mailbox: Mailbox<A::Message>,
    ) -> ActorHandle<A::Message> {
        let actor_id = handle.actor_id().to_string();
        let actor_type = actor.name().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let global = self.shutdown.clone();
        let loop_handle = handle.clone();
        let task_handle = tokio::spawn(async move {
            run_actor_loop(actor, loop_handle, mailbox, shutdown_rx, global).await;
        });

        info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");

        self.children.insert(
            actor_id.clone(),
            ActorRef {
                actor_id,
                actor_type,
                task_handle,
                shutdown_tx,
            },
        );

        handle
    }

    /// Create a mailbox and start `actor` on it.
    pub fn spawn<A: Actor>(&mut self, actor: A) -> ActorHandle<A::Message> {
        let (handle, mailbox) = mailbox(actor.name());
        self.start(actor, handle, mailbox)
    }

    /// Stop all supervised actors, aborting those that do not finish in time.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.stop();
        }

        let deadline = clock::now() + Duration::from_secs(5);
        while clock::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            clock::sleep(Duration::from_millis(50)).await;
        }

        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.abort();
            }
        }

        self.children.clear();
    }

    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    myself: ActorHandle<A::Message>,
    mut mailbox: Mailbox<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    mut global: watch::Receiver<bool>,
) {
    let mut ctx = ActorContext::new(myself, shutdown.clone());
    let actor_id = ctx.actor_id.clone();

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        ctx.state = ActorState::Failed;
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received stop signal");
                    break;
                }
            }

            changed = global.changed() => {
                if changed.is_err() || *global.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = mailbox.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(ActorError::Permanent(reason)) => {
                        error!(actor_id = %actor_id, error = %reason, "Actor failed");
                        ctx.state = ActorState::Failed;
                        break;
                    }
                    Err(e) => {
                        warn!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    ctx.state = ActorState::Stopped;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
