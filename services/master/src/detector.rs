//! Leader detection.
//!
//! Exactly one master leads at a time, or none. Schedulers and slaves
//! subscribe and are told about every change, including the loss of a
//! leader. Election itself is external: whoever owns the detector appoints.

use std::sync::Arc;

use corral_protocol::MasterInfo;
use tokio::sync::watch;
use tracing::info;

use crate::actors::MasterHandle;

/// The current leading master and how to reach it.
#[derive(Debug, Clone)]
pub struct Leader {
    pub info: MasterInfo,
    pub master: MasterHandle,
}

#[derive(Debug, Clone)]
pub struct MasterDetector {
    tx: Arc<watch::Sender<Option<Leader>>>,
}

impl Default for MasterDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterDetector {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Make `leader` the leading master, replacing any previous one.
    pub fn appoint(&self, leader: Leader) {
        info!(master = %leader.info, "New leading master");
        self.tx.send_replace(Some(leader));
    }

    /// No master leads until the next appointment.
    pub fn withdraw(&self) {
        if self.tx.send_replace(None).is_some() {
            info!("Leading master lost");
        }
    }

    /// Watch leadership changes. The current value is marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<Option<Leader>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Leader> {
        self.tx.borrow().clone()
    }

    pub fn leader_info(&self) -> Option<MasterInfo> {
        self.tx.borrow().as_ref().map(|leader| leader.info.clone())
    }
}
