//! Observable sync state shared between the sync loop and its readers.
//!
//! One writer side (`StatePublisher`, held by the loop and the tasks it
//! dispatches) and any number of `StateReader`s. Readers get snapshots and
//! change notifications but no way to mutate.

use crate::peer::{Fix, PeerSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Position shown before the first fix arrives.
pub const FALLBACK_LOCATION: Fix = Fix {
    latitude: 58.58,
    longitude: 49.62,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub current_location: Fix,
    /// Never contains the local device's own identity.
    pub peers: PeerSet,
    /// Millis of the last applied location or peer update, 0 before any.
    pub updated_ts: i64,
}

impl SyncState {
    pub fn new(fallback: Fix) -> Self {
        SyncState {
            current_location: fallback,
            peers: PeerSet::new(),
            updated_ts: 0,
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::new(FALLBACK_LOCATION)
    }
}

/// Create a state cell seeded with `fallback` as the current location.
pub fn channel(fallback: Fix) -> (StatePublisher, StateReader) {
    let (tx, rx) = watch::channel(SyncState::new(fallback));
    (StatePublisher { tx: Arc::new(tx) }, StateReader { rx })
}

#[derive(Clone)]
pub struct StatePublisher {
    tx: Arc<watch::Sender<SyncState>>,
}

impl StatePublisher {
    pub fn set_location(&self, fix: Fix) {
        self.tx.send_modify(|state| {
            state.current_location = fix;
            state.updated_ts = crate::peer::now_millis();
        });
    }

    /// Replace the peer collection wholesale. Last write wins.
    pub fn replace_peers(&self, peers: PeerSet) {
        self.tx.send_modify(|state| {
            state.peers = peers;
            state.updated_ts = crate::peer::now_millis();
        });
    }

    /// Drop peers last seen before `cutoff_ms` and return how many went.
    /// Readers are only notified when something was dropped.
    pub fn expire_peers(&self, cutoff_ms: i64) -> usize {
        let mut dropped = 0;
        self.tx.send_if_modified(|state| {
            let before = state.peers.len();
            state.peers.retain(|_, peer| peer.timestamp >= cutoff_ms);
            dropped = before - state.peers.len();
            if dropped > 0 {
                state.updated_ts = crate::peer::now_millis();
            }
            dropped > 0
        });
        dropped
    }

    pub fn snapshot(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> StateReader {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct StateReader {
    rx: watch::Receiver<SyncState>,
}

impl StateReader {
    pub fn snapshot(&self) -> SyncState {
        self.rx.borrow().clone()
    }

    /// Wait for the next update and return it. `None` once every publisher is gone.
    pub async fn changed(&mut self) -> Option<SyncState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
