//! Lifecycle around the sync loop: at most one loop per service, explicit
//! cancellation, and the outcome handed back to whoever stops it.

use log::{info, warn};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::controller::{LocationSync, LoopSettings, SyncOutcome};
use crate::peer::Fix;
use crate::prefs::Preferences;
use crate::state::{self, StatePublisher, StateReader};
use crate::store::PeerLocationStore;
use crate::traits::{LocationProvider, RunningIndicator};

/// Owner side of a cancellation signal.
#[derive(Clone)]
pub struct CancelSource {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelSource { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side handed to the loop. Dropping every `CancelSource` counts as
/// cancellation.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Stops whichever loop the service is currently running. Safe to call from
/// signal handlers and other synchronous contexts.
#[derive(Clone)]
pub struct StopHandle {
    current: Arc<StdMutex<Option<CancelSource>>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(source) = current.as_ref() {
                source.cancel();
            }
        }
    }
}

struct ActiveLoop {
    handle: JoinHandle<SyncOutcome>,
}

pub struct SyncService<L, I>
where
    L: LocationProvider + 'static,
    I: RunningIndicator + 'static,
{
    provider: Arc<L>,
    store: Arc<dyn PeerLocationStore>,
    indicator: Arc<I>,
    prefs: Arc<Preferences>,
    publisher: StatePublisher,
    settings: LoopSettings,

    active: Mutex<Option<ActiveLoop>>,
    stop: StopHandle,
}

impl<L, I> SyncService<L, I>
where
    L: LocationProvider + 'static,
    I: RunningIndicator + 'static,
{
    pub fn new(
        provider: Arc<L>,
        store: Arc<dyn PeerLocationStore>,
        indicator: Arc<I>,
        prefs: Arc<Preferences>,
        fallback: Fix,
        settings: LoopSettings,
    ) -> Self {
        let (publisher, _reader) = state::channel(fallback);
        SyncService {
            provider,
            store,
            indicator,
            prefs,
            publisher,
            settings,
            active: Mutex::new(None),
            stop: StopHandle {
                current: Arc::new(StdMutex::new(None)),
            },
        }
    }

    pub fn from_config(
        config: &Config,
        provider: Arc<L>,
        store: Arc<dyn PeerLocationStore>,
        indicator: Arc<I>,
        prefs: Arc<Preferences>,
    ) -> Self {
        Self::new(
            provider,
            store,
            indicator,
            prefs,
            config.fallback_location,
            LoopSettings::from(config),
        )
    }

    /// Read-only view of the state the loop publishes.
    pub fn state(&self) -> StateReader {
        self.publisher.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Start the loop, replacing a running one. The previous loop is
    /// cancelled and awaited first, so two loops never overlap.
    pub async fn start(&self) {
        let mut active = self.lock_cancelled().await;
        if let Some(previous) = active.take() {
            info!("[Service] Replacing running sync loop");
            let outcome = join_outcome(previous.handle).await;
            info!("[Service] Previous loop ended: {:?}", outcome);
        }

        let source = CancelSource::new();
        let token = source.token();
        if let Ok(mut current) = self.stop.current.lock() {
            *current = Some(source);
        }

        let sync = LocationSync::new(
            self.provider.clone(),
            self.store.clone(),
            self.indicator.clone(),
            self.prefs.clone(),
            self.publisher.clone(),
            self.settings,
        );
        let handle = tokio::spawn(sync.run(token));
        *active = Some(ActiveLoop { handle });
    }

    /// Cancel the running loop and return how it ended. `None` when idle.
    pub async fn stop(&self) -> Option<SyncOutcome> {
        let previous = self.lock_cancelled().await.take()?;
        let outcome = join_outcome(previous.handle).await;
        info!("[Service] Sync loop stopped: {:?}", outcome);
        Some(outcome)
    }

    /// Wait for the running loop to end on its own or through the stop handle.
    pub async fn wait(&self) -> Option<SyncOutcome> {
        let mut active = self.active.lock().await;
        let previous = active.take()?;
        Some(join_outcome(previous.handle).await)
    }

    /// Lock the active slot with whatever loop it holds cancelled. The first
    /// cancel releases a `wait()` sitting on the lock; the second reaches a
    /// loop that a concurrent `start()` installed while we queued for it.
    async fn lock_cancelled(&self) -> MutexGuard<'_, Option<ActiveLoop>> {
        self.stop.stop();
        let active = self.active.lock().await;
        self.stop.stop();
        active
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }
}

async fn join_outcome(handle: JoinHandle<SyncOutcome>) -> SyncOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("[Service] Sync loop task ended abnormally: {}", e);
            SyncOutcome::Failure(e.to_string())
        }
    }
}
