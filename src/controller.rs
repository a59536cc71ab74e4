use anyhow::{anyhow, Result};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::indicator::ensure_shown;
use crate::peer::{now_millis, Fix};
use crate::prefs::Preferences;
use crate::service::CancelToken;
use crate::state::StatePublisher;
use crate::store::PeerLocationStore;
use crate::traits::{Accuracy, LocationProvider, RunningIndicator};

// Constants
pub const SYNC_INTERVAL: Duration = Duration::from_secs(15);
pub const FIX_TIMEOUT: Duration = Duration::from_secs(10);
pub const PEER_EXPIRY: Duration = Duration::from_secs(3600);

/// How a sync loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Stopped on request. Cancellation always lands here.
    Success,
    /// Could not start, or an iteration failed in a way the loop cannot recover from.
    Failure(String),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub interval: Duration,
    pub fix_timeout: Duration,
    pub accuracy: Accuracy,
    /// Known peers older than this are dropped when a fetch comes back
    /// empty. `None` keeps them indefinitely.
    pub peer_expiry: Option<Duration>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        LoopSettings {
            interval: SYNC_INTERVAL,
            fix_timeout: FIX_TIMEOUT,
            accuracy: Accuracy::Balanced,
            peer_expiry: Some(PEER_EXPIRY),
        }
    }
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        LoopSettings {
            interval: config.interval(),
            fix_timeout: config.fix_timeout(),
            accuracy: config.accuracy,
            peer_expiry: config.peer_expiry(),
        }
    }
}

/// Store calls started by one iteration.
pub struct Dispatched {
    pub save: Option<JoinHandle<()>>,
    pub fetch: JoinHandle<()>,
}

/// Periodic location sync: sample the position, publish it, push it to the
/// store and pull the peers back, then sleep.
pub struct LocationSync<L, I>
where
    L: LocationProvider + 'static,
    I: RunningIndicator + 'static,
{
    provider: Arc<L>,
    store: Arc<dyn PeerLocationStore>,
    indicator: Arc<I>,
    prefs: Arc<Preferences>,
    state: StatePublisher,
    settings: LoopSettings,

    // Group of the previous fetch; peers are dropped when it changes.
    last_group: Option<String>,
    // Store calls dispatched by earlier iterations.
    saves: Vec<JoinHandle<()>>,
    fetches: Vec<JoinHandle<()>>,
    iterations: u64,
}

impl<L, I> LocationSync<L, I>
where
    L: LocationProvider + 'static,
    I: RunningIndicator + 'static,
{
    pub fn new(
        provider: Arc<L>,
        store: Arc<dyn PeerLocationStore>,
        indicator: Arc<I>,
        prefs: Arc<Preferences>,
        state: StatePublisher,
        settings: LoopSettings,
    ) -> Self {
        LocationSync {
            provider,
            store,
            indicator,
            prefs,
            state,
            settings,
            last_group: None,
            saves: Vec::new(),
            fetches: Vec::new(),
            iterations: 0,
        }
    }

    /// Run until cancelled. Never panics or returns an error: the result is
    /// reported as an outcome and the indicator is always cleared on exit.
    pub async fn run(mut self, mut cancel: CancelToken) -> SyncOutcome {
        let outcome = match AssertUnwindSafe(self.drive(&mut cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = format!("sync iteration panicked: {}", panic_message(panic.as_ref()));
                error!("[Sync] {}", reason);
                SyncOutcome::Failure(reason)
            }
        };

        self.settle_in_flight().await;
        self.indicator.clear();
        match &outcome {
            SyncOutcome::Success => info!("[Sync] Stopped after {} iteration(s).", self.iterations),
            SyncOutcome::Failure(reason) => warn!("[Sync] Failed: {}", reason),
        }
        outcome
    }

    async fn drive(&mut self, cancel: &mut CancelToken) -> SyncOutcome {
        if !self.provider.has_permission() {
            error!("[Sync] No location permission, not starting.");
            return SyncOutcome::Failure("location permission denied".to_string());
        }

        info!(
            "[Sync] Started (interval {:?}, accuracy {:?})",
            self.settings.interval, self.settings.accuracy
        );
        self.refresh_indicator();

        loop {
            if cancel.is_cancelled() {
                return SyncOutcome::Success;
            }

            match self.run_iteration().await {
                Ok(dispatched) => {
                    self.saves.extend(dispatched.save);
                    self.fetches.push(dispatched.fetch);
                }
                Err(e) => {
                    error!("[Sync] Stopping after failed iteration: {:#}", e);
                    return SyncOutcome::Failure(format!("{:#}", e));
                }
            }

            if cancel.is_cancelled() {
                return SyncOutcome::Success;
            }

            tokio::select! {
                _ = cancel.cancelled() => return SyncOutcome::Success,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
    }

    /// One pass of the loop. Per-step failures are logged and swallowed; an
    /// Err here means the loop itself cannot continue.
    ///
    /// Returns the store calls dispatched by this pass. They run on their own
    /// and may finish after later iterations have started.
    pub async fn run_iteration(&mut self) -> Result<Dispatched> {
        self.reap_finished().await;

        if !self.provider.has_permission() {
            return Err(anyhow!("location permission revoked"));
        }
        self.iterations += 1;

        let save = match self.request_fix().await {
            Ok(Some(fix)) => {
                // Visible before any network I/O starts.
                self.state.set_location(fix);
                Some(self.dispatch_save(fix))
            }
            Ok(None) => {
                debug!("[Sync] No fix this iteration.");
                None
            }
            Err(e) => {
                warn!("[Sync] Error on current location update: {:#}", e);
                None
            }
        };

        let fetch = self.dispatch_fetch();
        self.refresh_indicator();

        Ok(Dispatched { save, fetch })
    }

    async fn request_fix(&self) -> Result<Option<Fix>> {
        let request = self.provider.request_current_fix(self.settings.accuracy);
        match tokio::time::timeout(self.settings.fix_timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                debug!("[Sync] Fix request timed out after {:?}", self.settings.fix_timeout);
                Ok(None)
            }
        }
    }

    fn dispatch_save(&self, fix: Fix) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            store.save_location(fix.latitude, fix.longitude).await;
        })
    }

    fn dispatch_fetch(&mut self) -> JoinHandle<()> {
        let group = self.prefs.group();
        if self.last_group.as_deref().is_some_and(|last| last != group) {
            info!("[Sync] Group changed to '{}', dropping previous peers.", group);
            self.state.replace_peers(Default::default());
        }
        self.last_group = Some(group.clone());

        let own_ids = self.prefs.own_ids();
        let expiry = self.settings.peer_expiry;
        let store = self.store.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut peers = store.fetch_peers(&group).await;
            peers.retain(|id, peer| !own_ids.contains(id) && !own_ids.contains(&peer.id));
            if peers.is_empty() {
                // Empty also means the fetch failed; keep what we have until it goes stale.
                debug!("[Sync] No peers returned for group '{}'", group);
                if let Some(expiry) = expiry {
                    let age = i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX);
                    let dropped = state.expire_peers(now_millis().saturating_sub(age));
                    if dropped > 0 {
                        info!("[Sync] Dropped {} peer(s) not seen for {:?}", dropped, expiry);
                    }
                }
                return;
            }
            debug!("[Sync] {} peer(s) in group '{}'", peers.len(), group);
            state.replace_peers(peers);
        })
    }

    fn refresh_indicator(&self) {
        if let Err(e) = ensure_shown(self.indicator.as_ref()) {
            warn!("[Sync] Error on running indicator refresh: {:#}", e);
        }
    }

    /// Collect store calls that already finished so their panics get logged.
    async fn reap_finished(&mut self) {
        for handles in [&mut self.saves, &mut self.fetches] {
            let (finished, pending): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(|handle| handle.is_finished());
            *handles = pending;
            for handle in finished {
                if let Err(e) = handle.await {
                    warn!("[Sync] Store call failed: {}", e);
                }
            }
        }
    }

    /// A stopped loop must not publish peers any more: pending fetches are
    /// aborted and awaited. Saves only touch the store and finish on their own.
    async fn settle_in_flight(&mut self) {
        for fetch in std::mem::take(&mut self.fetches) {
            fetch.abort();
            if let Err(e) = fetch.await {
                if e.is_panic() {
                    warn!("[Sync] Store call failed: {}", e);
                }
            }
        }
        let pending = self.saves.drain(..).filter(|save| !save.is_finished()).count();
        if pending > 0 {
            debug!("[Sync] {} save(s) still in flight at exit", pending);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
