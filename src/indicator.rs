use anyhow::Result;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::traits::RunningIndicator;

type StopAction = Box<dyn Fn() + Send + Sync>;

/// Show the indicator unless it is already visible.
pub fn ensure_shown<I: RunningIndicator + ?Sized>(indicator: &I) -> Result<()> {
    if !indicator.is_shown() {
        indicator.show()?;
    }
    Ok(())
}

/// Running indicator for headless hosts: a log line while sharing is active,
/// with Ctrl+C (or any caller of `press_stop`) as the stop control.
pub struct TerminalIndicator {
    shown: AtomicBool,
    show_count: AtomicUsize,
    stop_action: Mutex<Option<StopAction>>,
}

impl TerminalIndicator {
    pub fn new() -> Self {
        TerminalIndicator {
            shown: AtomicBool::new(false),
            show_count: AtomicUsize::new(0),
            stop_action: Mutex::new(None),
        }
    }

    pub fn set_stop_action<F>(&self, action: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.stop_action.lock() {
            *slot = Some(Box::new(action));
        }
    }

    /// The indicator's stop control.
    pub fn press_stop(&self) {
        info!("[Indicator] Stop requested.");
        if let Ok(slot) = self.stop_action.lock() {
            if let Some(action) = slot.as_ref() {
                action();
            }
        }
    }

    /// How many times the indicator went from hidden to shown.
    pub fn show_count(&self) -> usize {
        self.show_count.load(Ordering::SeqCst)
    }
}

impl Default for TerminalIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningIndicator for TerminalIndicator {
    fn is_shown(&self) -> bool {
        self.shown.load(Ordering::SeqCst)
    }

    fn show(&self) -> Result<()> {
        if !self.shown.swap(true, Ordering::SeqCst) {
            self.show_count.fetch_add(1, Ordering::SeqCst);
            info!("[Indicator] Sharing geolocation. Press Ctrl+C to stop.");
        }
        Ok(())
    }

    fn clear(&self) {
        if self.shown.swap(false, Ordering::SeqCst) {
            debug!("[Indicator] Cleared.");
        }
    }
}
