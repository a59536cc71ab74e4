use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::peer::Fix;

/// Accuracy hint passed along with a fix request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    High,
    #[default]
    Balanced,
    LowPower,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Whether the process is currently allowed to read the device position.
    fn has_permission(&self) -> bool;

    /// Best-effort current position. Ok(None) means no fix is available right now.
    async fn request_current_fix(&self, accuracy: Accuracy) -> Result<Option<Fix>>;
}

/// User-visible "sync is running" signal.
#[cfg_attr(test, mockall::automock)]
pub trait RunningIndicator: Send + Sync {
    fn is_shown(&self) -> bool;

    fn show(&self) -> Result<()>;

    /// Remove the indicator. Clearing an absent indicator does nothing.
    fn clear(&self);
}
