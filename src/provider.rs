use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::sync::RwLock;

use crate::peer::Fix;
use crate::traits::{Accuracy, LocationProvider};

/// Location provider for hosts without a positioning service: reports a
/// configured position. Without one it behaves like a denied permission.
pub struct StaticLocationProvider {
    fix: RwLock<Option<Fix>>,
}

impl StaticLocationProvider {
    pub fn new(fix: Option<Fix>) -> Self {
        StaticLocationProvider {
            fix: RwLock::new(fix),
        }
    }

    pub fn set_fix(&self, fix: Option<Fix>) {
        if let Ok(mut guard) = self.fix.write() {
            *guard = fix;
        }
    }

    fn current(&self) -> Option<Fix> {
        self.fix.read().ok().and_then(|guard| *guard)
    }
}

#[async_trait]
impl LocationProvider for StaticLocationProvider {
    fn has_permission(&self) -> bool {
        self.current().is_some()
    }

    async fn request_current_fix(&self, accuracy: Accuracy) -> Result<Option<Fix>> {
        let fix = self.current();
        debug!("[Provider] Fix request ({:?}) -> {:?}", accuracy, fix);
        Ok(fix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_configured_fix() {
        let fix = Fix::new(50.1, 40.2).unwrap();
        let provider = StaticLocationProvider::new(Some(fix));
        assert!(provider.has_permission());
        assert_eq!(
            provider.request_current_fix(Accuracy::High).await.unwrap(),
            Some(fix)
        );
    }

    #[tokio::test]
    async fn test_no_fix_means_no_permission() {
        let provider = StaticLocationProvider::new(None);
        assert!(!provider.has_permission());
        assert_eq!(
            provider.request_current_fix(Accuracy::Balanced).await.unwrap(),
            None
        );

        provider.set_fix(Some(Fix::new(1.0, 2.0).unwrap()));
        assert!(provider.has_permission());
    }
}
