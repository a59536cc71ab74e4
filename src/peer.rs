use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name and group label used when the user never set one.
pub const DEFAULT_LABEL: &str = "Guest";

/// Identity-keyed peer collection.
pub type PeerSet = BTreeMap<String, PeerRecord>;

/// A single sampled device position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        check_coordinates(latitude, longitude)?;
        Ok(Fix { latitude, longitude })
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

/// Last state reported by one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub group: String,
}

impl PeerRecord {
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && check_coordinates(self.latitude, self.longitude).is_ok()
    }

    pub fn position(&self) -> Fix {
        Fix {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn staleness(&self, now_ms: i64) -> Staleness {
        Staleness::between(self.timestamp, now_ms)
    }
}

/// Coarse "time since last update" used for peer labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Seconds(i64),
    Minutes(i64),
    Hours(i64),
    Days(i64),
}

impl Staleness {
    pub fn between(timestamp_ms: i64, now_ms: i64) -> Self {
        // Clock skew between devices can put a peer slightly in the future.
        let secs = (now_ms - timestamp_ms).max(0) / 1000;
        if secs > 86_400 {
            Staleness::Days(secs / 86_400)
        } else if secs > 3_600 {
            Staleness::Hours(secs / 3_600)
        } else if secs > 60 {
            Staleness::Minutes(secs / 60)
        } else {
            Staleness::Seconds(secs)
        }
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (n, unit) = match *self {
            Staleness::Seconds(n) => (n, "second"),
            Staleness::Minutes(n) => (n, "minute"),
            Staleness::Hours(n) => (n, "hour"),
            Staleness::Days(n) => (n, "day"),
        };
        let plural = if n == 1 { "" } else { "s" };
        write!(f, "{} {}{} ago", n, unit, plural)
    }
}

pub fn check_coordinates(latitude: f64, longitude: f64) -> Result<()> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(anyhow!("Latitude {} out of range", latitude));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(anyhow!("Longitude {} out of range", longitude));
    }
    Ok(())
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
