pub mod peer;
pub mod prefs;
pub mod state;
pub mod traits;
pub mod store;
pub mod controller;
pub mod service;
pub mod indicator;
pub mod provider;
pub mod config;

pub use controller::{LocationSync, SyncOutcome};
pub use peer::{Fix, PeerRecord, PeerSet};
pub use service::{CancelSource, CancelToken, SyncService};
pub use store::{build_store, Backend, PeerLocationStore};
