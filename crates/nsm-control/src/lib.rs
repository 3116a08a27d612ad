//! Control plane side of dataplane management
//!
//! The registrar accepts dataplane registrations, a health monitor per
//! dataplane mirrors its mechanism updates into the shared store, and the
//! healing module turns classified failures into recovery actions. The
//! registrar client and liveness watcher are the dataplane-side counterparts.
pub mod client;
pub mod healing;
pub mod liveness;
pub mod monitor;
pub mod registrar;
pub mod store;
pub mod task_tracker;

pub use client::{ClientError, RegistrarClient};
pub use healing::{
    ClientConnection, HealAction, HealError, HealProperties, HealState, Healer, HeldConnection,
    NetworkServiceManager, RecoveryActions, RecoveryError, RestoreResult, UnknownHealState,
};
pub use liveness::LivenessMonitor;
pub use monitor::{monitor_dataplane, MonitorExit};
pub use registrar::{DataplaneRegistrar, RegistrarServer};
pub use store::{Dataplane, DataplaneStore, StoreError};
pub use task_tracker::TaskTracker;
