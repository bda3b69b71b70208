//! Supervision core: the fleet coordinator, the per-device connection
//! supervisors, and adapter recovery.

pub mod coordinator;
pub mod recovery;
pub mod supervisor;

pub use coordinator::FleetCoordinator;
pub use recovery::AdapterRecoveryMonitor;
pub use supervisor::DeviceSupervisor;
