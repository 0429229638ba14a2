//! Instance lifecycle: status state machine, session registry, shutdown
//! timers and the coordinator that sequences them.

pub mod coordinator;
pub mod sessions;
pub mod status;
pub mod timers;

pub use coordinator::{
    LifecycleSettings, ShutdownCoordinator, DEFAULT_GRACE_PERIOD, DEFAULT_INACTIVITY_TIMEOUT,
    DEFAULT_LIFETIME,
};
pub use sessions::{Session, SessionGuard, SessionRegistry};
pub use status::{InstanceStatus, StatusGuard, StatusRegister};
pub use timers::{ActivityHandle, ShutdownReason, ShutdownTimers, ShutdownTrigger};
