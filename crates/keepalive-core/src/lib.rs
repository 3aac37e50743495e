//! Adaptive keep-alive supervisor.
//!
//! [`Supervisor`] is a single-executor state machine: it owns the heartbeat
//! loop, the record ring, the offline uplink cache and the restart policy,
//! and reacts to [`Signal`]s posted by its host. [`runtime`] drives it on
//! tokio; the `sim` module (feature `test_support`) drives it on a virtual
//! clock.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod env;
pub mod error;
pub mod heartbeat;
pub mod host;
pub mod memory;
pub mod persistence;
pub mod runtime;
#[cfg(any(test, feature = "test_support"))]
pub mod sim;
pub mod store;
pub mod supervisor;

pub use analysis::{analyze, Anomaly, Gap, HealthLevel, HealthReport};
pub use cache::{FlushStep, NetworkCache};
pub use config::{config_schema_json, load_config, Config};
pub use env::{EnvCoalescer, EnvProbe};
pub use error::{ConfigError, KeepAliveError, PermissionKind, PersistenceError, WorkerError};
pub use heartbeat::HeartbeatLoop;
pub use host::{
    Clock, DeathNotifier, Host, Mailbox, NetworkSink, PermissionProbe, Persistence, Signal,
    TimerId, TimerToken, UplinkDispatch, UplinkOutcome, UplinkTicket, WorkerHandle,
};
pub use memory::{MemoryGovernor, TrimSignal};
pub use persistence::{FilePersistence, MemoryPersistence};
pub use runtime::{spawn_supervisor, RuntimeError, RuntimeHost, SupervisorClient, SupervisorRuntime};
pub use store::HeartbeatStore;
pub use supervisor::Supervisor;

pub use keepalive_policy::{PolicyDecision, PolicyEngine};
pub use keepalive_protocol::*;
