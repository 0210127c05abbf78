// Fleetlink - CPE Fleet Connectivity Controller
//
// This crate implements connectivity and liveness management for a fleet of
// remote field devices: an authenticated WebSocket session registry, an
// out-of-band UDP wake channel, a timestamp-based liveness policy, and
// fleet-wide presence reconciliation as cancellable, progress-tracked jobs.

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod ops;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod store;
pub mod tasks;
pub mod wake;

pub use auth::{TokenClaims, TokenVerifier};
pub use config::Config;
pub use error::{DomainError, FleetError, InfraError};
pub use ops::{FleetOps, PushOutcome};
pub use presence::{presence, Presence};
pub use protocol::{DeviceMessage, OobPacket, ServerMessage};
pub use reconcile::{MetricsHook, Reconciler, ThrottleVerdict};
pub use registry::{LocalRegistry, SessionHandle, SessionRouter};
pub use server::SessionServer;
pub use store::{ConnectionStatus, DeviceRecord, DeviceStore, MemoryDeviceStore};
pub use tasks::{MemoryTaskStore, SqliteTaskStore, Task, TaskMode, TaskStats, TaskStatus, TaskStore};
pub use wake::{DiscoveryListener, WakeChannel, WakeTarget};
